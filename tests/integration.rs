use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use pretty_assertions::assert_eq;

use threadbus::channel::Channel;
use threadbus::executor::Executor;
use threadbus::fiber::Fiber;
use threadbus::message::Message;
use threadbus::reply::Reply;
use threadbus::worker::{Handler, Worker};

struct Echo {
    out: mpsc::Sender<usize>,
}

impl Handler for Echo {
    fn recv(&mut self, msg: Message) {
        let _ = self.out.send(msg.id());
    }
}

#[test]
fn worker_request_reply_over_shared_channel() {
    struct Doubler {
        reply_to: Channel,
    }
    impl Handler for Doubler {
        fn recv(&mut self, msg: Message) {
            let mut n = 0i32;
            if msg.payload().copy_extract(&mut n) {
                Reply::new(self.reply_to.clone(), msg.id()).send(n * 2);
            }
        }
    }
    let reply_channel = Channel::make();
    let worker = {
        let reply_channel = reply_channel.clone();
        Worker::make(move || Doubler {
            reply_to: reply_channel,
        })
        .unwrap()
    };
    worker.send(7, 21i32);
    let msg = reply_channel.recv().expect("reply expected");
    assert_eq!(msg.id(), 7);
    let mut out = 0i32;
    assert!(msg.payload().copy_extract(&mut out));
    assert_eq!(out, 42);
    worker.close(true);
    worker.join();
}

#[test]
fn executor_spreads_work_across_all_workers() {
    let touched: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
    struct Counter {
        index: usize,
        touched: Arc<Vec<AtomicUsize>>,
    }
    impl Handler for Counter {
        fn recv(&mut self, _msg: Message) {
            self.touched[self.index].fetch_add(1, Ordering::SeqCst);
        }
    }
    let counter = AtomicUsize::new(0);
    let touched_for_factory = touched.clone();
    let ex = Executor::make(4, move || {
        let index = counter.fetch_add(1, Ordering::SeqCst);
        Counter {
            index,
            touched: touched_for_factory.clone(),
        }
    })
    .unwrap();

    for i in 0..40 {
        ex.send_id(i);
    }
    std::thread::sleep(Duration::from_millis(200));

    let total: usize = touched.iter().map(|c| c.load(Ordering::SeqCst)).sum();
    assert_eq!(total, 40);
    ex.close(true);
}

#[test]
fn fiber_processes_messages_in_order_on_its_host() {
    struct NoopHandler;
    impl Handler for NoopHandler {
        fn recv(&mut self, _msg: Message) {}
    }
    let host = Worker::make(|| NoopHandler).unwrap();
    let (tx, rx) = mpsc::channel();
    let fiber = Fiber::make(host.clone(), move || Echo { out: tx });
    for i in 0..5 {
        fiber.send_id(i);
    }
    for i in 0..5 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), i);
    }
    fiber.close(true);
    host.close(true);
    host.join();
}

#[test]
fn closed_channel_send_reports_failure_not_panic() {
    let ch = Channel::make();
    ch.close(false);
    assert!(!ch.send_id(1));
    assert!(!ch.send(2, 5i32));
}
