//! FIFO message channels: the cross-thread transport every other
//! construct in this crate (worker, executor, fiber, reply) is built
//! on top of.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use log::trace;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result as CrateResult};
use crate::message::Message;
use crate::payload::Payload;
use crate::task::{Task, TaskPacket};

/// Result of a non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvState {
    /// A message was received.
    Success,
    /// No message was available, but the channel is still open.
    Failure,
    /// The channel is closed and drained.
    Closed,
}

/// A capability any object can implement to receive messages fanned
/// out from a channel, without the channel owning it.
///
/// A listener is held by weak reference; once it stops being `alive`
/// the channel drops it from rotation on the next delivery attempt.
pub trait Listener: Send + Sync {
    /// Attempt delivery. Returns the message back on failure (the
    /// listener can no longer accept messages), in which case the
    /// channel pushes it back to the head of its queue and removes
    /// this listener from rotation.
    fn send(&self, msg: Message) -> Result<(), Message>;

    /// `false` once this listener will never accept another message.
    fn alive(&self) -> bool;
}

// One condition variable per blocked receiver avoids the thundering
// herd that a single channel-wide condvar would cause under fan-out.
struct Waiter {
    slot: Mutex<Option<Message>>,
    cond: Condvar,
    closed: AtomicBool,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn deliver(&self, msg: Message) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(msg);
        self.cond.notify_one();
    }

    /// Wakes this waiter; used both to deliver a close notification to
    /// a blocked receiver and, on a bounded channel, to unblock a
    /// producer once queue space frees up.
    fn wake(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        self.cond.notify_one();
    }

    fn wait(&self) -> Option<Message> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(msg) = slot.take() {
                return Some(msg);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            slot = self.cond.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Listener for Waiter {
    fn send(&self, msg: Message) -> Result<(), Message> {
        self.deliver(msg);
        Ok(())
    }

    fn alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

struct ListenerEntry {
    listener: Weak<dyn Listener>,
    requeue: bool,
}

struct Inner {
    closed: bool,
    capacity: Option<usize>,
    queue: VecDeque<Message>,
    receivers: VecDeque<Arc<Waiter>>,
    listeners: VecDeque<ListenerEntry>,
    send_waiters: VecDeque<Arc<Waiter>>,
}

impl Inner {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            closed: false,
            capacity,
            queue: VecDeque::new(),
            receivers: VecDeque::new(),
            listeners: VecDeque::new(),
            send_waiters: VecDeque::new(),
        }
    }
}

/// A FIFO, multi-producer/multi-consumer message queue.
///
/// Cloning a `Channel` clones the handle; all clones refer to the same
/// underlying mailbox. The channel is closed (see [`Channel::close`])
/// when explicitly requested; closing is independent of handle
/// lifetime (unlike the teacher's `Rc`-counted single-threaded
/// channel, this crate's channels cross OS-thread boundaries, so
/// closing is explicit rather than ref-count-driven).
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Mutex<Inner>>,
}

impl Channel {
    /// An unbounded channel.
    pub fn make() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new(None))),
        }
    }

    /// A channel whose queue holds at most `capacity` messages;
    /// `send` blocks the producer while the queue is full.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new(Some(capacity)))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `true` once [`Channel::close`] has been called.
    pub fn closed(&self) -> bool {
        self.lock().closed
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn blocked_receivers(&self) -> usize {
        self.lock().receivers.len()
    }

    /// Registers `listener` to receive messages as they arrive. If
    /// `requeue` is true (the usual case) the listener is pushed back
    /// to the tail of the rotation after each successful delivery,
    /// giving round-robin fan-out across all registered listeners.
    /// Returns `false` if the channel is already closed.
    pub fn register_listener(&self, listener: Weak<dyn Listener>, requeue: bool) -> bool {
        let mut lock = self.lock();
        if lock.closed {
            return false;
        }
        lock.listeners.push_back(ListenerEntry { listener, requeue });
        self.pump(lock);
        true
    }

    /// Enqueues a message built from `id` (and optionally a payload).
    /// Returns `false` if the channel is closed.
    pub fn send_id(&self, id: usize) -> bool {
        self.send_message(Message::with_id(id))
    }

    pub fn send<T: std::any::Any + Send>(&self, id: usize, value: T) -> bool {
        self.send_message(Message::make(id, value))
    }

    pub fn send_payload(&self, id: usize, payload: Payload) -> bool {
        self.send_message(Message::with_payload(id, payload))
    }

    /// Enqueues a task packet for inline execution by whichever
    /// worker ends up receiving it.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, f: F) -> bool {
        self.send(0, TaskPacket::new(f))
    }

    pub fn send_message(&self, msg: Message) -> bool {
        self.try_send_message(msg).is_ok()
    }

    /// Like [`Channel::send_message`] but hands the message back on
    /// failure instead of dropping it; used internally by constructs
    /// (e.g. the executor's worker pool) that need to redirect a
    /// message elsewhere when this channel can't take it.
    pub(crate) fn try_send_message(&self, msg: Message) -> Result<(), Message> {
        let mut lock = self.lock();
        if lock.closed {
            return Err(msg);
        }
        if let Some(capacity) = lock.capacity {
            while lock.queue.len() >= capacity && !lock.closed {
                let waiter = Waiter::new();
                lock.send_waiters.push_back(waiter.clone());
                drop(lock);
                waiter.wait();
                lock = self.lock();
            }
            if lock.closed {
                return Err(msg);
            }
        }
        lock.queue.push_back(msg);
        self.pump(lock);
        Ok(())
    }

    /// Delivers queued messages to waiting receivers/listeners.
    /// Blocked receivers are served before listeners, matching the
    /// intuition that an explicit blocking `recv()` call takes
    /// priority over a passive fan-out registration.
    fn pump(&self, mut lock: std::sync::MutexGuard<'_, Inner>) {
        loop {
            if lock.queue.is_empty() {
                break;
            }
            if let Some(waiter) = lock.receivers.pop_front() {
                let msg = lock.queue.pop_front().expect("queue just checked non-empty");
                drop(lock);
                waiter.deliver(msg);
                lock = self.lock();
                continue;
            }

            // prune dead listeners from the head before trying delivery
            while let Some(entry) = lock.listeners.front() {
                if entry.listener.upgrade().map(|l| l.alive()).unwrap_or(false) {
                    break;
                }
                lock.listeners.pop_front();
            }

            if let Some(entry) = lock.listeners.pop_front() {
                let target = match entry.listener.upgrade() {
                    Some(t) => t,
                    None => continue,
                };
                let msg = lock.queue.pop_front().expect("queue just checked non-empty");
                drop(lock);
                let result = target.send(msg);
                lock = self.lock();
                match result {
                    Ok(()) => {
                        if entry.requeue && !lock.closed && target.alive() {
                            lock.listeners.push_back(ListenerEntry {
                                listener: entry.listener,
                                requeue: entry.requeue,
                            });
                        }
                    }
                    Err(msg) => {
                        // listener died between the alive() check and
                        // send(); restore the message and stop draining
                        // this round.
                        trace!("channel: listener died mid-delivery, requeuing message");
                        lock.queue.push_front(msg);
                        break;
                    }
                }
                continue;
            }
            break;
        }

        self.wake_send_waiters(&mut lock);

        if lock.closed && lock.queue.is_empty() {
            for waiter in lock.receivers.drain(..) {
                waiter.wake();
            }
            // only safe once the queue is fully drained: a message
            // pushed back to the head after a failed delivery, or one
            // still in flight to a listener on another thread, must
            // still have a chance to reach a live listener before the
            // rotation is torn down.
            lock.listeners.clear();
        }
    }

    fn wake_send_waiters(&self, lock: &mut std::sync::MutexGuard<'_, Inner>) {
        if let Some(capacity) = lock.capacity {
            while lock.queue.len() < capacity {
                match lock.send_waiters.pop_front() {
                    Some(w) => w.wake(),
                    None => break,
                }
            }
        }
    }

    /// Blocks until a message is available, the channel is hard
    /// closed, or a soft-closed channel is drained.
    pub fn recv(&self) -> Option<Message> {
        let mut lock = self.lock();
        if let Some(msg) = lock.queue.pop_front() {
            self.pump_after_pop(&mut lock);
            return Some(msg);
        }
        if lock.closed {
            return None;
        }
        let waiter = Waiter::new();
        lock.receivers.push_back(waiter.clone());
        drop(lock);
        waiter.wait()
    }

    fn pump_after_pop(&self, lock: &mut std::sync::MutexGuard<'_, Inner>) {
        self.wake_send_waiters(lock);
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> (TryRecvState, Option<Message>) {
        let mut lock = self.lock();
        if let Some(msg) = lock.queue.pop_front() {
            self.pump_after_pop(&mut lock);
            return (TryRecvState::Success, Some(msg));
        }
        if lock.closed {
            (TryRecvState::Closed, None)
        } else {
            (TryRecvState::Failure, None)
        }
    }

    /// Closes the channel. Idempotent.
    ///
    /// `soft = true` (the default) lets previously queued messages
    /// continue to drain to receivers; `soft = false` discards them
    /// immediately and wakes every blocked receiver with a closed
    /// indication.
    pub fn close(&self, soft: bool) {
        let mut lock = self.lock();
        if lock.closed {
            return;
        }
        lock.closed = true;
        if !soft {
            lock.queue.clear();
        }
        for waiter in lock.send_waiters.drain(..) {
            waiter.wake();
        }
        // drain whatever remains to receivers/listeners before tearing
        // the listener rotation down, instead of clearing it out from
        // under a message still in flight.
        self.pump(lock);
    }

    /// Spawns a transient OS thread that runs `f` (via a memoizing
    /// [`Task`], evaluated exactly once), then sends its return value
    /// back to this channel tagged with `resp_id`. Returns `Ok(false)`
    /// if the channel is already closed; `Err(Error::Spawn)` if the OS
    /// thread could not be created.
    pub fn r#async<T, F>(&self, resp_id: usize, f: F) -> CrateResult<bool>
    where
        T: std::any::Any + Send + Clone,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.closed() {
            return Ok(false);
        }
        let self_clone = self.clone();
        let task = Task::new(f);
        std::thread::Builder::new()
            .name("threadbus-async".into())
            .spawn(move || {
                let value = task.get();
                self_clone.send(resp_id, value);
            })
            .map_err(Error::Spawn)?;
        Ok(true)
    }

    /// Like [`Channel::async`] but for a callable with no return
    /// value; the response message carries no payload.
    pub fn async_void<F>(&self, resp_id: usize, f: F) -> CrateResult<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed() {
            return Ok(false);
        }
        let self_clone = self.clone();
        std::thread::Builder::new()
            .name("threadbus-async".into())
            .spawn(move || {
                f();
                self_clone.send_id(resp_id);
            })
            .map_err(Error::Spawn)?;
        Ok(true)
    }

    /// Sends a message tagged `resp_id` back to this channel after
    /// `duration` elapses, carrying `payload`. Uses [`SystemClock`];
    /// see [`Channel::timer_with_clock`] to inject a different one.
    pub fn timer<T>(&self, resp_id: usize, duration: Duration, payload: T) -> CrateResult<bool>
    where
        T: std::any::Any + Send + Clone,
    {
        self.timer_with_clock(resp_id, duration, payload, SystemClock)
    }

    /// Like [`Channel::timer`] but waits on `clock` instead of the real
    /// wall clock, so tests can avoid sleeping wall-clock time.
    pub fn timer_with_clock<T, C>(
        &self,
        resp_id: usize,
        duration: Duration,
        payload: T,
        clock: C,
    ) -> CrateResult<bool>
    where
        T: std::any::Any + Send + Clone,
        C: Clock,
    {
        self.r#async(resp_id, move || {
            clock.sleep(duration);
            payload
        })
    }

    /// Like [`Channel::timer`] but with no payload in the response.
    pub fn timer_void(&self, resp_id: usize, duration: Duration) -> CrateResult<bool> {
        self.timer_void_with_clock(resp_id, duration, SystemClock)
    }

    /// Like [`Channel::timer_void`] but waits on `clock` instead of the
    /// real wall clock.
    pub fn timer_void_with_clock<C: Clock>(
        &self,
        resp_id: usize,
        duration: Duration,
        clock: C,
    ) -> CrateResult<bool> {
        self.async_void(resp_id, move || {
            clock.sleep(duration);
        })
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { channel: self }
    }
}

/// Blocking iterator over a channel's messages; ends once `recv`
/// returns `None`.
pub struct Iter<'a> {
    channel: &'a Channel,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        self.channel.recv()
    }
}

impl<'a> IntoIterator for &'a Channel {
    type Item = Message;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn basic_ping() {
        let ch = Channel::make();
        assert!(ch.send(7, String::from("hello")));
        let msg = ch.recv().expect("message expected");
        assert_eq!(msg.id(), 7);
        let mut s = String::new();
        assert!(msg.payload().copy_extract(&mut s));
        assert_eq!(s, "hello");
        ch.close(true);
        assert!(ch.recv().is_none());
    }

    #[test]
    fn soft_close_drains_queue() {
        let ch = Channel::make();
        ch.send(1, 10i32);
        ch.send(2, 20i32);
        ch.close(true);
        let m1 = ch.recv().unwrap();
        assert_eq!(m1.id(), 1);
        let m2 = ch.recv().unwrap();
        assert_eq!(m2.id(), 2);
        assert!(ch.recv().is_none());
    }

    #[test]
    fn hard_close_discards_queue() {
        let ch = Channel::make();
        ch.send(1, 10i32);
        ch.send(2, 20i32);
        ch.close(false);
        assert!(ch.recv().is_none());
    }

    #[test]
    fn send_after_close_fails() {
        let ch = Channel::make();
        ch.close(true);
        assert!(!ch.send_id(1));
    }

    #[test]
    fn blocking_recv_wakes_on_send() {
        let ch = Channel::make();
        let ch2 = ch.clone();
        let handle = std::thread::spawn(move || ch2.recv());
        std::thread::sleep(Duration::from_millis(20));
        ch.send(42, 5i32);
        let msg = handle.join().unwrap().expect("message expected");
        assert_eq!(msg.id(), 42);
    }

    #[test]
    fn try_recv_on_empty_open_channel() {
        let ch = Channel::make();
        let (state, msg) = ch.try_recv();
        assert_eq!(state, TryRecvState::Failure);
        assert!(msg.is_none());
    }

    #[test]
    fn try_recv_on_closed_channel() {
        let ch = Channel::make();
        ch.close(true);
        let (state, msg) = ch.try_recv();
        assert_eq!(state, TryRecvState::Closed);
        assert!(msg.is_none());
    }

    struct CollectListener {
        received: Mutex<Vec<usize>>,
        alive: AtomicBool,
    }

    impl Listener for CollectListener {
        fn send(&self, msg: Message) -> Result<(), Message> {
            self.received.lock().unwrap().push(msg.id());
            Ok(())
        }

        fn alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn fan_out_round_robins_across_listeners() {
        let ch = Channel::make();
        let listeners: Vec<_> = (0..3)
            .map(|_| {
                Arc::new(CollectListener {
                    received: Mutex::new(Vec::new()),
                    alive: AtomicBool::new(true),
                })
            })
            .collect();
        for l in &listeners {
            let weak: Weak<dyn Listener> = Arc::downgrade(l);
            ch.register_listener(weak, true);
        }
        for i in 0..6 {
            ch.send_id(i);
        }
        for l in &listeners {
            assert_eq!(l.received.lock().unwrap().len(), 2);
        }
    }

    #[test]
    fn bounded_channel_blocks_until_drained() {
        let ch = Channel::bounded(1);
        assert!(ch.send_id(1));
        let ch2 = ch.clone();
        let handle = std::thread::spawn(move || ch2.send_id(2));
        std::thread::sleep(Duration::from_millis(20));
        let m = ch.recv().unwrap();
        assert_eq!(m.id(), 1);
        assert!(handle.join().unwrap());
        let m2 = ch.recv().unwrap();
        assert_eq!(m2.id(), 2);
    }

    struct InstantClock;
    impl crate::clock::Clock for InstantClock {
        fn now(&self) -> std::time::Instant {
            std::time::Instant::now()
        }
        fn sleep(&self, _duration: Duration) {}
    }

    #[test]
    fn timer_with_fake_clock_does_not_wait() {
        let ch = Channel::make();
        ch.timer_with_clock(9, Duration::from_secs(60), 7i32, InstantClock)
            .unwrap();
        let msg = ch.recv().expect("message expected");
        assert_eq!(msg.id(), 9);
        let mut out = 0i32;
        assert!(msg.payload().copy_extract(&mut out));
        assert_eq!(out, 7);
    }

    struct FlakyListener {
        dead: AtomicBool,
    }

    impl Listener for FlakyListener {
        fn send(&self, msg: Message) -> Result<(), Message> {
            self.dead.store(true, Ordering::SeqCst);
            Err(msg)
        }

        fn alive(&self) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn close_still_delivers_a_message_stranded_by_a_failed_delivery() {
        let ch = Channel::make();
        let flaky = Arc::new(FlakyListener {
            dead: AtomicBool::new(false),
        });
        let survivor = Arc::new(CollectListener {
            received: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
        });
        let flaky_weak: Weak<dyn Listener> = Arc::downgrade(&flaky);
        let survivor_weak: Weak<dyn Listener> = Arc::downgrade(&survivor);
        ch.register_listener(flaky_weak, true);
        ch.register_listener(survivor_weak, true);

        // delivery to `flaky` fails and the message is pushed back to
        // the queue head; `flaky` is dropped from rotation and the
        // pump stops draining further listeners this round, so the
        // message is still queued at this point.
        ch.send_id(42);
        assert_eq!(ch.queued(), 1);

        // closing must still hand the stranded message to the
        // remaining live listener instead of wiping the rotation out
        // from under it.
        ch.close(true);
        assert_eq!(survivor.received.lock().unwrap().as_slice(), &[42]);
    }
}
