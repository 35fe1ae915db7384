//! Worker threads: an OS thread that owns a [`Channel`] and dispatches
//! received messages to a handler object constructed on the worker
//! thread itself.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use log::{debug, error, trace};

use crate::channel::{Channel, Listener};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::task::TaskPacket;

/// A user object that reacts to messages delivered to a worker's
/// channel. Constructed on the worker thread so any thread-local state
/// it touches during construction is correct for that thread.
pub trait Handler: Send {
    fn recv(&mut self, msg: Message);
}

thread_local! {
    // Weak, not a strong `Worker` clone: the worker thread itself must
    // never hold a reference that keeps `Inner` alive, or dropping the
    // last user-visible `Worker` handle would never run `Inner`'s
    // `Drop` and the channel would never close.
    static CURRENT: RefCell<Option<Weak<Inner>>> = RefCell::new(None);
}

/// Restores the previous thread-local "current worker" value on drop,
/// so a nested reassignment (there is none today, but the invariant is
/// cheap to keep) can never leak into code that runs after it.
struct CurrentGuard(Option<Weak<Inner>>);

impl CurrentGuard {
    fn set(inner: Weak<Inner>) -> Self {
        let previous = CURRENT.with(|c| c.borrow_mut().replace(inner));
        Self(previous)
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| *c.borrow_mut() = self.0.take());
    }
}

struct Inner {
    channel: Channel,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    /// The last user-visible `Worker` handle dropping closes the
    /// channel, so the receive loop drains and the thread exits
    /// instead of leaking, blocked forever in `channel.recv()`.
    fn drop(&mut self) {
        self.channel.close(true);
    }
}

/// A worker handle. Cloning shares the same underlying thread and
/// mailbox; the worker's channel closes automatically once the last
/// `Worker` handle referring to it is dropped, and the thread exits
/// once its channel has drained.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    /// Spawns an OS thread, constructs `factory()` on it, and enters
    /// the receive loop.
    pub fn make<H, F>(factory: F) -> Result<Worker>
    where
        H: Handler + 'static,
        F: FnOnce() -> H + Send + 'static,
    {
        let channel = Channel::make();
        let inner = Arc::new(Inner {
            channel: channel.clone(),
            join: Mutex::new(None),
        });
        let worker = Worker { inner };

        // The thread captures the channel directly and only a weak
        // reference to `Inner`, so it never itself keeps the worker
        // alive.
        let weak_inner = Arc::downgrade(&worker.inner);
        let thread_channel = channel;
        let join = std::thread::Builder::new()
            .name("threadbus-worker".into())
            .spawn(move || Worker::run(weak_inner, thread_channel, factory))
            .map_err(Error::Spawn)?;
        *worker.inner.join.lock().unwrap_or_else(|e| e.into_inner()) = Some(join);
        Ok(worker)
    }

    fn run<H, F>(weak_inner: Weak<Inner>, channel: Channel, factory: F)
    where
        H: Handler + 'static,
        F: FnOnce() -> H,
    {
        let _guard = CurrentGuard::set(weak_inner);
        trace!("worker: constructing handler");
        let mut handler = factory();
        while let Some(msg) = channel.recv() {
            if msg.payload().is::<TaskPacket>() {
                if let Some(packet) = msg.into_payload().into_inner::<TaskPacket>() {
                    run_guarded(|| packet.run());
                }
                continue;
            }
            run_guarded(|| handler.recv(msg));
        }
        debug!("worker: channel closed, exiting receive loop");
    }

    /// The worker currently executing on the calling OS thread, if
    /// any. Returns `None` once every user-visible `Worker` handle has
    /// already been dropped, even from within a handler still running
    /// out its current dispatch.
    pub fn current() -> Option<Worker> {
        CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .and_then(|weak| weak.upgrade())
                .map(|inner| Worker { inner })
        })
    }

    pub fn send<T: std::any::Any + Send>(&self, id: usize, value: T) -> bool {
        self.inner.channel.send(id, value)
    }

    pub fn send_id(&self, id: usize) -> bool {
        self.inner.channel.send_id(id)
    }

    /// Posts `f` to run inline on this worker's thread.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, f: F) -> bool {
        self.inner.channel.schedule(f)
    }

    pub fn queued(&self) -> usize {
        self.inner.channel.queued()
    }

    /// Registers `listener` on this worker's channel. See
    /// [`Channel::register_listener`].
    pub fn register_listener(&self, listener: Weak<dyn Listener>) -> bool {
        self.inner.channel.register_listener(listener, true)
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Hands `msg` directly to this worker's channel, returning it
    /// back on failure (channel closed) instead of dropping it.
    pub(crate) fn deliver(&self, msg: Message) -> std::result::Result<(), Message> {
        self.inner.channel.try_send_message(msg)
    }

    /// Closes the worker's channel; the receive loop exits once it
    /// drains (soft) or immediately (hard). Idempotent.
    pub fn close(&self, soft: bool) {
        self.inner.channel.close(soft);
    }

    pub fn alive(&self) -> bool {
        !self.inner.channel.closed()
    }

    /// Blocks until the worker thread has exited. Only the last
    /// external holder of a `Worker` should call this: once it drops
    /// its handle (or calls this after `close`), the channel closing
    /// lets the thread's receive loop exit on its own.
    pub fn join(&self) {
        let join = self
            .inner
            .join
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

fn run_guarded<F: FnOnce()>(f: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        let err = Error::handler_panic(payload);
        error!("worker: {}", err);
    }
}
