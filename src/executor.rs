//! Executors: a fixed pool of [`Worker`]s sharing a single front
//! channel, with a round-robin-with-queue-depth-bias dispatch policy.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::OnceCell;

use crate::channel::{Channel, Listener};
use crate::error::Result;
use crate::message::Message;
use crate::worker::{Handler, Worker};

struct Pool {
    workers: Vec<Worker>,
    cursor: AtomicUsize,
    alive: AtomicBool,
}

impl Listener for Pool {
    fn send(&self, msg: Message) -> std::result::Result<(), Message> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(msg);
        }
        let n = self.workers.len();
        let start = self.cursor.load(Ordering::Relaxed) % n;
        let next = (start + 1) % n;
        // Bias toward whichever of the two adjacent candidates has the
        // shallower backlog, so a slow worker doesn't keep accumulating
        // work purely because its turn came up next in rotation.
        let chosen = if self.workers[next].queued() < self.workers[start].queued() {
            next
        } else {
            start
        };
        self.cursor.store((chosen + 1) % n, Ordering::Relaxed);
        self.workers[chosen].deliver(msg)
    }

    fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct Inner {
    front: Channel,
    pool: Arc<Pool>,
    shutdown: AtomicBool,
}

/// A pool of worker threads sharing one inbound channel.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    /// Builds `worker_count` (minimum 1) workers, each running a
    /// handler produced by `factory`, and registers them as a single
    /// pooled listener on a fresh front channel.
    pub fn make<H, F>(worker_count: usize, factory: F) -> Result<Executor>
    where
        H: Handler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let worker_count = worker_count.max(1);
        let factory = Arc::new(factory);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let factory = factory.clone();
            workers.push(Worker::make(move || factory())?);
        }

        let front = Channel::make();
        let pool = Arc::new(Pool {
            workers,
            cursor: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
        });
        let weak: Weak<dyn Listener> = Arc::downgrade(&pool);
        front.register_listener(weak, true);

        Ok(Executor {
            inner: Arc::new(Inner {
                front,
                pool,
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    pub fn count(&self) -> usize {
        self.inner.pool.workers.len()
    }

    pub fn send<T: std::any::Any + Send>(&self, id: usize, value: T) -> bool {
        self.inner.front.send(id, value)
    }

    pub fn send_id(&self, id: usize) -> bool {
        self.inner.front.send_id(id)
    }

    pub fn schedule<F: FnOnce() + Send + 'static>(&self, f: F) -> bool {
        self.inner.front.schedule(f)
    }

    pub fn alive(&self) -> bool {
        !self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Closes the front channel and every worker. Idempotent.
    pub fn close(&self, soft: bool) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.pool.alive.store(false, Ordering::SeqCst);
        self.inner.front.close(soft);
        for worker in &self.inner.pool.workers {
            worker.close(soft);
        }
    }
}

// The process-wide singleton. Reconstructed lazily if the slot is
// empty or the previously stored executor has been shut down, mirroring
// the teacher's re-construct-after-terminate stance for its own
// statically allocated executor.
static INSTANCE: OnceCell<Mutex<Option<Executor>>> = OnceCell::new();

/// Handler used by the default, process-wide [`Executor::instance`]
/// when the caller doesn't need anything beyond inline task execution.
struct NullHandler;

impl Handler for NullHandler {
    fn recv(&mut self, _msg: Message) {}
}

impl Executor {
    /// The process-wide executor singleton, sized to the available
    /// parallelism. Reconstructed on next access if a prior instance
    /// was closed.
    pub fn instance() -> Executor {
        let slot = INSTANCE.get_or_init(|| Mutex::new(None));
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = guard.as_ref() {
            if existing.alive() {
                return existing.clone();
            }
        }
        let worker_count = num_cpus::get().max(1);
        let executor = Executor::make(worker_count, || NullHandler)
            .expect("spawning the default executor's worker threads failed");
        *guard = Some(executor.clone());
        executor
    }
}
