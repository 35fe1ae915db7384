//! Task packets: callables that travel through a channel as a message
//! payload and are evaluated inline by whichever worker receives them,
//! plus a lazy, memoizing `Task` wrapper used by the `async`/`timer`
//! helpers.

use std::sync::Mutex;

/// A boxed, one-shot, zero-argument callable. [`crate::worker::Worker`]
/// special-cases a payload holding a `TaskPacket`: instead of handing
/// the message to the user handler, it evaluates the callable inline
/// on the worker thread.
pub struct TaskPacket {
    f: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskPacket {
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> Self {
        Self { f: Some(Box::new(f)) }
    }

    /// Runs the wrapped callable. Idempotent after the first call (a
    /// second call is a no-op), matching the "evaluate exactly once"
    /// contract task packets are dispatched under.
    pub fn run(mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

enum Lazy<T> {
    Pending(Box<dyn FnOnce() -> T + Send>),
    Done(T),
    Running,
}

/// A lazily evaluated, memoizing computation.
///
/// Unlike [`TaskPacket`], which runs exactly once when a worker pulls
/// it off a channel, a `Task` can be queried repeatedly; the wrapped
/// callable runs on the first call to [`Task::get`] and the result is
/// cached for subsequent calls.
pub struct Task<T> {
    state: Mutex<Lazy<T>>,
}

impl<T: Clone> Task<T> {
    pub fn new<F: FnOnce() -> T + Send + 'static>(f: F) -> Self {
        Self {
            state: Mutex::new(Lazy::Pending(Box::new(f))),
        }
    }

    /// Evaluates the callable on first access; returns the cached
    /// result thereafter.
    pub fn get(&self) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *guard, Lazy::Running) {
            Lazy::Done(v) => {
                *guard = Lazy::Done(v.clone());
                v
            }
            Lazy::Pending(f) => {
                let v = f();
                *guard = Lazy::Done(v.clone());
                v
            }
            Lazy::Running => unreachable!("Task::get called re-entrantly while evaluating"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn task_packet_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let packet = TaskPacket::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        packet.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lazy_task_memoizes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let task = Task::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            99
        });
        assert_eq!(task.get(), 99);
        assert_eq!(task.get(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
