//! Crate-wide error type.
//!
//! Most operations in this crate report failure as a plain `bool` or a
//! small result enum (see [`crate::channel`]) rather than through this
//! type: a closed channel, a type mismatch on payload extraction, or a
//! dead listener are all expected, routine outcomes. [`Error`] exists
//! for the few genuinely exceptional boundaries: spawning the OS thread
//! behind a worker, an executor, or an `async`/`timer` call can fail.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Spawning the OS thread backing a worker, executor, or a
    /// transient `async`/`timer` task failed.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// A handler or scheduled task panicked. Caught at the worker/fiber
    /// dispatch boundary so one bad handler can't take its host thread
    /// down with it.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
}

impl Error {
    /// Builds a [`Error::HandlerPanic`] from a `catch_unwind` payload,
    /// recovering the panic message when it's a `&str` or `String`.
    pub(crate) fn handler_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Error::HandlerPanic(message)
    }
}
