//! Message-passing channels, worker threads, an executor pool and
//! cooperative fibers.
//!
//! This library contains the following building blocks:
//!
//! - [Channels](channel): FIFO multi-producer/multi-consumer queues with
//!   blocking `recv`, weak-referenced listener fan-out, and optional
//!   bounded capacity.
//! - [Messages and payloads](message): a type-erased id/payload pair
//!   that can carry any `Send` value.
//! - [Workers](worker): an OS thread that owns a channel and dispatches
//!   messages to a handler constructed on that same thread.
//! - [Executors](executor): a fixed pool of workers sharing one front
//!   channel, load balanced by queue depth.
//! - [Fibers](fiber): cooperative tasks hosted on a worker, woken one
//!   message at a time without ever blocking the host thread.
//! - [Reply handles](reply): a thin `(channel, id)` pair for answering
//!   a request without learning more about the requester than it was
//!   handed.
//! - [Error handling](error)
//! - [Clock abstraction](clock) for deterministic timer tests
//!
//! ### Prerequisites
//!
//! - rustc 1.71 or newer
//!
//! ### A minimal example
//!
//! ```no_run
//! use threadbus::worker::{Handler, Worker};
//! use threadbus::message::Message;
//!
//! struct Echo;
//! impl Handler for Echo {
//!     fn recv(&mut self, msg: Message) {
//!         println!("got message {}", msg.id());
//!     }
//! }
//!
//! let worker = Worker::make(|| Echo).unwrap();
//! worker.send_id(1);
//! worker.close(true);
//! worker.join();
//! ```

pub mod channel;
pub mod clock;
pub mod error;
pub mod executor;
pub mod fiber;
pub mod message;
pub mod payload;
pub mod reply;
pub mod task;
pub mod worker;

pub use error::{Error, Result};
