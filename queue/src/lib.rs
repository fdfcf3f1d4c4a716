//! hyperprocess queues
//!
//! Process-safe FIFO queues built on hyperprocess pipes:
//!
//! - [`Queue`]: bounded queue whose `put` hands items to a background feeder
//!   thread, so producers never block on the pipe
//! - [`JoinableQueue`]: a [`Queue`] that tracks unfinished tasks
//! - [`SimpleQueue`]: unbuffered queue that reads and writes the pipe directly
//!
//! Counters, capacity permits and the read/write locks live in memory shared
//! with forked children when the [`Context`](hyperprocess_common::Context)
//! uses [`StartMethod::Fork`](hyperprocess_common::StartMethod::Fork).
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use hyperprocess_common::Context;
//! use hyperprocess_queue::Queue;
//!
//! # fn main() -> Result<(), hyperprocess_queue::QueueError> {
//! let queue: Queue<Vec<u32>> = Queue::new(&Context::default(), 16)?;
//! queue.put(vec![1, 2, 3], true, None)?;
//! let item = queue.get(true, Some(Duration::from_secs(1)))?;
//! assert_eq!(item, vec![1, 2, 3]);
//!
//! queue.close();
//! queue.join_thread()?;
//! # Ok(())
//! # }
//! ```

/// Queue error type
pub mod error;

/// Background feeder thread
pub mod feeder;

/// Unfinished-task tracking
pub mod joinable;

/// Bounded queue
pub mod queue;

/// Cross-process counters and locks
mod shared;

/// Unbuffered queue
pub mod simple;

pub use error::{QueueError, Result};
pub use feeder::FEEDER_THREAD_NAME;
pub use joinable::JoinableQueue;
pub use queue::Queue;
pub use simple::SimpleQueue;
