use std::time::{Duration, Instant};

use hyperprocess_common::Context;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::{QueueError, Result},
    queue::Queue,
};

/// A [`Queue`] that also counts unfinished tasks.
///
/// Every successful `put` adds a task; consumers call
/// [`task_done`](Self::task_done) once per item they finished, and
/// [`join`](Self::join) waits until no task is outstanding.
pub struct JoinableQueue<T> {
    queue: Queue<T>,
}

impl<T> Clone for JoinableQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<T> JoinableQueue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Create a joinable queue holding at most `maxsize` items; 0 means
    /// unbounded
    pub fn new(ctx: &Context, maxsize: usize) -> Result<Self> {
        Ok(Self {
            queue: Queue::new(ctx, maxsize)?,
        })
    }

    /// Append `item` and count it as an unfinished task
    pub fn put(&self, item: T, block: bool, timeout: Option<Duration>) -> Result<()> {
        // Counted before the item becomes visible so a fast consumer's
        // task_done never runs ahead of it.
        let shared = self.queue.shared();
        shared.add_unfinished();
        if let Err(e) = self.queue.put(item, block, timeout) {
            shared.finish_one();
            return Err(e);
        }
        Ok(())
    }

    pub fn put_nowait(&self, item: T) -> Result<()> {
        self.put(item, false, None)
    }

    /// Remove and return the oldest item. Does not mark it done.
    pub fn get(&self, block: bool, timeout: Option<Duration>) -> Result<T> {
        self.queue.get(block, timeout)
    }

    pub fn get_nowait(&self) -> Result<T> {
        self.queue.get_nowait()
    }
}

impl<T> JoinableQueue<T> {
    /// Mark one retrieved item as processed.
    ///
    /// Fails with [`QueueError::TaskDoneTooManyTimes`] when no task is
    /// outstanding.
    pub fn task_done(&self) -> Result<()> {
        if self.queue.shared().finish_one() {
            return Ok(());
        }
        tracing::error!("task_done() called more times than items were put");
        Err(QueueError::TaskDoneTooManyTimes)
    }

    /// Block until every task put so far is done
    pub fn join(&self) {
        self.queue.shared().wait_all_finished(None);
    }

    /// Like [`join`](Self::join) with a bound; returns whether all tasks
    /// finished in time
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.queue
            .shared()
            .wait_all_finished(Some(Instant::now() + timeout))
    }

    /// Number of tasks put and not yet marked done
    pub fn unfinished_tasks(&self) -> usize {
        self.queue.shared().unfinished().max(0) as usize
    }

    pub fn maxsize(&self) -> usize {
        self.queue.maxsize()
    }

    pub fn qsize(&self) -> usize {
        self.queue.qsize()
    }

    pub fn empty(&self) -> bool {
        self.queue.empty()
    }

    pub fn full(&self) -> bool {
        self.queue.full()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn close(&self) {
        self.queue.close();
    }

    pub fn join_thread(&self) -> Result<()> {
        self.queue.join_thread()
    }

    pub fn cancel_join_thread(&self) {
        self.queue.cancel_join_thread();
    }
}

impl<T> std::fmt::Debug for JoinableQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinableQueue")
            .field("maxsize", &self.maxsize())
            .field("qsize", &self.qsize())
            .field("unfinished_tasks", &self.unfinished_tasks())
            .field("closed", &self.is_closed())
            .finish()
    }
}
