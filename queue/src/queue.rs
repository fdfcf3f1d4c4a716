use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use hyperprocess_common::{pipe, Codec, Connection, Context, IpcError};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::{QueueError, Result},
    feeder::{Buffer, Feeder, Slot},
    shared::SharedState,
};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A bounded FIFO queue shared between threads and forked processes.
///
/// `put` appends to a local buffer that a background feeder thread drains
/// into a pipe; `get` reads from the other end of that pipe. Clones share
/// the same queue. Processes forked after the queue was created share it as
/// well, subject to two rules:
///
/// - a child can `put` only if the parent had not started its feeder (that
///   is, had not put anything) before forking;
/// - a child that puts must call [`close`](Queue::close) and
///   [`join_thread`](Queue::join_thread) before it exits, since a forked
///   child exits without running destructors.
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

pub(crate) struct Inner<T> {
    maxsize:        usize,
    write_lock:     bool,
    shared:         Arc<SharedState>,
    buffer:         Arc<Buffer<T>>,
    reader:         Mutex<Connection>,
    writer:         Mutex<Option<Connection>>,
    feeder:         Mutex<Option<Feeder>>,
    closed:         AtomicBool,
    join_cancelled: AtomicBool,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Create a queue holding at most `maxsize` items; 0 means unbounded
    pub fn new(ctx: &Context, maxsize: usize) -> Result<Self> {
        let (reader, writer) = pipe(false, ctx)?;
        let shared = SharedState::new(ctx, maxsize)?;
        tracing::debug!(
            "Created queue (maxsize={}, start_method={}, codec={})",
            maxsize,
            ctx.start_method,
            ctx.codec
        );

        Ok(Self {
            inner: Arc::new(Inner {
                maxsize,
                write_lock: ctx.write_lock,
                shared: Arc::new(shared),
                buffer: Arc::new(Buffer::new()),
                reader: Mutex::new(reader),
                writer: Mutex::new(Some(writer)),
                feeder: Mutex::new(None),
                closed: AtomicBool::new(false),
                join_cancelled: AtomicBool::new(false),
            }),
        })
    }

    /// Append `item`.
    ///
    /// Waits for free capacity when `block` is set, for at most `timeout`
    /// (forever when `None`), and fails with [`QueueError::Full`] if none
    /// frees up.
    pub fn put(&self, item: T, block: bool, timeout: Option<Duration>) -> Result<()> {
        let inner = &*self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        inner.check_feeder()?;

        if inner.maxsize > 0 {
            let acquired = if block {
                inner.shared.acquire_permit(timeout.map(|t| Instant::now() + t))
            } else {
                inner.shared.try_acquire_permit()
            };
            if !acquired {
                return Err(QueueError::Full);
            }
        }

        if let Err(e) = self.ensure_feeder() {
            if inner.maxsize > 0 {
                inner.shared.release_permit();
            }
            return Err(e);
        }

        let size = inner.shared.add_size(1);
        inner.buffer.push(Slot::Item(item));
        tracing::debug!("Item put into queue. New size: {}", size);
        Ok(())
    }

    /// `put` without waiting for capacity
    pub fn put_nowait(&self, item: T) -> Result<()> {
        self.put(item, false, None)
    }

    fn ensure_feeder(&self) -> Result<()> {
        let inner = &*self.inner;
        let mut feeder = lock(&inner.feeder);
        if feeder.is_some() {
            return Ok(());
        }

        let writer = lock(&inner.writer).take().ok_or(QueueError::Closed)?;
        *feeder = Some(Feeder::start(
            inner.buffer.clone(),
            writer,
            inner.shared.clone(),
            inner.maxsize > 0,
            inner.write_lock,
        )?);
        Ok(())
    }

    /// Remove and return the oldest item.
    ///
    /// Waits when `block` is set, for at most `timeout` (forever when
    /// `None`), and fails with [`QueueError::Empty`] if nothing arrives.
    pub fn get(&self, block: bool, timeout: Option<Duration>) -> Result<T> {
        let inner = &*self.inner;
        let deadline = if block {
            timeout.map(|t| Instant::now() + t)
        } else {
            Some(Instant::now())
        };

        let payload = {
            let _rlock = inner.shared.lock_read(deadline).ok_or(QueueError::Empty)?;
            let mut reader = lock(&inner.reader);

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if !reader.poll(remaining)? {
                return Err(QueueError::Empty);
            }

            match reader.recv_bytes() {
                Ok(payload) => payload,
                Err(IpcError::Eof) => return Err(inner.end_of_stream()),
                Err(e) => return Err(e.into()),
            }
        };

        if inner.maxsize > 0 {
            inner.shared.release_permit();
        }
        let size = inner.shared.add_size(-1);
        tracing::debug!("Item retrieved from queue. New size: {}", size);

        Ok(Codec::decode(&payload)?)
    }

    /// `get` without waiting
    pub fn get_nowait(&self) -> Result<T> {
        self.get(false, None)
    }
}

impl<T> Queue<T> {
    /// Capacity bound; 0 means unbounded
    pub fn maxsize(&self) -> usize {
        self.inner.maxsize
    }

    /// Approximate number of items put and not yet taken
    pub fn qsize(&self) -> usize {
        self.inner.shared.size().max(0) as usize
    }

    /// Approximate emptiness check
    pub fn empty(&self) -> bool {
        self.inner.shared.size() <= 0
    }

    /// Approximate fullness check; never true for unbounded queues
    pub fn full(&self) -> bool {
        self.inner.maxsize > 0 && self.inner.shared.size() >= self.inner.maxsize as i64
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting items. Items already put are still delivered.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Wait for the feeder to flush everything and exit.
    ///
    /// Fails with [`QueueError::NotClosed`] on an open queue and with
    /// [`QueueError::FeederFailed`] if the feeder stopped on an error.
    pub fn join_thread(&self) -> Result<()> {
        if !self.is_closed() {
            return Err(QueueError::NotClosed);
        }
        self.inner.join_feeder()
    }

    /// Do not wait for the feeder when the last handle is dropped
    pub fn cancel_join_thread(&self) {
        self.inner.join_cancelled.store(true, Ordering::SeqCst);
        tracing::debug!("Join thread cancelled");
    }

    pub(crate) fn shared(&self) -> &SharedState {
        &self.inner.shared
    }
}

impl<T> Inner<T> {
    fn check_feeder(&self) -> Result<()> {
        let mut feeder = lock(&self.feeder);
        if let Some(feeder) = feeder.as_mut() {
            if feeder.is_foreign() {
                return Err(QueueError::ForeignFeeder { pid: feeder.pid() });
            }
            if let Some(message) = feeder.failure() {
                return Err(QueueError::FeederFailed(message.to_string()));
            }
        }
        Ok(())
    }

    /// Our writer is gone, so a local feeder has finished or is finishing
    fn end_of_stream(&self) -> QueueError {
        let mut feeder = lock(&self.feeder);
        let failure = feeder
            .as_mut()
            .filter(|f| !f.is_foreign())
            .and_then(|f| f.settle().map(str::to_string));
        match failure {
            Some(message) => QueueError::FeederFailed(message),
            None => QueueError::Ipc(IpcError::Eof),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        match lock(&self.feeder).as_ref() {
            Some(feeder) if feeder.is_foreign() => {}
            Some(_) => self.buffer.push(Slot::Sentinel),
            None => {
                if let Some(mut writer) = lock(&self.writer).take() {
                    writer.close();
                }
            }
        }
        tracing::debug!("Queue closed");
    }

    fn join_feeder(&self) -> Result<()> {
        match lock(&self.feeder).as_mut() {
            Some(feeder) if !feeder.is_foreign() => {
                feeder.join().map_err(QueueError::FeederFailed)?;
                tracing::debug!("Join thread completed");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        self.close();

        // Release our read end first so a feeder blocked on a full pipe
        // fails instead of waiting forever.
        self.reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .close();

        if self.join_cancelled.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.join_feeder() {
            tracing::warn!("Queue feeder ended with an error during teardown: {}", e);
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("maxsize", &self.inner.maxsize)
            .field("qsize", &self.qsize())
            .field("closed", &self.is_closed())
            .finish()
    }
}
