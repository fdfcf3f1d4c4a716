use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, TryLockError,
    },
    time::Duration,
};

use hyperprocess_common::{pipe, Codec, Connection, Context, IpcError};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::{QueueError, Result},
    queue::lock,
    shared::SharedState,
};

/// An unbounded queue without a buffer or feeder thread.
///
/// `put` writes straight to the pipe under the write lock and `get` reads
/// under the read lock, so both may block on the pipe itself. `close` never
/// waits for them: a blocked `get` notices within one poll interval and
/// fails with [`QueueError::Closed`].
pub struct SimpleQueue<T> {
    inner:   Arc<SimpleInner>,
    _marker: PhantomData<fn(T) -> T>,
}

struct SimpleInner {
    reader:        Mutex<Connection>,
    writer:        Mutex<Connection>,
    /// Second handle on the read end, only ever polled with a zero timeout
    watcher:       Mutex<Connection>,
    shared:        SharedState,
    write_lock:    bool,
    poll_interval: Duration,
    closed:        AtomicBool,
}

impl<T> Clone for SimpleQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner:   self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> SimpleQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(ctx: &Context) -> Result<Self> {
        let (reader, writer) = pipe(false, ctx)?;
        let watcher = reader.try_clone()?;
        Ok(Self {
            inner:   Arc::new(SimpleInner {
                reader:        Mutex::new(reader),
                writer:        Mutex::new(writer),
                watcher:       Mutex::new(watcher),
                shared:        SharedState::new(ctx, 0)?,
                write_lock:    ctx.write_lock,
                poll_interval: ctx.poll_interval,
                closed:        AtomicBool::new(false),
            }),
            _marker: PhantomData,
        })
    }

    /// Write `item` to the pipe
    pub fn put(&self, item: T) -> Result<()> {
        self.check_open()?;
        let inner = &*self.inner;
        let mut writer = lock(&inner.writer);
        if self.is_closed() {
            writer.close();
            return Err(QueueError::Closed);
        }
        let payload = writer.codec().encode(&item)?;

        let result = {
            let _wlock = if inner.write_lock { inner.shared.lock_write(None) } else { None };
            writer.send_bytes(&payload)
        };
        // close() skipped the writer while we held it
        if self.is_closed() {
            writer.close();
        }
        Ok(result?)
    }

    /// Read the next item, blocking until one arrives or the queue is closed
    pub fn get(&self) -> Result<T> {
        self.check_open()?;
        let inner = &*self.inner;
        let payload = {
            let _rlock = inner.shared.lock_read(None);
            let mut reader = lock(&inner.reader);
            loop {
                if self.is_closed() {
                    reader.close();
                    return Err(QueueError::Closed);
                }
                if reader.poll(Some(inner.poll_interval))? {
                    break;
                }
            }
            reader.recv_bytes()?
        };
        Ok(Codec::decode(&payload)?)
    }
}

impl<T> SimpleQueue<T> {
    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    /// Whether nothing can be read right now. Never waits for a reader.
    pub fn empty(&self) -> Result<bool> {
        self.check_open()?;
        match lock(&self.inner.watcher).poll(Some(Duration::ZERO)) {
            Ok(ready) => Ok(!ready),
            Err(IpcError::Closed) => Err(QueueError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    /// Close both ends. Safe to call more than once, and from any thread
    /// while others are inside `get` or `put`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.inner.watcher).close();
        // Ends in use are closed by the get or put holding them
        close_if_idle(&self.inner.reader);
        close_if_idle(&self.inner.writer);
        tracing::debug!("SimpleQueue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

fn close_if_idle(conn: &Mutex<Connection>) {
    match conn.try_lock() {
        Ok(mut conn) => conn.close(),
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().close(),
        Err(TryLockError::WouldBlock) => {}
    }
}

impl<T> std::fmt::Debug for SimpleQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleQueue")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use hyperprocess_common::StartMethod;

    use super::*;

    fn ctx() -> Context {
        Context::with_start_method(StartMethod::Thread)
    }

    /// Spawn `get` on another thread and give it time to block
    fn blocked_getter(queue: &SimpleQueue<u8>) -> thread::JoinHandle<Result<u8>> {
        let queue = queue.clone();
        let handle = thread::spawn(move || queue.get());
        thread::sleep(Duration::from_millis(50));
        handle
    }

    #[test]
    fn empty_reflects_pending_items() {
        let queue: SimpleQueue<(u8, String)> = SimpleQueue::new(&ctx()).unwrap();
        assert!(queue.empty().unwrap());

        queue.put((1, "one".to_string())).unwrap();
        assert!(!queue.empty().unwrap());
        assert_eq!(queue.get().unwrap(), (1, "one".to_string()));
        assert!(queue.empty().unwrap());
    }

    #[test]
    fn closed_queue_rejects_everything() {
        let queue: SimpleQueue<u8> = SimpleQueue::new(&ctx()).unwrap();
        queue.close();
        queue.close();
        assert!(matches!(queue.put(1), Err(QueueError::Closed)));
        assert!(matches!(queue.get(), Err(QueueError::Closed)));
        assert!(matches!(queue.empty(), Err(QueueError::Closed)));
    }

    #[test]
    fn close_wakes_a_blocked_getter() {
        let queue: SimpleQueue<u8> = SimpleQueue::new(&ctx()).unwrap();
        let getter = blocked_getter(&queue);

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let closer = {
            let queue = queue.clone();
            thread::spawn(move || {
                queue.close();
                queue.close();
                let _ = done_tx.send(());
            })
        };

        assert!(
            done_rx.recv_timeout(Duration::from_secs(2)).is_ok(),
            "close waited on the blocked get"
        );
        assert!(matches!(getter.join().unwrap(), Err(QueueError::Closed)));
        closer.join().unwrap();
    }

    #[test]
    fn empty_answers_while_a_getter_is_blocked() {
        let queue: SimpleQueue<u8> = SimpleQueue::new(&ctx()).unwrap();
        let getter = blocked_getter(&queue);

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        {
            let queue = queue.clone();
            thread::spawn(move || {
                let _ = result_tx.send(queue.empty());
            });
        }
        let empty = result_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("empty() waited on the blocked get");
        assert!(empty.unwrap());

        queue.put(5).unwrap();
        assert_eq!(getter.join().unwrap().unwrap(), 5);
    }
}
