//! The background thread that moves buffered items onto the pipe.

use std::{
    collections::VecDeque,
    io, process,
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, TryRecvError};
use hyperprocess_common::Connection;
use serde::Serialize;

use crate::shared::SharedState;

/// Thread name given to every feeder
pub const FEEDER_THREAD_NAME: &str = "QueueFeederThread";

pub(crate) enum Slot<T> {
    Item(T),
    /// Tells the feeder to close the writer and exit
    Sentinel,
}

/// Items waiting for the feeder
pub(crate) struct Buffer<T> {
    slots:     Mutex<VecDeque<Slot<T>>>,
    not_empty: Condvar,
}

impl<T> Buffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots:     Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, slot: Slot<T>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.push_back(slot);
        self.not_empty.notify_one();
    }

    /// Wait until something is buffered and take all of it
    fn drain(&self) -> Vec<Slot<T>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        while slots.is_empty() {
            slots = self
                .not_empty
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
        slots.drain(..).collect()
    }
}

type Outcome = Result<(), String>;

/// Handle on a running feeder thread
pub(crate) struct Feeder {
    handle:  Option<JoinHandle<()>>,
    outcome: Receiver<Outcome>,
    pid:     u32,
    /// Outcome once the thread has reported one
    report:  Option<Outcome>,
}

impl Feeder {
    /// Spawn a feeder that owns `writer` until it sees the sentinel
    pub(crate) fn start<T>(
        buffer: Arc<Buffer<T>>,
        writer: Connection,
        shared: Arc<SharedState>,
        bounded: bool,
        write_lock: bool,
    ) -> io::Result<Self>
    where
        T: Serialize + Send + 'static,
    {
        tracing::debug!("Starting queue feeder thread");
        let (tx, rx) = crossbeam_channel::bounded(1);

        let handle = thread::Builder::new()
            .name(FEEDER_THREAD_NAME.to_string())
            .spawn(move || {
                tracing::debug!("Feeder thread started");
                let outcome = feed(&buffer, writer, &shared, bounded, write_lock);
                let _ = tx.send(outcome);
            })?;

        tracing::info!("Queue feeder thread started");
        Ok(Self {
            handle:  Some(handle),
            outcome: rx,
            pid:     process::id(),
            report:  None,
        })
    }

    /// Pid of the process that started this feeder
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the feeder thread lives in another process (we were forked
    /// after it started)
    pub(crate) fn is_foreign(&self) -> bool {
        self.pid != process::id()
    }

    /// The feeder's failure, if it has reported one
    pub(crate) fn failure(&mut self) -> Option<&str> {
        if self.report.is_none() {
            match self.outcome.try_recv() {
                Ok(outcome) => self.report = Some(outcome),
                Err(TryRecvError::Empty) => {}
                // The thread ended without sending, so it panicked
                Err(TryRecvError::Disconnected) => {
                    self.report = Some(Err("feeder thread panicked".to_string()));
                }
            }
        }
        match &self.report {
            Some(Err(message)) => Some(message),
            _ => None,
        }
    }

    /// Block until the feeder reports, then return its failure, if any.
    ///
    /// Only call this once the feeder is known to be finishing, e.g. after
    /// its writer hit end-of-stream.
    pub(crate) fn settle(&mut self) -> Option<&str> {
        if self.report.is_none() {
            self.report = Some(
                self.outcome
                    .recv()
                    .unwrap_or_else(|_| Err("feeder thread panicked".to_string())),
            );
        }
        self.failure()
    }

    /// Wait for the feeder to exit and return its failure, if any
    pub(crate) fn join(&mut self) -> Result<(), String> {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() && self.report.is_none() {
                self.report = Some(Err("feeder thread panicked".to_string()));
            }
            tracing::debug!("Queue feeder thread joined");
        }
        match self.failure() {
            Some(message) => Err(message.to_string()),
            None => Ok(()),
        }
    }
}

fn feed<T: Serialize>(
    buffer: &Buffer<T>,
    mut writer: Connection,
    shared: &SharedState,
    bounded: bool,
    write_lock: bool,
) -> Outcome {
    loop {
        for slot in buffer.drain() {
            let item = match slot {
                Slot::Item(item) => item,
                Slot::Sentinel => {
                    tracing::debug!("Feeder thread received sentinel, exiting");
                    writer.close();
                    return Ok(());
                }
            };

            let payload = match writer.codec().encode(&item) {
                Ok(payload) => payload,
                Err(e) => {
                    // The item never reaches a reader; give back what put took
                    tracing::error!("Dropping queue item that failed to encode: {}", e);
                    shared.add_size(-1);
                    if bounded {
                        shared.release_permit();
                    }
                    shared.finish_one();
                    continue;
                }
            };

            let _guard = if write_lock { shared.lock_write(None) } else { None };
            if let Err(e) = writer.send_bytes(&payload) {
                if e.is_disconnect() {
                    tracing::warn!("Queue reader went away, feeder exiting: {}", e);
                } else {
                    tracing::error!("Error in feeder thread: {}", e);
                }
                return Err(e.to_string());
            }
        }
    }
}
