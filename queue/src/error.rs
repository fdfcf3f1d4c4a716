use hyperprocess_common::IpcError;
use thiserror::Error;

/// Errors raised by queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// No capacity became free before the deadline
    #[error("queue is full")]
    Full,

    /// Nothing arrived before the deadline
    #[error("queue is empty")]
    Empty,

    /// The queue was closed by this handle
    #[error("queue is closed")]
    Closed,

    /// `join_thread` was called before `close`
    #[error("queue must be closed before joining its feeder")]
    NotClosed,

    /// The feeder stopped after a write failure
    #[error("queue feeder failed: {0}")]
    FeederFailed(String),

    /// The feeder was started by another process before this one forked
    #[error("queue feeder belongs to process {pid}")]
    ForeignFeeder { pid: u32 },

    /// `task_done` was called more times than items were put
    #[error("task_done() called too many times")]
    TaskDoneTooManyTimes,

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

impl From<std::io::Error> for QueueError {
    fn from(e: std::io::Error) -> Self {
        QueueError::Ipc(IpcError::Io(e))
    }
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
