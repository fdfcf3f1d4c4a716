use std::{env, fmt, str::FromStr, time::Duration};

use crate::{codec::Codec, error::IpcError};

const START_METHOD_ENV: &str = "HYPERPROCESS_START_METHOD";
const CODEC_ENV: &str = "HYPERPROCESS_CODEC";
const MAX_FRAME_LEN_ENV: &str = "HYPERPROCESS_MAX_FRAME_LEN";

/// Largest frame a connection accepts unless configured otherwise (64 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// How long a peer may stay silent during the authentication handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often waits on process-shared counters re-check the shared value
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How child workers are launched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMethod {
    /// Fork the current OS process; children inherit queues and pipes.
    Fork,
    /// Run workers on threads of the current process.
    Thread,
}

impl StartMethod {
    /// The start method used when none is configured: `Fork` where the
    /// platform has it, `Thread` elsewhere.
    pub fn platform_default() -> Self {
        if cfg!(unix) {
            StartMethod::Fork
        } else {
            StartMethod::Thread
        }
    }

    /// Whether state created under this method must be visible to other
    /// processes.
    pub fn is_multiprocess(self) -> bool {
        matches!(self, StartMethod::Fork)
    }
}

impl FromStr for StartMethod {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fork" => Ok(StartMethod::Fork),
            "thread" => Ok(StartMethod::Thread),
            other => Err(IpcError::Config(format!("unknown start method: {other}"))),
        }
    }
}

impl fmt::Display for StartMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartMethod::Fork => f.write_str("fork"),
            StartMethod::Thread => f.write_str("thread"),
        }
    }
}

/// Explicit configuration handed to every queue, process, listener and
/// client.
#[derive(Debug, Clone)]
pub struct Context {
    /// How child workers start, and therefore where queue state lives
    pub start_method:      StartMethod,
    /// Codec used to encode outgoing payloads
    pub codec:             Codec,
    /// Upper bound on an incoming frame
    pub max_frame_len:     usize,
    /// Read timeout applied while the handshake runs
    pub handshake_timeout: Duration,
    /// Re-check interval for waits on process-shared counters
    pub poll_interval:     Duration,
    /// Serialize writers on a shared lock (platforms without atomic writes)
    pub write_lock:        bool,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            start_method:      StartMethod::platform_default(),
            codec:             Codec::Bincode,
            max_frame_len:     DEFAULT_MAX_FRAME_LEN,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            poll_interval:     DEFAULT_POLL_INTERVAL,
            write_lock:        !cfg!(windows),
        }
    }
}

impl Context {
    /// Creates a context with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context for the given start method
    pub fn with_start_method(start_method: StartMethod) -> Self {
        Self {
            start_method,
            ..Self::default()
        }
    }

    /// Creates a context from environment variables
    ///
    /// Reads HYPERPROCESS_START_METHOD, HYPERPROCESS_CODEC and
    /// HYPERPROCESS_MAX_FRAME_LEN; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, IpcError> {
        let mut ctx = Self::new();

        if let Ok(method) = env::var(START_METHOD_ENV) {
            ctx.start_method = method.parse()?;
        }

        if let Ok(codec) = env::var(CODEC_ENV) {
            ctx.codec = codec.parse()?;
        }

        if let Ok(len) = env::var(MAX_FRAME_LEN_ENV) {
            ctx.max_frame_len = len.trim().parse().map_err(|_| {
                IpcError::Config(format!("{MAX_FRAME_LEN_ENV} is not a byte count: {len}"))
            })?;
        }

        tracing::debug!(
            "Context from environment: start_method={}, codec={:?}, max_frame_len={}",
            ctx.start_method,
            ctx.codec,
            ctx.max_frame_len
        );
        Ok(ctx)
    }

    /// Set the payload codec
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the incoming frame limit
    pub fn max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Set the handshake read timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the shared-counter re-check interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enable or disable the shared write lock
    pub fn write_lock(mut self, enabled: bool) -> Self {
        self.write_lock = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_method_parses_case_insensitively() {
        assert_eq!("Fork".parse::<StartMethod>().unwrap(), StartMethod::Fork);
        assert_eq!(" thread ".parse::<StartMethod>().unwrap(), StartMethod::Thread);
        assert!("spawn".parse::<StartMethod>().is_err());
    }

    #[test]
    fn builder_overrides_defaults() {
        let ctx = Context::with_start_method(StartMethod::Thread)
            .codec(Codec::Json)
            .max_frame_len(1024)
            .write_lock(false);

        assert_eq!(ctx.start_method, StartMethod::Thread);
        assert_eq!(ctx.codec, Codec::Json);
        assert_eq!(ctx.max_frame_len, 1024);
        assert!(!ctx.write_lock);
        assert_eq!(ctx.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn only_fork_is_multiprocess() {
        assert!(StartMethod::Fork.is_multiprocess());
        assert!(!StartMethod::Thread.is_multiprocess());
    }
}
