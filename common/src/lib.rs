//! hyperprocess common library
//!
//! Building blocks shared by the listener, the client and the queues:
//!
//! - Address parsing and transport family inference
//! - Platform-specific endpoints (Unix domain sockets, TCP, Windows named pipes)
//! - Length-prefixed framed [`Connection`]s and in-process [`pipe`]s
//! - Mutual HMAC-SHA256 challenge/response authentication
//! - Tagged payload codecs
//! - The explicit [`Context`] every component is configured with
//! - Child workers started by fork or on a thread
//!
//! # Features
//!
//! - **Cross-platform IPC**: one interface over Unix domain sockets, TCP and named pipes
//! - **Mutual authentication**: a shared key is proven by both peers without being sent
//! - **Bounded frames**: incoming frame sizes are capped by configuration

/// Listener and client addresses
pub mod address;

/// Challenge/response handshake and the shared key type
pub mod auth;

/// Payload codecs
pub mod codec;

/// Runtime configuration
pub mod config;

/// Framed connections
pub mod connection;

/// Error type shared by every crate
pub mod error;

/// Platform-specific socket implementations
pub mod platform_socket;

/// Child workers
pub mod process;

// Re-export commonly used types for convenience
pub use address::{Address, Family};
pub use auth::{AuthKey, Role};
pub use codec::Codec;
pub use config::{Context, StartMethod};
pub use connection::{pipe, Connection};
pub use error::{IpcError, Result};
pub use platform_socket::{PeerCredentials, PlatformListener, PlatformSocket};
pub use process::Process;
