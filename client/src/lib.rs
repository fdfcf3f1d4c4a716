//! hyperprocess client library
//!
//! Connects to a hyperprocess listener over a TCP socket, Unix domain socket
//! or Windows named pipe and, when a shared key is configured, proves
//! knowledge of it through the mutual challenge/response handshake.
//!
//! # Example
//!
//! ```no_run
//! use hyperprocess_client::{Address, AuthKey, ClientConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut conn = ClientConfig::new()
//!     .with_address(Address::parse("127.0.0.1:6000")?)
//!     .with_authkey(AuthKey::from("secret"))
//!     .connect()?;
//!
//! conn.send(&("ping", 1u32))?;
//! let reply: String = conn.recv()?;
//! println!("listener replied: {reply}");
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export important types from hyperprocess-common for convenience
pub use hyperprocess_common::{Address, AuthKey, Connection, Context, Family, IpcError};
