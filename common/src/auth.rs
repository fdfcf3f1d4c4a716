//! Mutual challenge/response authentication.
//!
//! Each side proves knowledge of the shared key without sending it: the
//! verifier sends a random challenge, the responder returns
//! HMAC-SHA256(key, challenge), and the verifier answers with [`WELCOME`]
//! when the digest matches. Both sides run the exchange once in each role.

use std::{env, fmt};

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;

use crate::{
    config::Context,
    connection::Connection,
    error::{IpcError, Result},
};

type HmacSha256 = Hmac<Sha256>;

/// Size of a challenge in bytes
pub const MESSAGE_LENGTH: usize = 32;

/// Acknowledgement sent once a digest checks out
pub const WELCOME: &[u8] = b"WELCOME";

/// Longest message accepted while authenticating
const MAX_HANDSHAKE_MESSAGE: usize = 256;

const AUTHKEY_ENV: &str = "HYPERPROCESS_AUTHKEY";

/// Shared secret used to authenticate peers
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey(Vec<u8>);

impl AuthKey {
    pub fn new<B: Into<Vec<u8>>>(bytes: B) -> Self {
        AuthKey(bytes.into())
    }

    /// A fresh 32-byte key from the OS random source
    pub fn random() -> Self {
        let mut bytes = vec![0u8; MESSAGE_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        AuthKey(bytes)
    }

    /// Decode a key from hex text
    pub fn from_hex(text: &str) -> Result<Self> {
        hex::decode(text.trim())
            .map(AuthKey)
            .map_err(|e| IpcError::Config(format!("authkey is not valid hex: {e}")))
    }

    /// Load the key from `HYPERPROCESS_AUTHKEY`, if set
    pub fn from_env() -> Result<Option<Self>> {
        match env::var(AUTHKEY_ENV) {
            Ok(text) => Self::from_hex(&text).map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    fn mac(&self) -> Result<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.0)
            .map_err(|e| IpcError::Authentication(format!("unusable key: {e}")))
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthKey(<{} bytes redacted>)", self.0.len())
    }
}

impl From<&[u8]> for AuthKey {
    fn from(bytes: &[u8]) -> Self {
        AuthKey(bytes.to_vec())
    }
}

impl From<&str> for AuthKey {
    fn from(text: &str) -> Self {
        AuthKey(text.as_bytes().to_vec())
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepting side: verifies first, then responds
    Server,
    /// Connecting side: responds first, then verifies
    Client,
}

/// Run the mutual handshake on a freshly opened connection.
///
/// The connection carries `ctx.handshake_timeout` as its read timeout while
/// this runs; the timeout is cleared on success.
pub fn handshake(conn: &mut Connection, key: &AuthKey, role: Role, ctx: &Context) -> Result<()> {
    conn.set_read_timeout(Some(ctx.handshake_timeout))?;

    match role {
        Role::Server => {
            deliver_challenge(conn, key)?;
            answer_challenge(conn, key)?;
        }
        Role::Client => {
            answer_challenge(conn, key)?;
            deliver_challenge(conn, key)?;
        }
    }

    conn.set_read_timeout(None)?;
    tracing::debug!("Handshake completed as {:?}", role);
    Ok(())
}

/// Challenge the peer and check its digest
pub fn deliver_challenge(conn: &mut Connection, key: &AuthKey) -> Result<()> {
    let mut challenge = [0u8; MESSAGE_LENGTH];
    OsRng.fill_bytes(&mut challenge);
    conn.send_bytes(&challenge)?;
    tracing::debug!("Sent {}-byte challenge", MESSAGE_LENGTH);

    let response = read_handshake_message(conn)?;
    let mut mac = key.mac()?;
    mac.update(&challenge);
    if mac.verify_slice(&response).is_err() {
        tracing::warn!("Peer answered the challenge with a wrong digest");
        return Err(IpcError::Authentication("digest received was wrong".to_string()));
    }

    conn.send_bytes(WELCOME)?;
    Ok(())
}

/// Answer the peer's challenge and wait for its acknowledgement
pub fn answer_challenge(conn: &mut Connection, key: &AuthKey) -> Result<()> {
    let challenge = read_handshake_message(conn)?;
    let mut mac = key.mac()?;
    mac.update(&challenge);
    conn.send_bytes(&mac.finalize().into_bytes())?;

    let reply = read_handshake_message(conn)?;
    if reply != WELCOME {
        tracing::warn!("Peer rejected our digest");
        return Err(IpcError::Authentication("digest sent was rejected".to_string()));
    }
    Ok(())
}

fn read_handshake_message(conn: &mut Connection) -> Result<Vec<u8>> {
    conn.recv_bytes_limited(MAX_HANDSHAKE_MESSAGE).map_err(|e| match e {
        IpcError::Eof => {
            IpcError::Authentication("peer closed the connection during the handshake".to_string())
        }
        IpcError::FrameTooLarge { len, .. } => {
            IpcError::Authentication(format!("handshake message too long ({len} bytes)"))
        }
        other => other,
    })
}
