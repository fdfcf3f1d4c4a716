//! Authenticated listener.
//!
//! A [`Listener`] binds a TCP socket, Unix domain socket or Windows named
//! pipe and hands out framed [`Connection`]s. When it holds a key, every
//! accepted connection must pass the mutual challenge/response handshake
//! before it is returned.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context as _;
use hyperprocess_common::{
    auth::{self, AuthKey, Role},
    platform_socket::PlatformListener,
    Address, Connection, Context, Family, IpcError, Result,
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Accepts connections on one address
pub struct Listener {
    listener: Option<PlatformListener>,
    address:  Address,
    authkey:  Option<AuthKey>,
    ctx:      Context,
}

impl Listener {
    /// Bind a listener.
    ///
    /// With no `address`, an arbitrary free address of `family` (TCP when
    /// unspecified) is chosen. When both are given they must agree.
    ///
    /// # Arguments
    /// * `ctx` - Codec and frame limit for accepted connections
    /// * `address` - Where to listen
    /// * `family` - Transport family to pick an address from
    /// * `authkey` - Shared key; without one no handshake is run
    pub fn bind(
        ctx: &Context,
        address: Option<Address>,
        family: Option<Family>,
        authkey: Option<AuthKey>,
    ) -> Result<Self> {
        let address = match (address, family) {
            (Some(address), Some(family)) if address.family() != family => {
                return Err(IpcError::Address(format!(
                    "address {address} does not belong to the {family:?} family"
                )));
            }
            (Some(address), _) => address,
            (None, family) => Address::arbitrary(family.unwrap_or(Family::Inet)),
        };

        let listener = PlatformListener::bind(&address)?;
        let address = listener.local_address()?;
        tracing::info!(
            "Listener bound to {} ({})",
            address,
            if authkey.is_some() { "authenticated" } else { "no authentication" }
        );

        Ok(Self {
            listener: Some(listener),
            address,
            authkey,
            ctx: ctx.clone(),
        })
    }

    /// The address clients should connect to
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn closed(&self) -> bool {
        self.listener.is_none()
    }

    fn listener(&self) -> Result<&PlatformListener> {
        self.listener.as_ref().ok_or(IpcError::Closed)
    }

    /// Accept one connection and authenticate it
    pub fn accept(&self) -> Result<Connection> {
        let socket = self.listener()?.accept()?;
        self.establish(Connection::from_context(socket, &self.ctx))
    }

    fn establish(&self, mut conn: Connection) -> Result<Connection> {
        if let Address::Unix(_) = self.address {
            match conn.peer_credentials() {
                Ok(creds) => {
                    tracing::debug!("Peer PID: {}, UID: {}", creds.pid, creds.uid)
                }
                Err(e) => tracing::debug!("Peer credentials unavailable: {}", e),
            }
        }

        if let Some(key) = &self.authkey {
            tracing::debug!("Authenticating peer on {}", self.address);
            auth::handshake(&mut conn, key, Role::Server, &self.ctx)?;
        }

        tracing::info!("Accepted connection on {}", self.address);
        Ok(conn)
    }

    /// Iterator over accepted, authenticated connections
    pub fn incoming(&self) -> Incoming<'_> {
        Incoming { listener: self }
    }

    /// Accept connections until `running` is cleared, passing each to
    /// `handler`.
    ///
    /// Connections that fail the handshake are logged and skipped, as are
    /// handler errors.
    pub fn serve<F>(&self, running: Arc<AtomicBool>, mut handler: F) -> anyhow::Result<()>
    where
        F: FnMut(Connection) -> anyhow::Result<()>,
    {
        let listener = self.listener()?;
        tracing::info!("Listener serving on {}", self.address);

        // Non-blocking accept so the running flag is observed
        listener
            .set_nonblocking(true)
            .with_context(|| format!("Failed to make {} non-blocking", self.address))?;

        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok(socket) => match self.establish(Connection::from_context(socket, &self.ctx)) {
                    Ok(conn) => {
                        if let Err(e) = handler(conn) {
                            tracing::error!("Connection handler error: {:#}", e);
                        }
                    }
                    Err(IpcError::Authentication(reason)) => {
                        tracing::warn!("Rejected peer on {}: {}", self.address, reason);
                    }
                    Err(e) => tracing::error!("Connection setup failed: {}", e),
                },
                Err(IpcError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_BACKOFF);
                }
                Err(e) => tracing::error!("Accept error: {}", e),
            }
        }

        tracing::info!("Shutdown signal received, listener on {} stopping", self.address);
        if let Err(e) = listener.set_nonblocking(false) {
            tracing::warn!("Failed to restore blocking accept: {}", e);
        }
        Ok(())
    }

    /// Stop listening. Secondary errors are logged, not returned.
    pub fn close(&mut self) {
        if let Some(listener) = self.listener.take() {
            tracing::info!("Closing listener on {}", self.address);
            drop(listener);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("address", &self.address)
            .field("authkey", &self.authkey)
            .field("closed", &self.closed())
            .finish()
    }
}

/// Iterator returned by [`Listener::incoming`]
pub struct Incoming<'a> {
    listener: &'a Listener,
}

impl Iterator for Incoming<'_> {
    type Item = Result<Connection>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.listener.listener {
            Some(_) => Some(self.listener.accept()),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arbitrary_tcp_address_reports_real_port() {
        let listener = Listener::bind(&Context::default(), None, None, None).unwrap();
        match listener.address() {
            Address::Inet { host, port } => {
                assert_eq!(host, "127.0.0.1");
                assert_ne!(*port, 0);
            }
            other => panic!("expected a TCP address, got {other}"),
        }
    }

    #[test]
    fn family_must_match_address() {
        let err = Listener::bind(
            &Context::default(),
            Some(Address::inet("127.0.0.1", 0)),
            Some(Family::Unix),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, IpcError::Address(_)));
    }

    #[cfg(unix)]
    #[test]
    fn closing_twice_is_harmless() {
        let mut listener =
            Listener::bind(&Context::default(), None, Some(Family::Unix), None).unwrap();
        let path = match listener.address() {
            Address::Unix(path) => path.clone(),
            other => panic!("expected a Unix address, got {other}"),
        };
        assert!(path.exists());

        listener.close();
        listener.close();
        assert!(listener.closed());
        assert!(!path.exists());
        assert!(matches!(listener.accept(), Err(IpcError::Closed)));
        assert!(listener.incoming().next().is_none());
    }
}
