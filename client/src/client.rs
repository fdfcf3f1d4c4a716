use hyperprocess_common::{
    auth::{self, AuthKey, Role},
    platform_socket::connect_socket,
    Address, Connection, Context, Family, IpcError, Result,
};

/// Configuration for a client connection
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Listener to connect to
    pub address: Option<Address>,
    /// Expected transport family; checked against the address
    pub family:  Option<Family>,
    /// Shared key; without one no handshake is run
    pub authkey: Option<AuthKey>,
    /// Codec and frame limit for the connection
    pub context: Context,
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration from environment variables
    ///
    /// Reads the context settings and HYPERPROCESS_AUTHKEY.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            authkey: AuthKey::from_env()?,
            context: Context::from_env()?,
            ..Self::default()
        })
    }

    /// Set the listener address
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    /// Require the address to belong to `family`
    pub fn with_family(mut self, family: Family) -> Self {
        self.family = Some(family);
        self
    }

    /// Set the shared key
    pub fn with_authkey(mut self, authkey: AuthKey) -> Self {
        self.authkey = Some(authkey);
        self
    }

    /// Set the context
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Connect using this configuration
    pub fn connect(&self) -> Result<Connection> {
        let address = self
            .address
            .as_ref()
            .ok_or_else(|| IpcError::Config("no address configured".to_string()))?;

        if let Some(family) = self.family {
            if address.family() != family {
                return Err(IpcError::Address(format!(
                    "address {address} does not belong to the {family:?} family"
                )));
            }
        }

        Client::connect(&self.context, address, self.authkey.as_ref())
    }
}

/// Opens connections to a [`Listener`](https://docs.rs/hyperprocess-server)
#[derive(Debug, Clone, Copy)]
pub struct Client;

impl Client {
    /// Connect to `address` and, when a key is given, run the handshake.
    ///
    /// The client answers the listener's challenge first, then challenges
    /// the listener in turn.
    pub fn connect(ctx: &Context, address: &Address, authkey: Option<&AuthKey>) -> Result<Connection> {
        let socket = connect_socket(address)?;
        let mut conn = Connection::from_context(socket, ctx);

        if let Some(key) = authkey {
            tracing::debug!("Authenticating with listener at {}", address);
            if let Err(e) = auth::handshake(&mut conn, key, Role::Client, ctx) {
                tracing::warn!("Handshake with {} failed: {}", address, e);
                return Err(e);
            }
        }

        tracing::info!("Connected to {}", address);
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_address_is_a_config_error() {
        assert!(matches!(ClientConfig::new().connect(), Err(IpcError::Config(_))));
    }

    #[test]
    fn family_override_is_checked() {
        let config = ClientConfig::new()
            .with_address(Address::inet("127.0.0.1", 1))
            .with_family(Family::Unix);
        assert!(matches!(config.connect(), Err(IpcError::Address(_))));
    }

    #[test]
    fn named_pipe_is_unavailable_off_windows() {
        if cfg!(windows) {
            return;
        }
        let result = Client::connect(&Context::default(), &Address::pipe("nowhere"), None);
        assert!(matches!(result, Err(IpcError::Address(_))));
    }
}
