use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use rand::RngCore;

use crate::error::{IpcError, Result};

/// Prefix reserved for Windows named pipes
pub const PIPE_PREFIX: &str = r"\\.\pipe\";

/// Transport family of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// TCP socket on a host/port pair
    Inet,
    /// Unix-domain socket on a filesystem path
    Unix,
    /// Windows named pipe
    Pipe,
}

/// Where a listener binds or a client connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Host/port pair
    Inet {
        /// Host name or IP literal
        host: String,
        /// Port; 0 asks the OS for a free one
        port: u16,
    },
    /// Filesystem path of a Unix-domain socket
    Unix(PathBuf),
    /// Full named pipe path, `\\.\pipe\name`
    Pipe(String),
}

impl Address {
    /// Infer an address from its textual shape
    ///
    /// * `\\...`           -> named pipe
    /// * contains `/` or ends in `.sock` -> Unix-domain socket
    /// * `host:port`       -> TCP socket
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with(r"\\") {
            if !s.starts_with(PIPE_PREFIX) || s.len() == PIPE_PREFIX.len() {
                return Err(IpcError::Address(format!(
                    "named pipe addresses must look like {PIPE_PREFIX}name, got {s:?}"
                )));
            }
            return Ok(Address::Pipe(s.to_string()));
        }

        if s.contains('/') || s.ends_with(".sock") {
            return Ok(Address::Unix(PathBuf::from(s)));
        }

        if let Some((host, port)) = s.rsplit_once(':') {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if !host.is_empty() {
                if let Ok(port) = port.parse::<u16>() {
                    return Ok(Address::Inet {
                        host: host.to_string(),
                        port,
                    });
                }
            }
        }

        Err(IpcError::Address(format!("unrecognized address shape: {s:?}")))
    }

    /// Build a TCP address
    pub fn inet<S: Into<String>>(host: S, port: u16) -> Self {
        Address::Inet {
            host: host.into(),
            port,
        }
    }

    /// Build a Unix-domain socket address
    pub fn unix<P: AsRef<Path>>(path: P) -> Self {
        Address::Unix(path.as_ref().to_path_buf())
    }

    /// Build a named pipe address from a bare pipe name
    pub fn pipe(name: &str) -> Self {
        Address::Pipe(format!("{PIPE_PREFIX}{name}"))
    }

    /// The family this address belongs to
    pub fn family(&self) -> Family {
        match self {
            Address::Inet { .. } => Family::Inet,
            Address::Unix(_) => Family::Unix,
            Address::Pipe(_) => Family::Pipe,
        }
    }

    /// An address of `family` that is very likely free
    pub fn arbitrary(family: Family) -> Self {
        match family {
            Family::Inet => Address::inet("127.0.0.1", 0),
            Family::Unix => {
                let name = format!("hyperprocess-listener-{}.sock", random_suffix());
                Address::Unix(std::env::temp_dir().join(name))
            }
            Family::Pipe => Address::pipe(&format!("hyperprocess-{}", random_suffix())),
        }
    }
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl FromStr for Address {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::inet(addr.ip().to_string(), addr.port())
    }
}

impl From<PathBuf> for Address {
    fn from(path: PathBuf) -> Self {
        Address::Unix(path)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Address::Inet { host, port } => write!(f, "{host}:{port}"),
            Address::Unix(path) => write!(f, "{}", path.display()),
            Address::Pipe(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_is_inferred_from_shape() {
        assert_eq!(Address::parse("localhost:6000").unwrap(), Address::inet("localhost", 6000));
        assert_eq!(Address::parse("[::1]:80").unwrap(), Address::inet("::1", 80));
        assert_eq!(
            Address::parse("/tmp/worker.sock").unwrap(),
            Address::unix("/tmp/worker.sock")
        );
        assert_eq!(Address::parse("worker.sock").unwrap().family(), Family::Unix);
        assert_eq!(
            Address::parse(r"\\.\pipe\jobs").unwrap(),
            Address::Pipe(r"\\.\pipe\jobs".to_string())
        );
    }

    #[test]
    fn unrecognized_shapes_fail_immediately() {
        for bad in ["", "justaname", "host:notaport", ":80", r"\\server\share", r"\\.\pipe\"] {
            assert!(
                matches!(Address::parse(bad), Err(IpcError::Address(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn arbitrary_addresses_match_their_family() {
        for family in [Family::Inet, Family::Unix, Family::Pipe] {
            assert_eq!(Address::arbitrary(family).family(), family);
        }
        assert_ne!(Address::arbitrary(Family::Unix), Address::arbitrary(Family::Unix));
    }

    #[test]
    fn display_round_trips_through_parse() {
        for addr in [
            Address::inet("127.0.0.1", 9000),
            Address::inet("::1", 9000),
            Address::unix("/run/app/q.sock"),
            Address::pipe("q"),
        ] {
            assert_eq!(Address::parse(&addr.to_string()).unwrap(), addr);
        }
    }
}
