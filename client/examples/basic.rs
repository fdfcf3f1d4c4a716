use std::env;

use anyhow::{Context, Result};
use hyperprocess_client::{Address, ClientConfig};

/// Talks to the `echo` server example.
///
/// Usage: basic <address>, with HYPERPROCESS_AUTHKEY set to the key the
/// server printed.
fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("=== hyperprocess Client Basic Example ===");

    let address = env::args()
        .nth(1)
        .context("usage: basic <address>")?;
    let address = Address::parse(&address).context("Invalid listener address")?;

    let config = ClientConfig::from_env()
        .context("Failed to read configuration from the environment")?
        .with_address(address.clone());
    if config.authkey.is_none() {
        println!("HYPERPROCESS_AUTHKEY is not set; connecting without authentication");
    }

    println!("Connecting to {address}...");
    let mut conn = config.connect().context("Failed to connect")?;
    println!("✓ Connected");

    for message in ["ping", "hello", "hyperprocess"] {
        conn.send(message).context("Failed to send message")?;
        let reply: String = conn.recv().context("Failed to receive reply")?;
        println!("  {message} -> {reply}");
    }

    conn.close();
    println!("✓ Client example completed");
    Ok(())
}
