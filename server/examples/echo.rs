use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context as _, Result};
use hyperprocess_common::{AuthKey, Connection, Context, Family, IpcError};
use hyperprocess_server::Listener;
use tracing::{error, info};

/// Echo server example that sends every string it receives straight back
fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("=== hyperprocess Echo Server Example ===");

    let ctx = Context::from_env().context("Invalid configuration")?;
    let authkey = match AuthKey::from_env()? {
        Some(key) => key,
        None => {
            let key = AuthKey::random();
            println!("Generated key, export it for clients:");
            println!("  HYPERPROCESS_AUTHKEY={}", key.to_hex());
            key
        }
    };

    let family = if cfg!(unix) { Family::Unix } else { Family::Inet };
    let listener = Listener::bind(&ctx, None, Some(family), Some(authkey))
        .context("Failed to bind listener")?;
    println!("Listening on {}", listener.address());
    println!("Press Ctrl+C to stop the server");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, shutting down gracefully...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    info!("Starting echo server...");
    match listener.serve(running, echo) {
        Ok(()) => info!("Echo server stopped normally"),
        Err(e) => error!("Echo server error: {:#}", e),
    }

    println!("✓ Echo server shutdown completed");
    Ok(())
}

fn echo(mut conn: Connection) -> Result<()> {
    loop {
        let message: String = match conn.recv() {
            Ok(message) => message,
            Err(IpcError::Eof) => return Ok(()),
            Err(e) => return Err(e).context("Failed to read message"),
        };
        info!("Echoing {:?}", message);
        conn.send(&message).context("Failed to send reply")?;
    }
}
