//! Plugin server binary. Spawned by the host-side wrapper, one per session.
//!
//! Usage: `linbridge-server <index>,<module path>,<session id>`

use linbridge_server::{serve, BootArgs, EntryPointFactory, ServerConfig};
use std::env;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("LINBRIDGE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // The host only watches the boot cell and the process; the exit status
    // carries nothing.
    let Some(raw) = env::args().nth(1) else {
        tracing::error!("boot arguments required as first argument");
        return;
    };

    let args: BootArgs = match raw.parse() {
        Ok(args) => args,
        Err(e) => {
            tracing::error!(raw = %raw, "invalid boot arguments: {}", e);
            return;
        }
    };

    if let Err(e) = serve(&args, &ServerConfig::from_env(), &EntryPointFactory) {
        tracing::error!(session = %args.session, "server session failed: {}", e);
    }
}
