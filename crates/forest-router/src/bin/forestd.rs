//! Forest router daemon.
//!
//! Usage: `forestd <config.toml>`. Runs until stdin closes or the
//! process is signalled.

use std::io::Read;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use forest_router::{config, RouterRuntime};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let path = std::env::args()
        .nth(1)
        .context("usage: forestd <config.toml>")?;
    let cfg = config::load(&path).with_context(|| format!("loading {path}"))?;

    let mut runtime = RouterRuntime::start(cfg)?;
    info!(addr = %runtime.local_addr(), "router up; close stdin to stop");

    // park until stdin closes
    let mut sink = Vec::new();
    let _ = std::io::stdin().read_to_end(&mut sink);

    runtime.shutdown();
    Ok(())
}
