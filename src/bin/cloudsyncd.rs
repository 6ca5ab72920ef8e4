use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cloudsync::cli::DaemonOpts;
use cloudsync::config::ServerConfig;
use cloudsync::{logger, server};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    logger::init_tracing(opts.verbose);
    let cfg = ServerConfig::load(&opts)?;

    // Validate root directory exists and is a directory
    if !cfg.root.exists() {
        anyhow::bail!("Error: Root directory does not exist: {}", cfg.root.display());
    }
    if !cfg.root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", cfg.root.display());
    }

    // Canonicalize the path for better logging
    let canonical_root = std::fs::canonicalize(&cfg.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", cfg.root.display()))?;

    info!("Starting cloudsync daemon:");
    info!("  Root: {}", canonical_root.display());
    info!("  Bind: {}", cfg.bind);

    if cfg.bind.starts_with("0.0.0.0") {
        warn!("Binding to 0.0.0.0 exposes the daemon to all network interfaces");
        warn!("The protocol is unencrypted and logins are not authenticated; use trusted networks only");
    }

    let journal = logger::open(cfg.log_file.as_deref())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        tokio::select! {
            res = server::serve(&cfg.bind, &canonical_root, journal) => res,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                Ok(())
            }
        }
    })
}
