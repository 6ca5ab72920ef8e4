//! cloudsync client: keeps a server copy of one local directory up to date.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cloudsync::cli::ClientOpts;
use cloudsync::config::ClientConfig;
use cloudsync::{client, logger};

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    logger::init_tracing(opts.verbose);

    let cfg = ClientConfig::load(&opts)?;
    let journal = logger::open(cfg.log_file.as_deref())?;

    info!(
        "syncing {} as {} to {}",
        cfg.root.display(),
        cfg.username,
        cfg.server
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        tokio::select! {
            res = client::run(cfg, journal) => res,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                Ok(())
            }
        }
    })
}
