//! Command-line options for the client and the daemon.
//!
//! Every setting is optional here so a `--config` file can supply it; the
//! merged result is built in `config`.

use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Watch a directory and keep a server copy in sync
#[derive(Clone, Debug, Default, Parser)]
#[command(name = "cloudsync", version)]
pub struct ClientOpts {
    /// Directory to watch (created if missing)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Server address (host:port)
    #[arg(long)]
    pub server: Option<String>,

    /// Account name on the server
    #[arg(short, long)]
    pub username: Option<String>,

    /// Quiet period before queued changes are sent (ms)
    #[arg(long)]
    pub debounce_ms: Option<u64>,

    /// Delay between connection attempts (s)
    #[arg(long)]
    pub reconnect_delay_secs: Option<u64>,

    /// Bytes per file chunk on the wire
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// TOML file with any of the options above
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append a line per sent operation to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Print the snapshot tree after each scan
    #[arg(long, action = ArgAction::SetTrue)]
    pub print_tree: bool,

    /// Debug-level diagnostics
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

/// Receive synchronized trees into per-user directories
#[derive(Clone, Debug, Default, Parser)]
#[command(name = "cloudsyncd", version)]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Storage root holding one directory per user
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// TOML file with any of the options above
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append a line per applied operation to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Debug-level diagnostics
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}
