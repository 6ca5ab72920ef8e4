//! Per-action journal: one timestamped line for every operation a process
//! sends or applies. Diagnostics go through `tracing`; this is the record of
//! what actually happened to files.

use crate::operation::Operation;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub trait Logger: Send + Sync {
    fn session_start(&self, _username: &str, _peer: &str) {}
    fn sent(&self, _op: &Operation) {}
    fn applied(&self, _username: &str, _op: &Operation) {}
    fn written(&self, _path: &Path, _position: u64, _bytes: u64) {}
    fn recycled(&self, _from: &Path, _to: &Path) {}
    fn error(&self, _context: &str, _what: &str, _msg: &str) {}
    fn session_end(&self, _username: &str, _ops: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .with_context(|| format!("open journal {}", path.as_ref().display()))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn session_start(&self, username: &str, peer: &str) {
        self.line(&format!("LOGIN user={} peer={}", username, peer));
    }
    fn sent(&self, op: &Operation) {
        self.line(&format!("SENT {}", op));
    }
    fn applied(&self, username: &str, op: &Operation) {
        self.line(&format!("APPLY user={} {}", username, op));
    }
    fn written(&self, path: &Path, position: u64, bytes: u64) {
        self.line(&format!(
            "WRITE path={} pos={} bytes={}",
            path.display(),
            position,
            bytes
        ));
    }
    fn recycled(&self, from: &Path, to: &Path) {
        self.line(&format!("RECYCLE src={} dst={}", from.display(), to.display()));
    }
    fn error(&self, context: &str, what: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} op={} msg={}", context, what, msg));
    }
    fn session_end(&self, username: &str, ops: u64, bytes: u64, seconds: f64) {
        self.line(&format!(
            "LOGOUT user={username} ops={ops} bytes={bytes} seconds={seconds:.3}"
        ));
    }
}

/// Console diagnostics. `RUST_LOG` wins over the `--verbose` level.
pub fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Journal selected by an optional `--log-file`.
pub fn open(path: Option<&Path>) -> Result<Arc<dyn Logger>> {
    Ok(match path {
        Some(p) => Arc::new(TextLogger::new(p)?),
        None => Arc::new(NoopLogger),
    })
}
