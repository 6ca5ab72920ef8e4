//! Effective configuration: CLI flags over an optional TOML file over
//! built-in defaults.

use crate::cli::{ClientOpts, DaemonOpts};
use crate::protocol::{
    timeouts, DEFAULT_CHUNK_SIZE, DEFAULT_PORT, ENVELOPE_HEADROOM, MAX_FRAME_SIZE, RECYCLE_DIR,
};
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client keys accepted in a config file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientFile {
    pub server: Option<String>,
    pub username: Option<String>,
    pub root: Option<PathBuf>,
    pub debounce_ms: Option<u64>,
    pub reconnect_delay_secs: Option<u64>,
    pub chunk_size: Option<usize>,
    pub log_file: Option<PathBuf>,
}

/// Server keys accepted in a config file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerFile {
    pub bind: Option<String>,
    pub root: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub username: String,
    pub root: PathBuf,
    pub debounce: Duration,
    pub reconnect_delay: Duration,
    pub chunk_size: usize,
    pub log_file: Option<PathBuf>,
    pub print_tree: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub root: PathBuf,
    pub log_file: Option<PathBuf>,
}

fn read_file<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&data).with_context(|| format!("parse config {}", path.display()))
}

impl ClientConfig {
    pub fn load(opts: &ClientOpts) -> Result<Self> {
        let file: ClientFile = read_file(opts.config.as_deref())?;
        Self::merge(opts, file)
    }

    pub fn merge(opts: &ClientOpts, file: ClientFile) -> Result<Self> {
        let Some(username) = opts.username.clone().or(file.username) else {
            bail!("a username is required (--username or `username` in the config file)");
        };
        validate_username(&username)?;
        let Some(root) = opts.root.clone().or(file.root) else {
            bail!("a directory to watch is required (--root or `root` in the config file)");
        };
        let chunk_size = opts.chunk_size.or(file.chunk_size).unwrap_or(DEFAULT_CHUNK_SIZE);
        validate_chunk_size(chunk_size)?;

        Ok(Self {
            server: opts
                .server
                .clone()
                .or(file.server)
                .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_PORT)),
            username,
            root,
            debounce: Duration::from_millis(
                opts.debounce_ms.or(file.debounce_ms).unwrap_or(timeouts::DEBOUNCE_MS),
            ),
            reconnect_delay: Duration::from_secs(
                opts.reconnect_delay_secs
                    .or(file.reconnect_delay_secs)
                    .unwrap_or(timeouts::RECONNECT_DELAY_SECS),
            ),
            chunk_size,
            log_file: opts.log_file.clone().or(file.log_file),
            print_tree: opts.print_tree,
        })
    }
}

impl ServerConfig {
    pub fn load(opts: &DaemonOpts) -> Result<Self> {
        let file: ServerFile = read_file(opts.config.as_deref())?;
        Ok(Self::merge(opts, file))
    }

    pub fn merge(opts: &DaemonOpts, file: ServerFile) -> Self {
        Self {
            bind: opts
                .bind
                .clone()
                .or(file.bind)
                .unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_PORT)),
            root: opts.root.clone().or(file.root).unwrap_or_else(|| PathBuf::from(".")),
            log_file: opts.log_file.clone().or(file.log_file),
        }
    }
}

/// A username names a directory directly under the server root.
pub fn validate_username(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("username must not be empty");
    }
    if name == "." || name == ".." {
        bail!("username {:?} is reserved", name);
    }
    if name.starts_with('$') || name == RECYCLE_DIR {
        bail!("username {:?} must not start with '$'", name);
    }
    if name.contains(['/', '\\', '\0']) {
        bail!("username {:?} must not contain path separators", name);
    }
    Ok(())
}

fn validate_chunk_size(size: usize) -> Result<()> {
    let max = MAX_FRAME_SIZE - ENVELOPE_HEADROOM;
    if size == 0 || size > max {
        bail!("chunk size must be between 1 and {} bytes, got {}", max, size);
    }
    Ok(())
}
