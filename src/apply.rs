//! Server-side application of received operations inside one user's sandbox.
//!
//! Every mutation re-checks the filesystem first: operations whose source is
//! already gone are no-ops, not failures. Deleted files and directories are
//! moved to the user's recycle directory rather than unlinked.

use crate::logger::Logger;
use crate::operation::{EntityKind, Message, Operation};
use crate::paths;
use crate::protocol::RECYCLE_DIR;
use crate::transfer;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Precondition already implies there is nothing to do
    Skipped,
}

pub struct Applier {
    username: String,
    sandbox: PathBuf,
    recycle: PathBuf,
    journal: Arc<dyn Logger>,
    applied: u64,
    bytes_written: u64,
}

impl Applier {
    /// Create `<root>/<username>` and `<root>/$recycled/<username>` if needed.
    pub fn new(root: &Path, username: &str, journal: Arc<dyn Logger>) -> Result<Self> {
        let sandbox = root.join(username);
        let recycle = root.join(RECYCLE_DIR).join(username);
        paths::ensure_dir_exists(&sandbox)
            .with_context(|| format!("create user directory {}", sandbox.display()))?;
        paths::ensure_dir_exists(&recycle)
            .with_context(|| format!("create recycle directory {}", recycle.display()))?;
        Ok(Self {
            username: username.to_string(),
            sandbox,
            recycle,
            journal,
            applied: 0,
            bytes_written: 0,
        })
    }

    pub fn sandbox(&self) -> &Path {
        &self.sandbox
    }

    pub fn recycle_dir(&self) -> &Path {
        &self.recycle
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Sandbox path for an incoming wire path (`<username>/...`).
    fn resolve(&self, wire: &str) -> Result<PathBuf> {
        let rel = paths::strip_user(&self.username, wire)?;
        paths::resolve(&self.sandbox, rel)
    }

    /// Like `resolve`, but refuses the sandbox root itself.
    fn resolve_entry(&self, wire: &str) -> Result<PathBuf> {
        let rel = paths::strip_user(&self.username, wire)?;
        if rel.is_empty() {
            bail!("operation on the user root is not allowed");
        }
        paths::resolve(&self.sandbox, rel)
    }

    pub fn apply(&mut self, message: Message) -> Result<ApplyOutcome> {
        let (op, position, payload) = message.into_parts();
        let outcome = match &op {
            Operation::FileWriting { path } => {
                let (Some(position), Some(bytes)) = (position, payload) else {
                    bail!("FileWriting without position/payload");
                };
                let target = self.resolve_entry(path)?;
                transfer::write_at(&target, position, &bytes)?;
                self.bytes_written += bytes.len() as u64;
                self.journal.written(&target, position, bytes.len() as u64);
                return Ok(ApplyOutcome::Applied);
            }
            Operation::Create { entity, path } => match entity {
                EntityKind::File => {
                    transfer::prepare_target(&self.resolve_entry(path)?)?;
                    ApplyOutcome::Applied
                }
                EntityKind::Directory => {
                    let dir = self.resolve(path)?;
                    paths::ensure_dir_exists(&dir)
                        .with_context(|| format!("create directory {}", dir.display()))?;
                    ApplyOutcome::Applied
                }
            },
            Operation::Modify { entity, path } => match entity {
                EntityKind::File => {
                    transfer::prepare_target(&self.resolve_entry(path)?)?;
                    ApplyOutcome::Applied
                }
                EntityKind::Directory => ApplyOutcome::Skipped,
            },
            Operation::Delete { entity, path } => {
                let target = self.resolve_entry(path)?;
                let present = match entity {
                    EntityKind::File => target.is_file(),
                    EntityKind::Directory => target.is_dir(),
                };
                if present {
                    self.recycle(&target)?;
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::Skipped
                }
            }
            Operation::Rename { from, to, .. } | Operation::Move { from, to, .. } => {
                let src = self.resolve_entry(from)?;
                let dst = self.resolve_entry(to)?;
                if std::fs::symlink_metadata(&src).is_err() {
                    ApplyOutcome::Skipped
                } else {
                    paths::ensure_parent_exists(&dst)?;
                    std::fs::rename(&src, &dst)
                        .with_context(|| format!("move {} -> {}", src.display(), dst.display()))?;
                    ApplyOutcome::Applied
                }
            }
            Operation::Copy { entity, from, to } => {
                if *entity == EntityKind::Directory {
                    bail!("directory copy is not supported");
                }
                let src = self.resolve_entry(from)?;
                let dst = self.resolve_entry(to)?;
                if !src.is_file() {
                    bail!("copy source {} does not exist", src.display());
                }
                paths::ensure_parent_exists(&dst)?;
                let bytes = std::fs::copy(&src, &dst)
                    .with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
                self.bytes_written += bytes;
                ApplyOutcome::Applied
            }
            Operation::AuthRequest { .. } | Operation::AuthSuccess { .. } | Operation::AuthFailed { .. } => {
                bail!("unexpected {} after login", op);
            }
        };

        match outcome {
            ApplyOutcome::Applied => {
                self.applied += 1;
                self.journal.applied(&self.username, &op);
            }
            ApplyOutcome::Skipped => debug!("apply: nothing to do for {}", op),
        }
        Ok(outcome)
    }

    /// Move a file or a whole directory into the recycle directory as
    /// `$<millis>_<name>`.
    fn recycle(&self, target: &Path) -> Result<()> {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        paths::ensure_dir_exists(&self.recycle)?;
        let mut stamp = Utc::now().timestamp_millis();
        let mut dest = self.recycle.join(format!("${}_{}", stamp, name));
        while dest.exists() {
            stamp += 1;
            dest = self.recycle.join(format!("${}_{}", stamp, name));
        }
        std::fs::rename(target, &dest)
            .with_context(|| format!("recycle {} -> {}", target.display(), dest.display()))?;
        self.journal.recycled(target, &dest);
        Ok(())
    }
}
