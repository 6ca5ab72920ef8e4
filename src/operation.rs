//! Operations and the message envelope that carries them.
//!
//! `Operation` is a closed set: the watcher and the reconciler produce the
//! filesystem variants, the session handshake uses the auth variants, and the
//! server dispatches on all of them. Paths are wire paths (see `paths`).

use crate::inventory::InventoryEntry;
use crate::paths;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Directory,
    File,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Directory => f.write_str("DIRECTORY"),
            EntityKind::File => f.write_str("FILE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create { entity: EntityKind, path: String },
    Delete { entity: EntityKind, path: String },
    Modify { entity: EntityKind, path: String },
    Rename { entity: EntityKind, from: String, to: String },
    Move { entity: EntityKind, from: String, to: String },
    Copy { entity: EntityKind, from: String, to: String },
    FileWriting { path: String },
    AuthRequest { username: String },
    AuthSuccess { username: String, inventory: Vec<InventoryEntry> },
    AuthFailed { username: String, reason: String },
}

impl Operation {
    pub fn create(entity: EntityKind, path: impl Into<String>) -> Self {
        Operation::Create { entity, path: path.into() }
    }

    pub fn delete(entity: EntityKind, path: impl Into<String>) -> Self {
        Operation::Delete { entity, path: path.into() }
    }

    pub fn modify(entity: EntityKind, path: impl Into<String>) -> Self {
        Operation::Modify { entity, path: path.into() }
    }

    pub fn rename(entity: EntityKind, from: impl Into<String>, to: impl Into<String>) -> Self {
        Operation::Rename { entity, from: from.into(), to: to.into() }
    }

    pub fn moved(entity: EntityKind, from: impl Into<String>, to: impl Into<String>) -> Self {
        Operation::Move { entity, from: from.into(), to: to.into() }
    }

    pub fn copy(entity: EntityKind, from: impl Into<String>, to: impl Into<String>) -> Self {
        Operation::Copy { entity, from: from.into(), to: to.into() }
    }

    /// Continuation that carries the bytes of a Create/Modify on a file.
    pub fn writing(intent: &Operation) -> Result<Self> {
        match intent {
            Operation::Create { entity: EntityKind::File, path }
            | Operation::Modify { entity: EntityKind::File, path } => {
                Ok(Operation::FileWriting { path: path.clone() })
            }
            other => bail!("no file bytes accompany {}", other),
        }
    }

    /// Create/Modify of a file: the operations whose bytes must follow.
    pub fn carries_file_bytes(&self) -> bool {
        matches!(
            self,
            Operation::Create { entity: EntityKind::File, .. }
                | Operation::Modify { entity: EntityKind::File, .. }
        )
    }

    /// Primary path: the entity path, or the source path of a two-path variant.
    pub fn path(&self) -> Option<&str> {
        match self {
            Operation::Create { path, .. }
            | Operation::Delete { path, .. }
            | Operation::Modify { path, .. }
            | Operation::FileWriting { path } => Some(path),
            Operation::Rename { from, .. } | Operation::Move { from, .. } | Operation::Copy { from, .. } => {
                Some(from)
            }
            _ => None,
        }
    }

    /// Rewrite every path field in place.
    pub fn map_paths<F>(&mut self, mut f: F)
    where
        F: FnMut(&str) -> String,
    {
        match self {
            Operation::Create { path, .. }
            | Operation::Delete { path, .. }
            | Operation::Modify { path, .. }
            | Operation::FileWriting { path } => *path = f(path),
            Operation::Rename { from, to, .. }
            | Operation::Move { from, to, .. }
            | Operation::Copy { from, to, .. } => {
                *from = f(from);
                *to = f(to);
            }
            Operation::AuthRequest { .. } | Operation::AuthSuccess { .. } | Operation::AuthFailed { .. } => {}
        }
    }

    /// Root-relative operation as it leaves the client: prefixed with the username.
    pub fn for_user(mut self, username: &str) -> Self {
        self.map_paths(|p| paths::with_user(username, p));
        self
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create { entity, path } => write!(f, "CREATE {} ({})", entity, path),
            Operation::Delete { entity, path } => write!(f, "DELETE {} ({})", entity, path),
            Operation::Modify { entity, path } => write!(f, "MODIFY {} ({})", entity, path),
            Operation::Rename { entity, from, to } => write!(f, "RENAME {} ({} -> {})", entity, from, to),
            Operation::Move { entity, from, to } => write!(f, "MOVE {} ({} -> {})", entity, from, to),
            Operation::Copy { entity, from, to } => write!(f, "COPY {} ({} -> {})", entity, from, to),
            Operation::FileWriting { path } => write!(f, "FILE_WRITING ({})", path),
            Operation::AuthRequest { username } => write!(f, "AUTH_REQUEST ({})", username),
            Operation::AuthSuccess { username, inventory } => {
                write!(f, "AUTH_SUCCESS ({}, {} files)", username, inventory.len())
            }
            Operation::AuthFailed { username, reason } => write!(f, "AUTH_FAILED ({}: {})", username, reason),
        }
    }
}

/// Wire envelope: one operation, plus position and bytes for FileWriting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    operation: Operation,
    position: Option<u64>,
    payload: Option<Vec<u8>>,
}

impl Message {
    /// Envelope without a byte payload. FileWriting must go through `chunk`.
    pub fn new(operation: Operation) -> Result<Self> {
        if matches!(operation, Operation::FileWriting { .. }) {
            bail!("FileWriting needs a position and payload");
        }
        Ok(Self {
            operation,
            position: None,
            payload: None,
        })
    }

    /// Positioned chunk of file bytes.
    pub fn chunk(path: impl Into<String>, position: u64, bytes: Vec<u8>) -> Self {
        Self {
            operation: Operation::FileWriting { path: path.into() },
            position: Some(position),
            payload: Some(bytes),
        }
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn position(&self) -> Option<u64> {
        self.position
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn into_parts(self) -> (Operation, Option<u64>, Option<Vec<u8>>) {
        (self.operation, self.position, self.payload)
    }

    /// Check the envelope invariant on a decoded message.
    pub fn validate(&self) -> Result<()> {
        let is_chunk = matches!(self.operation, Operation::FileWriting { .. });
        let has_data = self.position.is_some() && self.payload.is_some();
        let has_any = self.position.is_some() || self.payload.is_some();
        if is_chunk && !has_data {
            bail!("FileWriting without position/payload");
        }
        if !is_chunk && has_any {
            bail!("{} must not carry position/payload", self.operation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writing_only_follows_file_create_or_modify() {
        let create = Operation::create(EntityKind::File, "a.txt");
        assert_eq!(
            Operation::writing(&create).unwrap(),
            Operation::FileWriting { path: "a.txt".into() }
        );
        assert!(Operation::writing(&Operation::modify(EntityKind::File, "a.txt")).is_ok());
        assert!(Operation::writing(&Operation::create(EntityKind::Directory, "d")).is_err());
        assert!(Operation::writing(&Operation::delete(EntityKind::File, "a.txt")).is_err());
    }

    #[test]
    fn for_user_prefixes_both_paths() {
        let op = Operation::rename(EntityKind::File, "dir/a.txt", "dir/b.txt").for_user("alice");
        assert_eq!(op, Operation::rename(EntityKind::File, "alice/dir/a.txt", "alice/dir/b.txt"));

        let auth = Operation::AuthRequest { username: "alice".into() }.for_user("alice");
        assert_eq!(auth, Operation::AuthRequest { username: "alice".into() });
    }

    #[test]
    fn carries_file_bytes() {
        assert!(Operation::create(EntityKind::File, "a").carries_file_bytes());
        assert!(Operation::modify(EntityKind::File, "a").carries_file_bytes());
        assert!(!Operation::modify(EntityKind::Directory, "a").carries_file_bytes());
        assert!(!Operation::copy(EntityKind::File, "a", "b").carries_file_bytes());
    }

    #[test]
    fn display_names_kind_and_paths() {
        assert_eq!(
            Operation::moved(EntityKind::Directory, "a/d", "b/d").to_string(),
            "MOVE DIRECTORY (a/d -> b/d)"
        );
        assert_eq!(Operation::delete(EntityKind::File, "x").to_string(), "DELETE FILE (x)");
    }

    #[test]
    fn envelope_invariant() {
        assert!(Message::new(Operation::FileWriting { path: "a".into() }).is_err());

        let plain = Message::new(Operation::create(EntityKind::File, "a")).unwrap();
        assert!(plain.position().is_none() && plain.payload().is_none());
        plain.validate().unwrap();

        let chunk = Message::chunk("a", 10, vec![1, 2, 3]);
        assert_eq!(chunk.position(), Some(10));
        assert_eq!(chunk.payload(), Some(&[1u8, 2, 3][..]));
        chunk.validate().unwrap();

        let bad = Message {
            operation: Operation::delete(EntityKind::File, "a"),
            position: Some(0),
            payload: None,
        };
        assert!(bad.validate().is_err());
    }
}
