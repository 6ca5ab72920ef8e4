//! Flattened file records exchanged between client and server.
//!
//! The server scans a user's sandbox once per login and ships the result to
//! the client inside `AuthSuccess`; the reconciler consumes it.

use crate::checksum::{hash_file, ContentHash};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

/// Relocatable projection of a file: no parent link, path relative to the
/// sandbox root in wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub hash: ContentHash,
}

impl InventoryEntry {
    pub fn new(path: impl Into<String>, size: u64, hash: ContentHash) -> Self {
        let path = path.into();
        let name = paths::file_name(&path).to_string();
        Self {
            path,
            name,
            size,
            hash,
        }
    }

    pub fn extension(&self) -> &str {
        paths::extension(&self.name)
    }

    /// Same size and same (case-insensitive) extension
    pub fn same_size_and_extension(&self, size: u64, name: &str) -> bool {
        self.size == size && self.extension().eq_ignore_ascii_case(paths::extension(name))
    }
}

impl fmt::Display for InventoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes, {})", self.path, self.size, self.hash.short())
    }
}

/// Walk `root` and list every regular file beneath it. Unreadable entries are
/// logged and skipped.
pub fn scan(root: &Path) -> Vec<InventoryEntry> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).into_iter() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("inventory: skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = paths::relative_to_root(root, entry.path()) else {
            continue;
        };
        let size = match entry.metadata() {
            Ok(md) => md.len(),
            Err(e) => {
                warn!("inventory: no metadata for {}: {}", entry.path().display(), e);
                continue;
            }
        };
        match hash_file(entry.path()) {
            Ok(hash) => entries.push(InventoryEntry::new(rel, size, hash)),
            Err(e) => warn!("inventory: cannot hash {}: {:#}", entry.path().display(), e),
        }
    }
    entries
}

/// Remote inventory indexed for reconciliation: by path (consumed as local
/// files are matched) and by content hash (every entry, including the first
/// of each hash group).
#[derive(Debug, Default)]
pub struct RemoteIndex {
    by_path: BTreeMap<String, InventoryEntry>,
    by_hash: HashMap<ContentHash, Vec<InventoryEntry>>,
}

impl RemoteIndex {
    pub fn build(entries: Vec<InventoryEntry>) -> Self {
        let mut index = RemoteIndex::default();
        for entry in entries {
            index
                .by_hash
                .entry(entry.hash)
                .or_default()
                .push(entry.clone());
            index.by_path.insert(entry.path.clone(), entry);
        }
        index
    }

    /// Remove and return the entry at `path`.
    pub fn take(&mut self, path: &str) -> Option<InventoryEntry> {
        self.by_path.remove(path)
    }

    /// First entry with `hash` whose size and extension also match and that
    /// `usable` accepts.
    pub fn find_copy_source<F>(
        &self,
        hash: &ContentHash,
        size: u64,
        name: &str,
        usable: F,
    ) -> Option<&InventoryEntry>
    where
        F: Fn(&InventoryEntry) -> bool,
    {
        self.by_hash
            .get(hash)?
            .iter()
            .find(|candidate| candidate.same_size_and_extension(size, name) && usable(candidate))
    }

    /// Entries never consumed by `take`, in path order.
    pub fn into_remaining(self) -> impl Iterator<Item = InventoryEntry> {
        self.by_path.into_values()
    }

    pub fn remaining_len(&self) -> usize {
        self.by_path.len()
    }
}
