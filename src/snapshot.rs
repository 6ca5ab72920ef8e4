//! One full recursive walk of a directory into a [`Tree`].

use crate::tree::{DirId, FileMeta, NodeRef, Times, Tree};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Walk `root` (created if missing) and return the populated tree. The root
/// path is canonicalized so it matches the paths reported by the watcher.
pub fn build(root: &Path) -> Result<Tree> {
    if !root.exists() {
        std::fs::create_dir_all(root)
            .with_context(|| format!("create watched root {}", root.display()))?;
    }
    let root = root
        .canonicalize()
        .with_context(|| format!("canonicalize {}", root.display()))?;
    let times = std::fs::metadata(&root)
        .map(|md| Times::from_metadata(&md))
        .unwrap_or_default();

    let started = Instant::now();
    let mut tree = Tree::new(root, times);
    let top = tree.root();
    walk_into(&mut tree, top);
    info!(
        "snapshot of {}: {} dirs, {} files in {:.2?}",
        tree.root_path().display(),
        tree.dir_count(),
        tree.file_count(),
        started.elapsed()
    );
    Ok(tree)
}

/// Add everything on disk below the directory `at` to the tree, returning
/// the nodes added, parents before children. Unreadable entries are logged
/// and skipped.
pub fn walk_into(tree: &mut Tree, at: DirId) -> Vec<NodeRef> {
    let base = tree.path(NodeRef::Dir(at));
    let mut added = Vec::new();

    let walker = WalkDir::new(&base)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("snapshot: skipping unreadable entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        let Some(name) = entry.file_name().to_str() else {
            warn!("snapshot: skipping non UTF-8 name {}", path.display());
            continue;
        };
        let Some(parent) = path.parent().and_then(|p| tree.lookup_dir(p)) else {
            // Parent was skipped earlier
            continue;
        };

        let ft = entry.file_type();
        if ft.is_dir() {
            let times = entry
                .metadata()
                .map(|md| Times::from_metadata(&md))
                .unwrap_or_default();
            added.push(NodeRef::Dir(tree.add_dir(parent, name, times)));
        } else if ft.is_file() {
            match FileMeta::read(path) {
                Ok(meta) => added.push(NodeRef::File(tree.add_file(parent, name, meta))),
                Err(e) => warn!("snapshot: skipping {}: {:#}", path.display(), e),
            }
        } else {
            debug!("snapshot: ignoring special entry {}", path.display());
        }
    }
    added
}

/// Background snapshot. `is_computing` stays true until the walk has
/// produced its tree; `finish` hands the tree over to the next owner.
pub struct SnapshotTask {
    handle: JoinHandle<Result<Tree>>,
    computing: watch::Receiver<bool>,
}

impl SnapshotTask {
    pub fn spawn(root: PathBuf) -> Self {
        let (tx, rx) = watch::channel(true);
        let handle = tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || build(&root))
                .await
                .context("snapshot task panicked")
                .and_then(|r| r);
            let _ = tx.send(false);
            result
        });
        Self {
            handle,
            computing: rx,
        }
    }

    pub fn is_computing(&self) -> bool {
        *self.computing.borrow()
    }

    /// Resolves once the walk is idle, without taking the tree.
    pub async fn idle(&mut self) {
        let _ = self.computing.wait_for(|computing| !computing).await;
    }

    pub async fn finish(self) -> Result<Tree> {
        self.handle.await.context("snapshot task aborted")?
    }
}
