//! Live change detection for a watched root.
//!
//! Native notifications are normalized to create/delete/modify events, then
//! folded batch by batch into the tree. A delete immediately followed by a
//! create of an entry with identical attributes becomes a single rename or
//! move. The resulting operations wait in [`PendingOps`] until the debounce
//! timer hands them to the client.

use crate::debounce::{Debouncer, PendingOps};
use crate::operation::{EntityKind, Operation};
use crate::snapshot;
use crate::tree::{DirId, FileMeta, NodeRef, Times, Tree};
use lazy_static::lazy_static;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("a watcher is already active for {0}")]
    AlreadyActive(PathBuf),
    #[error("cannot watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("cannot start watcher thread: {0}")]
    Thread(#[from] std::io::Error),
}

lazy_static! {
    static ref ACTIVE_ROOTS: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

/// Claim on a watched root, released on drop.
struct RootRegistration(PathBuf);

impl RootRegistration {
    fn acquire(root: &Path) -> Result<Self, WatcherError> {
        let mut active = ACTIVE_ROOTS.lock();
        if !active.insert(root.to_path_buf()) {
            return Err(WatcherError::AlreadyActive(root.to_path_buf()));
        }
        Ok(Self(root.to_path_buf()))
    }
}

impl Drop for RootRegistration {
    fn drop(&mut self) {
        ACTIVE_ROOTS.lock().remove(&self.0);
    }
}

/// Raw filesystem event reduced to what the coalescer understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Create(PathBuf),
    Delete(PathBuf),
    Modify(PathBuf),
    Overflow,
}

pub fn normalize(event: Event) -> Vec<FsEvent> {
    if event.need_rescan() {
        return vec![FsEvent::Overflow];
    }
    let make: fn(PathBuf) -> FsEvent = match event.kind {
        EventKind::Create(_) => FsEvent::Create,
        EventKind::Remove(_) => FsEvent::Delete,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => FsEvent::Delete,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FsEvent::Create,
        // Already reported as separate From/To halves
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return Vec::new(),
        EventKind::Modify(ModifyKind::Name(_)) => {
            return event
                .paths
                .into_iter()
                .map(|p| {
                    if p.symlink_metadata().is_ok() {
                        FsEvent::Create(p)
                    } else {
                        FsEvent::Delete(p)
                    }
                })
                .collect();
        }
        EventKind::Modify(_) => FsEvent::Modify,
        _ => return Vec::new(),
    };
    event.paths.into_iter().map(make).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Continue,
    RootDeleted,
}

/// A node removed by the previous event of the batch, kept detached in case
/// the next event recreates it elsewhere.
struct Lookback {
    node: NodeRef,
    delete_op: Operation,
    parent: DirId,
    name: String,
    times: Times,
    meta: Option<FileMeta>,
    non_empty: bool,
}

/// Folds events into the tree and the pending-operation queue.
pub struct EventCoalescer {
    tree: Tree,
    lookback: Option<Lookback>,
}

impl EventCoalescer {
    pub fn new(tree: Tree) -> Self {
        Self {
            tree,
            lookback: None,
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn into_tree(mut self) -> Tree {
        self.drop_lookback();
        self.tree
    }

    /// Apply one wake-up's worth of events. Lookback never crosses batches.
    pub fn process<I>(&mut self, events: I, queue: &mut Vec<Operation>) -> BatchOutcome
    where
        I: IntoIterator<Item = FsEvent>,
    {
        let mut outcome = BatchOutcome::Continue;
        for event in events {
            match event {
                FsEvent::Create(path) => self.on_create(&path, queue),
                FsEvent::Delete(path) => {
                    if path == self.tree.root_path() {
                        outcome = BatchOutcome::RootDeleted;
                        break;
                    }
                    self.on_delete(&path, queue);
                }
                FsEvent::Modify(path) => self.on_modify(&path, queue),
                FsEvent::Overflow => warn!("watcher: event overflow, some changes may be missed"),
            }
        }
        self.drop_lookback();
        outcome
    }

    fn drop_lookback(&mut self) {
        if let Some(prev) = self.lookback.take() {
            self.tree.discard(prev.node);
        }
    }

    fn on_delete(&mut self, path: &Path, queue: &mut Vec<Operation>) {
        self.drop_lookback();
        let Some(node) = self.tree.lookup(path) else {
            debug!("watcher: delete of untracked {} (recursively deleted)", path.display());
            return;
        };
        let rel = self.tree.rel_path(node);
        let lookback = match node {
            NodeRef::Dir(d) => {
                let Some(dir) = self.tree.dir(d) else { return };
                let Some(parent) = dir.parent() else { return };
                Lookback {
                    node,
                    delete_op: Operation::delete(EntityKind::Directory, rel),
                    parent,
                    name: dir.name.clone(),
                    times: dir.times,
                    meta: None,
                    non_empty: !dir.is_empty(),
                }
            }
            NodeRef::File(f) => {
                let Some(file) = self.tree.file(f) else { return };
                Lookback {
                    node,
                    delete_op: Operation::delete(EntityKind::File, rel),
                    parent: file.parent(),
                    name: file.name.clone(),
                    times: file.times(),
                    meta: Some(file.meta()),
                    non_empty: true,
                }
            }
        };
        self.tree.detach(node);
        queue.push(lookback.delete_op.clone());
        self.lookback = Some(lookback);
    }

    fn on_create(&mut self, path: &Path, queue: &mut Vec<Operation>) {
        let lookback = self.lookback.take();
        self.create(path, lookback, queue);
        self.drop_lookback();
    }

    fn create(&mut self, path: &Path, lookback: Option<Lookback>, queue: &mut Vec<Operation>) {
        let discard = |tree: &mut Tree, lb: Option<Lookback>| {
            if let Some(lb) = lb {
                tree.discard(lb.node);
            }
        };

        let Ok(md) = std::fs::symlink_metadata(path) else {
            debug!("watcher: {} vanished before it could be read", path.display());
            return discard(&mut self.tree, lookback);
        };
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            return discard(&mut self.tree, lookback);
        };
        let is_dir = md.is_dir();
        if !is_dir && !md.is_file() {
            debug!("watcher: ignoring special entry {}", path.display());
            return discard(&mut self.tree, lookback);
        }

        if let Some(existing) = self.tree.lookup(path) {
            discard(&mut self.tree, lookback);
            return self.refresh_existing(existing, path, is_dir, queue);
        }

        let Some(parent) = self.tree.ensure_parent_dir(path) else {
            return discard(&mut self.tree, lookback);
        };

        if is_dir {
            let times = Times::from_metadata(&md);
            if let Some(lb) = lookback {
                let same = lb.meta.is_none() && lb.non_empty && lb.times == times;
                if let Some(op) = self.try_merge(&lb, same, parent, &name, EntityKind::Directory) {
                    return replace_delete(queue, &lb.delete_op, op);
                }
                self.tree.discard(lb.node);
            }
            let id = self.tree.add_dir(parent, &name, times);
            queue.push(Operation::create(
                EntityKind::Directory,
                self.tree.rel_path(NodeRef::Dir(id)),
            ));
            // Content that appeared before the directory was watched
            for node in snapshot::walk_into(&mut self.tree, id) {
                let entity = match node {
                    NodeRef::Dir(_) => EntityKind::Directory,
                    NodeRef::File(_) => EntityKind::File,
                };
                queue.push(Operation::create(entity, self.tree.rel_path(node)));
            }
        } else {
            let meta = match FileMeta::read(path) {
                Ok(m) => m,
                Err(e) => {
                    debug!("watcher: cannot read created {}: {:#}", path.display(), e);
                    return discard(&mut self.tree, lookback);
                }
            };
            if let Some(lb) = lookback {
                let same = lb.meta == Some(meta);
                if let Some(op) = self.try_merge(&lb, same, parent, &name, EntityKind::File) {
                    return replace_delete(queue, &lb.delete_op, op);
                }
                self.tree.discard(lb.node);
            }
            let id = self.tree.add_file(parent, &name, meta);
            queue.push(Operation::create(
                EntityKind::File,
                self.tree.rel_path(NodeRef::File(id)),
            ));
        }
    }

    /// Re-attach the previously deleted node when the created entry is the
    /// same entity in a new place.
    fn try_merge(
        &mut self,
        lb: &Lookback,
        same: bool,
        parent: DirId,
        name: &str,
        entity: EntityKind,
    ) -> Option<Operation> {
        let kind_matches = matches!(
            (lb.node, entity),
            (NodeRef::Dir(_), EntityKind::Directory) | (NodeRef::File(_), EntityKind::File)
        );
        if !same || !kind_matches {
            return None;
        }
        let from = self.tree.rel_path(lb.node);
        if lb.name == name && lb.parent != parent {
            self.tree.attach(lb.node, parent, name);
            Some(Operation::moved(entity, from, self.tree.rel_path(lb.node)))
        } else if lb.parent == parent && lb.name != name {
            self.tree.attach(lb.node, parent, name);
            Some(Operation::rename(entity, from, self.tree.rel_path(lb.node)))
        } else {
            None
        }
    }

    /// A create for a path the tree already has: bring it up to date.
    fn refresh_existing(&mut self, node: NodeRef, path: &Path, is_dir: bool, queue: &mut Vec<Operation>) {
        match (node, is_dir) {
            (NodeRef::Dir(_), true) => {}
            (NodeRef::File(_), false) => self.on_modify(path, queue),
            _ => {
                let entity = match node {
                    NodeRef::Dir(_) => EntityKind::Directory,
                    NodeRef::File(_) => EntityKind::File,
                };
                queue.push(Operation::delete(entity, self.tree.rel_path(node)));
                self.tree.remove(node);
                self.create(path, None, queue);
            }
        }
    }

    fn on_modify(&mut self, path: &Path, queue: &mut Vec<Operation>) {
        match self.tree.lookup(path) {
            Some(NodeRef::Dir(d)) => {
                if let (Ok(md), Some(dir)) = (std::fs::metadata(path), self.tree.dir_mut(d)) {
                    dir.times = Times::from_metadata(&md);
                }
            }
            Some(NodeRef::File(f)) => match FileMeta::read(path) {
                Ok(meta) => {
                    let rel = self.tree.rel_path(NodeRef::File(f));
                    if let Some(file) = self.tree.file_mut(f) {
                        file.refresh(meta);
                    }
                    queue.push(Operation::modify(EntityKind::File, rel));
                }
                Err(e) => debug!("watcher: cannot read modified {}: {:#}", path.display(), e),
            },
            None => {
                // Creation went unseen; treat the first sign of life as one
                if path.is_file() {
                    self.create(path, None, queue);
                }
            }
        }
    }
}

/// Remove the queued delete a rename/move stands in for, then append it.
fn replace_delete(queue: &mut Vec<Operation>, delete_op: &Operation, op: Operation) {
    if let Some(pos) = queue.iter().rposition(|q| q == delete_op) {
        queue.remove(pos);
    }
    queue.push(op);
}

/// Running watcher for one root. At most one exists per root at a time.
pub struct Watcher {
    root: PathBuf,
    notify: Option<RecommendedWatcher>,
    thread: Option<JoinHandle<()>>,
    _registration: RootRegistration,
}

impl Watcher {
    /// Take over the snapshot tree and start watching its root. Batches of
    /// operations arrive on `out`; the channel closes when the watcher stops.
    /// Must be called from within a tokio runtime.
    pub fn start(
        tree: Tree,
        debounce: Duration,
        out: mpsc::UnboundedSender<Vec<Operation>>,
    ) -> Result<Self, WatcherError> {
        let root = tree.root_path().to_path_buf();
        let registration = RootRegistration::acquire(&root)?;

        let (tx, rx) = std_mpsc::channel();
        let mut notify = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(|source| WatcherError::Watch {
            path: root.clone(),
            source,
        })?;
        notify
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|source| WatcherError::Watch {
                path: root.clone(),
                source,
            })?;

        let pending = PendingOps::new();
        let debouncer = Debouncer::spawn(debounce, pending.clone(), out.clone());
        let coalescer = EventCoalescer::new(tree);
        let thread = std::thread::Builder::new()
            .name("cloudsync-watch".into())
            .spawn(move || event_loop(rx, coalescer, pending, debouncer, out))?;

        info!("watching {}", root.display());
        Ok(Self {
            root,
            notify: Some(notify),
            thread: Some(thread),
            _registration: registration,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop receiving notifications, cancel the flush timer and release the
    /// root. Pending operations are dropped.
    pub async fn shutdown(mut self) {
        // Dropping the notify handle closes the event channel, ending the loop
        self.notify.take();
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        info!("stopped watching {}", self.root.display());
    }
}

fn event_loop(
    rx: std_mpsc::Receiver<notify::Result<Event>>,
    mut coalescer: EventCoalescer,
    pending: PendingOps,
    debouncer: Debouncer,
    out: mpsc::UnboundedSender<Vec<Operation>>,
) {
    while let Ok(first) = rx.recv() {
        let mut events = Vec::new();
        for res in std::iter::once(first).chain(rx.try_iter()) {
            match res {
                Ok(event) => events.extend(normalize(event)),
                Err(e) => warn!("watcher: notification error: {}", e),
            }
        }
        if events.is_empty() {
            continue;
        }

        let outcome = {
            let mut queue = pending.lock();
            coalescer.process(events, &mut queue)
        };
        debouncer.touch();

        if outcome == BatchOutcome::RootDeleted {
            warn!(
                "watched root {} was deleted, stopping watcher",
                coalescer.tree().root_path().display()
            );
            debouncer.cancel();
            if let Some(batch) = pending.try_drain() {
                if !batch.is_empty() {
                    let _ = out.send(batch);
                }
            }
            return;
        }
    }
    debouncer.cancel();
}
