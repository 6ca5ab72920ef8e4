//! In-memory mirror of a watched directory subtree.
//!
//! Nodes live in two arenas indexed by [`DirId`] and [`FileId`]. A directory
//! owns its children through its name maps; every non-root node keeps a
//! non-owning `parent` link used to rebuild its path and to re-parent it.
//! Only the root has no parent directory: its location is the tree's
//! absolute root path.
//!
//! Detaching a node removes it from its parent's map but leaves its slot and
//! parent link alone, so its former path can still be computed. A detached
//! node is either re-attached (rename or move) or discarded.
//!
//! Discarded slots are reused. Ids carry the slot's generation, so an id kept
//! past its node's discard resolves to nothing rather than to the newcomer.

use crate::checksum::{hash_file, ContentHash};
use crate::inventory::InventoryEntry;
use crate::paths;
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirId(SlotKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(SlotKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SlotKey {
    index: usize,
    generation: u32,
}

#[derive(Debug, Clone)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage with a free list.
#[derive(Debug, Clone)]
struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    fn insert(&mut self, value: T) -> SlotKey {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.value = Some(value);
            return SlotKey {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        SlotKey {
            index: self.slots.len() - 1,
            generation: 0,
        }
    }

    fn get(&self, key: SlotKey) -> Option<&T> {
        self.slots
            .get(key.index)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.value.as_ref())
    }

    fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        self.slots
            .get_mut(key.index)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.value.as_mut())
    }

    fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.live -= 1;
        Some(value)
    }

    fn len(&self) -> usize {
        self.live
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Dir(DirId),
    File(FileId),
}

/// Timestamps shared by files and directories. `created` is `None` where the
/// platform does not report a birth time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Times {
    pub created: Option<SystemTime>,
    pub modified: Option<SystemTime>,
}

impl Times {
    pub fn from_metadata(md: &Metadata) -> Self {
        Self {
            created: md.created().ok(),
            modified: md.modified().ok(),
        }
    }
}

/// Everything tracked about a file's content, read in one go so size and
/// hash can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub times: Times,
    pub size: u64,
    pub hash: ContentHash,
}

impl FileMeta {
    pub fn read(path: &Path) -> Result<Self> {
        let md = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
        if !md.is_file() {
            bail!("{} is not a regular file", path.display());
        }
        let hash = hash_file(path)?;
        Ok(Self {
            times: Times::from_metadata(&md),
            size: md.len(),
            hash,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Directory {
    pub name: String,
    parent: Option<DirId>,
    pub times: Times,
    subdirs: BTreeMap<String, DirId>,
    files: BTreeMap<String, FileId>,
}

impl Directory {
    pub fn parent(&self) -> Option<DirId> {
        self.parent
    }

    pub fn is_empty(&self) -> bool {
        self.subdirs.is_empty() && self.files.is_empty()
    }

    pub fn subdir(&self, name: &str) -> Option<DirId> {
        self.subdirs.get(name).copied()
    }

    pub fn file(&self, name: &str) -> Option<FileId> {
        self.files.get(name).copied()
    }

    /// Subdirectories in name order
    pub fn subdirs(&self) -> impl Iterator<Item = DirId> + '_ {
        self.subdirs.values().copied()
    }

    /// Files in name order
    pub fn files(&self) -> impl Iterator<Item = FileId> + '_ {
        self.files.values().copied()
    }
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    parent: DirId,
    meta: FileMeta,
}

impl FileEntry {
    pub fn parent(&self) -> DirId {
        self.parent
    }

    pub fn times(&self) -> Times {
        self.meta.times
    }

    pub fn size(&self) -> u64 {
        self.meta.size
    }

    pub fn hash(&self) -> ContentHash {
        self.meta.hash
    }

    pub fn meta(&self) -> FileMeta {
        self.meta
    }

    /// Replace the tracked content attributes as a unit.
    pub fn refresh(&mut self, meta: FileMeta) {
        self.meta = meta;
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    root_path: PathBuf,
    root: DirId,
    dirs: Arena<Directory>,
    files: Arena<FileEntry>,
}

impl Tree {
    pub fn new(root_path: impl Into<PathBuf>, times: Times) -> Self {
        let root_path = root_path.into();
        let name = root_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut dirs = Arena::new();
        let root = DirId(dirs.insert(Directory {
            name,
            parent: None,
            times,
            subdirs: BTreeMap::new(),
            files: BTreeMap::new(),
        }));
        Self {
            root_path,
            root,
            dirs,
            files: Arena::new(),
        }
    }

    pub fn root(&self) -> DirId {
        self.root
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn dir(&self, id: DirId) -> Option<&Directory> {
        self.dirs.get(id.0)
    }

    pub fn dir_mut(&mut self, id: DirId) -> Option<&mut Directory> {
        self.dirs.get_mut(id.0)
    }

    pub fn file(&self, id: FileId) -> Option<&FileEntry> {
        self.files.get(id.0)
    }

    pub fn file_mut(&mut self, id: FileId) -> Option<&mut FileEntry> {
        self.files.get_mut(id.0)
    }

    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn name_of(&self, node: NodeRef) -> Option<&str> {
        match node {
            NodeRef::Dir(d) => self.dir(d).map(|d| d.name.as_str()),
            NodeRef::File(f) => self.file(f).map(|f| f.name.as_str()),
        }
    }

    fn parent_of(&self, node: NodeRef) -> Option<DirId> {
        match node {
            NodeRef::Dir(d) => self.dir(d).and_then(|d| d.parent),
            NodeRef::File(f) => self.file(f).map(|f| f.parent),
        }
    }

    /// Names from just below the root down to `node`.
    fn components(&self, node: NodeRef) -> Vec<&str> {
        let mut names = Vec::new();
        let mut cur = Some(node);
        while let Some(n) = cur {
            if n == NodeRef::Dir(self.root) {
                break;
            }
            let Some(name) = self.name_of(n) else { break };
            names.push(name);
            cur = self.parent_of(n).map(NodeRef::Dir);
        }
        names.reverse();
        names
    }

    /// Absolute path of a node (also valid for a detached node).
    pub fn path(&self, node: NodeRef) -> PathBuf {
        let mut p = self.root_path.clone();
        for name in self.components(node) {
            p.push(name);
        }
        p
    }

    /// Root-relative wire path of a node.
    pub fn rel_path(&self, node: NodeRef) -> String {
        self.components(node).join(&paths::SEP.to_string())
    }

    fn rel_components<'a>(&self, abs: &'a Path) -> Option<Vec<&'a str>> {
        let rel = abs.strip_prefix(&self.root_path).ok()?;
        let mut out = Vec::new();
        for c in rel.components() {
            match c {
                Component::Normal(s) => out.push(s.to_str()?),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(out)
    }

    /// Find the attached node at an absolute path.
    pub fn lookup(&self, abs: &Path) -> Option<NodeRef> {
        let names = self.rel_components(abs)?;
        let Some((last, parents)) = names.split_last() else {
            return Some(NodeRef::Dir(self.root));
        };
        let mut dir = self.root;
        for name in parents {
            dir = self.dir(dir)?.subdir(name)?;
        }
        let d = self.dir(dir)?;
        d.subdir(last)
            .map(NodeRef::Dir)
            .or_else(|| d.file(last).map(NodeRef::File))
    }

    pub fn lookup_dir(&self, abs: &Path) -> Option<DirId> {
        match self.lookup(abs)? {
            NodeRef::Dir(d) => Some(d),
            NodeRef::File(_) => None,
        }
    }

    /// Directory that should hold `abs`, creating missing intermediate
    /// directories from on-disk metadata.
    pub fn ensure_parent_dir(&mut self, abs: &Path) -> Option<DirId> {
        let names = self.rel_components(abs)?;
        let (_, parents) = names.split_last()?;
        let mut dir = self.root;
        let mut on_disk = self.root_path.clone();
        for name in parents {
            on_disk.push(name);
            dir = match self.dir(dir)?.subdir(name) {
                Some(d) => d,
                None => {
                    let times = std::fs::metadata(&on_disk)
                        .map(|md| Times::from_metadata(&md))
                        .unwrap_or_default();
                    self.add_dir(dir, name, times)
                }
            };
        }
        Some(dir)
    }

    /// Attach a new empty directory. An existing child with the same name is
    /// discarded first.
    pub fn add_dir(&mut self, parent: DirId, name: &str, times: Times) -> DirId {
        self.remove_child(parent, name);
        let id = DirId(self.dirs.insert(Directory {
            name: name.to_string(),
            parent: Some(parent),
            times,
            subdirs: BTreeMap::new(),
            files: BTreeMap::new(),
        }));
        if let Some(p) = self.dir_mut(parent) {
            p.subdirs.insert(name.to_string(), id);
        }
        id
    }

    /// Attach a new file. An existing child with the same name is discarded
    /// first.
    pub fn add_file(&mut self, parent: DirId, name: &str, meta: FileMeta) -> FileId {
        self.remove_child(parent, name);
        let id = FileId(self.files.insert(FileEntry {
            name: name.to_string(),
            parent,
            meta,
        }));
        if let Some(p) = self.dir_mut(parent) {
            p.files.insert(name.to_string(), id);
        }
        id
    }

    fn remove_child(&mut self, parent: DirId, name: &str) {
        let existing = self.dir(parent).and_then(|d| {
            d.subdir(name)
                .map(NodeRef::Dir)
                .or_else(|| d.file(name).map(NodeRef::File))
        });
        if let Some(node) = existing {
            self.remove(node);
        }
    }

    /// Unlink a node from its parent's child map, keeping the node itself.
    /// The root cannot be detached.
    pub fn detach(&mut self, node: NodeRef) -> bool {
        let (Some(parent), Some(name)) = (self.parent_of(node), self.name_of(node).map(str::to_string)) else {
            return false;
        };
        let Some(p) = self.dir_mut(parent) else {
            return false;
        };
        match node {
            NodeRef::Dir(d) if p.subdirs.get(&name) == Some(&d) => {
                p.subdirs.remove(&name);
                true
            }
            NodeRef::File(f) if p.files.get(&name) == Some(&f) => {
                p.files.remove(&name);
                true
            }
            _ => false,
        }
    }

    /// Attach a detached node under `parent` with `name`.
    pub fn attach(&mut self, node: NodeRef, parent: DirId, name: &str) {
        self.remove_child(parent, name);
        match node {
            NodeRef::Dir(d) => {
                if let Some(dir) = self.dir_mut(d) {
                    dir.name = name.to_string();
                    dir.parent = Some(parent);
                }
                if let Some(p) = self.dir_mut(parent) {
                    p.subdirs.insert(name.to_string(), d);
                }
            }
            NodeRef::File(f) => {
                if let Some(file) = self.file_mut(f) {
                    file.name = name.to_string();
                    file.parent = parent;
                }
                if let Some(p) = self.dir_mut(parent) {
                    p.files.insert(name.to_string(), f);
                }
            }
        }
    }

    /// Free a node's slot and, for a directory, every descendant.
    pub fn discard(&mut self, node: NodeRef) {
        match node {
            NodeRef::File(f) => {
                self.files.remove(f.0);
            }
            NodeRef::Dir(d) => {
                if d == self.root {
                    return;
                }
                let Some(dir) = self.dirs.remove(d.0) else {
                    return;
                };
                for f in dir.files.into_values() {
                    self.discard(NodeRef::File(f));
                }
                for sub in dir.subdirs.into_values() {
                    self.discard(NodeRef::Dir(sub));
                }
            }
        }
    }

    /// Detach and discard.
    pub fn remove(&mut self, node: NodeRef) {
        self.detach(node);
        self.discard(node);
    }

    /// Rename within the same parent.
    pub fn rename(&mut self, node: NodeRef, new_name: &str) {
        if let Some(parent) = self.parent_of(node) {
            self.detach(node);
            self.attach(node, parent, new_name);
        }
    }

    /// Re-parent, keeping the name.
    pub fn move_to(&mut self, node: NodeRef, new_parent: DirId) {
        if let Some(name) = self.name_of(node).map(str::to_string) {
            self.detach(node);
            self.attach(node, new_parent, &name);
        }
    }

    /// Relocatable projection of every attached file.
    pub fn inventory(&self) -> Vec<InventoryEntry> {
        let mut out = Vec::new();
        self.collect_inventory(self.root, &mut out);
        out
    }

    fn collect_inventory(&self, dir: DirId, out: &mut Vec<InventoryEntry>) {
        let Some(d) = self.dir(dir) else { return };
        for sub in d.subdirs() {
            self.collect_inventory(sub, out);
        }
        for f in d.files() {
            if let Some(file) = self.file(f) {
                out.push(InventoryEntry::new(
                    self.rel_path(NodeRef::File(f)),
                    file.size(),
                    file.hash(),
                ));
            }
        }
    }

    /// Indented listing: directories in brackets, files with their size.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_dir(self.root, 0, &mut out);
        out
    }

    fn render_dir(&self, id: DirId, depth: usize, out: &mut String) {
        let Some(d) = self.dir(id) else { return };
        let _ = writeln!(out, "{:indent$}[{}]", "", d.name, indent = depth * 2);
        for sub in d.subdirs() {
            self.render_dir(sub, depth + 1, out);
        }
        for f in d.files() {
            if let Some(file) = self.file(f) {
                let _ = writeln!(
                    out,
                    "{:indent$}{} ({} bytes)",
                    "",
                    file.name,
                    file.size(),
                    indent = (depth + 1) * 2
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hash_bytes;

    fn meta(content: &[u8]) -> FileMeta {
        FileMeta {
            times: Times::default(),
            size: content.len() as u64,
            hash: hash_bytes(content),
        }
    }

    fn sample() -> (Tree, DirId, FileId) {
        let mut tree = Tree::new("/r", Times::default());
        let docs = tree.add_dir(tree.root(), "docs", Times::default());
        let f = tree.add_file(docs, "a.txt", meta(b"hello"));
        tree.add_file(tree.root(), "top.bin", meta(b"x"));
        (tree, docs, f)
    }

    #[test]
    fn path_is_concatenation_of_ancestors() {
        let (tree, docs, f) = sample();
        assert_eq!(tree.path(NodeRef::File(f)), PathBuf::from("/r/docs/a.txt"));
        assert_eq!(tree.rel_path(NodeRef::File(f)), "docs/a.txt");
        assert_eq!(tree.rel_path(NodeRef::Dir(docs)), "docs");
        assert_eq!(tree.path(NodeRef::Dir(tree.root())), PathBuf::from("/r"));
        assert_eq!(tree.rel_path(NodeRef::Dir(tree.root())), "");
    }

    #[test]
    fn lookup_finds_files_and_dirs() {
        let (tree, docs, f) = sample();
        assert_eq!(tree.lookup(Path::new("/r/docs/a.txt")), Some(NodeRef::File(f)));
        assert_eq!(tree.lookup_dir(Path::new("/r/docs")), Some(docs));
        assert_eq!(tree.lookup(Path::new("/r")), Some(NodeRef::Dir(tree.root())));
        assert!(tree.lookup(Path::new("/r/docs/missing")).is_none());
        assert!(tree.lookup(Path::new("/other/docs")).is_none());
        assert!(tree.lookup_dir(Path::new("/r/docs/a.txt")).is_none());
    }

    #[test]
    fn detached_node_keeps_its_old_path() {
        let (mut tree, _, f) = sample();
        assert!(tree.detach(NodeRef::File(f)));
        assert!(tree.lookup(Path::new("/r/docs/a.txt")).is_none());
        assert_eq!(tree.rel_path(NodeRef::File(f)), "docs/a.txt");
        // Second detach is a no-op
        assert!(!tree.detach(NodeRef::File(f)));
    }

    #[test]
    fn move_reuses_node() {
        let (mut tree, _, f) = sample();
        let other = tree.add_dir(tree.root(), "other", Times::default());
        tree.move_to(NodeRef::File(f), other);
        assert_eq!(tree.lookup(Path::new("/r/other/a.txt")), Some(NodeRef::File(f)));
        assert!(tree.lookup(Path::new("/r/docs/a.txt")).is_none());
        assert_eq!(tree.file(f).unwrap().hash(), hash_bytes(b"hello"));
    }

    #[test]
    fn rename_keeps_parent() {
        let (mut tree, docs, _) = sample();
        tree.rename(NodeRef::Dir(docs), "papers");
        let f = tree.lookup(Path::new("/r/papers/a.txt")).unwrap();
        assert_eq!(tree.rel_path(f), "papers/a.txt");
        assert!(tree.lookup_dir(Path::new("/r/docs")).is_none());
    }

    #[test]
    fn remove_discards_subtree() {
        let (mut tree, docs, f) = sample();
        assert_eq!(tree.file_count(), 2);
        tree.remove(NodeRef::Dir(docs));
        assert!(tree.file(f).is_none());
        assert!(tree.dir(docs).is_none());
        assert_eq!(tree.file_count(), 1);
        assert_eq!(tree.dir_count(), 1);
    }

    #[test]
    fn child_names_stay_unique() {
        let (mut tree, docs, f) = sample();
        let g = tree.add_file(docs, "a.txt", meta(b"replacement"));
        assert_ne!(f, g);
        assert!(tree.file(f).is_none());
        assert_eq!(tree.dir(docs).unwrap().files().count(), 1);
    }

    #[test]
    fn churn_reuses_slots() {
        let (mut tree, docs, _) = sample();
        for _ in 0..10_000 {
            let f = tree.add_file(docs, "swap.tmp", meta(b"s"));
            tree.remove(NodeRef::File(f));
        }
        assert_eq!(tree.file_count(), 2);
        assert!(tree.files.slots.len() <= 3);

        let scratch = tree.add_dir(tree.root(), "build", Times::default());
        tree.remove(NodeRef::Dir(scratch));
        let again = tree.add_dir(tree.root(), "build", Times::default());
        assert_eq!(tree.dirs.slots.len(), 3);
        // The stale id does not resolve to the slot's new occupant
        assert!(tree.dir(scratch).is_none());
        assert_eq!(tree.dir(again).unwrap().name, "build");
    }

    #[test]
    fn refresh_updates_size_and_hash_together() {
        let (mut tree, _, f) = sample();
        tree.file_mut(f).unwrap().refresh(meta(b"longer content"));
        let file = tree.file(f).unwrap();
        assert_eq!(file.size(), 14);
        assert_eq!(file.hash(), hash_bytes(b"longer content"));
    }

    #[test]
    fn ensure_parent_dir_builds_missing_levels() {
        let mut tree = Tree::new("/nonexistent-root", Times::default());
        let d = tree.ensure_parent_dir(Path::new("/nonexistent-root/a/b/c.txt")).unwrap();
        assert_eq!(tree.rel_path(NodeRef::Dir(d)), "a/b");
        assert_eq!(tree.ensure_parent_dir(Path::new("/nonexistent-root/a/b/d.txt")), Some(d));
        assert!(tree.ensure_parent_dir(Path::new("/elsewhere/x")).is_none());
    }

    #[test]
    fn inventory_and_render() {
        let (tree, _, _) = sample();
        let paths: Vec<_> = tree.inventory().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["docs/a.txt".to_string(), "top.bin".to_string()]);

        let rendered = tree.render();
        assert_eq!(rendered, "[r]\n  [docs]\n    a.txt (5 bytes)\n  top.bin (1 bytes)\n");
    }
}
