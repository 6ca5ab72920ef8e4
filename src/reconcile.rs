//! One-time diff of a local snapshot against the server's inventory.
//!
//! Every local file is matched by path first; content that the server already
//! holds under another path is copied there instead of uploaded. Whatever the
//! walk leaves unmatched exists only remotely and is deleted, after
//! everything else.

use crate::checksum::ContentHash;
use crate::inventory::{InventoryEntry, RemoteIndex};
use crate::operation::{EntityKind, Operation};
use crate::tree::{DirId, NodeRef, Tree};
use std::collections::HashMap;
use tracing::debug;

/// Operations that bring the remote side in line with `tree`. Paths are
/// relative to the watched root.
pub fn reconcile(tree: &Tree, remote: Vec<InventoryEntry>) -> Vec<Operation> {
    let local: HashMap<String, ContentHash> = tree
        .inventory()
        .into_iter()
        .map(|e| (e.path, e.hash))
        .collect();
    let mut index = RemoteIndex::build(remote);
    let mut ops = Vec::new();

    visit(tree, tree.root(), &local, &mut index, &mut ops);

    let deletes = index.remaining_len();
    ops.extend(
        index
            .into_remaining()
            .map(|e| Operation::delete(EntityKind::File, e.path)),
    );
    debug!(
        "reconcile: {} operation(s), {} remote-only file(s)",
        ops.len(),
        deletes
    );
    ops
}

/// Post-order: subdirectories first, then the directory's own files.
fn visit(
    tree: &Tree,
    dir: DirId,
    local: &HashMap<String, ContentHash>,
    index: &mut RemoteIndex,
    ops: &mut Vec<Operation>,
) {
    let Some(d) = tree.dir(dir) else { return };

    if d.is_empty() && dir != tree.root() {
        ops.push(Operation::create(
            EntityKind::Directory,
            tree.rel_path(NodeRef::Dir(dir)),
        ));
        return;
    }

    for sub in d.subdirs() {
        visit(tree, sub, local, index, ops);
    }

    for f in d.files() {
        let Some(file) = tree.file(f) else { continue };
        let path = tree.rel_path(NodeRef::File(f));
        let matched = index.take(&path);
        if matched.as_ref().is_some_and(|m| m.hash == file.hash()) {
            continue;
        }

        // A source is only safe to copy from if the run leaves its content
        // alone: either no local file sits there (deleted last) or the local
        // file there already matches it.
        let stable = |candidate: &InventoryEntry| match local.get(&candidate.path) {
            None => true,
            Some(h) => *h == candidate.hash,
        };
        let source = index
            .find_copy_source(&file.hash(), file.size(), &file.name, stable)
            .filter(|s| s.path != path)
            .map(|s| s.path.clone());

        ops.push(match (source, matched) {
            (Some(from), _) => Operation::copy(EntityKind::File, from, path),
            (None, Some(_)) => Operation::modify(EntityKind::File, path),
            (None, None) => Operation::create(EntityKind::File, path),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hash_bytes;
    use crate::snapshot::build;
    use std::fs;
    use tempfile::TempDir;

    fn entry(path: &str, content: &[u8]) -> InventoryEntry {
        InventoryEntry::new(path, content.len() as u64, hash_bytes(content))
    }

    fn tree_of(files: &[(&str, &[u8])]) -> (TempDir, Tree) {
        let tmp = TempDir::new().unwrap();
        for (p, content) in files {
            let full = tmp.path().join(p);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        let tree = build(tmp.path()).unwrap();
        (tmp, tree)
    }

    #[test]
    fn empty_remote_yields_one_create_per_file() {
        let (_tmp, tree) = tree_of(&[("a.txt", b"a"), ("d/b.txt", b"b"), ("d/e/c.txt", b"c")]);
        let ops = reconcile(&tree, Vec::new());
        assert_eq!(ops.len(), 3);
        assert!(ops.iter().all(|o| matches!(o, Operation::Create { entity: EntityKind::File, .. })));
        // Post-order: deeper files before their ancestors' files
        assert_eq!(ops[0], Operation::create(EntityKind::File, "d/e/c.txt"));
        assert_eq!(ops[2], Operation::create(EntityKind::File, "a.txt"));
    }

    #[test]
    fn identical_inventory_yields_nothing() {
        let (_tmp, tree) = tree_of(&[("a.txt", b"a"), ("d/b.txt", b"b")]);
        let remote = vec![entry("a.txt", b"a"), entry("d/b.txt", b"b")];
        assert!(reconcile(&tree, remote).is_empty());
    }

    #[test]
    fn same_content_elsewhere_is_copied() {
        let (_tmp, tree) = tree_of(&[("a.txt", b"H1 content")]);
        let remote = vec![entry("old/a.txt", b"H1 content")];
        let ops = reconcile(&tree, remote);
        assert_eq!(
            ops,
            vec![
                Operation::copy(EntityKind::File, "old/a.txt", "a.txt"),
                Operation::delete(EntityKind::File, "old/a.txt"),
            ]
        );
    }

    #[test]
    fn changed_file_is_modified() {
        let (_tmp, tree) = tree_of(&[("a.txt", b"new")]);
        let ops = reconcile(&tree, vec![entry("a.txt", b"old")]);
        assert_eq!(ops, vec![Operation::modify(EntityKind::File, "a.txt")]);
    }

    #[test]
    fn changed_file_with_known_content_is_copied() {
        let (_tmp, tree) = tree_of(&[("a.txt", b"shared"), ("b.txt", b"shared")]);
        let remote = vec![entry("a.txt", b"shared"), entry("b.txt", b"stale")];
        let ops = reconcile(&tree, remote);
        assert_eq!(ops, vec![Operation::copy(EntityKind::File, "a.txt", "b.txt")]);
    }

    #[test]
    fn extension_mismatch_falls_back_to_upload() {
        let (_tmp, tree) = tree_of(&[("a.txt", b"same")]);
        let ops = reconcile(&tree, vec![entry("a.bin", b"same")]);
        assert_eq!(
            ops,
            vec![
                Operation::create(EntityKind::File, "a.txt"),
                Operation::delete(EntityKind::File, "a.bin"),
            ]
        );
    }

    // The remote copy at `x.txt` is about to be overwritten by a Modify, so
    // it cannot serve as the source for `y.txt`.
    #[test]
    fn overwritten_source_is_not_used() {
        let (_tmp, tree) = tree_of(&[("x.txt", b"fresh"), ("y.txt", b"old")]);
        let remote = vec![entry("x.txt", b"old")];
        let ops = reconcile(&tree, remote);
        assert_eq!(
            ops,
            vec![
                Operation::modify(EntityKind::File, "x.txt"),
                Operation::create(EntityKind::File, "y.txt"),
            ]
        );
    }

    #[test]
    fn deletes_come_last() {
        let (_tmp, tree) = tree_of(&[("z/keep.txt", b"k"), ("new.txt", b"n")]);
        let remote = vec![entry("gone.txt", b"g"), entry("z/keep.txt", b"k")];
        let ops = reconcile(&tree, remote);
        assert_eq!(ops.last(), Some(&Operation::delete(EntityKind::File, "gone.txt")));
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn empty_directories_are_created() {
        let (tmp, _) = tree_of(&[("a.txt", b"a")]);
        fs::create_dir_all(tmp.path().join("empty/inner")).unwrap();
        let tree = build(tmp.path()).unwrap();
        let ops = reconcile(&tree, vec![entry("a.txt", b"a")]);
        assert_eq!(ops, vec![Operation::create(EntityKind::Directory, "empty/inner")]);
    }
}
