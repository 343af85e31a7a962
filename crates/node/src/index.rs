use std::collections::BTreeMap;
use std::mem::take;

use borsh::BorshDeserialize;
use flotilla_primitives::file::FLAG_DELETED;
use flotilla_primitives::{lamport, FileInfo, FileInfoTruncated, NodeId, RepoId};
use flotilla_store::{Store, Transaction};
use parking_lot::RwLock;

/// Per-repository, multi-replica file index.
///
/// One replica per node id, each an ordered name → [`FileInfo`] map tagged
/// with the replica's local-version watermark. The global view (winning
/// entry per name across replicas) is maintained incrementally; the need
/// view is derived from it on traversal.
///
/// Every mutation is mirrored to the persistent store in a single
/// transaction, so a crash leaves the replica at a prior consistent point.
/// Store failures are unrecoverable and abort the process rather than let
/// index corruption propagate.
#[derive(Debug)]
pub struct RepoIndex {
    repo: RepoId,
    store: Store,
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    replicas: BTreeMap<NodeId, Replica>,
    /// name → node holding the winning version. Ties break toward the
    /// greater node id; the local node has no special priority.
    global: BTreeMap<String, NodeId>,
}

#[derive(Debug, Default)]
struct Replica {
    files: BTreeMap<String, FileInfo>,
    /// Highest local version assigned in this replica; strictly monotonic
    /// across successful writes.
    local_version: u64,
}

impl RepoIndex {
    /// Opens the index for `repo`, loading any replicas previously
    /// persisted under this repository's key prefix.
    pub fn new(repo: RepoId, store: Store) -> Self {
        let mut inner = Inner::default();

        let entries = store
            .iter_prefix(&file_prefix(&repo))
            .unwrap_or_else(|err| panic!("index load failed for repo {repo}: {err}"));

        for (key, value) in entries {
            let Some((node, _name)) = split_file_key(&repo, &key) else {
                panic!("inconsistent state, malformed index key in repo {repo}");
            };
            let file = FileInfo::try_from_slice(&value)
                .unwrap_or_else(|err| panic!("index decode failed for repo {repo}: {err}"));

            let replica = inner.replicas.entry(node).or_default();
            replica.local_version = replica.local_version.max(file.local_version);
            let _prev = replica.files.insert(file.name.clone(), file);
        }

        let watermarks = store
            .iter_prefix(&version_prefix(&repo))
            .unwrap_or_else(|err| panic!("index load failed for repo {repo}: {err}"));

        for (key, value) in watermarks {
            let Some(node) = split_version_key(&repo, &key) else {
                continue;
            };
            let Ok(bytes) = <[u8; 8]>::try_from(value.as_slice()) else {
                continue;
            };
            let replica = inner.replicas.entry(node).or_default();
            replica.local_version = replica.local_version.max(u64::from_le_bytes(bytes));
        }

        let names: Vec<String> = inner
            .replicas
            .values()
            .flat_map(|r| r.files.keys().cloned())
            .collect();
        for name in names {
            inner.recompute_global(&name);
        }

        Self {
            repo,
            store,
            inner: RwLock::new(inner),
        }
    }

    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    /// Atomically sets the replica to exactly `files`; names not present
    /// are removed. Used for a peer's full Index and for peer disconnect
    /// (with an empty list, retracting the replica's contributions).
    pub fn replace(&self, node: NodeId, files: Vec<FileInfo>) {
        self.replace_inner(node, files, false);
    }

    /// Like [`replace`](Self::replace), but names dropped from the replica
    /// are kept as Deleted tombstones ticked past their previous version,
    /// so local deletions propagate. Used for the local replica after a
    /// full scan of the root.
    pub fn replace_with_delete(&self, node: NodeId, files: Vec<FileInfo>) {
        self.replace_inner(node, files, true);
    }

    fn replace_inner(&self, node: NodeId, files: Vec<FileInfo>, with_delete: bool) {
        let mut inner = self.inner.write();
        let mut tx = Transaction::default();

        let replica = inner.replicas.entry(node).or_default();
        let old = take(&mut replica.files);
        let mut next_version = replica.local_version;

        let mut fresh = BTreeMap::new();
        for mut file in files {
            next_version += 1;
            file.local_version = next_version;
            tx.put(file_key(&self.repo, node, &file.name), encode(&file));
            let _prev = fresh.insert(file.name.clone(), file);
        }

        for (name, old_file) in &old {
            if fresh.contains_key(name) {
                continue;
            }
            if with_delete {
                // The block list stays on the tombstone; it records how
                // many bytes the deletion covers.
                let mut tombstone = old_file.clone();
                tombstone.flags |= FLAG_DELETED;
                tombstone.version = lamport::DEFAULT.tick(tombstone.version);
                next_version += 1;
                tombstone.local_version = next_version;
                tx.put(file_key(&self.repo, node, name), encode(&tombstone));
                let _prev = fresh.insert(name.clone(), tombstone);
            } else {
                tx.delete(file_key(&self.repo, node, name));
            }
        }

        replica.files = fresh;
        replica.local_version = next_version;
        tx.put(
            version_key(&self.repo, node),
            next_version.to_le_bytes().to_vec(),
        );

        let affected: Vec<String> = old
            .keys()
            .chain(inner.replicas[&node].files.keys())
            .cloned()
            .collect();
        for name in affected {
            inner.recompute_global(&name);
        }

        self.commit(tx);
    }

    /// Upsert: same-name entries are replaced, new ones appended, nothing
    /// removed. Every inserted entry receives the next local version for
    /// the replica.
    pub fn update(&self, node: NodeId, files: Vec<FileInfo>) {
        if files.is_empty() {
            return;
        }

        let mut inner = self.inner.write();
        let mut tx = Transaction::default();

        let replica = inner.replicas.entry(node).or_default();
        let mut next_version = replica.local_version;

        let mut affected = Vec::with_capacity(files.len());
        for mut file in files {
            next_version += 1;
            file.local_version = next_version;
            tx.put(file_key(&self.repo, node, &file.name), encode(&file));
            affected.push(file.name.clone());
            let _prev = replica.files.insert(file.name.clone(), file);
        }

        replica.local_version = next_version;
        tx.put(
            version_key(&self.repo, node),
            next_version.to_le_bytes().to_vec(),
        );

        for name in affected {
            inner.recompute_global(&name);
        }

        self.commit(tx);
    }

    /// The replica's current entry for `name`, if any.
    pub fn get(&self, node: NodeId, name: &str) -> Option<FileInfo> {
        self.inner
            .read()
            .replicas
            .get(&node)
            .and_then(|r| r.files.get(name))
            .cloned()
    }

    /// The winning entry for `name` across all replicas.
    pub fn get_global(&self, name: &str) -> Option<FileInfo> {
        let inner = self.inner.read();
        inner.global_file(name).cloned()
    }

    /// The nodes holding the winning version of `name`, excluding replicas
    /// whose entry is deleted or invalid.
    pub fn availability(&self, name: &str) -> Vec<NodeId> {
        let inner = self.inner.read();

        let Some(global) = inner.global_file(name) else {
            return Vec::new();
        };
        let version = global.version;

        inner
            .replicas
            .iter()
            .filter(|(_, replica)| {
                replica
                    .files
                    .get(name)
                    .is_some_and(|f| f.version == version && !f.is_deleted() && !f.is_invalid())
            })
            .map(|(node, _)| *node)
            .collect()
    }

    /// The replica's local-version watermark.
    pub fn local_version(&self, node: NodeId) -> u64 {
        self.inner
            .read()
            .replicas
            .get(&node)
            .map_or(0, |r| r.local_version)
    }

    /// Visits the replica's entries in name order until the visitor
    /// returns `false`. The snapshot is consistent for the whole
    /// traversal; the visitor must not call back into this index.
    pub fn with_have<F>(&self, node: NodeId, mut visit: F)
    where
        F: FnMut(&FileInfo) -> bool,
    {
        let inner = self.inner.read();
        let Some(replica) = inner.replicas.get(&node) else {
            return;
        };

        for file in replica.files.values() {
            if !visit(file) {
                break;
            }
        }
    }

    pub fn with_have_truncated<F>(&self, node: NodeId, mut visit: F)
    where
        F: FnMut(&FileInfoTruncated) -> bool,
    {
        self.with_have(node, |f| visit(&FileInfoTruncated::from(f)));
    }

    /// Visits the global view in name order.
    pub fn with_global<F>(&self, mut visit: F)
    where
        F: FnMut(&FileInfo) -> bool,
    {
        let inner = self.inner.read();

        for name in inner.global.keys() {
            let Some(file) = inner.global_file(name) else {
                panic!("inconsistent state, global entry without replica backing");
            };
            if !visit(file) {
                break;
            }
        }
    }

    pub fn with_global_truncated<F>(&self, mut visit: F)
    where
        F: FnMut(&FileInfoTruncated) -> bool,
    {
        self.with_global(|f| visit(&FileInfoTruncated::from(f)));
    }

    /// Visits, in name order, the global entries the given replica lags
    /// behind on. Invalid globals are never needed.
    pub fn with_need<F>(&self, node: NodeId, mut visit: F)
    where
        F: FnMut(&FileInfo) -> bool,
    {
        let inner = self.inner.read();

        for name in inner.global.keys() {
            let Some(global) = inner.global_file(name) else {
                panic!("inconsistent state, global entry without replica backing");
            };
            if global.is_invalid() {
                continue;
            }

            let have_version = inner
                .replicas
                .get(&node)
                .and_then(|r| r.files.get(name))
                .map_or(0, |f| f.version);

            if global.version > have_version && !visit(global) {
                break;
            }
        }
    }

    pub fn with_need_truncated<F>(&self, node: NodeId, mut visit: F)
    where
        F: FnMut(&FileInfoTruncated) -> bool,
    {
        self.with_need(node, |f| visit(&FileInfoTruncated::from(f)));
    }

    fn commit(&self, tx: Transaction) {
        if tx.is_empty() {
            return;
        }
        self.store
            .apply(tx)
            .unwrap_or_else(|err| panic!("index store commit failed for repo {}: {err}", self.repo));
    }
}

impl Inner {
    fn global_file(&self, name: &str) -> Option<&FileInfo> {
        let node = self.global.get(name)?;
        self.replicas.get(node)?.files.get(name)
    }

    fn recompute_global(&mut self, name: &str) {
        let mut winner: Option<(u64, NodeId)> = None;

        for (node, replica) in &self.replicas {
            if let Some(file) = replica.files.get(name) {
                let candidate = (file.version, *node);
                if winner.map_or(true, |w| candidate > w) {
                    winner = Some(candidate);
                }
            }
        }

        match winner {
            Some((_, node)) => {
                let _prev = self.global.insert(name.to_owned(), node);
            }
            None => {
                let _prev = self.global.remove(name);
            }
        }
    }
}

fn encode(file: &FileInfo) -> Vec<u8> {
    borsh::to_vec(file).expect("borsh encoding of FileInfo cannot fail")
}

fn file_prefix(repo: &RepoId) -> Vec<u8> {
    let mut key = Vec::with_capacity(5 + repo.as_str().len());
    key.extend_from_slice(b"idx\0");
    key.extend_from_slice(repo.as_str().as_bytes());
    key.push(0);
    key
}

fn file_key(repo: &RepoId, node: NodeId, name: &str) -> Vec<u8> {
    let mut key = file_prefix(repo);
    key.extend_from_slice(node.as_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

fn split_file_key(repo: &RepoId, key: &[u8]) -> Option<(NodeId, String)> {
    let rest = key.strip_prefix(file_prefix(repo).as_slice())?;
    if rest.len() < 32 {
        return None;
    }
    let (node, name) = rest.split_at(32);
    Some((
        NodeId::from_slice(node)?,
        String::from_utf8(name.to_vec()).ok()?,
    ))
}

fn version_prefix(repo: &RepoId) -> Vec<u8> {
    let mut key = Vec::with_capacity(5 + repo.as_str().len());
    key.extend_from_slice(b"ver\0");
    key.extend_from_slice(repo.as_str().as_bytes());
    key.push(0);
    key
}

fn version_key(repo: &RepoId, node: NodeId) -> Vec<u8> {
    let mut key = version_prefix(repo);
    key.extend_from_slice(node.as_bytes());
    key
}

fn split_version_key(repo: &RepoId, key: &[u8]) -> Option<NodeId> {
    let rest = key.strip_prefix(version_prefix(repo).as_slice())?;
    NodeId::from_slice(rest)
}

#[cfg(test)]
mod tests {
    use flotilla_primitives::file::{FLAG_INVALID, FLAG_NO_PERM_BITS};
    use flotilla_primitives::BlockInfo;
    use flotilla_store::InMemoryDb;

    use super::*;

    fn index() -> RepoIndex {
        RepoIndex::new("photos".into(), Store::new(InMemoryDb::new()))
    }

    fn file(name: &str, version: u64) -> FileInfo {
        FileInfo {
            name: name.to_owned(),
            flags: 0o644,
            modified: 1_400_000_000,
            version,
            local_version: 0,
            blocks: vec![BlockInfo {
                offset: 0,
                size: 10,
                hash: vec![0xab; 32],
            }],
        }
    }

    fn names(index: &RepoIndex, node: NodeId) -> Vec<String> {
        let mut out = Vec::new();
        index.with_have(node, |f| {
            out.push(f.name.clone());
            true
        });
        out
    }

    #[test]
    fn replace_sets_replica_exactly() {
        let idx = index();
        let node = NodeId::new([1; 32]);

        idx.replace(node, vec![file("a", 1), file("b", 1)]);
        assert_eq!(names(&idx, node), ["a", "b"]);

        idx.replace(node, vec![file("b", 2), file("c", 1)]);
        assert_eq!(names(&idx, node), ["b", "c"]);
        assert!(idx.get(node, "a").is_none());
    }

    #[test]
    fn update_upserts_without_removal() {
        let idx = index();
        let node = NodeId::new([1; 32]);

        idx.replace(node, vec![file("a", 1), file("b", 1)]);
        idx.update(node, vec![file("b", 5), file("c", 1)]);

        assert_eq!(names(&idx, node), ["a", "b", "c"]);
        assert_eq!(idx.get(node, "b").unwrap().version, 5);
    }

    #[test]
    fn local_version_watermark_is_monotonic_and_matches_entries() {
        let idx = index();
        let node = NodeId::new([1; 32]);

        idx.replace(node, vec![file("a", 1), file("b", 1)]);
        let after_replace = idx.local_version(node);
        assert_eq!(after_replace, 2);

        idx.update(node, vec![file("a", 2)]);
        let after_update = idx.local_version(node);
        assert!(after_update > after_replace);

        let mut max_entry = 0;
        idx.with_have(node, |f| {
            max_entry = max_entry.max(f.local_version);
            true
        });
        assert_eq!(max_entry, after_update);
    }

    #[test]
    fn global_takes_max_version_with_node_id_tiebreak() {
        let idx = index();
        let lo = NodeId::new([1; 32]);
        let hi = NodeId::new([2; 32]);

        idx.replace(lo, vec![file("a", 7)]);
        idx.replace(hi, vec![file("a", 3)]);
        assert_eq!(idx.get_global("a").unwrap().version, 7);
        assert_eq!(idx.availability("a"), [lo]);

        // Equal versions: the greater node id wins.
        idx.replace(hi, vec![file("a", 7)]);
        assert_eq!(idx.get_global("a").unwrap().version, 7);
        assert_eq!(idx.availability("a"), [lo, hi]);
    }

    #[test]
    fn need_lists_only_lagging_names() {
        let idx = index();
        let peer = NodeId::new([1; 32]);

        idx.replace(NodeId::LOCAL, vec![file("a", 5), file("b", 2)]);
        idx.replace(peer, vec![file("b", 4), file("c", 1)]);

        let mut needed = Vec::new();
        idx.with_need(NodeId::LOCAL, |f| {
            needed.push((f.name.clone(), f.version));
            true
        });

        // b lags (2 < 4), c is missing entirely, a is already at global.
        assert_eq!(
            needed,
            [("b".to_owned(), 4), ("c".to_owned(), 1)]
        );
    }

    #[test]
    fn need_and_have_at_global_are_disjoint() {
        let idx = index();
        let peer = NodeId::new([1; 32]);

        idx.replace(NodeId::LOCAL, vec![file("a", 5)]);
        idx.replace(peer, vec![file("a", 5), file("b", 1)]);

        let mut needed = Vec::new();
        idx.with_need(NodeId::LOCAL, |f| {
            needed.push((f.name.clone(), f.version));
            true
        });

        for (name, version) in needed {
            let have = idx.get(NodeId::LOCAL, &name).map_or(0, |f| f.version);
            assert!(
                have < version,
                "{name} is needed yet held at the global version"
            );
        }
    }

    #[test]
    fn invalid_global_is_never_needed() {
        let idx = index();
        let peer = NodeId::new([1; 32]);

        let mut bad = file("a", 9);
        bad.flags |= FLAG_INVALID;
        idx.replace(peer, vec![bad]);

        let mut needed = Vec::new();
        idx.with_need(NodeId::LOCAL, |f| {
            needed.push(f.name.clone());
            true
        });
        assert!(needed.is_empty());

        // The invalid entry still occupies its name slot in the global view
        // and never contributes availability.
        assert!(idx.get_global("a").is_some());
        assert!(idx.availability("a").is_empty());
    }

    #[test]
    fn replace_with_delete_leaves_ticked_tombstones() {
        let idx = index();

        idx.replace(NodeId::LOCAL, vec![file("a", 3), file("b", 1)]);
        idx.replace_with_delete(NodeId::LOCAL, vec![file("b", 1)]);

        let tomb = idx.get(NodeId::LOCAL, "a").unwrap();
        assert!(tomb.is_deleted());
        assert!(tomb.version > 3, "tombstone must beat the deleted version");
        assert_eq!(tomb.size(), 10, "tombstone keeps its byte accounting");

        // A plain replace drops the name instead.
        idx.replace(NodeId::LOCAL, vec![file("b", 1)]);
        assert!(idx.get(NodeId::LOCAL, "a").is_none());
    }

    #[test]
    fn disconnect_replace_retracts_contributions() {
        let idx = index();
        let peer = NodeId::new([1; 32]);

        idx.replace(NodeId::LOCAL, vec![file("a", 2)]);
        idx.replace(peer, vec![file("a", 9), file("z", 1)]);
        assert_eq!(idx.get_global("a").unwrap().version, 9);

        idx.replace(peer, Vec::new());
        assert_eq!(idx.get_global("a").unwrap().version, 2);
        assert!(idx.get_global("z").is_none());
    }

    #[test]
    fn contents_survive_reopen() {
        let store = Store::new(InMemoryDb::new());
        let node = NodeId::new([1; 32]);

        {
            let idx = RepoIndex::new("photos".into(), store.clone());
            idx.replace(node, vec![file("a", 4)]);
            idx.update(NodeId::LOCAL, vec![file("b", 2)]);
        }

        let idx = RepoIndex::new("photos".into(), store);
        assert_eq!(idx.get(node, "a").unwrap().version, 4);
        assert_eq!(idx.get(NodeId::LOCAL, "b").unwrap().version, 2);
        assert_eq!(idx.local_version(node), 1);
        assert_eq!(idx.get_global("a").unwrap().version, 4);

        // The watermark keeps advancing, never resets.
        idx.update(node, vec![file("c", 1)]);
        assert_eq!(idx.local_version(node), 2);
    }

    #[test]
    fn indexes_of_different_repos_do_not_interfere() {
        let store = Store::new(InMemoryDb::new());
        let photos = RepoIndex::new("photos".into(), store.clone());
        let music = RepoIndex::new("music".into(), store.clone());

        photos.replace(NodeId::LOCAL, vec![file("a", 1)]);
        music.replace(NodeId::LOCAL, vec![file("b", 1)]);

        let photos = RepoIndex::new("photos".into(), store);
        assert!(photos.get(NodeId::LOCAL, "a").is_some());
        assert!(photos.get(NodeId::LOCAL, "b").is_none());
    }

    #[test]
    fn flags_round_trip_through_persistence() {
        let store = Store::new(InMemoryDb::new());
        {
            let idx = RepoIndex::new("photos".into(), store.clone());
            let mut f = file("a", 1);
            f.flags |= FLAG_NO_PERM_BITS;
            idx.replace(NodeId::LOCAL, vec![f]);
        }

        let idx = RepoIndex::new("photos".into(), store);
        let f = idx.get(NodeId::LOCAL, "a").unwrap();
        assert_ne!(f.flags & FLAG_NO_PERM_BITS, 0);
    }
}
