//! The process-wide coordination authority.
//!
//! The model owns the repository table, the repo/peer sharing graph and the
//! live connection table, split over three reader-writer lock domains:
//!
//! | domain | protects |
//! |--------|----------|
//! | P      | `conns`: proto/raw connections, peer client versions |
//! | R      | `repos`: repo configs, indexes, sharing graph, ignores, stats |
//! | S      | `states`: repo state machine and transition timestamps |
//!
//! Locks nest only in the order P → R → S, and none of them is held across
//! I/O: code reads out the `Arc` handles it needs, releases, then touches
//! disk, store or transport. A watchdog thread per lock panics the process
//! if a lock stays wedged past its timeout.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use flotilla_primitives::file::{FLAG_DELETED, FLAG_INVALID};
use flotilla_primitives::{
    lamport, Event, FileInfo, FileInfoTruncated, FileLike, NodeId, RepoId, INDEX_BATCH_SIZE,
};
use flotilla_store::Store;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::config::{Config, NodeConfig, RepoConfig};
use crate::events::EventBus;
use crate::ignore::{self, Patterns, IGNORE_FILE};
use crate::index::RepoIndex;
use crate::protocol::{
    ClusterConfigMessage, Closer, Connection, ModelCallbacks, NodeAnnouncement, OptionKv,
    RepoAnnouncement, RequestError, Statistics, TotalCounters, FLAG_INTRODUCER, FLAG_SHARE_TRUSTED,
};
use crate::puller::{Puller, Versioner};
use crate::scan::{
    CurrentFiler, DefaultTempNamer, Scanner, TempNamer, WalkOptions, STANDARD_BLOCK_SIZE,
};
use crate::sender;
use crate::state::RepoState;
use crate::stats::{NodeStatistics, NodeStatsRef};
use crate::watchdog;

const SCAN_BATCH_SIZE: usize = 100;

/// A TLS close sends an alert; against a dead peer that write must not
/// hang shutdown.
const CLOSE_WRITE_DEADLINE: Duration = Duration::from_millis(250);

/// Builds a versioning backend for a repository from its configuration.
pub type VersionerFactory =
    Arc<dyn Fn(&RepoId, &Utf8Path, &BTreeMap<String, String>) -> Arc<dyn Versioner> + Send + Sync>;

/// Per-connection statistics, as reported by `connection_stats`.
#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
    pub statistics: Statistics,
    pub address: Option<std::net::SocketAddr>,
    pub client_version: String,
}

#[derive(Default)]
struct RepoMaps {
    repo_cfgs: HashMap<RepoId, RepoConfig>,
    repo_files: HashMap<RepoId, Arc<RepoIndex>>,
    repo_nodes: HashMap<RepoId, Vec<NodeId>>,
    node_repos: HashMap<NodeId, Vec<RepoId>>,
    repo_ignores: HashMap<RepoId, Patterns>,
    node_stat_refs: HashMap<NodeId, NodeStatsRef>,
}

#[derive(Default)]
struct StateMaps {
    repo_state: HashMap<RepoId, RepoState>,
    repo_state_changed: HashMap<RepoId, SystemTime>,
}

#[derive(Default)]
struct ConnMaps {
    proto_conn: HashMap<NodeId, Arc<dyn Connection>>,
    raw_conn: HashMap<NodeId, Box<dyn Closer>>,
    node_ver: HashMap<NodeId, String>,
}

pub struct Model {
    cfg: Mutex<Config>,
    store: Store,

    node_name: String,
    client_name: String,
    client_version: String,

    scanner: Arc<dyn Scanner>,
    temp_namer: Arc<dyn TempNamer>,
    counters: Arc<dyn TotalCounters>,
    events: EventBus,
    versioners: Mutex<HashMap<String, VersionerFactory>>,

    repos: Arc<RwLock<RepoMaps>>,
    states: Arc<RwLock<StateMaps>>,
    conns: Arc<RwLock<ConnMaps>>,

    added_repo: AtomicBool,
    started: AtomicBool,
}

impl Model {
    /// Creates a model. It starts in read-only mode: it announces files to
    /// peers and serves requests without altering local repositories until
    /// `start_repo_rw` spawns a puller.
    pub fn new(
        cfg: Config,
        node_name: impl Into<String>,
        client_name: impl Into<String>,
        client_version: impl Into<String>,
        store: Store,
        scanner: Arc<dyn Scanner>,
        counters: Arc<dyn TotalCounters>,
    ) -> Arc<Self> {
        let repos = Arc::new(RwLock::new(RepoMaps::default()));
        let states = Arc::new(RwLock::new(StateMaps::default()));
        let conns = Arc::new(RwLock::new(ConnMaps::default()));

        let timeout = watchdog::timeout_from_env();
        watchdog::deadlock_detect("repo", &repos, timeout);
        watchdog::deadlock_detect("state", &states, timeout);
        watchdog::deadlock_detect("peer", &conns, timeout);

        Arc::new(Self {
            cfg: Mutex::new(cfg),
            store,
            node_name: node_name.into(),
            client_name: client_name.into(),
            client_version: client_version.into(),
            scanner,
            temp_namer: Arc::new(DefaultTempNamer),
            counters,
            events: EventBus::new(),
            versioners: Mutex::new(HashMap::new()),
            repos,
            states,
            conns,
            added_repo: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> Config {
        self.cfg.lock().clone()
    }

    pub fn register_versioner(&self, kind: impl Into<String>, factory: VersionerFactory) {
        let _prev = self.versioners.lock().insert(kind.into(), factory);
    }

    /// Registers a repository. Must happen before the model is started;
    /// mutating the repo table afterwards is a programming error.
    pub fn add_repo(&self, cfg: RepoConfig) {
        if self.started.load(Ordering::SeqCst) {
            panic!("cannot add repo to started model");
        }
        if cfg.id.is_empty() {
            panic!("cannot add empty repo id");
        }

        let mut repos = self.repos.write();

        if repos.repo_cfgs.contains_key(&cfg.id) {
            panic!("cannot add repo {} twice", cfg.id);
        }

        let index = Arc::new(RepoIndex::new(cfg.id.clone(), self.store.clone()));
        let _prev = repos.repo_files.insert(cfg.id.clone(), index);
        let _prev = repos.repo_nodes.insert(cfg.id.clone(), cfg.nodes.clone());
        for node in &cfg.nodes {
            repos.node_repos.entry(*node).or_default().push(cfg.id.clone());
        }
        let _prev = repos.repo_ignores.insert(cfg.id.clone(), Patterns::default());
        let _prev = repos.repo_cfgs.insert(cfg.id.clone(), cfg);

        self.added_repo.store(true, Ordering::SeqCst);
    }

    /// Freezes the repository table and allows workers to spawn.
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Whether any repository has been registered.
    pub fn has_repos(&self) -> bool {
        self.added_repo.load(Ordering::SeqCst)
    }

    /// Read-only processing for a repository: periodic rescans, no pulls.
    pub fn start_repo_ro(self: &Arc<Self>, repo: &RepoId) {
        self.start();

        let interval = {
            let repos = self.repos.read();
            let Some(cfg) = repos.repo_cfgs.get(repo) else {
                panic!("cannot start nonexistent repo {repo}");
            };
            Duration::from_secs(cfg.rescan_interval_s.max(1))
        };

        let model = Arc::clone(self);
        let repo = repo.clone();
        drop(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                debug!(%repo, "rescan");

                if let Err(err) = model.scan_repo(&repo).await {
                    model.invalidate_repo(&repo, &err.to_string());
                    return;
                }
            }
        }));
    }

    /// Read-write processing for a repository: the puller keeps it in sync
    /// with the cluster by fetching needed files from peers.
    pub fn start_repo_rw(self: &Arc<Self>, repo: &RepoId) {
        self.start();

        let cfg = {
            let repos = self.repos.read();
            let Some(cfg) = repos.repo_cfgs.get(repo) else {
                panic!("cannot start nonexistent repo {repo}");
            };
            cfg.clone()
        };

        let versioner = cfg.versioning.as_ref().map(|v| {
            let factories = self.versioners.lock();
            let Some(factory) = factories.get(&v.kind) else {
                panic!("requested versioning type {:?} that does not exist", v.kind);
            };
            factory(repo, &cfg.directory, &v.params)
        });

        let puller = Puller {
            repo: repo.clone(),
            dir: cfg.directory.clone(),
            scan_interval: Duration::from_secs(cfg.rescan_interval_s.max(1)),
            ignore_perms: cfg.ignore_perms,
            model: Arc::clone(self),
            versioner,
        };

        drop(tokio::spawn(puller.serve()));
    }

    /// Registers an established connection. The peer immediately receives
    /// our cluster config and an initial index per shared repository.
    pub async fn add_connection(&self, raw: Box<dyn Closer>, proto: Arc<dyn Connection>) {
        let node = proto.id();

        {
            let mut conns = self.conns.write();
            if conns.proto_conn.contains_key(&node) {
                panic!("add existing node");
            }
            let _prev = conns.proto_conn.insert(node, Arc::clone(&proto));
            if conns.raw_conn.contains_key(&node) {
                panic!("add existing node");
            }
            let _prev = conns.raw_conn.insert(node, raw);
        }

        let cm = self.cluster_config_message(node);
        if let Err(err) = proto.cluster_config(cm).await {
            debug!(%node, %err, "Sending cluster config");
        }

        let senders: Vec<(RepoId, Arc<RepoIndex>, Patterns)> = {
            let repos = self.repos.read();
            repos
                .node_repos
                .get(&node)
                .into_iter()
                .flatten()
                .filter_map(|repo| {
                    let index = repos.repo_files.get(repo)?.clone();
                    let ignores = repos.repo_ignores.get(repo).cloned().unwrap_or_default();
                    Some((repo.clone(), index, ignores))
                })
                .collect()
        };

        for (repo, index, ignores) in senders {
            drop(tokio::spawn(sender::send_indexes(
                Arc::clone(&proto),
                repo,
                index,
                ignores,
            )));
        }

        self.node_was_seen(node);
    }

    pub fn connected_to(&self, node: NodeId) -> bool {
        let connected = self.conns.read().proto_conn.contains_key(&node);
        if connected {
            self.node_was_seen(node);
        }
        connected
    }

    /// Connection statistics per connected peer, plus a `"total"` entry
    /// with the process-wide transfer counters.
    pub fn connection_stats(&self) -> HashMap<String, ConnectionInfo> {
        let mut res = HashMap::new();

        {
            let conns = self.conns.read();
            for (node, conn) in &conns.proto_conn {
                let info = ConnectionInfo {
                    statistics: conn.statistics(),
                    address: conns.raw_conn.get(node).and_then(|raw| raw.remote_addr()),
                    client_version: conns.node_ver.get(node).cloned().unwrap_or_default(),
                };
                let _prev = res.insert(node.to_string(), info);
            }
        }

        let (in_total, out_total) = self.counters.total_in_out();
        let _prev = res.insert(
            "total".to_owned(),
            ConnectionInfo {
                statistics: Statistics {
                    at: SystemTime::now(),
                    in_bytes_total: in_total,
                    out_bytes_total: out_total,
                },
                ..Default::default()
            },
        );

        res
    }

    pub fn node_statistics(&self) -> HashMap<String, NodeStatistics> {
        let nodes: Vec<NodeId> = self.cfg.lock().nodes.iter().map(|n| n.node_id).collect();

        nodes
            .into_iter()
            .map(|node| (node.to_string(), self.node_stat_ref(node).statistics()))
            .collect()
    }

    /// Completion of `node` for `repo` in percent: `100 · (1 −
    /// need/total)` over non-deleted bytes. 0 for an unknown repo, 100 for
    /// an empty one.
    pub fn completion(&self, node: NodeId, repo: &RepoId) -> f64 {
        let Some(index) = self.index_for(repo) else {
            return 0.0;
        };

        let mut total: u64 = 0;
        index.with_global_truncated(|f| {
            if !f.is_deleted() {
                total += f.size();
            }
            true
        });

        if total == 0 {
            return 100.0;
        }

        let mut need: u64 = 0;
        index.with_need_truncated(node, |f| {
            if !f.is_deleted() {
                need += f.size();
            }
            true
        });

        let res = 100.0 * (1.0 - need as f64 / total as f64);
        debug!(%node, %repo, res, need, total, "Completion");
        res
    }

    /// Files, deleted files and bytes in the global view.
    pub fn global_size(&self, repo: &RepoId) -> (usize, usize, u64) {
        let Some(index) = self.index_for(repo) else {
            return (0, 0, 0);
        };

        let mut acc = SizeAccumulator::default();
        index.with_global_truncated(|f| {
            acc.add(f);
            true
        });
        acc.into_tuple()
    }

    /// Files, deleted files and bytes in the local replica. Invalid
    /// entries are reported as absent; deleted entries keep their byte
    /// accounting.
    pub fn local_size(&self, repo: &RepoId) -> (usize, usize, u64) {
        let Some(index) = self.index_for(repo) else {
            return (0, 0, 0);
        };

        let mut acc = SizeAccumulator::default();
        index.with_have_truncated(NodeId::LOCAL, |f| {
            if !f.is_invalid() {
                acc.add(f);
            }
            true
        });
        acc.into_tuple()
    }

    /// Count and bytes of files the local replica still needs.
    pub fn need_size(&self, repo: &RepoId) -> (usize, u64) {
        let mut files = 0;
        let mut bytes = 0;

        if let Some(index) = self.index_for(repo) {
            index.with_need_truncated(NodeId::LOCAL, |f| {
                files += 1;
                bytes += f.size();
                true
            });
        }

        debug!(%repo, files, bytes, "NeedSize");
        (files, bytes)
    }

    /// The needed files, stopping after `max_files` files or `max_blocks`
    /// blocks; a limit of zero is no limit.
    pub fn need_files_limited(
        &self,
        repo: &RepoId,
        max_files: usize,
        max_blocks: usize,
    ) -> Vec<FileInfo> {
        let Some(index) = self.index_for(repo) else {
            return Vec::new();
        };

        let mut files = Vec::new();
        let mut blocks = 0;
        index.with_need(NodeId::LOCAL, |f| {
            files.push(f.clone());
            blocks += f.blocks.len();
            (max_files == 0 || files.len() < max_files) && (max_blocks == 0 || blocks < max_blocks)
        });
        files
    }

    pub fn current_repo_file(&self, repo: &RepoId, name: &str) -> Option<FileInfo> {
        self.index_for(repo)?.get(NodeId::LOCAL, name)
    }

    pub fn current_global_file(&self, repo: &RepoId, name: &str) -> Option<FileInfo> {
        self.index_for(repo)?.get_global(name)
    }

    pub fn availability(&self, repo: &RepoId, name: &str) -> Vec<NodeId> {
        self.index_for(repo)
            .map(|index| index.availability(name))
            .unwrap_or_default()
    }

    /// Replaces the local replica with the scanner's view of the whole
    /// root, tombstoning anything that vanished.
    pub fn replace_local(&self, repo: &RepoId, files: Vec<FileInfo>) {
        let Some(index) = self.index_for(repo) else {
            panic!("bug: replace_local for nonexistent repo {repo}");
        };
        index.replace_with_delete(NodeId::LOCAL, files);
    }

    /// The local replica's change watermark; increments whenever local
    /// contents change.
    pub fn current_local_version(&self, repo: &RepoId) -> u64 {
        let Some(index) = self.index_for(repo) else {
            panic!("bug: current_local_version for nonexistent repo {repo}");
        };
        index.local_version(NodeId::LOCAL)
    }

    /// Sum of the peer replicas' watermarks; increments whenever remote
    /// contributions change.
    pub fn remote_local_version(&self, repo: &RepoId) -> u64 {
        let repos = self.repos.read();

        let Some(index) = repos.repo_files.get(repo) else {
            panic!("bug: remote_local_version for nonexistent repo {repo}");
        };

        repos
            .repo_nodes
            .get(repo)
            .into_iter()
            .flatten()
            .map(|node| index.local_version(*node))
            .sum()
    }

    /// Whether inbound index messages from `node` may touch `repo`. The
    /// only access-control gate on inbound index mutation.
    pub fn repo_shared_with(&self, repo: &RepoId, node: NodeId) -> bool {
        self.repos
            .read()
            .node_repos
            .get(&node)
            .map_or(false, |rs| rs.contains(repo))
    }

    /// The ignore file contents, line-trimmed.
    pub fn get_ignores(&self, repo: &RepoId) -> eyre::Result<Vec<String>> {
        let dir = self.repo_dir(repo)?;

        match std::fs::read_to_string(dir.join(IGNORE_FILE)) {
            Ok(content) => Ok(content.lines().map(|l| l.trim().to_owned()).collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => {
                warn!(%repo, %err, "Loading ignore file");
                Err(err.into())
            }
        }
    }

    /// Atomically rewrites the ignore file, then rescans so the new
    /// patterns take effect.
    pub async fn set_ignores(&self, repo: &RepoId, lines: &[String]) -> eyre::Result<()> {
        let dir = self.repo_dir(repo)?;
        ignore::save(&dir, lines)?;
        self.scan_repo(repo).await
    }

    pub async fn scan_repos(self: &Arc<Self>) {
        let repos: Vec<RepoId> = self.repos.read().repo_cfgs.keys().cloned().collect();

        let mut tasks = tokio::task::JoinSet::new();
        for repo in repos {
            let model = Arc::clone(self);
            let _handle = tasks.spawn(async move {
                if let Err(err) = model.scan_repo(&repo).await {
                    model.invalidate_repo(&repo, &err.to_string());
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Removes leftover temp files in every repository root.
    pub async fn clean_repos(&self) {
        let dirs: Vec<Utf8PathBuf> = self
            .repos
            .read()
            .repo_cfgs
            .values()
            .map(|cfg| cfg.directory.clone())
            .collect();

        for dir in dirs {
            self.scanner.clean_temp_files(&dir).await;
        }
    }

    pub async fn scan_repo(&self, repo: &RepoId) -> eyre::Result<()> {
        self.scan_repo_sub(repo, "").await
    }

    /// Reconciles (a subtree of) the repository root with the local
    /// replica: folds the scanner's output in, then resolves entries the
    /// disk no longer backs. Newly ignored names keep their version with
    /// the Invalid flag; vanished names become ticked Deleted tombstones.
    pub async fn scan_repo_sub(&self, repo: &RepoId, sub: &str) -> eyre::Result<()> {
        let (index, dir, ignore_perms) = {
            let repos = self.repos.read();
            let (Some(cfg), Some(index)) =
                (repos.repo_cfgs.get(repo), repos.repo_files.get(repo))
            else {
                eyre::bail!("no such repo {repo}");
            };
            (index.clone(), cfg.directory.clone(), cfg.ignore_perms)
        };

        if !subpath_stays_inside(&dir, sub) {
            eyre::bail!("invalid subpath");
        }

        let ignores = Patterns::load(&dir.join(IGNORE_FILE))?;
        {
            let mut repos = self.repos.write();
            let _prev = repos.repo_ignores.insert(repo.clone(), ignores.clone());
        }

        self.set_state(repo, RepoState::Scanning);

        let opts = WalkOptions {
            dir: dir.clone(),
            sub: sub.to_owned(),
            ignores: ignores.clone(),
            block_size: STANDARD_BLOCK_SIZE,
            ignore_perms,
            temp_namer: Arc::clone(&self.temp_namer),
            current: Some(Arc::new(IndexFiler {
                index: Arc::clone(&index),
            })),
        };

        let mut stream = self.scanner.walk(opts).await?;

        let mut batch = Vec::with_capacity(SCAN_BATCH_SIZE);
        while let Some(file) = stream.recv().await {
            self.emit_local_change(repo, &file);
            if batch.len() == SCAN_BATCH_SIZE {
                index.update(NodeId::LOCAL, std::mem::take(&mut batch));
            }
            batch.push(file);
        }
        if !batch.is_empty() {
            index.update(NodeId::LOCAL, std::mem::take(&mut batch));
        }

        // Second pass over the replica, restricted to the subtree: decide
        // what happened to entries the walk did not resurface.
        let mut existing: Vec<FileInfo> = Vec::new();
        let mut seen_prefix = false;
        index.with_have(NodeId::LOCAL, |f| {
            if !f.name.starts_with(sub) {
                // Keep iterating until the subtree starts, stop once past it.
                return !seen_prefix;
            }
            seen_prefix = true;
            if !f.is_deleted() && !f.is_invalid() {
                existing.push(f.clone());
            }
            true
        });

        for mut entry in existing {
            if batch.len() == SCAN_BATCH_SIZE {
                index.update(NodeId::LOCAL, std::mem::take(&mut batch));
            }

            if ignores.matches(&entry.name) {
                // Newly ignored: set the invalid bit, same version, since
                // the file itself did not change.
                entry.flags |= FLAG_INVALID;
                entry.local_version = 0;
                self.emit_local_change(repo, &entry);
                batch.push(entry);
            } else {
                match tokio::fs::symlink_metadata(dir.join(&entry.name).as_std_path()).await {
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        // Vanished from disk: tombstone it, keeping the
                        // block list for byte accounting.
                        entry.flags |= FLAG_DELETED;
                        entry.version = lamport::DEFAULT.tick(entry.version);
                        entry.local_version = 0;
                        self.emit_local_change(repo, &entry);
                        batch.push(entry);
                    }
                    _ => {}
                }
            }
        }
        if !batch.is_empty() {
            index.update(NodeId::LOCAL, batch);
        }

        self.set_state(repo, RepoState::Idle);
        Ok(())
    }

    /// Read-only to read-write reconciliation: rewrites every needed name
    /// as the local truth (local content where we have it, a deletion
    /// where we do not), stamped past the global version so it wins.
    pub fn override_changes(&self, repo: &RepoId) {
        let Some(index) = self.index_for(repo) else {
            panic!("bug: override for nonexistent repo {repo}");
        };

        self.set_state(repo, RepoState::Scanning);

        let mut needs = Vec::new();
        index.with_need(NodeId::LOCAL, |f| {
            needs.push(f.clone());
            true
        });

        let mut batch: Vec<FileInfo> = Vec::with_capacity(INDEX_BATCH_SIZE);
        for mut need in needs {
            if batch.len() == INDEX_BATCH_SIZE {
                index.update(NodeId::LOCAL, std::mem::take(&mut batch));
            }

            let global_version = need.version;
            match index.get(NodeId::LOCAL, &need.name) {
                Some(have) => {
                    // We have the file; ours replaces the global one.
                    need = have;
                }
                None => {
                    // We are missing the file; the winning record is a
                    // deletion.
                    need.flags |= FLAG_DELETED;
                    need.blocks.clear();
                }
            }
            need.version = lamport::DEFAULT.tick(global_version);
            need.local_version = 0;
            batch.push(need);
        }
        if !batch.is_empty() {
            index.update(NodeId::LOCAL, batch);
        }

        self.set_state(repo, RepoState::Idle);
    }

    pub fn state(&self, repo: &RepoId) -> (RepoState, Option<SystemTime>) {
        let states = self.states.read();
        (
            states.repo_state.get(repo).copied().unwrap_or_default(),
            states.repo_state_changed.get(repo).copied(),
        )
    }

    /// The cluster config we announce to `node`: every repo we share with
    /// it, with the full sharing list and trust flags per node.
    pub fn cluster_config_message(&self, node: NodeId) -> ClusterConfigMessage {
        let mut cm = ClusterConfigMessage {
            client_name: self.client_name.clone(),
            client_version: self.client_version.clone(),
            options: vec![OptionKv {
                key: "name".to_owned(),
                value: self.node_name.clone(),
            }],
            repositories: Vec::new(),
        };

        let repos = self.repos.read();
        let cfg = self.cfg.lock();

        for repo in repos.node_repos.get(&node).into_iter().flatten() {
            let mut announcement = RepoAnnouncement {
                id: repo.to_string(),
                nodes: Vec::new(),
            };

            for shared in repos.repo_nodes.get(repo).into_iter().flatten() {
                let mut flags = FLAG_SHARE_TRUSTED;
                if cfg.node(*shared).map_or(false, |n| n.introducer) {
                    flags |= FLAG_INTRODUCER;
                }
                announcement.nodes.push(NodeAnnouncement {
                    id: shared.as_bytes().to_vec(),
                    flags,
                });
            }

            cm.repositories.push(announcement);
        }

        cm
    }

    /// Takes a repository out of rotation, recording why, and persists the
    /// configuration.
    pub fn invalidate_repo(&self, repo: &RepoId, reason: &str) {
        warn!(%repo, reason, "Taking repository out of rotation");
        self.cfg.lock().invalidate_repo(repo, reason);
        self.save_config();
    }

    pub(crate) fn set_state(&self, repo: &RepoId, state: RepoState) {
        let (from, duration) = {
            let mut states = self.states.write();

            let old = states.repo_state.get(repo).copied().unwrap_or_default();
            if state == old {
                return;
            }

            let now = SystemTime::now();
            let prev_changed = states.repo_state_changed.insert(repo.clone(), now);
            let _prev = states.repo_state.insert(repo.clone(), state);

            match prev_changed {
                Some(prev) => (
                    Some(old.to_string()),
                    Some(now.duration_since(prev).unwrap_or_default().as_secs_f64()),
                ),
                None => (None, None),
            }
        };

        self.events.emit(Event::StateChanged {
            repo: repo.clone(),
            from,
            to: state.to_string(),
            duration,
        });
    }

    /// Outbound block request on behalf of a puller.
    pub(crate) async fn request_global(
        &self,
        node: NodeId,
        repo: &RepoId,
        name: &str,
        offset: u64,
        size: usize,
    ) -> eyre::Result<Vec<u8>> {
        let conn = self.conns.read().proto_conn.get(&node).cloned();
        let Some(conn) = conn else {
            eyre::bail!("request: not connected to {node}");
        };

        debug!(%node, %repo, name, offset, size, "REQ(out)");
        conn.request(repo, name, offset, size).await
    }

    /// Local index commit from the puller, with event emission.
    pub(crate) fn update_local(&self, repo: &RepoId, mut file: FileInfo) {
        file.local_version = 0;

        let Some(index) = self.index_for(repo) else {
            panic!("bug: update_local for nonexistent repo {repo}");
        };

        self.emit_local_change(repo, &file);
        index.update(NodeId::LOCAL, vec![file]);
    }

    pub(crate) fn scanner(&self) -> Arc<dyn Scanner> {
        Arc::clone(&self.scanner)
    }

    pub(crate) fn temp_namer(&self) -> Arc<dyn TempNamer> {
        Arc::clone(&self.temp_namer)
    }

    fn index_for(&self, repo: &RepoId) -> Option<Arc<RepoIndex>> {
        self.repos.read().repo_files.get(repo).cloned()
    }

    fn repo_dir(&self, repo: &RepoId) -> eyre::Result<Utf8PathBuf> {
        self.repos
            .read()
            .repo_cfgs
            .get(repo)
            .map(|cfg| cfg.directory.clone())
            .ok_or_else(|| eyre::eyre!("repo {repo} does not exist"))
    }

    fn emit_local_change(&self, repo: &RepoId, file: &FileInfo) {
        self.events.emit(Event::LocalIndexUpdated {
            repo: repo.clone(),
            name: file.name.clone(),
            modified: file.modified,
            flags: format!("0{:o}", file.flags),
            size: file.size(),
        });
    }

    fn node_stat_ref(&self, node: NodeId) -> NodeStatsRef {
        let mut repos = self.repos.write();
        repos
            .node_stat_refs
            .entry(node)
            .or_insert_with(|| NodeStatsRef::new(self.store.clone(), node))
            .clone()
    }

    fn node_was_seen(&self, node: NodeId) {
        self.node_stat_ref(node).was_seen();
    }

    fn save_config(&self) {
        let snapshot = self.cfg.lock().clone();
        if let Err(err) = snapshot.save() {
            warn!(%err, "Failed to persist configuration");
        }
    }

    /// Shared body of the Index and IndexUpdate callbacks: authorize,
    /// absorb every announced version into the clock, drop ignored names,
    /// then replace or extend the peer's replica.
    fn absorb_index(&self, node: NodeId, repo: &RepoId, mut files: Vec<FileInfo>, update: bool) {
        debug!(%node, %repo, files = files.len(), update, "IDX(in)");

        if !self.repo_shared_with(repo, node) {
            if update {
                info!(
                    %repo, %node,
                    "Update for unexpected repository id; ensure the repository exists and is shared with this node"
                );
            } else {
                self.events.emit(Event::RepoRejected {
                    repo: repo.clone(),
                    node,
                });
                warn!(
                    %repo, %node,
                    "Unexpected repository id; ensure the repository exists and is shared with this node"
                );
            }
            return;
        }

        let (index, ignores) = {
            let repos = self.repos.read();
            let Some(index) = repos.repo_files.get(repo).cloned() else {
                panic!("inconsistent state, shared repo {repo} has no index");
            };
            (index, repos.repo_ignores.get(repo).cloned().unwrap_or_default())
        };

        files.retain(|f| {
            let _observed = lamport::DEFAULT.tick(f.version);
            !ignores.matches(&f.name)
        });

        let items = files.len();
        if update {
            index.update(node, files);
        } else {
            index.replace(node, files);
        }

        self.events.emit(Event::RemoteIndexUpdated {
            node,
            repo: repo.clone(),
            items,
            version: index.local_version(node),
        });
    }
}

#[async_trait]
impl ModelCallbacks for Model {
    fn index(&self, node: NodeId, repo: &RepoId, files: Vec<FileInfo>) {
        self.absorb_index(node, repo, files, false);
    }

    fn index_update(&self, node: NodeId, repo: &RepoId, files: Vec<FileInfo>) {
        self.absorb_index(node, repo, files, true);
    }

    fn cluster_config(&self, node: NodeId, cm: ClusterConfigMessage) {
        {
            let mut conns = self.conns.write();
            let version = if cm.client_name == self.client_name {
                cm.client_version.clone()
            } else {
                format!("{} {}", cm.client_name, cm.client_version)
            };
            let _prev = conns.node_ver.insert(node, version);
        }

        info!(
            %node,
            client = cm.client_name,
            version = cm.client_version,
            "Peer client identified"
        );

        let mut changed = false;

        if let Some(name) = cm.get_option("name") {
            if !name.is_empty() {
                let mut cfg = self.cfg.lock();
                if let Some(node_cfg) = cfg.node_mut(node) {
                    if node_cfg.name.is_empty() {
                        info!(%node, name, "Recording peer name");
                        node_cfg.name = name.to_owned();
                        changed = true;
                    }
                }
            }
        }

        let introducer = self.cfg.lock().node(node).map_or(false, |n| n.introducer);
        if introducer {
            // The peer vouches for other nodes: absorb announced sharing
            // relationships for repos we already have.
            let mut repos = self.repos.write();
            let mut cfg = self.cfg.lock();

            for announcement in &cm.repositories {
                let repo_id: RepoId = announcement.id.as_str().into();
                if !repos.repo_nodes.contains_key(&repo_id) {
                    continue;
                }

                for announced in &announcement.nodes {
                    let Some(id) = NodeId::from_slice(&announced.id) else {
                        continue;
                    };

                    if cfg.node(id).is_none() {
                        info!(%id, introducer = %node, "Adding node to config (vouched for by introducer)");
                        let node_cfg = NodeConfig {
                            node_id: id,
                            name: String::new(),
                            // The introducer's introducers are also ours.
                            introducer: announced.flags & FLAG_INTRODUCER != 0,
                        };
                        if node_cfg.introducer {
                            info!(%id, "Node is now also an introducer");
                        }
                        cfg.nodes.push(node_cfg);
                        changed = true;
                    }

                    if repos
                        .node_repos
                        .get(&id)
                        .map_or(false, |rs| rs.contains(&repo_id))
                    {
                        continue;
                    }

                    info!(%id, repo = %repo_id, introducer = %node, "Adding node to share (vouched for by introducer)");
                    repos.node_repos.entry(id).or_default().push(repo_id.clone());
                    if let Some(nodes) = repos.repo_nodes.get_mut(&repo_id) {
                        nodes.push(id);
                    }
                    if let Some(repo_cfg) = cfg.repo_mut(&repo_id) {
                        if !repo_cfg.nodes.contains(&id) {
                            repo_cfg.nodes.push(id);
                        }
                    }
                    changed = true;
                }
            }
        }

        if changed {
            self.save_config();
        }
    }

    async fn request(
        &self,
        node: NodeId,
        repo: &RepoId,
        name: &str,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>, RequestError> {
        let Some(index) = self.index_for(repo) else {
            warn!(%node, %repo, name, "Request for nonexistent repo");
            return Err(RequestError::NoSuchFile);
        };

        let Some(local) = index.get(NodeId::LOCAL, name) else {
            return Err(RequestError::NoSuchFile);
        };
        if local.is_invalid() || local.is_deleted() {
            debug!(%node, %repo, name, offset, size, "REQ(in); invalid");
            return Err(RequestError::Invalid);
        }
        if offset > local.size() {
            debug!(%node, %repo, name, offset, size, "REQ(in); nonexistent range");
            return Err(RequestError::NoSuchFile);
        }
        if name.split('/').any(|part| part == "..") {
            return Err(RequestError::NoSuchFile);
        }

        if node != NodeId::LOCAL {
            debug!(%node, %repo, name, offset, size, "REQ(in)");
        }

        let Ok(dir) = self.repo_dir(repo) else {
            return Err(RequestError::NoSuchFile);
        };

        let mut fd = tokio::fs::File::open(dir.join(name).as_std_path()).await?;
        let _pos = fd.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0; size];
        fd.read_exact(&mut buf).await?;

        Ok(buf)
    }

    /// Drains a closed connection: the peer's replicas are replaced with
    /// empty (retracting its contributions), the raw stream is closed
    /// under a short write deadline, and the peer leaves the tables.
    async fn close(&self, node: NodeId, err: eyre::Report) {
        info!(%node, %err, "Connection closed");
        self.events.emit(Event::NodeDisconnected {
            id: node,
            error: err.to_string(),
        });

        let (indexes, raw) = {
            let mut conns = self.conns.write();
            let repos = self.repos.read();

            let indexes: Vec<Arc<RepoIndex>> = repos
                .node_repos
                .get(&node)
                .into_iter()
                .flatten()
                .filter_map(|repo| repos.repo_files.get(repo).cloned())
                .collect();

            let raw = conns.raw_conn.remove(&node);
            let _proto = conns.proto_conn.remove(&node);
            let _version = conns.node_ver.remove(&node);

            (indexes, raw)
        };

        for index in indexes {
            index.replace(node, Vec::new());
        }

        if let Some(raw) = raw {
            if let Err(err) = raw.close(CLOSE_WRITE_DEADLINE).await {
                debug!(%node, %err, "Closing raw connection");
            }
        }
    }
}

/// Lets the scanner consult the prior local entry for a name, to skip
/// re-hashing unchanged files.
struct IndexFiler {
    index: Arc<RepoIndex>,
}

impl CurrentFiler for IndexFiler {
    fn current_file(&self, name: &str) -> Option<FileInfo> {
        self.index.get(NodeId::LOCAL, name)
    }
}

#[derive(Default)]
struct SizeAccumulator {
    files: usize,
    deleted: usize,
    bytes: u64,
}

impl SizeAccumulator {
    fn add(&mut self, f: &FileInfoTruncated) {
        if f.is_deleted() {
            self.deleted += 1;
        } else {
            self.files += 1;
        }
        self.bytes += f.size();
    }

    fn into_tuple(self) -> (usize, usize, u64) {
        (self.files, self.deleted, self.bytes)
    }
}

fn subpath_stays_inside(dir: &Utf8Path, sub: &str) -> bool {
    normalize(&dir.join(sub)).starts_with(normalize(dir))
}

fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                let _popped = out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
