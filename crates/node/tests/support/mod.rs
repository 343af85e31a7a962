//! Shared fixtures for the integration scenarios: a real directory-walking
//! scanner, and loopback connections that deliver protocol callbacks
//! straight into another model.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use flotilla_node::config::{Config, RepoConfig};
use flotilla_node::protocol::{
    ClusterConfigMessage, Closer, Connection, ModelCallbacks, Statistics, TotalCounters,
};
use flotilla_node::scan::{DefaultTempNamer, Scanner, TempNamer, WalkOptions};
use flotilla_node::Model;
use flotilla_primitives::file::{FLAG_DIRECTORY, FLAG_NO_PERM_BITS};
use flotilla_primitives::{lamport, BlockInfo, FileInfo, NodeId, RepoId};
use flotilla_store::{InMemoryDb, Store};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn utf8(path: &std::path::Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).expect("non-utf8 temp path")
}

/// A model over an in-memory store and the walking scanner below.
pub fn model(cfg: Config) -> Arc<Model> {
    Model::new(
        cfg,
        "test node",
        "flotilla",
        "0.1.0-test",
        Store::new(InMemoryDb::new()),
        Arc::new(DiskScanner),
        Arc::new(NullCounters),
    )
}

pub fn model_with_repo(repo: &str, dir: &Utf8Path, nodes: &[NodeId]) -> Arc<Model> {
    let m = model(Config::default());
    m.add_repo(RepoConfig {
        id: repo.into(),
        directory: dir.to_owned(),
        nodes: nodes.to_vec(),
        rescan_interval_s: 1,
        ..Default::default()
    });
    m
}

pub async fn wait_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

pub struct NullCounters;

impl TotalCounters for NullCounters {
    fn total_in_out(&self) -> (u64, u64) {
        (0, 0)
    }
}

#[derive(Default)]
pub struct TestCloser {
    pub closed: AtomicBool,
}

#[async_trait]
impl Closer for TestCloser {
    async fn close(&self, _write_deadline: Duration) -> eyre::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A connection to `remote` that short-circuits the wire: everything sent
/// is delivered to `target`'s callbacks as coming from `present_as`.
pub struct LoopbackConnection {
    pub remote: NodeId,
    pub present_as: NodeId,
    pub target: Arc<Model>,
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn id(&self) -> NodeId {
        self.remote
    }

    fn name(&self) -> String {
        "loopback".to_owned()
    }

    fn statistics(&self) -> Statistics {
        Statistics::default()
    }

    async fn cluster_config(&self, msg: ClusterConfigMessage) -> eyre::Result<()> {
        self.target.cluster_config(self.present_as, msg);
        Ok(())
    }

    async fn index(&self, repo: &RepoId, files: Vec<FileInfo>) -> eyre::Result<()> {
        self.target.index(self.present_as, repo, files);
        Ok(())
    }

    async fn index_update(&self, repo: &RepoId, files: Vec<FileInfo>) -> eyre::Result<()> {
        self.target.index_update(self.present_as, repo, files);
        Ok(())
    }

    async fn request(
        &self,
        repo: &RepoId,
        name: &str,
        offset: u64,
        size: usize,
    ) -> eyre::Result<Vec<u8>> {
        Ok(self
            .target
            .request(self.present_as, repo, name, offset, size)
            .await?)
    }
}

/// A real scanner over the local filesystem: walks the tree in name order,
/// hashes changed files into fixed-size blocks, and skips files whose
/// metadata matches the prior index entry.
pub struct DiskScanner;

#[async_trait]
impl Scanner for DiskScanner {
    async fn walk(&self, opts: WalkOptions) -> eyre::Result<mpsc::Receiver<FileInfo>> {
        let start = if opts.sub.is_empty() {
            opts.dir.clone()
        } else {
            opts.dir.join(&opts.sub)
        };
        if !start.as_std_path().exists() {
            eyre::bail!("walk root {start} does not exist");
        }

        let (tx, rx) = mpsc::channel(64);
        let _task = tokio::task::spawn_blocking(move || {
            let root = opts.dir.clone();
            walk_into(&root, &start, &opts, &tx);
        });
        Ok(rx)
    }

    async fn clean_temp_files(&self, dir: &Utf8Path) {
        clean_dir(dir, &DefaultTempNamer);
    }
}

fn walk_into(root: &Utf8Path, dir: &Utf8Path, opts: &WalkOptions, tx: &mpsc::Sender<FileInfo>) {
    let Ok(entries) = std::fs::read_dir(dir.as_std_path()) else {
        return;
    };

    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = utf8(&entry.path());
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = rel.as_str().to_owned();

        if rel == ".stignore" || opts.temp_namer.is_temporary(&rel) || opts.ignores.matches(&rel)
        {
            continue;
        }

        let Ok(meta) = entry.metadata() else {
            continue;
        };

        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64);

        let current = opts
            .current
            .as_ref()
            .and_then(|filer| filer.current_file(&rel));
        let prior_version = current.as_ref().map_or(0, |c| c.version);

        if meta.is_dir() {
            let unchanged = current.as_ref().is_some_and(|c| {
                c.is_directory() && !c.is_deleted() && !c.is_invalid()
            });
            if !unchanged {
                let file = FileInfo {
                    name: rel.clone(),
                    flags: FLAG_DIRECTORY | mode_flags(opts, &meta),
                    modified,
                    version: lamport::DEFAULT.tick(prior_version),
                    local_version: 0,
                    blocks: Vec::new(),
                };
                if tx.blocking_send(file).is_err() {
                    return;
                }
            }
            walk_into(root, &path, opts, tx);
        } else if meta.is_file() {
            let unchanged = current.as_ref().is_some_and(|c| {
                !c.is_deleted()
                    && !c.is_invalid()
                    && !c.is_directory()
                    && c.modified == modified
                    && c.size() == meta.len()
            });
            if unchanged {
                continue;
            }

            let file = FileInfo {
                name: rel,
                flags: mode_flags(opts, &meta),
                modified,
                version: lamport::DEFAULT.tick(prior_version),
                local_version: 0,
                blocks: hash_blocks(&path, opts.block_size),
            };
            if tx.blocking_send(file).is_err() {
                return;
            }
        }
    }
}

#[cfg(unix)]
fn mode_flags(opts: &WalkOptions, meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    if opts.ignore_perms {
        FLAG_NO_PERM_BITS
    } else {
        meta.permissions().mode() & 0o777
    }
}

#[cfg(not(unix))]
fn mode_flags(opts: &WalkOptions, _meta: &std::fs::Metadata) -> u32 {
    if opts.ignore_perms {
        FLAG_NO_PERM_BITS
    } else {
        0o644
    }
}

fn hash_blocks(path: &Utf8Path, block_size: usize) -> Vec<BlockInfo> {
    use std::io::Read;

    let mut blocks = Vec::new();
    let Ok(mut fd) = std::fs::File::open(path.as_std_path()) else {
        return blocks;
    };

    let mut offset = 0_u64;
    let mut buf = vec![0_u8; block_size];
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            match fd.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(_) => return blocks,
            }
        }
        if filled == 0 {
            break;
        }

        blocks.push(BlockInfo {
            offset,
            size: filled as u32,
            hash: Sha256::digest(&buf[..filled]).to_vec(),
        });
        offset += filled as u64;

        if filled < buf.len() {
            break;
        }
    }

    blocks
}

fn clean_dir(dir: &Utf8Path, namer: &dyn TempNamer) {
    let Ok(entries) = std::fs::read_dir(dir.as_std_path()) else {
        return;
    };

    for entry in entries.flatten() {
        let path = utf8(&entry.path());
        if path.is_dir() {
            clean_dir(&path, namer);
        } else if path
            .file_name()
            .map_or(false, |name| namer.is_temporary(name))
        {
            let _removed = std::fs::remove_file(path.as_std_path());
        }
    }
}

