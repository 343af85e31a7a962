use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use flotilla_primitives::{BlockInfo, FileInfo, FileLike, NodeId, RepoId};
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::model::Model;
use crate::state::RepoState;

/// Limits for one pull round; the next round picks up whatever remains.
const PULL_BATCH_FILES: usize = 100;
const PULL_BATCH_BLOCKS: usize = 10_000;

/// Archives files about to be replaced or deleted. Concrete backends
/// (trash can, staggered history, ...) live outside the core and register
/// through the model's versioner factories.
pub trait Versioner: Send + Sync {
    fn archive(&self, path: &Utf8Path) -> eyre::Result<()>;
}

/// Per-repository worker for read-write mode: alternates scans with pull
/// rounds that drive the local need view toward empty.
///
/// Failures on one file are recoverable; the next cycle retries. A
/// scanner failure invalidates the repository and terminates the worker.
pub(crate) struct Puller {
    pub repo: RepoId,
    pub dir: Utf8PathBuf,
    pub scan_interval: Duration,
    pub ignore_perms: bool,
    pub model: Arc<Model>,
    pub versioner: Option<Arc<dyn Versioner>>,
}

impl Puller {
    pub(crate) async fn serve(self) {
        info!(repo = %self.repo, "Puller starting (read-write)");

        loop {
            self.model.set_state(&self.repo, RepoState::Cleaning);
            self.model.scanner().clean_temp_files(&self.dir).await;

            if let Err(err) = self.model.scan_repo(&self.repo).await {
                warn!(repo = %self.repo, %err, "Scan failed, invalidating repo and stopping puller");
                self.model.invalidate_repo(&self.repo, &err.to_string());
                return;
            }

            loop {
                let needed =
                    self.model
                        .need_files_limited(&self.repo, PULL_BATCH_FILES, PULL_BATCH_BLOCKS);
                if needed.is_empty() {
                    break;
                }

                self.model.set_state(&self.repo, RepoState::Syncing);

                let mut progressed = false;
                for file in needed {
                    match self.pull_one(&file).await {
                        Ok(()) => progressed = true,
                        Err(err) => {
                            debug!(repo = %self.repo, name = file.name, %err, "Pull failed, will retry next cycle");
                        }
                    }
                }

                if !progressed {
                    break;
                }
            }

            self.model.set_state(&self.repo, RepoState::Idle);

            tokio::time::sleep(self.scan_interval).await;
        }
    }

    async fn pull_one(&self, global: &FileInfo) -> eyre::Result<()> {
        if global.is_deleted() {
            return self.apply_delete(global).await;
        }
        if global.is_directory() {
            return self.apply_directory(global).await;
        }
        self.pull_file(global).await
    }

    /// Records a remote deletion locally: the content goes to the
    /// versioner (or away), the tombstone goes into the local replica so
    /// the need view converges.
    async fn apply_delete(&self, global: &FileInfo) -> eyre::Result<()> {
        let path = self.dir.join(&global.name);

        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                if meta.is_dir() {
                    tokio::fs::remove_dir(&path)
                        .await
                        .wrap_err_with(|| format!("removing directory {path}"))?;
                } else if let Some(versioner) = &self.versioner {
                    versioner.archive(&path)?;
                } else {
                    tokio::fs::remove_file(&path)
                        .await
                        .wrap_err_with(|| format!("removing {path}"))?;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).wrap_err_with(|| format!("stat {path}")),
        }

        self.commit(global.clone());
        Ok(())
    }

    async fn apply_directory(&self, global: &FileInfo) -> eyre::Result<()> {
        let path = self.dir.join(&global.name);

        tokio::fs::create_dir_all(&path)
            .await
            .wrap_err_with(|| format!("creating directory {path}"))?;
        self.apply_permissions(&path, global).await?;

        self.commit(global.clone());
        Ok(())
    }

    async fn pull_file(&self, global: &FileInfo) -> eyre::Result<()> {
        let peers = self.pick_peers(&global.name);
        let Some(peer) = peers.choose(&mut rand::thread_rng()).copied() else {
            eyre::bail!("no connected peer has {:?}", global.name);
        };

        let final_path = self.dir.join(&global.name);
        let temp_path = self
            .dir
            .join(self.model.temp_namer().temp_name(&global.name));

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err_with(|| format!("creating {parent}"))?;
        }

        let mut out = tokio::fs::File::create(&temp_path)
            .await
            .wrap_err_with(|| format!("creating {temp_path}"))?;

        for block in &global.blocks {
            let data = self
                .model
                .request_global(peer, &self.repo, &global.name, block.offset, block.size as usize)
                .await?;
            verify_block(&data, block)?;
            out.write_all(&data).await?;
        }

        out.sync_all().await?;
        drop(out);

        self.apply_permissions(&temp_path, global).await?;
        set_modified(&temp_path, global.modified)?;

        if tokio::fs::metadata(&final_path).await.is_ok() {
            if let Some(versioner) = &self.versioner {
                versioner.archive(&final_path)?;
            }
        }

        tokio::fs::rename(&temp_path, &final_path)
            .await
            .wrap_err_with(|| format!("renaming into {final_path}"))?;

        debug!(repo = %self.repo, name = global.name, %peer, blocks = global.blocks.len(), "Pulled file");

        self.commit(global.clone());
        Ok(())
    }

    fn pick_peers(&self, name: &str) -> Vec<NodeId> {
        let mut peers = self.model.availability(&self.repo, name);
        peers.retain(|peer| *peer != NodeId::LOCAL && self.model.connected_to(*peer));
        peers
    }

    async fn apply_permissions(&self, path: &Utf8Path, file: &FileInfo) -> eyre::Result<()> {
        #[cfg(unix)]
        if !self.ignore_perms && file.has_permission_bits() {
            use std::os::unix::fs::PermissionsExt;

            let mode = FileLike::permissions(file);
            let perms = std::fs::Permissions::from_mode(mode);
            tokio::fs::set_permissions(path.as_std_path(), perms)
                .await
                .wrap_err_with(|| format!("setting permissions on {path}"))?;
        }

        #[cfg(not(unix))]
        let _ = (path, file);

        Ok(())
    }

    /// Local index commit for a pulled change. The entry keeps the global
    /// version (a pull records the same cluster-wide change, it does not
    /// constitute a new one) and gets a fresh local version on insert.
    fn commit(&self, mut file: FileInfo) {
        file.local_version = 0;
        self.model.update_local(&self.repo, file);
    }
}

fn verify_block(data: &[u8], block: &BlockInfo) -> eyre::Result<()> {
    if data.len() != block.size as usize {
        eyre::bail!(
            "short block at offset {}: got {} bytes, want {}",
            block.offset,
            data.len(),
            block.size
        );
    }

    let digest = Sha256::digest(data);
    if digest.as_slice() != block.hash.as_slice() {
        eyre::bail!("block hash mismatch at offset {}", block.offset);
    }

    Ok(())
}

fn set_modified(path: &Utf8Path, modified: i64) -> eyre::Result<()> {
    let mtime = if modified >= 0 {
        std::time::UNIX_EPOCH + Duration::from_secs(modified as u64)
    } else {
        std::time::UNIX_EPOCH
    };

    let file = std::fs::File::options()
        .write(true)
        .open(path.as_std_path())
        .wrap_err_with(|| format!("opening {path}"))?;
    file.set_modified(mtime)
        .wrap_err_with(|| format!("setting mtime on {path}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(data: &[u8]) -> BlockInfo {
        BlockInfo {
            offset: 0,
            size: data.len() as u32,
            hash: Sha256::digest(data).to_vec(),
        }
    }

    #[test]
    fn verify_block_accepts_matching_content() {
        let data = b"0123456789";
        assert!(verify_block(data, &block(data)).is_ok());
    }

    #[test]
    fn verify_block_rejects_corruption() {
        let good = block(b"0123456789");
        assert!(verify_block(b"0123456780", &good).is_err());
    }

    #[test]
    fn verify_block_rejects_short_reads() {
        let good = block(b"0123456789");
        assert!(verify_block(b"01234", &good).is_err());
    }

    #[test]
    fn set_modified_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("f")).unwrap();
        std::fs::write(&path, b"x").unwrap();

        set_modified(&path, 1_400_000_000).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        let mtime = meta
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(mtime, 1_400_000_000);
    }
}
