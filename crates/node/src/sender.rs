use std::sync::Arc;
use std::time::Duration;

use flotilla_primitives::{
    FileInfo, NodeId, RepoId, INDEX_BATCH_SIZE, INDEX_PER_BLOCK_SIZE, INDEX_PER_FILE_SIZE,
    INDEX_TARGET_SIZE,
};
use tracing::debug;

use crate::ignore::Patterns;
use crate::index::RepoIndex;
use crate::protocol::Connection;

const RESEND_INTERVAL: Duration = Duration::from_secs(5);

/// Long-lived task per (peer, repo): sends the initial full index, then
/// watermark-driven incremental updates every few seconds. Any send error
/// terminates the task; reconnection spawns a fresh one, whose initial
/// Index supersedes everything.
pub(crate) async fn send_indexes(
    conn: Arc<dyn Connection>,
    repo: RepoId,
    index: Arc<RepoIndex>,
    ignores: Patterns,
) {
    let node = conn.id();
    let name = conn.name();

    debug!(%node, name, %repo, "sendIndexes starting");

    let mut watermark = match send_index_to(true, 0, &*conn, &repo, &index, &ignores).await {
        Ok(watermark) => watermark,
        Err(err) => {
            debug!(%node, name, %repo, %err, "sendIndexes exiting");
            return;
        }
    };

    loop {
        tokio::time::sleep(RESEND_INTERVAL).await;

        if index.local_version(NodeId::LOCAL) <= watermark {
            continue;
        }

        match send_index_to(false, watermark, &*conn, &repo, &index, &ignores).await {
            Ok(new_watermark) => watermark = new_watermark,
            Err(err) => {
                debug!(%node, name, %repo, %err, "sendIndexes exiting");
                return;
            }
        }
    }
}

/// Sends every local entry with a local version above `watermark`, batched
/// by count and approximate encoded size. Returns the highest local
/// version seen, which becomes the next watermark. The first flush of an
/// initial run goes out as Index, even when empty: a reconnecting peer
/// relies on it to retract whatever stale replica it still holds.
pub(crate) async fn send_index_to(
    initial: bool,
    watermark: u64,
    conn: &dyn Connection,
    repo: &RepoId,
    index: &RepoIndex,
    ignores: &Patterns,
) -> eyre::Result<u64> {
    let mut max_local_version = watermark;
    let mut pending = Vec::new();

    // Snapshot under the index guard; the actual sends happen without it.
    index.with_have(NodeId::LOCAL, |f| {
        if f.local_version <= watermark {
            return true;
        }

        max_local_version = max_local_version.max(f.local_version);

        if ignores.matches(&f.name) {
            return true;
        }

        pending.push(f.clone());
        true
    });

    let mut initial = initial;
    let mut batch: Vec<FileInfo> = Vec::with_capacity(INDEX_BATCH_SIZE);
    let mut batch_size = 0_usize;

    for f in pending {
        if batch.len() == INDEX_BATCH_SIZE || batch_size > INDEX_TARGET_SIZE {
            let files = std::mem::take(&mut batch);
            if initial {
                conn.index(repo, files).await?;
                initial = false;
            } else {
                conn.index_update(repo, files).await?;
            }
            batch_size = 0;
        }

        batch_size += INDEX_PER_FILE_SIZE + f.blocks.len() * INDEX_PER_BLOCK_SIZE;
        batch.push(f);
    }

    if initial {
        conn.index(repo, batch).await?;
    } else if !batch.is_empty() {
        conn.index_update(repo, batch).await?;
    }

    Ok(max_local_version)
}
