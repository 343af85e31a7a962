use serde::{Deserialize, Serialize};

use crate::id::{NodeId, RepoId};

/// Events emitted by the synchronization core, consumed by the UI and API
/// layers through a broadcast subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "PascalCase")]
pub enum Event {
    /// A peer announced an index for a repository we do not share with it.
    RepoRejected { repo: RepoId, node: NodeId },
    /// A peer replica was replaced or extended; `version` is the replica's
    /// new local-version watermark.
    RemoteIndexUpdated {
        node: NodeId,
        repo: RepoId,
        items: usize,
        version: u64,
    },
    /// The local replica changed for one name. `flags` is the octal bitset
    /// rendering, matching what the scanner reports.
    LocalIndexUpdated {
        repo: RepoId,
        name: String,
        modified: i64,
        flags: String,
        size: u64,
    },
    NodeDisconnected {
        id: NodeId,
        error: String,
    },
    /// A repository state machine transition. `from` and `duration` are
    /// absent for the first transition ever observed for the repo.
    StateChanged {
        repo: RepoId,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
}
