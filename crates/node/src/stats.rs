use std::time::{SystemTime, UNIX_EPOCH};

use borsh::{BorshDeserialize, BorshSerialize};
use flotilla_primitives::NodeId;
use flotilla_store::Store;

#[derive(Clone, Debug, Default, BorshSerialize, BorshDeserialize, serde::Serialize)]
pub struct NodeStatistics {
    /// Unix seconds of the last completed handshake or liveness probe.
    pub last_seen: i64,
}

/// Store-backed statistics for one peer, kept under a `stat|<node>` key.
#[derive(Clone, Debug)]
pub struct NodeStatsRef {
    store: Store,
    node: NodeId,
}

impl NodeStatsRef {
    pub fn new(store: Store, node: NodeId) -> Self {
        Self { store, node }
    }

    fn key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(5 + 32);
        key.extend_from_slice(b"stat\0");
        key.extend_from_slice(self.node.as_bytes());
        key
    }

    pub fn statistics(&self) -> NodeStatistics {
        let value = self
            .store
            .get(&self.key())
            .unwrap_or_else(|err| panic!("statistics read failed: {err}"));

        value
            .and_then(|bytes| NodeStatistics::try_from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    pub fn was_seen(&self) {
        let stats = NodeStatistics {
            last_seen: unix_now(),
        };

        let bytes = borsh::to_vec(&stats).expect("borsh encoding of statistics cannot fail");
        self.store
            .put(&self.key(), &bytes)
            .unwrap_or_else(|err| panic!("statistics write failed: {err}"));
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
