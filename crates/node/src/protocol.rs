//! The contract between the core and the wire transport.
//!
//! The transport owns framing, compression, encryption and codecs. Per
//! connection it exposes a [`Connection`] for outbound traffic and invokes
//! the [`ModelCallbacks`] serially for inbound traffic. The raw stream
//! underneath is reached only through [`Closer`], so a dead peer can be cut
//! loose with a bounded write deadline.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use flotilla_primitives::{FileInfo, NodeId, RepoId};

/// The peer may write into repositories it shares with us.
pub const FLAG_SHARE_TRUSTED: u32 = 1 << 0;
/// The peer only reads; reserved, not yet acted upon.
pub const FLAG_SHARE_READ_ONLY: u32 = 1 << 1;
/// The peer vouches for other peers and sharing relationships.
pub const FLAG_INTRODUCER: u32 = 1 << 2;

/// Typed errors surfaced to peers from `request`.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("no such file")]
    NoSuchFile,
    #[error("file is invalid")]
    Invalid,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Byte counters for one connection, as sampled by the transport.
#[derive(Clone, Debug)]
pub struct Statistics {
    pub at: SystemTime,
    pub in_bytes_total: u64,
    pub out_bytes_total: u64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            at: SystemTime::UNIX_EPOCH,
            in_bytes_total: 0,
            out_bytes_total: 0,
        }
    }
}

/// Process-wide transfer totals. A thin seam so the core does not depend
/// on a transport global.
pub trait TotalCounters: Send + Sync {
    fn total_in_out(&self) -> (u64, u64);
}

/// Outbound surface of one established peer connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> NodeId;

    fn name(&self) -> String;

    fn statistics(&self) -> Statistics;

    async fn cluster_config(&self, msg: ClusterConfigMessage) -> eyre::Result<()>;

    async fn index(&self, repo: &RepoId, files: Vec<FileInfo>) -> eyre::Result<()>;

    async fn index_update(&self, repo: &RepoId, files: Vec<FileInfo>) -> eyre::Result<()>;

    async fn request(
        &self,
        repo: &RepoId,
        name: &str,
        offset: u64,
        size: usize,
    ) -> eyre::Result<Vec<u8>>;
}

/// Handle to the raw stream under a connection. Closing takes a write
/// deadline because a TLS close sends an alert, which would hang forever
/// against a dead peer.
#[async_trait]
pub trait Closer: Send + Sync {
    async fn close(&self, write_deadline: Duration) -> eyre::Result<()>;

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// The inbound callback set the transport drives, serially per connection.
#[async_trait]
pub trait ModelCallbacks: Send + Sync {
    /// A peer sent its full index for a repository.
    fn index(&self, node: NodeId, repo: &RepoId, files: Vec<FileInfo>);

    /// A peer sent an incremental index update.
    fn index_update(&self, node: NodeId, repo: &RepoId, files: Vec<FileInfo>);

    /// A peer announced its cluster view right after connecting.
    fn cluster_config(&self, node: NodeId, msg: ClusterConfigMessage);

    /// A peer asked for a range of a file we advertise.
    async fn request(
        &self,
        node: NodeId,
        repo: &RepoId,
        name: &str,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>, RequestError>;

    /// The connection died or was torn down.
    async fn close(&self, node: NodeId, err: eyre::Report);
}

/// First message on every connection: who the peer is and what it shares.
#[derive(Clone, Debug, Default)]
pub struct ClusterConfigMessage {
    pub client_name: String,
    pub client_version: String,
    pub options: Vec<OptionKv>,
    pub repositories: Vec<RepoAnnouncement>,
}

#[derive(Clone, Debug)]
pub struct OptionKv {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default)]
pub struct RepoAnnouncement {
    pub id: String,
    pub nodes: Vec<NodeAnnouncement>,
}

#[derive(Clone, Debug)]
pub struct NodeAnnouncement {
    /// Raw 32-byte node id; malformed announcements are skipped on receipt.
    pub id: Vec<u8>,
    pub flags: u32,
}

impl ClusterConfigMessage {
    pub fn get_option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }
}
