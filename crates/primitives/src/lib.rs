//! Shared primitives for the flotilla synchronization core: node and
//! repository identities, the file index entry types exchanged between
//! replicas, the cluster-wide logical clock, and the event payloads the
//! core emits.

pub mod events;
pub mod file;
pub mod id;
pub mod lamport;

pub use events::Event;
pub use file::{BlockInfo, FileInfo, FileInfoTruncated, FileLike};
pub use id::{NodeId, RepoId};

/// Aim for index messages no larger than this many bytes, uncompressed.
pub const INDEX_TARGET_SIZE: usize = 250 * 1024;
/// Approximate envelope size of one FileInfo, excluding its blocks.
pub const INDEX_PER_FILE_SIZE: usize = 250;
/// Approximate encoded size of one BlockInfo.
pub const INDEX_PER_BLOCK_SIZE: usize = 40;
/// Never send more files than this in one Index/IndexUpdate message.
pub const INDEX_BATCH_SIZE: usize = 1000;
