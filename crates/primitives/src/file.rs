use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// The entry was deleted; the record is kept as a tombstone so that a
/// re-created file must carry a greater version to win.
pub const FLAG_DELETED: u32 = 1 << 12;
/// The entry names a path that exists but is excluded from synchronization.
/// It occupies its name slot but contributes neither content nor
/// availability.
pub const FLAG_INVALID: u32 = 1 << 13;
pub const FLAG_DIRECTORY: u32 = 1 << 14;
/// Permission bits in the entry are meaningless and must not be applied.
pub const FLAG_NO_PERM_BITS: u32 = 1 << 15;

const PERM_MASK: u32 = 0o777;

/// Nominal on-the-wire size charged for entries without content, so that
/// deletes and directories still account for something in totals.
const EMPTY_FILE_SIZE: u64 = 128;

/// One hashed span of a file's content.
#[derive(
    Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct BlockInfo {
    pub offset: u64,
    pub size: u32,
    pub hash: Vec<u8>,
}

impl fmt::Debug for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block{{off: {}, size: {}, hash: {:.8}}}",
            self.offset,
            self.size,
            hex(&self.hash),
        )
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The unit of index exchange: one replica's record of one name.
///
/// `version` is the cluster-wide logical clock value deciding which record
/// wins; `local_version` is a per-replica insertion sequence number used as
/// the incremental-exchange watermark. A `local_version` of zero means
/// "assign on write".
#[derive(
    Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct FileInfo {
    pub name: String,
    pub flags: u32,
    pub modified: i64,
    pub version: u64,
    pub local_version: u64,
    pub blocks: Vec<BlockInfo>,
}

impl fmt::Debug for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "File{{name: {:?}, flags: 0{:o}, modified: {}, version: {}, local: {}, {} blocks}}",
            self.name,
            self.flags,
            self.modified,
            self.version,
            self.local_version,
            self.blocks.len(),
        )
    }
}

/// A FileInfo without its block list, for traversals that only need the
/// envelope. Carries the precomputed size so totals stay cheap.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FileInfoTruncated {
    pub name: String,
    pub flags: u32,
    pub modified: i64,
    pub version: u64,
    pub local_version: u64,
    pub size: u64,
}

impl From<&FileInfo> for FileInfoTruncated {
    fn from(f: &FileInfo) -> Self {
        Self {
            name: f.name.clone(),
            flags: f.flags,
            modified: f.modified,
            version: f.version,
            local_version: f.local_version,
            size: f.size(),
        }
    }
}

/// The shared surface of the full and truncated entry flavours. Traversal
/// entrypoints choose the flavour; accounting code works over either.
pub trait FileLike {
    fn name(&self) -> &str;
    fn flags(&self) -> u32;
    fn modified(&self) -> i64;
    fn version(&self) -> u64;
    fn local_version(&self) -> u64;
    fn size(&self) -> u64;

    fn is_deleted(&self) -> bool {
        self.flags() & FLAG_DELETED != 0
    }

    fn is_invalid(&self) -> bool {
        self.flags() & FLAG_INVALID != 0
    }

    fn is_directory(&self) -> bool {
        self.flags() & FLAG_DIRECTORY != 0
    }

    fn has_permission_bits(&self) -> bool {
        self.flags() & FLAG_NO_PERM_BITS == 0
    }

    fn permissions(&self) -> u32 {
        self.flags() & PERM_MASK
    }
}

impl FileLike for FileInfo {
    fn name(&self) -> &str {
        &self.name
    }

    fn flags(&self) -> u32 {
        self.flags
    }

    fn modified(&self) -> i64 {
        self.modified
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn local_version(&self) -> u64 {
        self.local_version
    }

    fn size(&self) -> u64 {
        if self.is_directory() || (self.is_deleted() && self.blocks.is_empty()) {
            return EMPTY_FILE_SIZE;
        }
        self.blocks.iter().map(|b| u64::from(b.size)).sum()
    }
}

impl FileLike for FileInfoTruncated {
    fn name(&self) -> &str {
        &self.name
    }

    fn flags(&self) -> u32 {
        self.flags
    }

    fn modified(&self) -> i64 {
        self.modified
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn local_version(&self) -> u64 {
        self.local_version
    }

    fn size(&self) -> u64 {
        if self.is_directory() {
            return EMPTY_FILE_SIZE;
        }
        self.size
    }
}

impl FileInfo {
    pub fn size(&self) -> u64 {
        FileLike::size(self)
    }

    pub fn is_deleted(&self) -> bool {
        FileLike::is_deleted(self)
    }

    pub fn is_invalid(&self) -> bool {
        FileLike::is_invalid(self)
    }

    pub fn is_directory(&self) -> bool {
        FileLike::is_directory(self)
    }
}
