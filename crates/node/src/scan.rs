//! Contract with the on-disk scanner collaborator.
//!
//! The scanner owns directory walking, hashing and temp-file detection; the
//! core only drives it and folds its output into the local replica. The
//! [`CurrentFiler`] seam lets the scanner skip re-hashing files whose
//! metadata matches the prior index entry, which is also what keeps a
//! no-change rescan from touching any versions.

use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use flotilla_primitives::FileInfo;
use tokio::sync::mpsc;

use crate::ignore::Patterns;

/// Files are hashed in spans of this many bytes.
pub const STANDARD_BLOCK_SIZE: usize = 128 * 1024;

/// Parameters for one walk over (a subtree of) a repository root.
pub struct WalkOptions {
    pub dir: Utf8PathBuf,
    /// Subtree to walk, relative to `dir`; empty for the whole root.
    pub sub: String,
    pub ignores: Patterns,
    pub block_size: usize,
    /// When set, permission bits in produced entries are meaningless.
    pub ignore_perms: bool,
    pub temp_namer: Arc<dyn TempNamer>,
    /// Prior index entries, for skipping unchanged files.
    pub current: Option<Arc<dyn CurrentFiler>>,
}

/// The scanner collaborator. `walk` returns a lazy stream of entries; a
/// run is not cancellable mid-stream, it completes or errors.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn walk(&self, opts: WalkOptions) -> eyre::Result<mpsc::Receiver<FileInfo>>;

    /// Removes leftover temp files under `dir`.
    async fn clean_temp_files(&self, dir: &Utf8Path);
}

/// Access to the prior index entry for a name, so the scanner can skip
/// re-hashing unchanged files.
pub trait CurrentFiler: Send + Sync {
    fn current_file(&self, name: &str) -> Option<FileInfo>;
}

/// Maps names to the temporary names used for in-flight content.
pub trait TempNamer: Send + Sync {
    /// The temp name for `name`, in the same parent directory.
    fn temp_name(&self, name: &str) -> String;

    fn is_temporary(&self, name: &str) -> bool;
}

const TEMP_PREFIX: &str = ".flotilla.";

/// Default temp naming: a dotted sibling of the target file.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultTempNamer;

impl TempNamer for DefaultTempNamer {
    fn temp_name(&self, name: &str) -> String {
        match name.rsplit_once('/') {
            Some((parent, base)) => format!("{parent}/{TEMP_PREFIX}{base}"),
            None => format!("{TEMP_PREFIX}{name}"),
        }
    }

    fn is_temporary(&self, name: &str) -> bool {
        name.rsplit('/')
            .next()
            .is_some_and(|base| base.starts_with(TEMP_PREFIX))
    }
}
