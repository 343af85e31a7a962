use std::fmt;

/// Per-repository activity state. Transitions are driven by the scanner
/// driver, the puller, and `override_changes`; everything else only reads.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RepoState {
    #[default]
    Idle,
    Scanning,
    Syncing,
    Cleaning,
}

impl fmt::Display for RepoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Syncing => "syncing",
            Self::Cleaning => "cleaning",
        };
        f.write_str(s)
    }
}
