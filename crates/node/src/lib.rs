//! Coordination core of the flotilla file-synchronization daemon.
//!
//! The [`Model`] is the in-memory authority over the repository table, the
//! repo/peer sharing graph, live peer connections, and each repository's
//! multi-replica file index. Inbound protocol callbacks mutate index sets
//! through it, the scanner mutates the local replica, index senders push
//! deltas outbound, and pullers drive the need view toward empty.
//!
//! The wire transport, the directory scanner, and the versioning backends
//! are external collaborators, reached only through the contracts in
//! [`protocol`] and [`scan`].

pub mod config;
pub mod events;
pub mod ignore;
pub mod index;
pub mod model;
pub mod protocol;
pub mod puller;
pub mod scan;
pub mod state;
pub mod stats;

mod sender;
mod watchdog;

pub use config::{Config, NodeConfig, RepoConfig};
pub use events::EventBus;
pub use ignore::Patterns;
pub use index::RepoIndex;
pub use model::{ConnectionInfo, Model};
pub use protocol::{Connection, ModelCallbacks, RequestError};
pub use state::RepoState;
