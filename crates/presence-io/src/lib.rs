//! presence-io — Adapters between the presence core and the outside world.
//!
//! SQLite roster and attendance ledger, directory image corpus, local and
//! remote snapshot stores, an external encoder process, and layered
//! configuration.

pub mod config;
pub mod corpus;
pub mod encoder;
pub mod ledger;
pub mod snapshot_store;

pub use config::{Config, ConfigError, SnapshotSource, MAX_WINDOW_SECS};
pub use corpus::DirCorpus;
pub use encoder::CommandEncoder;
pub use ledger::{AttendanceFilter, EnrollReport, SqliteLedger, Student, StudentImage, STATUS_PRESENT};
pub use snapshot_store::{DirRemoteStore, FileSnapshotCache, HttpRemoteStore};
