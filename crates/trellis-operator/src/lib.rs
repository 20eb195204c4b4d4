//! Trellis command line support: configuration, snapshot files and cluster sync

#![deny(missing_docs)]

pub mod config;
pub mod loader;
pub mod sync;

pub use config::{ConfigError, EngineConfig};
pub use loader::{dump, load_files, load_into, LoadError};
pub use sync::{ClusterWriter, KubeClusterWriter, OutputSyncer, SyncError, SyncReport};
