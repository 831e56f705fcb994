//! # kvcache-disk
//!
//! The SQLite-backed disk tier (C4 manifest store + C5 blob store + C6
//! disk tier), plus the process-wide registry (C8) that enforces one
//! live instance per cache directory.

mod blobstore;
mod config;
mod manifest;
mod registry;
mod tier;
mod worker;

pub use config::{DiskTierConfig, PlacementMode};
pub use manifest::{ManifestEntry, SizeInfo};
pub use tier::DiskTier;
