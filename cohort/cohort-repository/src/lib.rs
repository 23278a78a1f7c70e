//! Local metadata repository for a cohort member.
//!
//! The repository is the source of truth for the instances homed in its
//! metadata collection. It implements the
//! [`MetadataCollection`](cohort_core::traits::MetadataCollection) connector
//! over a versioned key-value contract:
//!
//! - Entries are keyed by guid
//! - Every mutation names the version it read and advances it by one
//! - Stale writes fail with `VersionMismatch`

pub mod kv;
pub mod memory;

pub use kv::{Versioned, VersionedStore};
pub use memory::InMemoryRepository;
