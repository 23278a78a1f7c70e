//! Core types and abstractions for the cohort metadata federation engine.
//!
//! This crate provides the foundational types, traits, and error handling
//! used across all cohort components.

pub mod audit;
pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod traits;
pub mod types;

pub use audit::{AuditReport, AuditSeverity};
pub use config::CohortConfig;
pub use error::{CohortError, ErrorKind, Result};
pub use event::*;
pub use id::{Guid, MetadataCollectionId};
pub use traits::*;
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::audit::{AuditReport, AuditSeverity};
    pub use crate::config::CohortConfig;
    pub use crate::error::{CohortError, ErrorKind, Result};
    pub use crate::event::*;
    pub use crate::id::{Guid, MetadataCollectionId};
    pub use crate::traits::*;
    pub use crate::types::*;
}
