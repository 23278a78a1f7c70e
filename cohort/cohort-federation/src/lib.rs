//! Federation engine for cohorts of metadata repositories.
//!
//! Repositories that join a cohort replicate type definitions and instances
//! to each other and answer queries on behalf of the whole cohort.
//!
//! # Architecture
//!
//! 1. **TypeDef Store**: active type definitions, validated before they are
//!    adopted and never silently overwritten
//! 2. **Cohort Registry**: the members of the cohort and their contact history
//! 3. **Event Exchange**: at-least-once replication over a shared topic with
//!    per-instance ordering
//! 4. **Reference Copy Manager**: read-only copies of remotely owned instances
//! 5. **Enterprise Query Engine**: fan-out queries with partial results
//!
//! A [`FederationServer`] ties the pieces together for one member.
//!
//! # Usage
//!
//! ```rust,no_run
//! use cohort_federation::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> cohort_core::error::Result<()> {
//! let topic = Arc::new(InMemoryTopic::new("cohort"));
//! let directory = Arc::new(InProcessDirectory::new());
//!
//! let mut config = CohortConfig::default();
//! config.general.server_name = "server-a".to_string();
//! config.general.metadata_collection_id = "repo-a".to_string();
//!
//! let server = FederationServer::in_process(config, topic, &directory)?;
//! server.start()?;
//! server
//!     .add_type_def(TypeDef::new("Asset", TypeDefCategory::Entity))
//!     .await?;
//! let asset = server.create_entity("Asset", InstanceProperties::new()).await?;
//! let found = server.find_entity_by_guid(asset.header.guid).await?;
//! assert!(found.complete);
//! server.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod connector;
pub mod exchange;
pub mod query;
pub mod refcopy;
pub mod registry;
pub mod retry;
pub mod server;
pub mod stats;
pub mod typedef_store;

pub use audit::AuditLog;
pub use connector::InProcessDirectory;
pub use exchange::InMemoryTopic;
pub use query::{EnterpriseQueryEngine, EnterpriseResult, MemberOutcome, Provenance, Sourced};
pub use refcopy::{ApplyOutcome, ReferenceCopyManager};
pub use registry::{CohortRegistry, MemberStatus};
pub use retry::RetryPolicy;
pub use server::{FederationServer, ServerInstances, ServerStatus};
pub use stats::ExchangeStatistics;
pub use typedef_store::{TypeDefApplied, TypeDefStore};

/// Re-export commonly used types
pub mod prelude {
    pub use cohort_core::prelude::*;

    pub use crate::audit::{AuditLog, AuditRecord};
    pub use crate::connector::InProcessDirectory;
    pub use crate::exchange::InMemoryTopic;
    pub use crate::query::{EnterpriseResult, MemberOutcome, Provenance, Sourced};
    pub use crate::refcopy::{ApplyOutcome, ReferenceCopyManager};
    pub use crate::registry::{CohortRegistry, MemberStatus};
    pub use crate::server::{FederationServer, ServerInstances, ServerStatus};
    pub use crate::stats::ExchangeStatistics;
    pub use crate::typedef_store::{TypeDefApplied, TypeDefStore};
}
