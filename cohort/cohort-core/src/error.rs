//! Error types for the cohort federation engine.
//!
//! Errors are structured values: each variant carries the context fields of the
//! failure and nothing else. Operator-facing text (message ids, HTTP status,
//! suggested actions) hangs off [`ErrorKind`] and is only rendered at the
//! presentation boundary.

use crate::id::{Guid, MetadataCollectionId};
use serde::{Deserialize, Serialize};

/// Result type alias for cohort operations.
pub type Result<T> = std::result::Result<T, CohortError>;

/// Main error type for the cohort federation engine.
#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    /// The requested type definition is not known to this repository
    #[error("Type definition not known: {type_def}")]
    TypeDefNotKnown { type_def: String },

    /// A type definition clashes with the one already held
    #[error("Type definition conflict for {type_name}: {reason}")]
    TypeDefConflict { type_name: String, reason: String },

    /// No entity with this guid is known
    #[error("Entity not known: {guid}")]
    EntityNotKnown { guid: Guid },

    /// No relationship with this guid is known
    #[error("Relationship not known: {guid}")]
    RelationshipNotKnown { guid: Guid },

    /// Two metadata collections claim to be home to the same instance
    #[error("Home collection conflict for instance {guid}: held copy is homed in {existing_home}, incoming copy claims {incoming_home}")]
    HomeCollectionConflict {
        guid: Guid,
        existing_home: MetadataCollectionId,
        incoming_home: MetadataCollectionId,
    },

    /// A cohort member could not be reached (transient)
    #[error("Cohort member {member} unreachable: {reason}")]
    MemberUnreachable {
        member: MetadataCollectionId,
        reason: String,
    },

    /// The event topic refused or could not accept a publication (transient)
    #[error("Event topic {topic} unavailable")]
    TopicUnavailable { topic: String },

    /// A caller supplied an unusable parameter
    #[error("Invalid parameter {parameter} on {operation}: {reason}")]
    InvalidParameter {
        parameter: String,
        operation: String,
        reason: String,
    },

    /// A mutation was attempted on an instance homed elsewhere
    #[error("Instance {guid} is homed in {home} and cannot be changed by {caller}")]
    InstanceNotOwned {
        guid: Guid,
        home: MetadataCollectionId,
        caller: MetadataCollectionId,
    },

    /// Optimistic version check failed
    #[error("Version mismatch for {key}: expected {expected}, found {actual}")]
    VersionMismatch { key: String, expected: u64, actual: u64 },

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CohortError {
    pub fn type_def_not_known(type_def: impl Into<String>) -> Self {
        Self::TypeDefNotKnown {
            type_def: type_def.into(),
        }
    }

    pub fn type_def_conflict(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TypeDefConflict {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }

    pub fn entity_not_known(guid: Guid) -> Self {
        Self::EntityNotKnown { guid }
    }

    pub fn relationship_not_known(guid: Guid) -> Self {
        Self::RelationshipNotKnown { guid }
    }

    pub fn home_collection_conflict(
        guid: Guid,
        existing_home: MetadataCollectionId,
        incoming_home: MetadataCollectionId,
    ) -> Self {
        Self::HomeCollectionConflict {
            guid,
            existing_home,
            incoming_home,
        }
    }

    pub fn member_unreachable(member: MetadataCollectionId, reason: impl Into<String>) -> Self {
        Self::MemberUnreachable {
            member,
            reason: reason.into(),
        }
    }

    pub fn topic_unavailable(topic: impl Into<String>) -> Self {
        Self::TopicUnavailable {
            topic: topic.into(),
        }
    }

    /// Create a new invalid parameter error
    pub fn invalid_parameter(
        parameter: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TypeDefNotKnown { .. } => ErrorKind::TypeDefNotKnown,
            Self::TypeDefConflict { .. } => ErrorKind::TypeDefConflict,
            Self::EntityNotKnown { .. } => ErrorKind::EntityNotKnown,
            Self::RelationshipNotKnown { .. } => ErrorKind::RelationshipNotKnown,
            Self::HomeCollectionConflict { .. } => ErrorKind::HomeCollectionConflict,
            Self::MemberUnreachable { .. } | Self::TopicUnavailable { .. } | Self::Timeout(_) => {
                ErrorKind::MemberUnreachable
            }
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::InstanceNotOwned { .. } => ErrorKind::InstanceNotOwned,
            Self::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Serialization(_) | Self::Io(_) | Self::Internal(_) | Self::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TypeDefNotKnown { .. } | Self::EntityNotKnown { .. } | Self::RelationshipNotKnown { .. }
        )
    }

    /// Check if this is a conflict that must be reported rather than resolved
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::TypeDefConflict { .. } | Self::HomeCollectionConflict { .. }
        )
    }

    /// Check if the failure is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::MemberUnreachable { .. } | Self::TopicUnavailable { .. } | Self::Timeout(_)
        )
    }
}

// ============================================================================
// Error classification and presentation
// ============================================================================

/// Error classes of the federation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TypeDefNotKnown,
    TypeDefConflict,
    EntityNotKnown,
    RelationshipNotKnown,
    HomeCollectionConflict,
    MemberUnreachable,
    InvalidParameter,
    InstanceNotOwned,
    VersionMismatch,
    Configuration,
    Internal,
}

impl ErrorKind {
    /// HTTP status a transport layer should map this class to
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidParameter | Self::InstanceNotOwned | Self::Configuration => 400,
            Self::TypeDefNotKnown | Self::EntityNotKnown | Self::RelationshipNotKnown => 404,
            Self::TypeDefConflict | Self::HomeCollectionConflict | Self::VersionMismatch => 409,
            Self::MemberUnreachable => 503,
            Self::Internal => 500,
        }
    }

    /// Stable message identifier, `COHORT-<status>-<nnn>`
    pub fn message_id(&self) -> &'static str {
        match self {
            Self::InvalidParameter => "COHORT-400-001",
            Self::InstanceNotOwned => "COHORT-400-002",
            Self::Configuration => "COHORT-400-003",
            Self::TypeDefNotKnown => "COHORT-404-001",
            Self::EntityNotKnown => "COHORT-404-002",
            Self::RelationshipNotKnown => "COHORT-404-003",
            Self::TypeDefConflict => "COHORT-409-001",
            Self::HomeCollectionConflict => "COHORT-409-002",
            Self::VersionMismatch => "COHORT-409-003",
            Self::MemberUnreachable => "COHORT-503-001",
            Self::Internal => "COHORT-500-001",
        }
    }

    /// What the engine did in response to the error
    pub fn system_action(&self) -> &'static str {
        match self {
            Self::InvalidParameter | Self::Configuration => {
                "The request was rejected before any state was changed."
            }
            Self::InstanceNotOwned => {
                "The mutation was rejected; only the home repository may change an instance."
            }
            Self::TypeDefNotKnown | Self::EntityNotKnown | Self::RelationshipNotKnown => {
                "The request could not be satisfied because the item is not known to any source that answered."
            }
            Self::TypeDefConflict => {
                "The incoming type definition was rejected and the existing definition retained."
            }
            Self::HomeCollectionConflict => {
                "The incoming copy was quarantined and the existing copy retained."
            }
            Self::VersionMismatch => "The update was rejected because the stored version moved on.",
            Self::MemberUnreachable => {
                "The member was skipped; results or replication are partial until it recovers."
            }
            Self::Internal => "The operation failed unexpectedly; local state is unchanged.",
        }
    }

    /// What the caller or operator should do about it
    pub fn user_action(&self) -> &'static str {
        match self {
            Self::InvalidParameter => "Correct the parameter named in the message and retry.",
            Self::InstanceNotOwned => "Send the change to the instance's home repository.",
            Self::Configuration => "Fix the configuration file or environment overrides.",
            Self::TypeDefNotKnown => "Add the type definition before using it.",
            Self::EntityNotKnown | Self::RelationshipNotKnown => {
                "Check the guid; if members were unreachable retry once they recover."
            }
            Self::TypeDefConflict => {
                "Reconcile the type definitions across the cohort; conflicts are never merged automatically."
            }
            Self::HomeCollectionConflict => {
                "Decide which repository owns the instance and purge the other copy."
            }
            Self::VersionMismatch => "Re-read the instance and reapply the change.",
            Self::MemberUnreachable => "Check the member's connectivity; no action is needed for transient outages.",
            Self::Internal => "Inspect the server log for details.",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
