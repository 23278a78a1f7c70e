//! Administrative reports raised by the federation engine.
//!
//! Conflicts and degraded members are never swallowed: every one of them
//! becomes an [`AuditReport`] delivered to an [`AuditSink`](crate::traits::AuditSink).

use crate::error::ErrorKind;
use crate::id::{Guid, MetadataCollectionId};
use serde::{Deserialize, Serialize};

/// Severity of an audit report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
}

/// A structured report for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum AuditReport {
    /// A type definition was rejected
    TypeDefConflict {
        type_name: String,
        type_def_guid: Guid,
        /// Member that sent the definition; `None` for local requests
        origin: Option<MetadataCollectionId>,
        reason: String,
    },

    /// Two collections claim the same instance, or copies of one version diverge
    HomeCollectionConflict {
        guid: Guid,
        existing_home: MetadataCollectionId,
        incoming_home: MetadataCollectionId,
        detail: String,
    },

    /// A call to a member failed or timed out
    MemberUnreachable {
        member: MetadataCollectionId,
        reason: String,
    },

    /// A member exhausted the configured failure budget
    DegradedMember {
        member: MetadataCollectionId,
        consecutive_failures: u32,
    },

    /// An outbound event could not be published within the retry budget
    PublicationAbandoned {
        event_kind: String,
        subject: String,
        attempts: u32,
        reason: String,
    },

    /// A registration was refused
    RegistrationRejected {
        member: MetadataCollectionId,
        reason: String,
    },
}

impl AuditReport {
    pub fn severity(&self) -> AuditSeverity {
        match self {
            Self::TypeDefConflict { .. } | Self::HomeCollectionConflict { .. } => AuditSeverity::Error,
            Self::PublicationAbandoned { .. } | Self::DegradedMember { .. } => AuditSeverity::Warning,
            Self::RegistrationRejected { .. } => AuditSeverity::Warning,
            Self::MemberUnreachable { .. } => AuditSeverity::Info,
        }
    }

    /// Error class the report corresponds to
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::TypeDefConflict { .. } => ErrorKind::TypeDefConflict,
            Self::HomeCollectionConflict { .. } => ErrorKind::HomeCollectionConflict,
            Self::MemberUnreachable { .. }
            | Self::DegradedMember { .. }
            | Self::PublicationAbandoned { .. } => ErrorKind::MemberUnreachable,
            Self::RegistrationRejected { .. } => ErrorKind::InvalidParameter,
        }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        match self {
            Self::TypeDefConflict {
                type_name, origin, reason, ..
            } => match origin {
                Some(origin) => format!("type definition {} from {} rejected: {}", type_name, origin, reason),
                None => format!("type definition {} rejected: {}", type_name, reason),
            },
            Self::HomeCollectionConflict {
                guid,
                existing_home,
                incoming_home,
                detail,
            } => format!(
                "instance {} held with home {} but {} claims it: {}",
                guid, existing_home, incoming_home, detail
            ),
            Self::MemberUnreachable { member, reason } => {
                format!("member {} unreachable: {}", member, reason)
            }
            Self::DegradedMember {
                member,
                consecutive_failures,
            } => format!(
                "member {} degraded after {} consecutive failures",
                member, consecutive_failures
            ),
            Self::PublicationAbandoned {
                event_kind,
                subject,
                attempts,
                reason,
            } => format!(
                "{} event for {} abandoned after {} attempts: {}",
                event_kind, subject, attempts, reason
            ),
            Self::RegistrationRejected { member, reason } => {
                format!("registration of {} rejected: {}", member, reason)
            }
        }
    }
}
