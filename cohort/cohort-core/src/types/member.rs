//! Cohort membership records.

use crate::id::MetadataCollectionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Replication protocol version spoken by a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Version implemented by this crate
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Members interoperate when their major versions match
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// How to reach a member's repository connector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Transport name, e.g. `in-process`
    pub transport: String,
    /// Transport-specific address of the connector
    pub endpoint: String,
}

impl ConnectionDescriptor {
    pub const IN_PROCESS: &'static str = "in-process";

    pub fn in_process(endpoint: impl Into<String>) -> Self {
        Self {
            transport: Self::IN_PROCESS.to_string(),
            endpoint: endpoint.into(),
        }
    }
}

/// A repository participating in the cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortMember {
    pub metadata_collection_id: MetadataCollectionId,
    pub server_name: String,
    pub connection: ConnectionDescriptor,
    pub registration_time: DateTime<Utc>,
    pub protocol_version: ProtocolVersion,
    /// Last time the member answered a call or sent an event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl CohortMember {
    pub fn new(
        metadata_collection_id: MetadataCollectionId,
        server_name: impl Into<String>,
        connection: ConnectionDescriptor,
    ) -> Self {
        Self {
            metadata_collection_id,
            server_name: server_name.into(),
            connection,
            registration_time: Utc::now(),
            protocol_version: ProtocolVersion::CURRENT,
            last_seen: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_compatibility() {
        let current = ProtocolVersion::CURRENT;
        assert!(current.is_compatible_with(&ProtocolVersion::new(1, 7)));
        assert!(!current.is_compatible_with(&ProtocolVersion::new(2, 0)));
        assert_eq!(current.to_string(), "1.0");
    }

    #[test]
    fn test_in_process_descriptor() {
        let conn = ConnectionDescriptor::in_process("repo-a");
        assert_eq!(conn.transport, "in-process");
        assert_eq!(conn.endpoint, "repo-a");
    }
}
