//! Coordination Protocol
//!
//! Defines the messages exchanged between client proxies and the
//! coordinator, and the frame header used when they travel over TCP.

use serde::{Deserialize, Serialize};

/// A single cell returned by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Outcome of a statement executed by the owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryResult {
    /// Read-returning statement
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    /// Effect-only statement
    Done { changes: u64 },
}

impl QueryResult {
    /// Number of rows (for `Rows`) or changed rows (for `Done`)
    pub fn len(&self) -> usize {
        match self {
            QueryResult::Rows { rows, .. } => rows.len(),
            QueryResult::Done { changes } => *changes as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why a query did not produce a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The coordinator gave up routing the query
    RetriesExhausted,
    /// No process could be reached to own the database
    OwnerUnavailable,
    /// The receiving process is not (or no longer) the ready owner
    OwnerNotReady,
    /// The store rejected the statement
    Execution,
    /// The owner failed to open the store
    Initialization,
}

impl FailureKind {
    /// Short machine-readable reason string
    pub fn reason(&self) -> &'static str {
        match self {
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::OwnerUnavailable => "owner_unavailable",
            FailureKind::OwnerNotReady => "owner_not_ready",
            FailureKind::Execution => "execution",
            FailureKind::Initialization => "initialization",
        }
    }

    /// Routing failures mean the statement was never executed
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            FailureKind::RetriesExhausted
                | FailureKind::OwnerUnavailable
                | FailureKind::OwnerNotReady
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

/// Failure relayed to the caller of a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl QueryFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Messages sent by a process to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToCoordinator {
    // ========== Membership ==========
    Register { process_id: String },
    Unregister { process_id: String },
    HeartbeatPong { process_id: String },

    // ========== Liveness ==========
    LivenessHeld { process_id: String },
    LivenessReleased { process_id: String },

    // ========== Queries ==========
    Query {
        process_id: String,
        request_id: String,
        statement: String,
    },

    // ========== Owner reports ==========
    OwnerReady { process_id: String },
    OwnerInitFailed { process_id: String, reason: String },
    QueryResult {
        process_id: String,
        request_id: String,
        result: QueryResult,
    },
    QueryError {
        process_id: String,
        request_id: String,
        error: QueryFailure,
    },
}

impl ToCoordinator {
    /// The process that sent this message
    pub fn process_id(&self) -> &str {
        match self {
            ToCoordinator::Register { process_id }
            | ToCoordinator::Unregister { process_id }
            | ToCoordinator::HeartbeatPong { process_id }
            | ToCoordinator::LivenessHeld { process_id }
            | ToCoordinator::LivenessReleased { process_id }
            | ToCoordinator::Query { process_id, .. }
            | ToCoordinator::OwnerReady { process_id }
            | ToCoordinator::OwnerInitFailed { process_id, .. }
            | ToCoordinator::QueryResult { process_id, .. }
            | ToCoordinator::QueryError { process_id, .. } => process_id,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            ToCoordinator::Register { .. } => "Register",
            ToCoordinator::Unregister { .. } => "Unregister",
            ToCoordinator::HeartbeatPong { .. } => "HeartbeatPong",
            ToCoordinator::LivenessHeld { .. } => "LivenessHeld",
            ToCoordinator::LivenessReleased { .. } => "LivenessReleased",
            ToCoordinator::Query { .. } => "Query",
            ToCoordinator::OwnerReady { .. } => "OwnerReady",
            ToCoordinator::OwnerInitFailed { .. } => "OwnerInitFailed",
            ToCoordinator::QueryResult { .. } => "QueryResult",
            ToCoordinator::QueryError { .. } => "QueryError",
        }
    }
}

/// Messages sent by the coordinator to a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FromCoordinator {
    /// The active process changed (broadcast)
    ActiveChanged { active_process_id: Option<String> },
    /// Delivered only to the promoted process
    Promote { process_id: String },
    /// Delivered only to the active process
    HeartbeatProbe,
    /// Delivered only to the active process
    ForwardQuery {
        request_id: String,
        origin_process_id: String,
        statement: String,
    },
    /// Relayed to the origin of a query
    QueryResult {
        request_id: String,
        result: QueryResult,
    },
    /// Relayed to the origin of a query
    QueryError {
        request_id: String,
        error: QueryFailure,
    },
    /// The active process finished opening the store (broadcast)
    OwnerReady { process_id: String },
}

impl FromCoordinator {
    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            FromCoordinator::ActiveChanged { .. } => "ActiveChanged",
            FromCoordinator::Promote { .. } => "Promote",
            FromCoordinator::HeartbeatProbe => "HeartbeatProbe",
            FromCoordinator::ForwardQuery { .. } => "ForwardQuery",
            FromCoordinator::QueryResult { .. } => "QueryResult",
            FromCoordinator::QueryError { .. } => "QueryError",
            FromCoordinator::OwnerReady { .. } => "OwnerReady",
        }
    }
}

/// Serialize a message body
pub fn serialize<T: Serialize>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(message)
}

/// Deserialize a message body
pub fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from a peer
    pub const MAX_LENGTH: u32 = 16 * 1024 * 1024;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_query_serialization() {
        let msg = FromCoordinator::ForwardQuery {
            request_id: "r1".to_string(),
            origin_process_id: "proc-b".to_string(),
            statement: "SELECT 1".to_string(),
        };

        let bytes = serialize(&msg).unwrap();
        let restored: FromCoordinator = deserialize(&bytes).unwrap();

        match restored {
            FromCoordinator::ForwardQuery { request_id, origin_process_id, statement } => {
                assert_eq!(request_id, "r1");
                assert_eq!(origin_process_id, "proc-b");
                assert_eq!(statement, "SELECT 1");
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_result_rows_survive_the_wire() {
        let msg = ToCoordinator::QueryResult {
            process_id: "proc-a".to_string(),
            request_id: "r7".to_string(),
            result: QueryResult::Rows {
                columns: vec!["id".into(), "name".into(), "score".into(), "raw".into()],
                rows: vec![vec![
                    Value::Integer(1),
                    Value::Text("alpha".into()),
                    Value::Real(0.5),
                    Value::Blob(vec![0, 1, 2]),
                ], vec![Value::Integer(2), Value::Null, Value::Null, Value::Null]],
            },
        };

        let restored: ToCoordinator = deserialize(&serialize(&msg).unwrap()).unwrap();
        assert_eq!(restored, msg);
        assert_eq!(restored.process_id(), "proc-a");
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
        assert_eq!(restored.length as usize, data.len());
    }

    #[test]
    fn test_failure_kinds() {
        assert!(FailureKind::RetriesExhausted.is_routing());
        assert!(FailureKind::OwnerNotReady.is_routing());
        assert!(!FailureKind::Execution.is_routing());
        assert!(!FailureKind::Initialization.is_routing());

        let failure = QueryFailure::new(FailureKind::Initialization, "disk full");
        assert_eq!(failure.to_string(), "initialization: disk full");
    }
}
