use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Errors raised by the comparison, magnitude and priority engines.
///
/// Every variant is a synchronous rejection: the operation that returned it
/// left no partial state behind.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("At least two items are required, got {count}")]
    InsufficientItems { count: usize },

    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },

    #[error("Invalid magnitude: {value}")]
    InvalidMagnitude { value: i64 },

    #[error("Invalid weight: {weight} (must be within 0.0..=1.0)")]
    InvalidWeight { weight: f64 },

    #[error("Unknown comparison: {comparison_id}")]
    UnknownComparison { comparison_id: String },

    #[error("Comparison already closed: {comparison_id}")]
    ComparisonClosed { comparison_id: String },

    #[error("Unknown participant {participant_id} for project {project_id}")]
    UnknownParticipant { project_id: i64, participant_id: i64 },

    #[error("Unknown item {item_id} for project {project_id}")]
    UnknownItem { project_id: i64, item_id: i64 },

    #[error("Unknown session: {session_id}")]
    UnknownSession { session_id: String },

    #[error("Project {project_id} already has an active {criterion} session: {session_id}")]
    SessionAlreadyActive {
        project_id: i64,
        criterion: String,
        session_id: String,
    },

    #[error("Project {project_id} has no participants")]
    NoParticipants { project_id: i64 },

    #[error("Invalid choice for comparison {comparison_id}: item {item_id} is not part of the pair")]
    InvalidChoice { comparison_id: String, item_id: i64 },

    #[error("Magnitude for item {item_id} ({criterion}) is locked")]
    MagnitudeLocked { item_id: i64, criterion: String },

    #[error("Magnitude for item {item_id} ({criterion}) is not locked")]
    MagnitudeNotLocked { item_id: i64, criterion: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// Numeric code carried by `error` envelopes.
    pub fn code(&self) -> u16 {
        match self {
            SessionError::InsufficientItems { .. } => 4100,
            SessionError::InsufficientData { .. } => 4101,
            SessionError::InvalidMagnitude { .. } => 4102,
            SessionError::InvalidWeight { .. } => 4103,
            SessionError::UnknownComparison { .. } => 4104,
            SessionError::ComparisonClosed { .. } => 4105,
            SessionError::UnknownParticipant { .. } => 4106,
            SessionError::UnknownItem { .. } => 4107,
            SessionError::UnknownSession { .. } => 4108,
            SessionError::SessionAlreadyActive { .. } => 4109,
            SessionError::NoParticipants { .. } => 4110,
            SessionError::InvalidChoice { .. } => 4111,
            SessionError::MagnitudeLocked { .. } => 4112,
            SessionError::MagnitudeNotLocked { .. } => 4113,
            SessionError::Storage(_) => 5000,
        }
    }
}

/// Connection-level errors. These only ever terminate the offending connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Invalid {kind} payload: {message}")]
    InvalidPayload { kind: String, message: String },

    #[error("Outbound queue full for agent {agent_id}")]
    CapacityExceeded { agent_id: String },

    #[error("Message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("No liveness probe response within {timeout_ms}ms")]
    LivenessTimeout { timeout_ms: u64 },

    #[error("Write timed out after {timeout_ms}ms")]
    WriteTimeout { timeout_ms: u64 },

    #[error("Connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConnectionError {
    /// Numeric code carried by `error` envelopes.
    pub fn code(&self) -> u16 {
        match self {
            ConnectionError::Protocol { .. } | ConnectionError::Json(_) => 4000,
            ConnectionError::InvalidPayload { .. } => 4002,
            ConnectionError::MessageTooLarge { .. } => 4009,
            ConnectionError::CapacityExceeded { .. } => 4029,
            ConnectionError::LivenessTimeout { .. } | ConnectionError::WriteTimeout { .. } => 4080,
            ConnectionError::Closed | ConnectionError::Io(_) => 5001,
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for session engine operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Result type alias for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");

        let err = AppError::Internal {
            message: "unexpected".to_string(),
        };
        assert_eq!(err.to_string(), "Internal error: unexpected");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Connection {
            message: "failed to connect".to_string(),
        };
        assert_eq!(err.to_string(), "Database connection failed: failed to connect");

        let err = StorageError::NotFound {
            entity: "Session",
            id: "sess-123".to_string(),
        };
        assert_eq!(err.to_string(), "Session not found: sess-123");

        let err = StorageError::Migration {
            message: "version mismatch".to_string(),
        };
        assert_eq!(err.to_string(), "Migration failed: version mismatch");
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::InsufficientItems { count: 1 };
        assert_eq!(err.to_string(), "At least two items are required, got 1");

        let err = SessionError::InvalidMagnitude { value: 4 };
        assert_eq!(err.to_string(), "Invalid magnitude: 4");

        let err = SessionError::ComparisonClosed {
            comparison_id: "cmp-1".to_string(),
        };
        assert_eq!(err.to_string(), "Comparison already closed: cmp-1");

        let err = SessionError::UnknownParticipant {
            project_id: 7,
            participant_id: 42,
        };
        assert_eq!(err.to_string(), "Unknown participant 42 for project 7");
    }

    #[test]
    fn test_session_error_codes_are_distinct() {
        let errors = vec![
            SessionError::InsufficientItems { count: 0 },
            SessionError::InsufficientData {
                message: String::new(),
            },
            SessionError::InvalidMagnitude { value: 0 },
            SessionError::InvalidWeight { weight: 2.0 },
            SessionError::UnknownComparison {
                comparison_id: String::new(),
            },
            SessionError::ComparisonClosed {
                comparison_id: String::new(),
            },
            SessionError::UnknownParticipant {
                project_id: 0,
                participant_id: 0,
            },
            SessionError::UnknownItem {
                project_id: 0,
                item_id: 0,
            },
        ];
        let mut codes: Vec<u16> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::MessageTooLarge {
            size: 9000,
            limit: 8192,
        };
        assert_eq!(
            err.to_string(),
            "Message of 9000 bytes exceeds limit of 8192 bytes"
        );
        assert_eq!(err.code(), 4009);

        let err = ConnectionError::CapacityExceeded {
            agent_id: "agent-1".to_string(),
        };
        assert_eq!(err.to_string(), "Outbound queue full for agent agent-1");
    }

    #[test]
    fn test_storage_error_conversion_to_session_error() {
        let storage_err = StorageError::Query {
            message: "syntax error".to_string(),
        };
        let session_err: SessionError = storage_err.into();
        assert!(matches!(session_err, SessionError::Storage(_)));
        assert_eq!(session_err.code(), 5000);
    }

    #[test]
    fn test_session_error_conversion_to_app_error() {
        let err = SessionError::NoParticipants { project_id: 3 };
        let app_err: AppError = err.into();
        assert!(matches!(app_err, AppError::Session(_)));
        assert!(app_err.to_string().contains("no participants"));
    }
}
