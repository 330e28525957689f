//! Error types for the bulk load library.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::coerce::Rejection;

/// Severity at or above which a server error terminates the session.
pub const FATAL_SEVERITY: u8 = 20;

/// Main error type for bulk load operations.
#[derive(Error, Debug)]
pub enum BulkLoadError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// API misuse: invalid argument, call out of order, missing destination.
    #[error("{0}")]
    Usage(String),

    /// A value failed validation against its destination column.
    #[error("Validation failed: {0}")]
    Validation(Box<Rejection>),

    /// The session could not be established.
    #[error("{0}")]
    Connectivity(ConnectFailure),

    /// The server reported an error while executing a request.
    #[error("{0}")]
    Server(ServerError),

    /// Operation attempted on a closed connection handle.
    #[error("The connection is closed.")]
    ConnectionClosed,

    /// Destination table or column mapping could not be resolved.
    #[error("Schema resolution failed: {0}")]
    SchemaResolution(String),

    /// Bulk transfer failed for a specific table.
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Operation was cancelled (abort, SIGINT, etc.)
    #[error("Operation cancelled")]
    Cancelled,

    /// Transport error from the TDS client.
    #[error("TDS error: {0}")]
    Tds(#[from] tiberius::error::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// CSV parsing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    Validation,
    Connectivity,
    ServerExecution,
    Other,
}

impl BulkLoadError {
    /// Create a Usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        BulkLoadError::Usage(message.into())
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        BulkLoadError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a SchemaResolution error.
    pub fn schema(message: impl Into<String>) -> Self {
        BulkLoadError::SchemaResolution(message.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BulkLoadError::Usage(_) | BulkLoadError::ConnectionClosed => ErrorKind::Usage,
            BulkLoadError::Validation(_) => ErrorKind::Validation,
            BulkLoadError::Connectivity(_) => ErrorKind::Connectivity,
            BulkLoadError::Server(_) | BulkLoadError::SchemaResolution(_) => {
                ErrorKind::ServerExecution
            }
            _ => ErrorKind::Other,
        }
    }

    /// Returns the rejection when this is a validation failure.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            BulkLoadError::Validation(r) => Some(r),
            _ => None,
        }
    }

    /// Returns the server error when the server reported one.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            BulkLoadError::Server(e) => Some(e),
            _ => None,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            BulkLoadError::Config(_) | BulkLoadError::Yaml(_) => 1,
            BulkLoadError::Usage(_) | BulkLoadError::ConnectionClosed => 2,
            BulkLoadError::Validation(_) => 3,
            BulkLoadError::Connectivity(_) => 4,
            BulkLoadError::Server(_) | BulkLoadError::SchemaResolution(_) => 5,
            BulkLoadError::Cancelled => 6,
            BulkLoadError::Io(_) | BulkLoadError::Csv(_) => 7,
            BulkLoadError::Transfer { .. } | BulkLoadError::Tds(_) => 10,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

impl From<Rejection> for BulkLoadError {
    fn from(r: Rejection) -> Self {
        BulkLoadError::Validation(Box::new(r))
    }
}

/// Error reported by the server for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub number: u32,
    pub severity: u8,
    pub state: u8,
    pub message: String,
}

impl ServerError {
    pub fn new(number: u32, severity: u8, state: u8, message: impl Into<String>) -> Self {
        Self {
            number,
            severity,
            state,
            message: message.into(),
        }
    }

    /// Errors at this severity end the session on the server side.
    pub fn is_fatal(&self) -> bool {
        self.severity >= FATAL_SEVERITY
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Msg {}, Level {}, State {}: {}",
            self.number, self.severity, self.state, self.message
        )
    }
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailureKind {
    /// Host did not answer or refused the TCP connection.
    Unreachable,
    /// Credentials were rejected.
    LoginFailed,
    /// Login succeeded but the database could not be opened.
    CannotOpenDatabase,
    /// Mutually exclusive connection properties were combined.
    IncompatibleOptions,
    /// The login timeout budget was exhausted.
    TimedOut,
    /// The caller cancelled the attempt.
    Interrupted,
}

impl ConnectFailureKind {
    /// Failures after which trying the failover partner makes sense.
    pub fn allows_failover(self) -> bool {
        matches!(self, ConnectFailureKind::Unreachable)
    }
}

/// A failed connection attempt.
///
/// `client_connection_id` is present only when the server was reached, so
/// the message can be correlated with server-side traces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailure {
    pub kind: ConnectFailureKind,
    pub message: String,
    pub client_connection_id: Option<Uuid>,
}

impl ConnectFailure {
    pub fn new(kind: ConnectFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            client_connection_id: None,
        }
    }

    /// Attach the client connection id (server was reached).
    pub fn with_connection_id(mut self, id: Uuid) -> Self {
        self.client_connection_id = Some(id);
        self
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(id) = self.client_connection_id {
            write!(f, " ClientConnectionId:{}", id)?;
        }
        Ok(())
    }
}

impl From<ConnectFailure> for BulkLoadError {
    fn from(f: ConnectFailure) -> Self {
        BulkLoadError::Connectivity(f)
    }
}

impl From<ServerError> for BulkLoadError {
    fn from(e: ServerError) -> Self {
        BulkLoadError::Server(e)
    }
}

/// Result type alias for bulk load operations.
pub type Result<T> = std::result::Result<T, BulkLoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failure_display_with_id() {
        let id = Uuid::new_v4();
        let f = ConnectFailure::new(ConnectFailureKind::LoginFailed, "Login failed for user 'sa'.")
            .with_connection_id(id);
        let msg = BulkLoadError::from(f).to_string();
        assert!(msg.starts_with("Login failed"));
        assert!(msg.contains(&format!("ClientConnectionId:{}", id)));
    }

    #[test]
    fn test_connect_failure_display_without_id() {
        let f = ConnectFailure::new(ConnectFailureKind::Unreachable, "host unreachable");
        assert!(!f.to_string().contains("ClientConnectionId"));
    }

    #[test]
    fn test_server_error_fatal_threshold() {
        assert!(!ServerError::new(50000, 19, 1, "x").is_fatal());
        assert!(ServerError::new(50000, 20, 1, "x").is_fatal());
        assert!(ServerError::new(50000, 21, 1, "x").is_fatal());
    }

    #[test]
    fn test_kind_and_exit_codes() {
        assert_eq!(BulkLoadError::usage("bad").kind(), ErrorKind::Usage);
        assert_eq!(BulkLoadError::ConnectionClosed.kind(), ErrorKind::Usage);
        assert_eq!(BulkLoadError::ConnectionClosed.exit_code(), 2);
        assert_eq!(BulkLoadError::Cancelled.exit_code(), 6);
        assert_eq!(
            BulkLoadError::Server(ServerError::new(1, 16, 1, "x")).kind(),
            ErrorKind::ServerExecution
        );
    }

    #[test]
    fn test_connection_closed_message() {
        assert_eq!(
            BulkLoadError::ConnectionClosed.to_string(),
            "The connection is closed."
        );
    }

    #[test]
    fn test_format_detailed() {
        let err = BulkLoadError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(err.format_detailed().starts_with("Error: IO error: gone"));
    }
}
