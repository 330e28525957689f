//! Connection event notification.

use uuid::Uuid;

use crate::error::ServerError;

/// What happened to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub client_connection_id: Uuid,
    /// The fatal server error, for `connection_error_occurred`.
    pub error: Option<ServerError>,
}

/// Receives close and fatal-error notifications, typically a pool.
///
/// Callbacks run on the task that caused the event and must not block.
pub trait ConnectionEventListener: Send + Sync {
    /// The caller closed the connection.
    fn connection_closed(&self, event: &ConnectionEvent);

    /// A fatal error made the connection unusable.
    fn connection_error_occurred(&self, event: &ConnectionEvent);
}
