//! Connection lifecycle.
//!
//! A [`Connection`] owns one server session and tracks its state:
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Validating
//!                                   |
//!                                   +-> Broken (fatal error, abort)
//!                                   +-> Closed (close)
//! ```
//!
//! Connecting is bounded by the login timeout and fails fast: the cause is
//! classified once and never retried, apart from a single attempt against
//! a configured failover partner inside the same budget.

mod events;

pub use self::events::{ConnectionEvent, ConnectionEventListener};

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{validate_connection, ConnectionProperties};
use crate::core::{Connector, Session};
use crate::error::{BulkLoadError, ConnectFailure, ConnectFailureKind, Result, ServerError};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Validating = 3,
    Broken = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Validating,
            4 => ConnectionState::Broken,
            _ => ConnectionState::Closed,
        }
    }

    /// No further work can run on a connection in this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Broken | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Validating => "validating",
            ConnectionState::Broken => "broken",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

type SessionSlot = Arc<Mutex<Option<Box<dyn Session>>>>;

/// State shared between a connection and its abort handles.
struct Shared {
    id: Uuid,
    state: AtomicU8,
    cancel: CancellationToken,
    listeners: StdMutex<Vec<Arc<dyn ConnectionEventListener>>>,
}

impl Shared {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            cancel: CancellationToken::new(),
            listeners: StdMutex::new(Vec::new()),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Unconditional transition. Returns the previous state.
    fn set_state(&self, to: ConnectionState) -> ConnectionState {
        let from = ConnectionState::from_u8(self.state.swap(to as u8, Ordering::AcqRel));
        if from != to {
            debug!("Connection {}: {} -> {}", self.id, from, to);
        }
        from
    }

    /// Transition only from `from`.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            debug!("Connection {}: {} -> {}", self.id, from, to);
        }
        moved
    }

    /// Move to `Broken` unless already terminal. Returns true if this call
    /// broke the connection.
    fn mark_broken(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if ConnectionState::from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Broken as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(
                        "Connection {}: {} -> broken",
                        self.id,
                        ConnectionState::from_u8(current)
                    );
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionEventListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn notify_error(&self, error: &ServerError) {
        let event = ConnectionEvent {
            client_connection_id: self.id,
            error: Some(error.clone()),
        };
        for listener in self.listeners() {
            listener.connection_error_occurred(&event);
        }
    }

    fn notify_closed(&self) {
        let event = ConnectionEvent {
            client_connection_id: self.id,
            error: None,
        };
        for listener in self.listeners() {
            listener.connection_closed(&event);
        }
    }
}

/// An open connection to a server.
///
/// All methods take `&self`; the session is used by one operation at a
/// time, so a transfer holds it exclusively until it finishes.
pub struct Connection {
    props: ConnectionProperties,
    session: SessionSlot,
    shared: Arc<Shared>,
}

impl Connection {
    /// Open a connection within the login timeout.
    pub async fn connect(connector: &dyn Connector, props: ConnectionProperties) -> Result<Self> {
        Self::connect_with_cancel(connector, props, &CancellationToken::new()).await
    }

    /// Open a connection, giving up early when `interrupt` is cancelled.
    ///
    /// An interrupted attempt fails with `ConnectFailureKind::Interrupted`;
    /// the token stays cancelled so the caller still sees the interrupt.
    pub async fn connect_with_cancel(
        connector: &dyn Connector,
        props: ConnectionProperties,
        interrupt: &CancellationToken,
    ) -> Result<Self> {
        validate_connection(&props)?;

        let shared = Arc::new(Shared::new(Uuid::new_v4()));
        shared.set_state(ConnectionState::Connecting);

        let started = Instant::now();
        let budget = props.login_timeout();
        let deadline = started + budget;

        let mut result = attempt(connector, &props, shared.id, deadline, budget, interrupt).await;

        if let Err(BulkLoadError::Connectivity(failure)) = &result {
            if failure.kind.allows_failover() {
                if let Some(partner) = props.for_failover_partner() {
                    warn!(
                        "Connection to {} failed: {}. Trying failover partner {}",
                        props.server_display(),
                        failure,
                        partner.server_display()
                    );
                    result =
                        attempt(connector, &partner, shared.id, deadline, budget, interrupt).await;
                }
            }
        }

        match result {
            Ok(session) => {
                shared.set_state(ConnectionState::Connected);
                info!(
                    "Connected to {} in {:?} (ClientConnectionId:{})",
                    props.server_display(),
                    started.elapsed(),
                    shared.id
                );
                Ok(Self {
                    props,
                    session: Arc::new(Mutex::new(Some(session))),
                    shared,
                })
            }
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                debug!("Connection to {} failed: {}", props.server_display(), e);
                Err(e)
            }
        }
    }

    /// Properties the connection was opened with.
    pub fn properties(&self) -> &ConnectionProperties {
        &self.props
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Identifier sent with the login, for correlating server traces.
    pub fn client_connection_id(&self) -> Result<Uuid> {
        if self.is_closed() {
            return Err(BulkLoadError::ConnectionClosed);
        }
        Ok(self.shared.id)
    }

    /// Check the session with a round trip.
    ///
    /// `timeout_secs` of 0 waits indefinitely; a negative value is a usage
    /// error. Closed and broken connections report `false`.
    pub async fn is_valid(&self, timeout_secs: i32) -> Result<bool> {
        if timeout_secs < 0 {
            return Err(BulkLoadError::usage(format!(
                "The query timeout value {} is not valid.",
                timeout_secs
            )));
        }
        if self.state().is_terminal() {
            return Ok(false);
        }

        // The deadline covers waiting for a session held by a running transfer.
        let deadline = (timeout_secs > 0)
            .then(|| Instant::now() + Duration::from_secs(timeout_secs.unsigned_abs().into()));

        let mut slot = match deadline {
            Some(deadline) => {
                let locked = tokio::select! {
                    _ = self.shared.cancel.cancelled() => return Ok(false),
                    locked = timeout_at(deadline, self.session.lock()) => locked,
                };
                match locked {
                    Ok(slot) => slot,
                    Err(_) => {
                        debug!(
                            "Validity check on {} timed out after {}s waiting for the session",
                            self.shared.id, timeout_secs
                        );
                        return Ok(false);
                    }
                }
            }
            None => self.session.lock().await,
        };
        let Some(session) = slot.as_mut() else {
            return Ok(false);
        };
        if !self
            .shared
            .transition(ConnectionState::Connected, ConnectionState::Validating)
        {
            return Ok(false);
        }

        let round_trip = async {
            match deadline {
                Some(deadline) => timeout_at(deadline, session.ping()).await.ok(),
                None => Some(session.ping().await),
            }
        };

        let outcome = tokio::select! {
            _ = self.shared.cancel.cancelled() => return Ok(false),
            outcome = round_trip => outcome,
        };

        match outcome {
            Some(Ok(())) => {
                self.shared
                    .transition(ConnectionState::Validating, ConnectionState::Connected);
                Ok(true)
            }
            Some(Err(e)) => {
                debug!("Validity check failed on {}: {}", self.shared.id, e);
                self.observe_error(&e);
                self.shared.mark_broken();
                Ok(false)
            }
            None => {
                debug!("Validity check timed out after {}s", timeout_secs);
                self.shared
                    .transition(ConnectionState::Validating, ConnectionState::Connected);
                Ok(false)
            }
        }
    }

    /// Execute a statement batch.
    ///
    /// A fatal server error breaks the connection and notifies listeners;
    /// other server errors are returned and the connection stays usable.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let mut slot = self.lock_session().await?;
        let session = slot.as_mut().ok_or(BulkLoadError::ConnectionClosed)?;

        let result = tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(BulkLoadError::Cancelled),
            r = session.execute(sql) => r,
        };
        if let Err(e) = &result {
            self.observe_error(e);
        }
        result
    }

    /// Close the connection and notify listeners. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.shared.set_state(ConnectionState::Closed) == ConnectionState::Closed {
            return Ok(());
        }
        self.shared.cancel.cancel();

        let session = self.session.lock().await.take();
        if let Some(mut session) = session {
            if let Err(e) = session.close().await {
                debug!("Error closing session {}: {}", self.shared.id, e);
            }
        }

        info!("Connection {} closed", self.shared.id);
        self.shared.notify_closed();
        Ok(())
    }

    /// Abort in-flight work and tear the session down on `executor`.
    ///
    /// Passing no executor is a usage error.
    pub fn abort(&self, executor: Option<&Handle>) -> Result<()> {
        self.abort_handle().abort(executor)
    }

    /// A handle that can abort this connection from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            session: Arc::clone(&self.session),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn add_connection_event_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn remove_connection_event_listener(&self, listener: &Arc<dyn ConnectionEventListener>) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Exclusive access to the session for a multi-step operation.
    pub(crate) async fn lock_session(&self) -> Result<MutexGuard<'_, Option<Box<dyn Session>>>> {
        self.ensure_usable()?;
        let guard = self.session.lock().await;
        self.ensure_usable()?;
        if guard.is_none() {
            return Err(BulkLoadError::ConnectionClosed);
        }
        Ok(guard)
    }

    /// Cancelled by `abort` and `close`.
    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    /// Break the connection on fatal server errors.
    pub(crate) fn observe_error(&self, error: &BulkLoadError) {
        if let Some(server) = error.server_error() {
            if server.is_fatal() && self.shared.mark_broken() {
                warn!(
                    "Connection {} broken by fatal server error: {}",
                    self.shared.id, server
                );
                self.shared.notify_error(server);
            }
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Closed => Err(BulkLoadError::ConnectionClosed),
            ConnectionState::Broken => Err(BulkLoadError::usage(
                "The connection is broken and must be closed.",
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("client_connection_id", &self.shared.id)
            .field("server", &self.props.server_display())
            .field("state", &self.state())
            .finish()
    }
}

/// Aborts a [`Connection`] from another task.
#[derive(Clone)]
pub struct AbortHandle {
    session: SessionSlot,
    shared: Arc<Shared>,
}

impl AbortHandle {
    /// Mark the connection broken, cancel in-flight work and close the
    /// session on `executor`.
    pub fn abort(&self, executor: Option<&Handle>) -> Result<()> {
        let executor =
            executor.ok_or_else(|| BulkLoadError::usage("The argument executor is not valid."))?;

        if !self.shared.mark_broken() {
            return Ok(());
        }
        warn!("Connection {} aborted", self.shared.id);
        self.shared.cancel.cancel();

        let session = Arc::clone(&self.session);
        let id = self.shared.id;
        executor.spawn(async move {
            let taken = session.lock().await.take();
            if let Some(mut session) = taken {
                if let Err(e) = session.close().await {
                    debug!("Error closing aborted session {}: {}", id, e);
                }
            }
        });
        Ok(())
    }
}

async fn attempt(
    connector: &dyn Connector,
    props: &ConnectionProperties,
    id: Uuid,
    deadline: Instant,
    budget: Duration,
    interrupt: &CancellationToken,
) -> Result<Box<dyn Session>> {
    if interrupt.is_cancelled() {
        return Err(interrupted(props));
    }
    debug!("Connecting to {}", props.server_display());

    tokio::select! {
        biased;
        _ = interrupt.cancelled() => Err(interrupted(props)),
        r = timeout_at(deadline, connector.open(props, id)) => match r {
            Ok(r) => r,
            Err(_) => Err(ConnectFailure::new(
                ConnectFailureKind::TimedOut,
                format!(
                    "The connection to {} timed out after {} seconds.",
                    props.server_display(),
                    budget.as_secs()
                ),
            )
            .into()),
        },
    }
}

fn interrupted(props: &ConnectionProperties) -> BulkLoadError {
    ConnectFailure::new(
        ConnectFailureKind::Interrupted,
        format!(
            "The connection attempt to {} was interrupted.",
            props.server_display()
        ),
    )
    .into()
}
