//! In-process loopback server.
//!
//! [`MemoryServer`] implements [`Connector`] without a network: tables live
//! in memory, bulk loads append rows, and a handful of statements are
//! understood (`SELECT 1`, `BEGIN TRANSACTION`, `COMMIT`, `ROLLBACK`,
//! `RAISERROR`). Connect behavior can be scripted per host so lifecycle
//! failures can be reproduced without a real server.
//!
//! Bulk loads follow the server's option semantics: column defaults replace
//! NULLs unless `keep_nulls`, check constraints and insert triggers only run
//! when asked for, identity values are generated unless `keep_identity`,
//! encrypted columns need `allow_encrypted_value_modifications`, and
//! `table_lock` holds a bulk update lock until the transaction ends.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::config::ConnectionProperties;
use crate::core::{
    BulkInsert, ColumnDescriptor, Connector, Session, SqlType, SqlValue, TableName,
};
use crate::error::{BulkLoadError, ConnectFailure, ConnectFailureKind, Result, ServerError};
use crate::transfer::BulkCopyOptions;

const DEFAULT_DATABASE: &str = "master";

/// How the server answers a connection attempt to a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    #[default]
    Accept,
    /// Fail immediately as if nothing listened on the port.
    Unreachable,
    /// Never answer; the attempt runs into the login timeout.
    Hang,
}

/// One acknowledged bulk load.
#[derive(Debug, Clone)]
pub struct BulkLoadRecord {
    pub table: TableName,
    pub columns: Vec<String>,
    pub rows: usize,
    pub options: BulkCopyOptions,
}

/// A named predicate over one column. NULL always passes.
#[derive(Clone)]
struct CheckConstraint {
    name: String,
    column: String,
    check: fn(&SqlValue<'static>) -> bool,
}

impl fmt::Debug for CheckConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckConstraint")
            .field("name", &self.name)
            .field("column", &self.column)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct Table {
    name: TableName,
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Vec<SqlValue<'static>>>,
    next_identity: i64,
    /// Keyed by lowercase column name.
    defaults: HashMap<String, SqlValue<'static>>,
    checks: Vec<CheckConstraint>,
    triggers: Vec<String>,
    /// Column encryption key per lowercase column name.
    encrypted: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct ServerState {
    databases: Vec<String>,
    login: Option<(String, String)>,
    tables: HashMap<String, Table>,
    hosts: HashMap<String, ConnectBehavior>,
    attempts: Vec<String>,
    open_sessions: usize,
    bulk_loads: Vec<BulkLoadRecord>,
    fail_bulk_load: Option<(usize, ServerError)>,
    /// Statement prefix (uppercase) and the error it fails with once.
    fail_statements: Vec<(String, ServerError)>,
    bulk_delay: Duration,
    trigger_firings: Vec<String>,
    /// Session holding a bulk update lock, per table cache key.
    table_locks: HashMap<String, Uuid>,
}

/// A scriptable server living in the current process.
#[derive(Debug, Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    /// A server with the `master` database that accepts any login.
    pub fn new() -> Self {
        let state = ServerState {
            databases: vec![DEFAULT_DATABASE.to_string()],
            ..ServerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Add a database logins may open.
    pub fn with_database(self, name: impl Into<String>) -> Self {
        self.lock().databases.push(name.into());
        self
    }

    /// Require this user and password.
    pub fn with_login(self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.lock().login = Some((user.into(), password.into()));
        self
    }

    /// Create (or replace) a table.
    pub fn create_table(&self, table: TableName, columns: Vec<ColumnDescriptor>) {
        let key = table.cache_key();
        self.lock().tables.insert(
            key,
            Table {
                name: table,
                columns,
                rows: Vec::new(),
                next_identity: 1,
                defaults: HashMap::new(),
                checks: Vec::new(),
                triggers: Vec::new(),
                encrypted: HashMap::new(),
            },
        );
    }

    /// Give `column` a default value.
    pub fn set_column_default(&self, table: &TableName, column: &str, value: SqlValue<'static>) {
        self.with_table(table, |t| {
            t.defaults.insert(column.to_lowercase(), value);
        });
    }

    /// Add a check constraint on `column`.
    pub fn add_check_constraint(
        &self,
        table: &TableName,
        name: &str,
        column: &str,
        check: fn(&SqlValue<'static>) -> bool,
    ) {
        self.with_table(table, |t| {
            t.checks.push(CheckConstraint {
                name: name.to_string(),
                column: column.to_string(),
                check,
            });
        });
    }

    /// Add an insert trigger. Each firing is recorded by name.
    pub fn add_insert_trigger(&self, table: &TableName, name: &str) {
        self.with_table(table, |t| t.triggers.push(name.to_string()));
    }

    /// Mark `column` as encrypted with the named column encryption key.
    pub fn encrypt_column(&self, table: &TableName, column: &str, key_name: &str) {
        self.with_table(table, |t| {
            t.encrypted
                .insert(column.to_lowercase(), key_name.to_string());
        });
    }

    /// Trigger names, once per firing, in order.
    pub fn fired_triggers(&self) -> Vec<String> {
        self.lock().trigger_firings.clone()
    }

    /// Session holding a bulk update lock on `table`, if any.
    pub fn table_lock_owner(&self, table: &TableName) -> Option<Uuid> {
        self.lock().table_locks.get(&table.cache_key()).copied()
    }

    /// Rows stored in a table, in insertion order.
    pub fn rows(&self, table: &TableName) -> Vec<Vec<SqlValue<'static>>> {
        self.lock()
            .tables
            .get(&table.cache_key())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Script how connection attempts to `host` behave.
    pub fn set_behavior(&self, host: impl Into<String>, behavior: ConnectBehavior) {
        self.lock()
            .hosts
            .insert(host.into().to_lowercase(), behavior);
    }

    /// Hosts connection attempts were made to, in order.
    pub fn connect_attempts(&self) -> Vec<String> {
        self.lock().attempts.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    /// Acknowledged bulk loads, in order.
    pub fn bulk_loads(&self) -> Vec<BulkLoadRecord> {
        self.lock().bulk_loads.clone()
    }

    /// Fail the `nth` bulk load (1-based) with `error`.
    pub fn fail_bulk_load(&self, nth: usize, error: ServerError) {
        self.lock().fail_bulk_load = Some((nth, error));
    }

    /// Fail the next statement starting with `prefix` (case-insensitive).
    pub fn fail_statement(&self, prefix: &str, error: ServerError) {
        self.lock()
            .fail_statements
            .push((prefix.to_uppercase(), error));
    }

    /// Delay each bulk load acknowledgment.
    pub fn set_bulk_delay(&self, delay: Duration) {
        self.lock().bulk_delay = delay;
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        lock(&self.state)
    }

    fn with_table(&self, table: &TableName, f: impl FnOnce(&mut Table)) {
        if let Some(t) = self.lock().tables.get_mut(&table.cache_key()) {
            f(t);
        }
    }
}

fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Connector for MemoryServer {
    async fn open(
        &self,
        props: &ConnectionProperties,
        client_connection_id: Uuid,
    ) -> Result<Box<dyn Session>> {
        let behavior = {
            let mut state = self.lock();
            state.attempts.push(props.host.clone());
            state
                .hosts
                .get(&props.host.to_lowercase())
                .copied()
                .unwrap_or_default()
        };

        match behavior {
            ConnectBehavior::Accept => {}
            ConnectBehavior::Unreachable => {
                return Err(ConnectFailure::new(
                    ConnectFailureKind::Unreachable,
                    format!(
                        "The TCP/IP connection to the host {} has failed. \
                         Verify the connection properties and that the host is reachable.",
                        props.server_display()
                    ),
                )
                .into());
            }
            ConnectBehavior::Hang => {
                std::future::pending::<()>().await;
            }
        }

        let database = {
            let mut state = self.lock();
            if let Some((user, password)) = &state.login {
                if *user != props.user || *password != props.password {
                    return Err(ConnectFailure::new(
                        ConnectFailureKind::LoginFailed,
                        format!("Login failed for user '{}'.", props.user),
                    )
                    .with_connection_id(client_connection_id)
                    .into());
                }
            }

            let database = if props.database.is_empty() {
                DEFAULT_DATABASE.to_string()
            } else {
                props.database.clone()
            };
            if !state
                .databases
                .iter()
                .any(|d| d.eq_ignore_ascii_case(&database))
            {
                return Err(ConnectFailure::new(
                    ConnectFailureKind::CannotOpenDatabase,
                    format!(
                        "Cannot open database \"{}\" requested by the login. The login failed.",
                        database
                    ),
                )
                .with_connection_id(client_connection_id)
                .into());
            }
            state.open_sessions += 1;
            database
        };

        debug!("Loopback session {} opened on {}", client_connection_id, database);
        Ok(Box::new(MemorySession {
            id: client_connection_id,
            database,
            state: Arc::clone(&self.state),
            snapshot: None,
            terminated: false,
            closed: false,
        }))
    }
}

/// A session on a [`MemoryServer`].
struct MemorySession {
    id: Uuid,
    database: String,
    state: Arc<Mutex<ServerState>>,
    snapshot: Option<HashMap<String, Table>>,
    terminated: bool,
    closed: bool,
}

impl MemorySession {
    fn check_alive(&self) -> Result<()> {
        if self.terminated || self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "The session was terminated by the server",
            )
            .into());
        }
        Ok(())
    }

    fn scripted_failure(&mut self, upper: &str) -> Option<ServerError> {
        let mut state = lock(&self.state);
        let index = state
            .fail_statements
            .iter()
            .position(|(prefix, _)| upper.starts_with(prefix.as_str()))?;
        let (_, error) = state.fail_statements.remove(index);
        drop(state);
        if error.is_fatal() {
            self.terminate();
        }
        Some(error)
    }

    /// Drop every lock this session holds.
    fn release_locks(&self) {
        let id = self.id;
        lock(&self.state)
            .table_locks
            .retain(|_, owner| *owner != id);
    }

    fn terminate(&mut self) {
        self.terminated = true;
        self.release_locks();
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.check_alive()?;
        let statement = sql.trim().trim_end_matches(';').trim();
        let upper = statement.to_uppercase();

        if let Some(error) = self.scripted_failure(&upper) {
            return Err(error.into());
        }

        if upper == "SELECT 1" || upper.starts_with("SET ") {
            return Ok(0);
        }
        if upper == "BEGIN TRANSACTION" || upper == "BEGIN TRAN" {
            self.snapshot = Some(lock(&self.state).tables.clone());
            return Ok(0);
        }
        if upper.starts_with("COMMIT") {
            self.snapshot = None;
            self.release_locks();
            return Ok(0);
        }
        if upper.starts_with("ROLLBACK") {
            let snapshot = self.snapshot.take().ok_or_else(|| {
                ServerError::new(
                    3903,
                    16,
                    1,
                    "The ROLLBACK TRANSACTION request has no corresponding BEGIN TRANSACTION.",
                )
            })?;
            lock(&self.state).tables = snapshot;
            self.release_locks();
            return Ok(0);
        }
        if upper.starts_with("RAISERROR") {
            let error = parse_raiserror(statement)?;
            if error.is_fatal() {
                self.terminate();
            }
            return Err(error.into());
        }

        let near = statement.split_whitespace().next().unwrap_or_default();
        Err(ServerError::new(102, 15, 1, format!("Incorrect syntax near '{}'.", near)).into())
    }

    async fn ping(&mut self) -> Result<()> {
        self.check_alive()
    }

    async fn describe_table(&mut self, table: &TableName) -> Result<Vec<ColumnDescriptor>> {
        self.check_alive()?;
        lock(&self.state)
            .tables
            .get(&table.cache_key())
            .map(|t| t.columns.clone())
            .ok_or_else(|| BulkLoadError::schema(format!("Invalid object name '{}'.", table)))
    }

    async fn bulk_insert(&mut self, request: BulkInsert<'_>) -> Result<u64> {
        self.check_alive()?;

        let delay = lock(&self.state).bulk_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        let load_number = state.bulk_loads.len() + 1;
        let scripted = match &state.fail_bulk_load {
            Some((nth, error)) if *nth == load_number => Some(error.clone()),
            _ => None,
        };
        if let Some(error) = scripted {
            drop(state);
            if error.is_fatal() {
                self.terminate();
            }
            return Err(error.into());
        }

        let hints = request.options.hints();
        if !hints.is_empty() {
            debug!("INSERT BULK {} WITH ({})", request.table, hints.join(", "));
        }

        let key = request.table.cache_key();
        if let Some(owner) = state.table_locks.get(&key) {
            // Bulk update locks are shared with other table-locked loads.
            if *owner != self.id && !request.options.table_lock {
                return Err(ServerError::new(
                    1222,
                    16,
                    51,
                    "Lock request time out period exceeded.",
                )
                .into());
            }
        }

        let table = state.tables.get_mut(&key).ok_or_else(|| {
            BulkLoadError::schema(format!("Invalid object name '{}'.", request.table))
        })?;
        let rows = build_rows(table, &request, &self.database)?;
        let count = rows.len();
        table.rows.extend(rows);

        let fired = if request.options.fire_triggers {
            table.triggers.clone()
        } else {
            Vec::new()
        };
        let record = BulkLoadRecord {
            table: table.name.clone(),
            columns: request.columns.iter().map(|c| c.name.clone()).collect(),
            rows: count,
            options: request.options.clone(),
        };

        state.trigger_firings.extend(fired);
        // Outside a transaction the lock ends with the batch.
        if request.options.table_lock && self.snapshot.is_some() {
            state.table_locks.entry(key).or_insert(self.id);
        }
        state.bulk_loads.push(record);
        Ok(count as u64)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.release_locks();
            let mut state = lock(&self.state);
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
        Ok(())
    }
}

/// Expand a batch to full table rows, generating identity values and
/// applying defaults. The whole batch is checked before anything is stored.
fn build_rows(
    table: &mut Table,
    request: &BulkInsert<'_>,
    database: &str,
) -> Result<Vec<Vec<SqlValue<'static>>>> {
    let options = request.options;
    let mut positions = Vec::with_capacity(request.columns.len());
    for column in request.columns {
        let position = table
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(&column.name))
            .ok_or_else(|| {
                ServerError::new(
                    207,
                    16,
                    1,
                    format!("Invalid column name '{}'.", column.name),
                )
            })?;
        let target = &table.columns[position];
        if target.is_identity && !options.keep_identity {
            return Err(ServerError::new(
                544,
                16,
                1,
                format!(
                    "Cannot insert explicit value for identity column in table '{}' \
                     when IDENTITY_INSERT is set to OFF.",
                    table.name.name
                ),
            )
            .into());
        }
        if let Some(key) = table.encrypted.get(&target.name.to_lowercase()) {
            if !options.allow_encrypted_value_modifications {
                let ty = target.type_display();
                return Err(ServerError::new(
                    206,
                    16,
                    2,
                    format!(
                        "Operand type clash: {} is incompatible with {} encrypted with \
                         (column_encryption_key_name = '{}')",
                        ty, ty, key
                    ),
                )
                .into());
            }
        }
        positions.push(position);
    }

    let mut next_identity = table.next_identity;
    let mut out = Vec::with_capacity(request.rows.len());
    for values in request.rows {
        if values.len() != positions.len() {
            return Err(BulkLoadError::usage(format!(
                "A bulk load row has {} values for {} columns",
                values.len(),
                positions.len()
            )));
        }

        let mut row: Vec<Option<SqlValue<'static>>> = vec![None; table.columns.len()];
        for (value, position) in values.iter().zip(&positions) {
            row[*position] = Some(value.clone());
        }

        let mut full = Vec::with_capacity(row.len());
        for (slot, column) in row.into_iter().zip(&table.columns) {
            let value = match slot {
                Some(v) if options.keep_nulls || !v.is_null() => {
                    if column.is_identity {
                        if let Some(n) = identity_number(&v) {
                            next_identity = next_identity.max(n + 1);
                        }
                    }
                    v
                }
                None if column.is_identity => {
                    let v = identity_value(column.sql_type, next_identity);
                    next_identity += 1;
                    v
                }
                // Unsent columns and NULLs take the column default.
                _ => table
                    .defaults
                    .get(&column.name.to_lowercase())
                    .cloned()
                    .unwrap_or(SqlValue::Null(column.sql_type.null_type())),
            };
            if value.is_null() && !column.is_nullable {
                return Err(ServerError::new(
                    515,
                    16,
                    2,
                    format!(
                        "Cannot insert the value NULL into column '{}', table '{}'; \
                         column does not allow nulls. INSERT fails.",
                        column.name, table.name
                    ),
                )
                .into());
            }
            full.push(value);
        }

        if options.check_constraints {
            check_row(table, &full, database)?;
        }
        out.push(full);
    }

    table.next_identity = next_identity;
    Ok(out)
}

fn check_row(table: &Table, row: &[SqlValue<'static>], database: &str) -> Result<()> {
    for constraint in &table.checks {
        let value = table
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(&constraint.column))
            .and_then(|p| row.get(p));
        let Some(value) = value else { continue };
        if !value.is_null() && !(constraint.check)(value) {
            return Err(ServerError::new(
                547,
                16,
                0,
                format!(
                    "The INSERT statement conflicted with the CHECK constraint \"{}\". \
                     The conflict occurred in database \"{}\", table \"{}\", column '{}'.",
                    constraint.name, database, table.name, constraint.column
                ),
            )
            .into());
        }
    }
    Ok(())
}

fn identity_value(sql_type: SqlType, n: i64) -> SqlValue<'static> {
    match sql_type {
        SqlType::TinyInt | SqlType::SmallInt => SqlValue::I16(n as i16),
        SqlType::Int => SqlValue::I32(n as i32),
        _ => SqlValue::I64(n),
    }
}

fn identity_number(value: &SqlValue<'_>) -> Option<i64> {
    match value {
        SqlValue::I16(v) => Some(i64::from(*v)),
        SqlValue::I32(v) => Some(i64::from(*v)),
        SqlValue::I64(v) => Some(*v),
        _ => None,
    }
}

/// Parse `RAISERROR('message', severity, state) [WITH LOG]`.
fn parse_raiserror(statement: &str) -> Result<ServerError> {
    let syntax = || ServerError::new(102, 15, 1, "Incorrect syntax near 'RAISERROR'.");

    let open = statement.find('(').ok_or_else(syntax)?;
    let close = statement.rfind(')').ok_or_else(syntax)?;
    let args = statement.get(open + 1..close).ok_or_else(syntax)?;

    let message_start = args.find('\'').ok_or_else(syntax)?;
    let message_end = args.rfind('\'').ok_or_else(syntax)?;
    if message_end <= message_start {
        return Err(syntax().into());
    }
    let message = args[message_start + 1..message_end].replace("''", "'");

    let mut numbers = args[message_end + 1..]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let severity: u8 = numbers
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(syntax)?;
    let state: u8 = numbers
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(syntax)?;

    Ok(ServerError::new(50000, severity, state, message))
}
