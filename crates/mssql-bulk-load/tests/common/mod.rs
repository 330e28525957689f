//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use mssql_bulk_load::core::{ColumnDescriptor, TableName};
use mssql_bulk_load::drivers::MemoryServer;
use mssql_bulk_load::{
    Connection, ConnectionEvent, ConnectionEventListener, ConnectionProperties, ServerError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A loopback server plus a deterministic random source.
pub struct TestContext {
    pub server: MemoryServer,
    rng: StdRng,
    tables: usize,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            server: MemoryServer::new(),
            rng: StdRng::seed_from_u64(0x5eed),
            tables: 0,
        }
    }

    /// Create a uniquely named table in `dbo`.
    pub fn create_table(&mut self, columns: Vec<ColumnDescriptor>) -> TableName {
        self.tables += 1;
        let table = TableName::new("dbo", &format!("bulk_{}", self.tables));
        self.server.create_table(table.clone(), columns);
        table
    }

    pub fn props(&self) -> ConnectionProperties {
        ConnectionProperties::new("localhost")
    }

    pub async fn connect(&self) -> Connection {
        Connection::connect(&self.server, self.props()).await.unwrap()
    }

    /// Lowercase ASCII strings between 1 and `max_len` characters.
    pub fn random_codes(&mut self, count: usize, max_len: usize) -> Vec<String> {
        (0..count)
            .map(|_| {
                let len = self.rng.gen_range(1..=max_len);
                (0..len)
                    .map(|_| char::from(self.rng.gen_range(b'a'..=b'z')))
                    .collect()
            })
            .collect()
    }
}

/// Records every event it receives.
#[derive(Default)]
pub struct RecordingListener {
    closed: AtomicUsize,
    errors: Mutex<Vec<ServerError>>,
}

impl RecordingListener {
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<ServerError> {
        self.errors.lock().unwrap().clone()
    }
}

impl ConnectionEventListener for RecordingListener {
    fn connection_closed(&self, _event: &ConnectionEvent) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_error_occurred(&self, event: &ConnectionEvent) {
        if let Some(error) = &event.error {
            self.errors.lock().unwrap().push(error.clone());
        }
    }
}
