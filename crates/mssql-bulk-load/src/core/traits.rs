//! Transport traits.
//!
//! - [`Connector`]: opens a [`Session`] for a set of connection properties
//! - [`Session`]: one authenticated server session
//!
//! The connection lifecycle manager and the bulk copy orchestrator only talk
//! to these traits. `drivers::mssql` implements them over TDS with tiberius;
//! `drivers::memory` implements them in-process for tests and offline
//! validation.

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::ConnectionProperties;
use crate::error::Result;
use crate::transfer::BulkCopyOptions;

use super::identifier::TableName;
use super::schema::ColumnDescriptor;
use super::value::SqlValue;

/// One flushed batch handed to the transport.
#[derive(Debug, Clone, Copy)]
pub struct BulkInsert<'a> {
    pub table: &'a TableName,
    /// Destination columns, in the order values appear in each row.
    pub columns: &'a [ColumnDescriptor],
    pub rows: &'a [Vec<SqlValue<'static>>],
    pub options: &'a BulkCopyOptions,
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session to the server named in `props`.
    ///
    /// Failures after the server was reached carry `client_connection_id`
    /// so they can be correlated with server-side traces. Implementations
    /// report every failure as `BulkLoadError::Connectivity`.
    async fn open(
        &self,
        props: &ConnectionProperties,
        client_connection_id: Uuid,
    ) -> Result<Box<dyn Session>>;
}

/// An open server session.
#[async_trait]
pub trait Session: Send {
    /// Execute a statement batch, returning rows affected when known.
    ///
    /// Server-reported errors come back as `BulkLoadError::Server` so the
    /// caller can look at their severity.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Lightweight round trip to check the session is alive.
    async fn ping(&mut self) -> Result<()>;

    /// Read destination column metadata from the catalog.
    async fn describe_table(&mut self, table: &TableName) -> Result<Vec<ColumnDescriptor>>;

    /// Fail with a usage error when this transport cannot honor `options`
    /// for a load into `columns`. Called once before the first batch.
    fn check_bulk_options(
        &self,
        _columns: &[ColumnDescriptor],
        _options: &BulkCopyOptions,
    ) -> Result<()> {
        Ok(())
    }

    /// Send one batch and wait for the server to acknowledge it.
    async fn bulk_insert(&mut self, request: BulkInsert<'_>) -> Result<u64>;

    /// Close the session.
    async fn close(&mut self) -> Result<()>;
}
