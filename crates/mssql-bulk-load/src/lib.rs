//! # mssql-bulk-load
//!
//! Validated bulk loading into Microsoft SQL Server.
//!
//! Rows are pulled from a [`RecordSource`], every value is checked against
//! the destination column on the client, and accepted rows are sent in
//! batches over the TDS bulk load protocol:
//!
//! - **Client-side validation** with precise diagnostics (column, value,
//!   limit) before anything reaches the server
//! - **Ordered batching** with at most one batch in flight
//! - **Internal transactions** for all-or-nothing loads
//! - **Connection lifecycle** with bounded login time, validity checks,
//!   abort and event listeners
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_bulk_load::core::SqlType;
//! use mssql_bulk_load::drivers::mssql::TdsConnector;
//! use mssql_bulk_load::{BulkCopy, Config, Connection, CsvFileRecord};
//!
//! #[tokio::main]
//! async fn main() -> mssql_bulk_load::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let conn = Connection::connect(&TdsConnector::new(), config.connection).await?;
//!
//!     let mut source = CsvFileRecord::open("orders.csv", true)?;
//!     source.declare_header_columns(SqlType::VarChar)?;
//!
//!     let mut copy = BulkCopy::with_options(config.bulk_copy);
//!     copy.set_destination_table_name("dbo.orders")?;
//!     let summary = copy.write_to_server(&conn, &mut source).await?;
//!     println!("Loaded {} rows", summary.rows_copied);
//!
//!     conn.close().await
//! }
//! ```

pub mod coerce;
pub mod config;
pub mod connection;
pub mod core;
pub mod drivers;
pub mod error;
pub mod record;
pub mod transfer;

// Re-exports for convenient access
pub use coerce::{coerce, CoercionContext, RejectReason, Rejection, ValidationOutcome};
pub use config::{Config, ConnectionProperties};
pub use connection::{
    AbortHandle, Connection, ConnectionEvent, ConnectionEventListener, ConnectionState,
};
pub use error::{BulkLoadError, ConnectFailure, ConnectFailureKind, ErrorKind, Result, ServerError};
pub use record::{CsvFileRecord, MemoryRecord, RecordSource, SourceColumn};
pub use transfer::{
    BulkCopy, BulkCopyOptions, ColumnMapping, ColumnRef, OptionFlag, TransferState,
    TransferSummary,
};
