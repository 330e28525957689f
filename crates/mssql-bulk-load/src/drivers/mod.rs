//! Transport implementations of [`Connector`](crate::core::Connector) and
//! [`Session`](crate::core::Session).
//!
//! - [`mssql`]: SQL Server over TDS with tiberius
//! - [`memory`]: in-process loopback server for tests and offline validation

pub mod memory;
pub mod mssql;

pub use memory::{ConnectBehavior, MemoryServer};
pub use mssql::TdsConnector;
