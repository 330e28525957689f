//! SQL Server driver over TDS.
//!
//! - [`TdsConnector`]: TCP connect (or SQL Browser lookup for named
//!   instances), TLS and SQL authentication through tiberius
//! - `session`: statements, catalog lookups and TDS bulk load
//! - `encode`: validated values to tiberius `ColumnData`

mod connector;
mod encode;
mod session;

pub use connector::TdsConnector;
