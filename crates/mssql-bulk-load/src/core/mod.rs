//! Core types shared by every layer of the bulk loader.
//!
//! - [`schema`]: destination column types and descriptors
//! - [`identifier`]: quoting and multi-part table names
//! - [`registry`]: per-table column registries and their shared cache
//! - [`value`]: SQL values moving from sources to the server
//! - [`traits`]: the transport seam (`Connector`, `Session`)

pub mod identifier;
pub mod registry;
pub mod schema;
pub mod traits;
pub mod value;

pub use identifier::{quote_mssql, TableName};
pub use registry::{ColumnRegistry, RegistryCache};
pub use schema::{ColumnDescriptor, SqlType, TypeFamily, MAX_LENGTH};
pub use traits::{BulkInsert, Connector, Session};
pub use value::{SqlNullType, SqlValue};
