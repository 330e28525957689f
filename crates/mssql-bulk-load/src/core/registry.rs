//! Destination column registry.
//!
//! A registry is built once per destination table from the server's catalog
//! and is immutable afterwards. [`RegistryCache`] lets several transfers to
//! the same table share one registry instead of asking the server again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::identifier::TableName;
use super::schema::{ColumnDescriptor, SqlType, MAX_DECIMAL_PRECISION, MAX_TEMPORAL_SCALE};
use crate::error::{BulkLoadError, Result};

/// Column metadata for one destination table, keyed by ordinal.
#[derive(Debug, Clone)]
pub struct ColumnRegistry {
    table: TableName,
    columns: BTreeMap<u16, ColumnDescriptor>,
}

impl ColumnRegistry {
    /// Build a registry, rejecting inconsistent metadata.
    pub fn new(table: TableName, columns: Vec<ColumnDescriptor>) -> Result<Self> {
        if columns.is_empty() {
            return Err(BulkLoadError::schema(format!(
                "Table {} has no columns or does not exist",
                table
            )));
        }

        let mut by_ordinal = BTreeMap::new();
        for column in columns {
            check_descriptor(&table, &column)?;
            if by_ordinal.values().any(|c: &ColumnDescriptor| c.name.eq_ignore_ascii_case(&column.name)) {
                return Err(BulkLoadError::schema(format!(
                    "Table {} declares column '{}' twice",
                    table, column.name
                )));
            }
            let ordinal = column.ordinal;
            if by_ordinal.insert(ordinal, column).is_some() {
                return Err(BulkLoadError::schema(format!(
                    "Table {} declares ordinal {} twice",
                    table, ordinal
                )));
            }
        }

        Ok(Self {
            table,
            columns: by_ordinal,
        })
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Look up a column by 1-based ordinal.
    pub fn get(&self, ordinal: u16) -> Option<&ColumnDescriptor> {
        self.columns.get(&ordinal)
    }

    /// Look up a column by name (case-insensitive, like the server's default collation).
    pub fn by_name(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .values()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Columns in ordinal order.
    pub fn columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.values()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

fn check_descriptor(table: &TableName, c: &ColumnDescriptor) -> Result<()> {
    let fail = |msg: String| {
        Err(BulkLoadError::schema(format!(
            "Table {} column '{}': {}",
            table, c.name, msg
        )))
    };

    if c.ordinal == 0 {
        return fail("ordinals are 1-based".into());
    }
    if c.name.is_empty() {
        return Err(BulkLoadError::schema(format!(
            "Table {} has a column without a name at ordinal {}",
            table, c.ordinal
        )));
    }
    if c.sql_type.has_length() && c.max_length == 0 {
        return fail(format!("{} requires a length", c.sql_type));
    }
    if c.sql_type.has_length() && c.max_length < -1 {
        return fail(format!("invalid length {}", c.max_length));
    }
    if matches!(c.sql_type, SqlType::Decimal | SqlType::Numeric) {
        if c.precision == 0 || c.precision > MAX_DECIMAL_PRECISION {
            return fail(format!("invalid precision {}", c.precision));
        }
        if c.scale > c.precision {
            return fail(format!(
                "scale {} exceeds precision {}",
                c.scale, c.precision
            ));
        }
    }
    if c.sql_type.has_fractional_seconds() && c.scale > MAX_TEMPORAL_SCALE {
        return fail(format!("invalid fractional second scale {}", c.scale));
    }
    Ok(())
}

/// Shared cache of registries keyed by table.
#[derive(Debug, Default)]
pub struct RegistryCache {
    entries: RwLock<HashMap<String, Arc<ColumnRegistry>>>,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &TableName) -> Option<Arc<ColumnRegistry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&table.cache_key())
            .cloned()
    }

    /// Store a registry; an existing entry for the same table wins.
    pub fn insert(&self, registry: ColumnRegistry) -> Arc<ColumnRegistry> {
        let key = registry.table().cache_key();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(key)
            .or_insert_with(|| {
                debug!("Caching column registry for {}", registry.table());
                Arc::new(registry)
            })
            .clone()
    }

    /// Drop the cached registry for a table (after DDL, for example).
    pub fn invalidate(&self, table: &TableName) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&table.cache_key());
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
