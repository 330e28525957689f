//! Source to destination column bindings.

use std::collections::HashSet;
use std::fmt;

use crate::core::{ColumnDescriptor, ColumnRegistry};
use crate::error::{BulkLoadError, Result};
use crate::record::RecordSource;

/// A column addressed by 1-based ordinal or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    Ordinal(u16),
    Name(String),
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnRef::Ordinal(o) => write!(f, "ordinal {}", o),
            ColumnRef::Name(n) => write!(f, "'{}'", n),
        }
    }
}

impl From<u16> for ColumnRef {
    fn from(ordinal: u16) -> Self {
        ColumnRef::Ordinal(ordinal)
    }
}

impl From<&str> for ColumnRef {
    fn from(name: &str) -> Self {
        ColumnRef::Name(name.to_string())
    }
}

impl From<String> for ColumnRef {
    fn from(name: String) -> Self {
        ColumnRef::Name(name)
    }
}

/// Explicit binding of one source column to one destination column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source: ColumnRef,
    pub destination: ColumnRef,
}

impl ColumnMapping {
    pub fn new(source: impl Into<ColumnRef>, destination: impl Into<ColumnRef>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// A resolved binding: where to read a value and where it goes.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    /// Index into the row returned by `RecordSource::row_values`.
    pub source_index: usize,
    pub source_ordinal: u16,
    pub dest: ColumnDescriptor,
}

/// Resolve the columns a transfer sends, in destination ordinal order.
///
/// Without explicit mappings, source columns are bound by position to the
/// destination's columns; identity columns are skipped unless
/// `keep_identity` is set.
pub(crate) fn resolve_bindings(
    source: &dyn RecordSource,
    registry: &ColumnRegistry,
    mappings: &[ColumnMapping],
    keep_identity: bool,
) -> Result<Vec<Binding>> {
    let ordinals = source.column_ordinals();

    let mut bindings = if mappings.is_empty() {
        positional(&ordinals, registry, keep_identity)?
    } else {
        explicit(source, &ordinals, registry, mappings, keep_identity)?
    };

    bindings.sort_by_key(|b| b.dest.ordinal);
    Ok(bindings)
}

fn positional(
    ordinals: &[u16],
    registry: &ColumnRegistry,
    keep_identity: bool,
) -> Result<Vec<Binding>> {
    let targets: Vec<&ColumnDescriptor> = registry
        .columns()
        .filter(|c| keep_identity || !c.is_identity)
        .collect();

    if ordinals.len() > targets.len() {
        return Err(BulkLoadError::schema(format!(
            "The source supplies {} columns but {} accepts only {}",
            ordinals.len(),
            registry.table(),
            targets.len()
        )));
    }

    Ok(ordinals
        .iter()
        .zip(targets)
        .enumerate()
        .map(|(index, (ordinal, dest))| Binding {
            source_index: index,
            source_ordinal: *ordinal,
            dest: dest.clone(),
        })
        .collect())
}

fn explicit(
    source: &dyn RecordSource,
    ordinals: &[u16],
    registry: &ColumnRegistry,
    mappings: &[ColumnMapping],
    keep_identity: bool,
) -> Result<Vec<Binding>> {
    let mut seen = HashSet::new();
    let mut bindings = Vec::with_capacity(mappings.len());

    for mapping in mappings {
        let source_index = match &mapping.source {
            ColumnRef::Ordinal(o) => ordinals.iter().position(|x| x == o),
            ColumnRef::Name(n) => ordinals.iter().position(|o| {
                source
                    .column(*o)
                    .map(|c| c.name.eq_ignore_ascii_case(n))
                    .unwrap_or(false)
            }),
        }
        .ok_or_else(|| {
            BulkLoadError::schema(format!(
                "The source column {} in a column mapping does not exist",
                mapping.source
            ))
        })?;

        let dest = match &mapping.destination {
            ColumnRef::Ordinal(o) => registry.get(*o),
            ColumnRef::Name(n) => registry.by_name(n),
        }
        .ok_or_else(|| {
            BulkLoadError::schema(format!(
                "The destination column {} does not exist in {}",
                mapping.destination,
                registry.table()
            ))
        })?;

        if !seen.insert(dest.ordinal) {
            return Err(BulkLoadError::schema(format!(
                "The destination column {} is mapped more than once",
                dest.name
            )));
        }

        if dest.is_identity && !keep_identity {
            tracing::debug!(
                "Skipping mapping to identity column {}; the server generates its values",
                dest.name
            );
            continue;
        }

        bindings.push(Binding {
            source_index,
            source_ordinal: ordinals[source_index],
            dest: dest.clone(),
        });
    }

    if bindings.is_empty() {
        return Err(BulkLoadError::schema(
            "The column mappings do not bind any destination column",
        ));
    }

    Ok(bindings)
}
