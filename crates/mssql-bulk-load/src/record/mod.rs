//! Record sources.
//!
//! A [`RecordSource`] is a pull-based, single-pass cursor over rows. The bulk
//! copy orchestrator asks for the column layout once, then alternates
//! [`RecordSource::advance`] and [`RecordSource::row_values`] until the
//! source is exhausted.
//!
//! Two sources ship with the crate:
//!
//! - [`MemoryRecord`]: rows built in code
//! - [`CsvFileRecord`]: delimited text files read with the `csv` crate

mod delimited;
mod memory;

pub use self::delimited::CsvFileRecord;
pub use self::memory::MemoryRecord;

use crate::core::{SqlType, SqlValue};
use crate::error::{BulkLoadError, Result};

/// Metadata a source declares for one of its columns.
///
/// `precision` is the length for character and binary types. A precision
/// and scale of zero mean "unspecified".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceColumn {
    pub name: String,
    pub sql_type: SqlType,
    pub precision: u32,
    pub scale: u32,
    /// The source column is an auto-increment column.
    pub is_identity: bool,
    /// chrono format string used to parse temporal text in this column.
    pub format: Option<String>,
}

impl SourceColumn {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            precision: 0,
            scale: 0,
            is_identity: false,
            format: None,
        }
    }

    pub fn precision_scale(mut self, precision: u32, scale: u32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

/// A pull-based row cursor.
///
/// Contract:
/// - `column_ordinals` is stable for the lifetime of the source and lists
///   1-based ordinals in ascending order.
/// - `row_values` may only be called once after each successful `advance`,
///   and returns values aligned with `column_ordinals`.
/// - After `advance` returns `false` it keeps returning `false`.
pub trait RecordSource: Send {
    /// Ordinals of the columns this source produces, ascending.
    fn column_ordinals(&self) -> Vec<u16>;

    /// Metadata for one column.
    fn column(&self, ordinal: u16) -> Option<&SourceColumn>;

    /// Move to the next row. Returns `false` once exhausted.
    fn advance(&mut self) -> Result<bool>;

    /// Values of the current row.
    fn row_values(&mut self) -> Result<Vec<SqlValue<'static>>>;

    /// Format string for temporal text in a column.
    fn date_time_format(&self, ordinal: u16) -> Option<&str> {
        self.column(ordinal).and_then(|c| c.format.as_deref())
    }

    /// Rewind to the first row.
    fn reset(&mut self) -> Result<()> {
        Err(BulkLoadError::usage("This record source does not support reset"))
    }
}

/// Check declared source metadata before the first row is read.
pub fn validate_source_metadata(source: &dyn RecordSource) -> Result<()> {
    let ordinals = source.column_ordinals();
    if ordinals.is_empty() {
        return Err(BulkLoadError::usage(
            "The record source does not declare any columns",
        ));
    }

    for ordinal in ordinals {
        let column = source.column(ordinal).ok_or_else(|| {
            BulkLoadError::usage(format!(
                "The record source lists column {} but has no metadata for it",
                ordinal
            ))
        })?;

        if column.precision != 0 && column.scale != 0 && column.scale > column.precision {
            return Err(BulkLoadError::usage(format!(
                "Source column {} ({}): scale {} exceeds precision {}",
                ordinal, column.name, column.scale, column.precision
            )));
        }
    }

    Ok(())
}

pub(crate) fn missing_row_error() -> BulkLoadError {
    BulkLoadError::usage("row_values called without a successful advance")
}
