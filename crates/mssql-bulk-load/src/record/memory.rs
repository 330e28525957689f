//! In-memory record source.

use std::collections::BTreeMap;

use super::{missing_row_error, RecordSource, SourceColumn};
use crate::core::SqlValue;
use crate::error::{BulkLoadError, Result};

/// Rows held in memory, built with [`MemoryRecord::with_column`] and
/// [`MemoryRecord::with_row`].
#[derive(Debug, Clone, Default)]
pub struct MemoryRecord {
    columns: BTreeMap<u16, SourceColumn>,
    rows: Vec<Vec<SqlValue<'static>>>,
    next: usize,
    current: Option<usize>,
}

impl MemoryRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a column at a 1-based ordinal.
    pub fn with_column(mut self, ordinal: u16, column: SourceColumn) -> Self {
        self.columns.insert(ordinal, column);
        self
    }

    /// Append a row; values are in ascending ordinal order.
    pub fn with_row(mut self, row: Vec<SqlValue<'static>>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn push_row(&mut self, row: Vec<SqlValue<'static>>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl RecordSource for MemoryRecord {
    fn column_ordinals(&self) -> Vec<u16> {
        self.columns.keys().copied().collect()
    }

    fn column(&self, ordinal: u16) -> Option<&SourceColumn> {
        self.columns.get(&ordinal)
    }

    fn advance(&mut self) -> Result<bool> {
        if self.next < self.rows.len() {
            self.current = Some(self.next);
            self.next += 1;
            Ok(true)
        } else {
            self.current = None;
            Ok(false)
        }
    }

    fn row_values(&mut self) -> Result<Vec<SqlValue<'static>>> {
        let index = self.current.take().ok_or_else(missing_row_error)?;
        let row = self.rows[index].clone();
        if row.len() != self.columns.len() {
            return Err(BulkLoadError::usage(format!(
                "Row {} has {} values but {} columns are declared",
                index + 1,
                row.len(),
                self.columns.len()
            )));
        }
        Ok(row)
    }

    fn reset(&mut self) -> Result<()> {
        self.next = 0;
        self.current = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlType;

    fn two_rows() -> MemoryRecord {
        MemoryRecord::new()
            .with_column(1, SourceColumn::new("id", SqlType::Int))
            .with_column(2, SourceColumn::new("name", SqlType::VarChar))
            .with_row(vec![SqlValue::I32(1), SqlValue::from("a".to_string())])
            .with_row(vec![SqlValue::I32(2), SqlValue::from("b".to_string())])
    }

    #[test]
    fn test_advance_then_values() {
        let mut source = two_rows();
        assert_eq!(source.column_ordinals(), vec![1, 2]);

        assert!(source.advance().unwrap());
        assert_eq!(source.row_values().unwrap()[0], SqlValue::I32(1));
        assert!(source.advance().unwrap());
        assert_eq!(source.row_values().unwrap()[0], SqlValue::I32(2));
        assert!(!source.advance().unwrap());
        assert!(!source.advance().unwrap());
    }

    #[test]
    fn test_values_require_advance() {
        let mut source = two_rows();
        assert!(source.row_values().is_err());

        source.advance().unwrap();
        source.row_values().unwrap();
        assert!(source.row_values().is_err());
    }

    #[test]
    fn test_reset_replays_rows() {
        let mut source = two_rows();
        while source.advance().unwrap() {
            source.row_values().unwrap();
        }
        source.reset().unwrap();
        assert!(source.advance().unwrap());
        assert_eq!(source.row_values().unwrap()[0], SqlValue::I32(1));
    }

    #[test]
    fn test_short_row_is_usage_error() {
        let mut source = MemoryRecord::new()
            .with_column(1, SourceColumn::new("a", SqlType::Int))
            .with_column(2, SourceColumn::new("b", SqlType::Int))
            .with_row(vec![SqlValue::I32(1)]);
        source.advance().unwrap();
        assert!(matches!(source.row_values(), Err(BulkLoadError::Usage(_))));
    }
}
