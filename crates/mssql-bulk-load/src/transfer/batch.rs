//! Row buffer between validation and the transport.

use crate::core::SqlValue;

/// Validated rows waiting to be flushed, in source order.
#[derive(Debug, Default)]
pub struct TransferBatch {
    rows: Vec<Vec<SqlValue<'static>>>,
    limit: usize,
}

impl TransferBatch {
    /// A batch that is full at `batch_size` rows; 0 never fills.
    pub fn new(batch_size: usize) -> Self {
        Self {
            rows: Vec::with_capacity(batch_size.min(4096)),
            limit: batch_size,
        }
    }

    pub fn push(&mut self, row: Vec<SqlValue<'static>>) {
        self.rows.push(row);
    }

    pub fn is_full(&self) -> bool {
        self.limit != 0 && self.rows.len() >= self.limit
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<SqlValue<'static>>] {
        &self.rows
    }

    /// Drop the rows after the server acknowledged them.
    pub fn clear(&mut self) {
        self.rows.clear();
    }
}
