//! Bulk copy orchestration.
//!
//! [`BulkCopy`] pulls rows from a [`RecordSource`], validates every bound
//! value against the destination column, buffers accepted rows in a
//! [`TransferBatch`] and hands full batches to the session. One batch is in
//! flight at a time and rows keep their source order.
//!
//! A transfer moves through:
//!
//! ```text
//! Idle -> Streaming -> (Flushing <-> Streaming)* -> Completed | Failed
//! ```
//!
//! The first rejected value fails the transfer before its row is queued.
//! With `use_internal_transaction` every batch is rolled back on failure;
//! without it, batches already acknowledged stay committed.

mod batch;
mod mapping;
mod options;

pub use self::batch::TransferBatch;
pub use self::mapping::{ColumnMapping, ColumnRef};
pub use self::options::{BulkCopyOptions, OptionFlag, DEFAULT_BULK_COPY_TIMEOUT_SECS};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::mapping::{resolve_bindings, Binding};
use crate::coerce::{coerce, CoercionContext};
use crate::connection::Connection;
use crate::core::{
    BulkInsert, ColumnDescriptor, ColumnRegistry, RegistryCache, Session, TableName,
};
use crate::error::{BulkLoadError, Result};
use crate::record::{validate_source_metadata, RecordSource};

/// Where a transfer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Streaming,
    Flushing,
    Completed,
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Idle => "idle",
            TransferState::Streaming => "streaming",
            TransferState::Flushing => "flushing",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of a completed transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferSummary {
    /// Rows acknowledged by the server.
    pub rows_copied: u64,

    /// Batches sent.
    pub batches: u64,

    /// Wall time of the transfer.
    pub elapsed: Duration,
}

/// Copies rows from a record source into one destination table.
#[derive(Debug)]
pub struct BulkCopy {
    destination: Option<TableName>,
    options: BulkCopyOptions,
    mappings: Vec<ColumnMapping>,
    registry_cache: Option<Arc<RegistryCache>>,
    progress: Option<Arc<AtomicU64>>,
    state: TransferState,
}

impl Default for BulkCopy {
    fn default() -> Self {
        Self::new()
    }
}

impl BulkCopy {
    pub fn new() -> Self {
        Self::with_options(BulkCopyOptions::default())
    }

    pub fn with_options(options: BulkCopyOptions) -> Self {
        Self {
            destination: None,
            options,
            mappings: Vec::new(),
            registry_cache: None,
            progress: None,
            state: TransferState::Idle,
        }
    }

    /// Set the destination, e.g. `dbo.orders` or `[sales].[dbo].[order lines]`.
    pub fn set_destination_table_name(&mut self, name: &str) -> Result<()> {
        self.destination = Some(TableName::parse(name)?);
        Ok(())
    }

    pub fn destination_table_name(&self) -> Option<&TableName> {
        self.destination.as_ref()
    }

    pub fn options(&self) -> &BulkCopyOptions {
        &self.options
    }

    /// Replace the options used by the next transfer.
    pub fn set_options(&mut self, options: BulkCopyOptions) {
        self.options = options;
    }

    pub fn add_column_mapping(&mut self, mapping: ColumnMapping) {
        self.mappings.push(mapping);
    }

    pub fn clear_column_mappings(&mut self) {
        self.mappings.clear();
    }

    /// Share resolved column registries with other transfers.
    pub fn with_registry_cache(mut self, cache: Arc<RegistryCache>) -> Self {
        self.registry_cache = Some(cache);
        self
    }

    /// Add acknowledged row counts to a shared counter.
    pub fn with_progress_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.progress = Some(counter);
        self
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Copy every row of `source` into the destination table.
    ///
    /// The connection's session is held for the whole transfer. Aborting
    /// the connection from another task fails the transfer with
    /// `BulkLoadError::Cancelled`.
    pub async fn write_to_server(
        &mut self,
        conn: &Connection,
        source: &mut dyn RecordSource,
    ) -> Result<TransferSummary> {
        let table = self.destination.clone().ok_or_else(|| {
            BulkLoadError::usage("The destination table name is missing or empty.")
        })?;
        self.state = TransferState::Idle;

        validate_source_metadata(source)?;
        let mut slot = conn.lock_session().await?;
        let session = slot.as_mut().ok_or(BulkLoadError::ConnectionClosed)?;

        info!("Starting bulk copy into {}", table);
        let started = Instant::now();
        self.set_state(TransferState::Streaming);

        match self.run(conn, session.as_mut(), source, &table).await {
            Ok(mut summary) => {
                summary.elapsed = started.elapsed();
                self.set_state(TransferState::Completed);
                info!(
                    "Bulk copy into {} complete: {} rows in {} batches ({:?})",
                    table, summary.rows_copied, summary.batches, summary.elapsed
                );
                Ok(summary)
            }
            Err(e) => {
                self.set_state(TransferState::Failed);
                conn.observe_error(&e);
                Err(e)
            }
        }
    }

    async fn run(
        &mut self,
        conn: &Connection,
        session: &mut dyn Session,
        source: &mut dyn RecordSource,
        table: &TableName,
    ) -> Result<TransferSummary> {
        let cancel = conn.cancellation();

        let registry = self.resolve_registry(cancel, session, table).await?;
        let bindings = resolve_bindings(
            source,
            &registry,
            &self.mappings,
            self.options.keep_identity,
        )?;
        let columns: Vec<ColumnDescriptor> = bindings.iter().map(|b| b.dest.clone()).collect();
        session.check_bulk_options(&columns, &self.options)?;

        let in_transaction = self.options.use_internal_transaction;
        if in_transaction {
            cancellable(cancel, session.execute("BEGIN TRANSACTION")).await?;
        }

        let streamed = self
            .stream(conn, session, source, table, &bindings, &columns)
            .await;
        let outcome = match streamed {
            Ok(summary) if in_transaction => {
                cancellable(cancel, session.execute("COMMIT TRANSACTION"))
                    .await
                    .map(|_| summary)
            }
            other => other,
        };

        match outcome {
            Ok(summary) => Ok(summary),
            Err(e) => {
                conn.observe_error(&e);
                if in_transaction && !conn.state().is_terminal() {
                    match session.execute("ROLLBACK TRANSACTION").await {
                        Ok(_) => warn!("Bulk copy into {} rolled back: {}", table, e),
                        Err(rollback) => {
                            warn!("Rollback of bulk copy into {} failed: {}", table, rollback)
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn stream(
        &mut self,
        conn: &Connection,
        session: &mut dyn Session,
        source: &mut dyn RecordSource,
        table: &TableName,
        bindings: &[Binding],
        columns: &[ColumnDescriptor],
    ) -> Result<TransferSummary> {
        let cancel = conn.cancellation();
        let formats: Vec<Option<String>> = bindings
            .iter()
            .map(|b| source.date_time_format(b.source_ordinal).map(str::to_string))
            .collect();

        let mut batch = TransferBatch::new(self.options.batch_size);
        let mut summary = TransferSummary::default();
        let mut row_number: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(BulkLoadError::Cancelled);
            }
            if !source.advance()? {
                break;
            }
            row_number += 1;
            let raw = source.row_values()?;

            let mut row = Vec::with_capacity(bindings.len());
            for (binding, format) in bindings.iter().zip(&formats) {
                let value = raw.get(binding.source_index).ok_or_else(|| {
                    BulkLoadError::usage(format!(
                        "Row {} has {} values; source column {} is missing",
                        row_number,
                        raw.len(),
                        binding.source_ordinal
                    ))
                })?;
                let ctx = CoercionContext {
                    date_time_format: format.as_deref(),
                };
                let accepted = coerce(value, &binding.dest, &ctx)
                    .into_result()
                    .map_err(|r| {
                        debug!("Row {} rejected: {}", row_number, r);
                        BulkLoadError::from(r)
                    })?;
                row.push(accepted);
            }
            batch.push(row);

            if batch.is_full() {
                self.flush(cancel, session, table, columns, &mut batch, &mut summary)
                    .await?;
            }
        }

        if !batch.is_empty() {
            self.flush(cancel, session, table, columns, &mut batch, &mut summary)
                .await?;
        }
        Ok(summary)
    }

    async fn flush(
        &mut self,
        cancel: &CancellationToken,
        session: &mut dyn Session,
        table: &TableName,
        columns: &[ColumnDescriptor],
        batch: &mut TransferBatch,
        summary: &mut TransferSummary,
    ) -> Result<()> {
        self.set_state(TransferState::Flushing);

        let request = BulkInsert {
            table,
            columns,
            rows: batch.rows(),
            options: &self.options,
        };
        let limit = self.options.bulk_copy_timeout_secs;
        let send = session.bulk_insert(request);
        let acknowledged = if limit == 0 {
            cancellable(cancel, send).await?
        } else {
            let bounded = async {
                match tokio::time::timeout(Duration::from_secs(limit), send).await {
                    Ok(r) => r,
                    Err(_) => Err(BulkLoadError::transfer(
                        table.to_string(),
                        format!("the batch was not acknowledged within {} seconds", limit),
                    )),
                }
            };
            cancellable(cancel, bounded).await?
        };

        summary.batches += 1;
        summary.rows_copied += acknowledged;
        if let Some(progress) = &self.progress {
            progress.fetch_add(acknowledged, Ordering::Relaxed);
        }
        debug!(
            "Flushed batch {} into {}: {} rows",
            summary.batches, table, acknowledged
        );

        batch.clear();
        self.set_state(TransferState::Streaming);
        Ok(())
    }

    async fn resolve_registry(
        &self,
        cancel: &CancellationToken,
        session: &mut dyn Session,
        table: &TableName,
    ) -> Result<Arc<ColumnRegistry>> {
        if let Some(registry) = self.registry_cache.as_ref().and_then(|c| c.get(table)) {
            debug!("Using cached column registry for {}", table);
            return Ok(registry);
        }

        let columns = cancellable(cancel, session.describe_table(table)).await?;
        let registry = ColumnRegistry::new(table.clone(), columns)?;
        Ok(match &self.registry_cache {
            Some(cache) => cache.insert(registry),
            None => Arc::new(registry),
        })
    }

    fn set_state(&mut self, to: TransferState) {
        if self.state != to {
            debug!("Bulk copy: {} -> {}", self.state, to);
            self.state = to;
        }
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BulkLoadError::Cancelled),
        r = work => r,
    }
}
