//! A TDS session.

use std::collections::HashMap;

use async_trait::async_trait;
use tiberius::{Client, Query, TokenRow};
use tokio::net::TcpStream;
use tokio_util::compat::Compat;
use tracing::debug;

use super::encode::{encode, null_for};
use crate::core::{quote_mssql, BulkInsert, ColumnDescriptor, Session, SqlType, TableName};
use crate::error::{BulkLoadError, Result, ServerError};
use crate::transfer::{BulkCopyOptions, OptionFlag};

type TdsClient = Client<Compat<TcpStream>>;

/// Session over a tiberius client.
pub struct TdsSession {
    client: Option<TdsClient>,
    /// Catalog metadata per table, used to lay out bulk load rows.
    layouts: HashMap<String, Vec<ColumnDescriptor>>,
}

impl TdsSession {
    pub(super) fn new(client: TdsClient) -> Self {
        Self {
            client: Some(client),
            layouts: HashMap::new(),
        }
    }

    fn client(&mut self) -> Result<&mut TdsClient> {
        self.client.as_mut().ok_or(BulkLoadError::ConnectionClosed)
    }

    async fn layout(&mut self, table: &TableName) -> Result<Vec<ColumnDescriptor>> {
        if let Some(columns) = self.layouts.get(&table.cache_key()) {
            return Ok(columns.clone());
        }
        self.describe_table(table).await
    }
}

/// Options `INSERT BULK` through tiberius cannot carry. It sends no load
/// hints and leaves identity columns out of the row layout.
fn unsupported_options(
    columns: &[ColumnDescriptor],
    options: &BulkCopyOptions,
) -> Vec<&'static str> {
    options
        .enabled()
        .into_iter()
        .filter(|flag| match flag {
            OptionFlag::UseInternalTransaction => false,
            OptionFlag::KeepIdentity => columns.iter().any(|c| c.is_identity),
            _ => true,
        })
        .map(OptionFlag::name)
        .collect()
}

/// Keep server errors typed so the caller can look at the severity.
fn map_error(error: tiberius::error::Error) -> BulkLoadError {
    match error {
        tiberius::error::Error::Server(token) => ServerError::new(
            token.code(),
            token.class(),
            token.state(),
            token.message().to_string(),
        )
        .into(),
        other => BulkLoadError::Tds(other),
    }
}

#[async_trait]
impl Session for TdsSession {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let client = self.client()?;
        client
            .simple_query(sql)
            .await
            .map_err(map_error)?
            .into_results()
            .await
            .map_err(map_error)?;
        Ok(0)
    }

    async fn ping(&mut self) -> Result<()> {
        let client = self.client()?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(map_error)?
            .into_row()
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn describe_table(&mut self, table: &TableName) -> Result<Vec<ColumnDescriptor>> {
        let catalog = match &table.database {
            Some(db) => format!("{}.", quote_mssql(db)?),
            None => String::new(),
        };
        let query = format!(
            r#"
            SELECT
                c.column_id,
                c.name,
                ty.name AS type_name,
                CAST(c.max_length AS INT) AS max_length,
                c.precision,
                c.scale,
                c.is_nullable,
                c.is_identity
            FROM {catalog}sys.columns c
            JOIN {catalog}sys.types ty ON c.user_type_id = ty.user_type_id
            JOIN {catalog}sys.tables t ON c.object_id = t.object_id
            JOIN {catalog}sys.schemas s ON t.schema_id = s.schema_id
            WHERE s.name = @P1 AND t.name = @P2
            ORDER BY c.column_id
        "#
        );

        let mut q = Query::new(query);
        q.bind(table.schema.as_str());
        q.bind(table.name.as_str());

        let client = self.client()?;
        let stream = q.query(client).await.map_err(map_error)?;
        let rows = stream.into_first_result().await.map_err(map_error)?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let ordinal: i32 = row.get(0).unwrap_or_default();
            let name: &str = row.get(1).unwrap_or_default();
            let type_name: &str = row.get(2).unwrap_or_default();
            let max_length: i32 = row.get(3).unwrap_or_default();
            let precision: u8 = row.get(4).unwrap_or_default();
            let scale: u8 = row.get(5).unwrap_or_default();

            let sql_type = SqlType::from_name(type_name).ok_or_else(|| {
                BulkLoadError::schema(format!(
                    "Column {} of {} has type {}, which bulk load does not support",
                    name, table, type_name
                ))
            })?;
            let ordinal = u16::try_from(ordinal).map_err(|_| {
                BulkLoadError::schema(format!("Column {} of {} has ordinal {}", name, table, ordinal))
            })?;

            let mut column = ColumnDescriptor::new(ordinal, name, sql_type);
            if sql_type.has_length() {
                let length = match max_length {
                    -1 => -1,
                    n if sql_type.is_unicode() => n / 2,
                    n => n,
                };
                column = column.length(length);
            }
            match sql_type {
                SqlType::Decimal | SqlType::Numeric => {
                    column = column.precision_scale(precision, scale)
                }
                t if t.has_fractional_seconds() => column = column.scale(scale),
                _ => {}
            }
            column.is_nullable = row.get::<bool, _>(6).unwrap_or(true);
            column.is_identity = row.get::<bool, _>(7).unwrap_or(false);
            columns.push(column);
        }

        debug!("Loaded {} columns for {}", columns.len(), table);
        self.layouts.insert(table.cache_key(), columns.clone());
        Ok(columns)
    }

    fn check_bulk_options(
        &self,
        columns: &[ColumnDescriptor],
        options: &BulkCopyOptions,
    ) -> Result<()> {
        let unsupported = unsupported_options(columns, options);
        if unsupported.is_empty() {
            return Ok(());
        }
        Err(BulkLoadError::usage(format!(
            "The bulk copy options {} are not supported over TDS.",
            unsupported.join(", ")
        )))
    }

    async fn bulk_insert(&mut self, request: BulkInsert<'_>) -> Result<u64> {
        self.check_bulk_options(request.columns, request.options)?;

        // The server fills identity columns; the load carries every other
        // column in table order.
        let layout: Vec<ColumnDescriptor> = self
            .layout(request.table)
            .await?
            .into_iter()
            .filter(|c| !c.is_identity)
            .collect();

        let positions: Vec<Option<usize>> = layout
            .iter()
            .map(|target| {
                request
                    .columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(&target.name))
            })
            .collect();

        let table = request.table.to_string();
        let mut token_rows = Vec::with_capacity(request.rows.len());
        for values in request.rows {
            let mut token_row = TokenRow::new();
            for (target, position) in layout.iter().zip(&positions) {
                let data = match position.and_then(|p| values.get(p)) {
                    Some(value) => encode(value, target, &table)?,
                    None => null_for(target.sql_type),
                };
                token_row.push(data);
            }
            token_rows.push(token_row);
        }

        let qualified = request.table.quoted()?;
        let client = self.client()?;
        let mut load = client.bulk_insert(&qualified).await.map_err(map_error)?;
        for token_row in token_rows {
            load.send(token_row).await.map_err(map_error)?;
        }
        let result = load.finalize().await.map_err(map_error)?;
        Ok(result.total())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close().await.map_err(map_error)?;
        }
        Ok(())
    }
}
