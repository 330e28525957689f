//! End-to-end bulk copy tests against the loopback server.

mod common;

use std::io::Write;
use std::time::Duration;

use chrono::NaiveDate;
use common::{RecordingListener, TestContext};
use mssql_bulk_load::core::{ColumnDescriptor, SqlNullType, SqlType, SqlValue};
use mssql_bulk_load::{
    BulkCopy, BulkCopyOptions, BulkLoadError, ColumnMapping, Connection, ConnectionState,
    CsvFileRecord,
    MemoryRecord, OptionFlag, RejectReason, ServerError, SourceColumn, TransferState,
};
use rust_decimal::Decimal;
use std::sync::Arc;

fn codes_table() -> Vec<ColumnDescriptor> {
    vec![
        ColumnDescriptor::new(1, "id", SqlType::Int).not_null(),
        ColumnDescriptor::new(2, "code", SqlType::VarChar).length(2),
    ]
}

fn code_rows(codes: &[String]) -> MemoryRecord {
    let mut source = MemoryRecord::new()
        .with_column(1, SourceColumn::new("id", SqlType::Int))
        .with_column(2, SourceColumn::new("code", SqlType::VarChar));
    for (i, code) in codes.iter().enumerate() {
        source.push_row(vec![SqlValue::I32(i as i32 + 1), SqlValue::from(code.clone())]);
    }
    source
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_csv_file_is_validated_and_loaded() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(vec![
        ColumnDescriptor::new(1, "id", SqlType::Int).not_null(),
        ColumnDescriptor::new(2, "name", SqlType::NVarChar).length(10),
        ColumnDescriptor::new(3, "amount", SqlType::Decimal).precision_scale(5, 2),
        ColumnDescriptor::new(4, "created", SqlType::SmallDateTime),
    ]);
    let conn = ctx.connect().await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "id,name,amount,created\n1,Zoë,12.5,2024-03-01 10:15:29.998\n2,Ann,,\n"
    )
    .unwrap();

    let mut source = CsvFileRecord::open(file.path(), true).unwrap();
    source.declare_header_columns(SqlType::VarChar).unwrap();

    let mut copy = BulkCopy::new();
    copy.set_destination_table_name(&table.to_string()).unwrap();
    let summary = copy.write_to_server(&conn, &mut source).await.unwrap();
    assert_eq!(summary.rows_copied, 2);

    let rows = ctx.server.rows(&table);
    assert_eq!(rows[0][0], SqlValue::I32(1));
    assert_eq!(rows[0][1], SqlValue::from("Zoë".to_string()));
    assert_eq!(rows[0][2], SqlValue::Decimal(Decimal::new(1250, 2)));
    assert_eq!(
        rows[0][3],
        SqlValue::DateTime(
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(10, 15, 0)
                .unwrap()
        )
    );
    assert!(rows[1][2].is_null());
    assert!(rows[1][3].is_null());
}

#[tokio::test]
async fn test_binary_values_are_padded_or_rejected() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(vec![
        ColumnDescriptor::new(1, "b", SqlType::Binary).length(5)
    ]);
    let conn = ctx.connect().await;

    let mut copy = BulkCopy::new();
    copy.set_destination_table_name(&table.to_string()).unwrap();

    let mut hex = MemoryRecord::new()
        .with_column(1, SourceColumn::new("b", SqlType::VarChar))
        .with_row(vec![SqlValue::from("010101".to_string())]);
    copy.write_to_server(&conn, &mut hex).await.unwrap();
    assert_eq!(
        ctx.server.rows(&table)[0][0],
        SqlValue::bytes_owned(vec![1, 1, 1, 0, 0])
    );

    let mut raw = MemoryRecord::new()
        .with_column(1, SourceColumn::new("b", SqlType::VarBinary))
        .with_row(vec![SqlValue::bytes_owned(b"helloo".to_vec())]);
    let err = copy.write_to_server(&conn, &mut raw).await.unwrap_err();
    let rejection = err.rejection().unwrap();
    assert!(matches!(
        rejection.reason,
        RejectReason::ValueTooLarge { value_size: 6, max_size: 5, .. }
    ));
    assert_eq!(rejection.column, "b");
    assert_eq!(ctx.server.rows(&table).len(), 1);
}

#[tokio::test]
async fn test_random_codes_in_batches() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;
    let codes = ctx.random_codes(50, 2);

    let mut copy = BulkCopy::with_options(BulkCopyOptions::default().with_batch_size(7));
    copy.set_destination_table_name(&table.to_string()).unwrap();
    let summary = copy
        .write_to_server(&conn, &mut code_rows(&codes))
        .await
        .unwrap();

    assert_eq!(summary.rows_copied, 50);
    assert_eq!(summary.batches, 8);
    let stored: Vec<SqlValue<'static>> = ctx
        .server
        .rows(&table)
        .into_iter()
        .map(|row| row[1].clone())
        .collect();
    let expected: Vec<SqlValue<'static>> = codes.into_iter().map(SqlValue::from).collect();
    assert_eq!(stored, expected);
}

#[tokio::test]
async fn test_batch_size_zero_sends_one_batch() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;
    let codes = ctx.random_codes(20, 2);

    let mut copy = BulkCopy::new();
    copy.set_destination_table_name(&table.to_string()).unwrap();
    let summary = copy
        .write_to_server(&conn, &mut code_rows(&codes))
        .await
        .unwrap();

    assert_eq!(summary.batches, 1);
    assert_eq!(ctx.server.bulk_loads()[0].rows, 20);
}

#[tokio::test]
async fn test_every_option_flag_reaches_the_session() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;

    for flag in OptionFlag::ALL {
        let options = BulkCopyOptions::default().with(flag, true);
        let mut copy = BulkCopy::with_options(options);
        copy.set_destination_table_name(&table.to_string()).unwrap();
        copy.write_to_server(&conn, &mut code_rows(&strings(&["ok"])))
            .await
            .unwrap();

        let sent = ctx.server.bulk_loads().last().unwrap().options.clone();
        for other in OptionFlag::ALL {
            assert_eq!(sent.get(other), other == flag, "{} with {}", other.name(), flag.name());
        }
    }
    assert_eq!(ctx.server.rows(&table).len(), OptionFlag::ALL.len());
}

#[tokio::test]
async fn test_internal_transaction_rolls_back_every_batch() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;
    ctx.server
        .fail_bulk_load(3, ServerError::new(2627, 14, 1, "Violation of PRIMARY KEY constraint."));

    let options = BulkCopyOptions::default()
        .with_batch_size(2)
        .with(OptionFlag::UseInternalTransaction, true);
    let mut copy = BulkCopy::with_options(options);
    copy.set_destination_table_name(&table.to_string()).unwrap();
    let err = copy
        .write_to_server(&conn, &mut code_rows(&strings(&["a", "b", "c", "d", "e"])))
        .await
        .unwrap_err();

    assert_eq!(err.server_error().unwrap().number, 2627);
    assert_eq!(copy.state(), TransferState::Failed);
    assert!(ctx.server.rows(&table).is_empty());
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_without_transaction_acknowledged_batches_stay() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;
    ctx.server
        .fail_bulk_load(3, ServerError::new(2627, 14, 1, "Violation of PRIMARY KEY constraint."));

    let mut copy = BulkCopy::with_options(BulkCopyOptions::default().with_batch_size(2));
    copy.set_destination_table_name(&table.to_string()).unwrap();
    copy.write_to_server(&conn, &mut code_rows(&strings(&["a", "b", "c", "d", "e"])))
        .await
        .unwrap_err();

    assert_eq!(ctx.server.rows(&table).len(), 4);
}

#[tokio::test]
async fn test_fatal_error_during_load_breaks_connection() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;
    let listener = Arc::new(RecordingListener::default());
    conn.add_connection_event_listener(listener.clone());
    ctx.server
        .fail_bulk_load(1, ServerError::new(50000, 20, 1, "The session was terminated."));

    let mut copy = BulkCopy::with_options(
        BulkCopyOptions::default().with(OptionFlag::UseInternalTransaction, true),
    );
    copy.set_destination_table_name(&table.to_string()).unwrap();
    let err = copy
        .write_to_server(&conn, &mut code_rows(&strings(&["a"])))
        .await
        .unwrap_err();

    assert!(err.server_error().unwrap().is_fatal());
    assert_eq!(conn.state(), ConnectionState::Broken);
    assert_eq!(listener.errors().len(), 1);

    let again = copy
        .write_to_server(&conn, &mut code_rows(&strings(&["a"])))
        .await
        .unwrap_err();
    assert_eq!(again.to_string(), "The connection is broken and must be closed.");
}

#[tokio::test(start_paused = true)]
async fn test_abort_interrupts_a_running_transfer() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;
    ctx.server.set_bulk_delay(Duration::from_secs(30));

    let mut copy = BulkCopy::new();
    copy.set_destination_table_name(&table.to_string()).unwrap();
    let mut source = code_rows(&strings(&["a", "b"]));
    let abort = conn.abort_handle();

    let (result, _) = tokio::join!(copy.write_to_server(&conn, &mut source), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        abort
            .abort(Some(&tokio::runtime::Handle::current()))
            .unwrap();
    });

    assert!(matches!(result, Err(BulkLoadError::Cancelled)));
    assert_eq!(conn.state(), ConnectionState::Broken);
    assert!(ctx.server.rows(&table).is_empty());

    for _ in 0..10 {
        if ctx.server.open_sessions() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ctx.server.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_validity_check_times_out_while_transfer_holds_session() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;
    ctx.server.set_bulk_delay(Duration::from_secs(30));

    let mut copy = BulkCopy::new();
    copy.set_destination_table_name(&table.to_string()).unwrap();
    let mut source = code_rows(&strings(&["a"]));

    let (result, (valid, waited)) = tokio::join!(copy.write_to_server(&conn, &mut source), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = tokio::time::Instant::now();
        let valid = conn.is_valid(1).await.unwrap();
        (valid, started.elapsed())
    });

    assert!(!valid);
    assert!(waited <= Duration::from_secs(2), "waited {:?}", waited);
    assert_eq!(result.unwrap().rows_copied, 1);
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(conn.is_valid(1).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_batch_times_out() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;
    ctx.server.set_bulk_delay(Duration::from_secs(5));

    let mut copy = BulkCopy::with_options(BulkCopyOptions::default().with_timeout_secs(1));
    copy.set_destination_table_name(&table.to_string()).unwrap();
    let err = copy
        .write_to_server(&conn, &mut code_rows(&strings(&["a"])))
        .await
        .unwrap_err();

    assert!(err
        .to_string()
        .contains("the batch was not acknowledged within 1 seconds"));
}

#[tokio::test]
async fn test_closed_connection_rejects_transfer() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;
    conn.close().await.unwrap();

    let mut copy = BulkCopy::new();
    copy.set_destination_table_name(&table.to_string()).unwrap();
    let err = copy
        .write_to_server(&conn, &mut code_rows(&strings(&["a"])))
        .await
        .unwrap_err();
    assert!(matches!(err, BulkLoadError::ConnectionClosed));
}

#[tokio::test]
async fn test_identity_generated_unless_kept() {
    let mut ctx = TestContext::new();
    let columns = vec![
        ColumnDescriptor::new(1, "id", SqlType::Int).identity(),
        ColumnDescriptor::new(2, "name", SqlType::VarChar).length(10),
    ];
    let generated = ctx.create_table(columns.clone());
    let kept = ctx.create_table(columns);
    let conn = ctx.connect().await;

    let mut names = MemoryRecord::new()
        .with_column(1, SourceColumn::new("name", SqlType::VarChar))
        .with_row(vec![SqlValue::from("x".to_string())])
        .with_row(vec![SqlValue::from("y".to_string())]);
    let mut copy = BulkCopy::new();
    copy.set_destination_table_name(&generated.to_string()).unwrap();
    copy.write_to_server(&conn, &mut names).await.unwrap();
    let ids: Vec<_> = ctx.server.rows(&generated).into_iter().map(|r| r[0].clone()).collect();
    assert_eq!(ids, vec![SqlValue::I32(1), SqlValue::I32(2)]);

    let mut explicit = MemoryRecord::new()
        .with_column(1, SourceColumn::new("id", SqlType::Int))
        .with_column(2, SourceColumn::new("name", SqlType::VarChar))
        .with_row(vec![SqlValue::I32(10), SqlValue::from("x".to_string())]);
    let mut copy =
        BulkCopy::with_options(BulkCopyOptions::default().with(OptionFlag::KeepIdentity, true));
    copy.set_destination_table_name(&kept.to_string()).unwrap();
    copy.write_to_server(&conn, &mut explicit).await.unwrap();
    assert_eq!(ctx.server.rows(&kept)[0][0], SqlValue::I32(10));
}

#[tokio::test]
async fn test_mappings_bind_by_name_in_any_order() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;

    let mut source = MemoryRecord::new()
        .with_column(1, SourceColumn::new("label", SqlType::VarChar))
        .with_column(2, SourceColumn::new("key", SqlType::Int))
        .with_row(vec![SqlValue::from("zz".to_string()), SqlValue::I32(7)]);

    let mut copy = BulkCopy::new();
    copy.set_destination_table_name(&table.to_string()).unwrap();
    copy.add_column_mapping(ColumnMapping::new("key", "id"));
    copy.add_column_mapping(ColumnMapping::new("label", "code"));
    copy.write_to_server(&conn, &mut source).await.unwrap();

    assert_eq!(
        ctx.server.rows(&table)[0],
        vec![SqlValue::I32(7), SqlValue::from("zz".to_string())]
    );
    assert_eq!(ctx.server.bulk_loads()[0].columns, vec!["id", "code"]);
}

// =============================================================================
// Option Semantics
// =============================================================================

fn status_source(statuses: &[Option<&str>]) -> MemoryRecord {
    let mut source = MemoryRecord::new()
        .with_column(1, SourceColumn::new("id", SqlType::Int))
        .with_column(2, SourceColumn::new("status", SqlType::VarChar));
    for (i, status) in statuses.iter().enumerate() {
        let value = match status {
            Some(s) => SqlValue::from(s.to_string()),
            None => SqlValue::Null(SqlNullType::String),
        };
        source.push_row(vec![SqlValue::I32(i as i32 + 1), value]);
    }
    source
}

fn quantity_source(quantities: &[i32]) -> MemoryRecord {
    let mut source = MemoryRecord::new()
        .with_column(1, SourceColumn::new("id", SqlType::Int))
        .with_column(2, SourceColumn::new("qty", SqlType::Int));
    for (i, qty) in quantities.iter().enumerate() {
        source.push_row(vec![SqlValue::I32(i as i32 + 1), SqlValue::I32(*qty)]);
    }
    source
}

fn non_negative(value: &SqlValue<'static>) -> bool {
    matches!(value, SqlValue::I32(n) if *n >= 0)
}

/// Everything a load leaves behind on the server.
#[derive(Debug, PartialEq)]
struct LoadOutcome {
    result: Result<u64, String>,
    rows: Vec<Vec<SqlValue<'static>>>,
    fired_triggers: Vec<String>,
}

/// Run the scenario that exercises `flag`, with the flag set to `on`.
async fn load_with_flag(flag: OptionFlag, on: bool) -> LoadOutcome {
    let mut ctx = TestContext::new();
    let mut options = BulkCopyOptions::default().with(flag, on);
    let mut mappings = Vec::new();
    let mut holder: Option<Connection> = None;

    let (table, mut source) = match flag {
        OptionFlag::UseInternalTransaction => {
            let table = ctx.create_table(codes_table());
            ctx.server.fail_bulk_load(
                2,
                ServerError::new(2627, 14, 1, "Violation of PRIMARY KEY constraint."),
            );
            options = options.with_batch_size(1);
            (table, code_rows(&strings(&["a", "b"])))
        }
        OptionFlag::AllowEncryptedValueModifications => {
            let table = ctx.create_table(vec![
                ColumnDescriptor::new(1, "id", SqlType::Int).not_null(),
                ColumnDescriptor::new(2, "ssn", SqlType::VarBinary).length(64),
            ]);
            ctx.server.encrypt_column(&table, "ssn", "CEK_Auto1");
            let source = MemoryRecord::new()
                .with_column(1, SourceColumn::new("id", SqlType::Int))
                .with_column(2, SourceColumn::new("ssn", SqlType::VarBinary))
                .with_row(vec![
                    SqlValue::I32(1),
                    SqlValue::bytes_owned(vec![0x01, 0x9f, 0x44]),
                ]);
            (table, source)
        }
        OptionFlag::CheckConstraints => {
            let table = ctx.create_table(vec![
                ColumnDescriptor::new(1, "id", SqlType::Int).not_null(),
                ColumnDescriptor::new(2, "qty", SqlType::Int),
            ]);
            ctx.server
                .add_check_constraint(&table, "CK_qty_non_negative", "qty", non_negative);
            (table, quantity_source(&[3, -5]))
        }
        OptionFlag::FireTriggers => {
            let table = ctx.create_table(codes_table());
            ctx.server.add_insert_trigger(&table, "trg_codes_audit");
            options = options.with_batch_size(2);
            (table, code_rows(&strings(&["a", "b", "c"])))
        }
        OptionFlag::KeepIdentity => {
            let table = ctx.create_table(vec![
                ColumnDescriptor::new(1, "id", SqlType::Int).not_null().identity(),
                ColumnDescriptor::new(2, "code", SqlType::VarChar).length(2),
            ]);
            mappings.push(ColumnMapping::new("id", "id"));
            mappings.push(ColumnMapping::new("code", "code"));
            let source = MemoryRecord::new()
                .with_column(1, SourceColumn::new("id", SqlType::Int))
                .with_column(2, SourceColumn::new("code", SqlType::VarChar))
                .with_row(vec![SqlValue::I32(40), SqlValue::from("zz".to_string())]);
            (table, source)
        }
        OptionFlag::KeepNulls => {
            let table = ctx.create_table(vec![
                ColumnDescriptor::new(1, "id", SqlType::Int).not_null(),
                ColumnDescriptor::new(2, "status", SqlType::VarChar).length(10),
            ]);
            ctx.server
                .set_column_default(&table, "status", SqlValue::from("new".to_string()));
            (table, status_source(&[None, Some("done")]))
        }
        OptionFlag::TableLock => {
            let table = ctx.create_table(codes_table());
            let conn = ctx.connect().await;
            conn.execute("BEGIN TRANSACTION").await.unwrap();
            let mut copy = BulkCopy::with_options(options.clone());
            copy.set_destination_table_name(&table.to_string()).unwrap();
            copy.write_to_server(&conn, &mut code_rows(&strings(&["a"])))
                .await
                .unwrap();
            holder = Some(conn);
            // The load under test comes from another connection without the flag.
            options = BulkCopyOptions::default();
            (table, code_rows(&strings(&["b"])))
        }
    };

    let conn = ctx.connect().await;
    let mut copy = BulkCopy::with_options(options);
    copy.set_destination_table_name(&table.to_string()).unwrap();
    for mapping in mappings {
        copy.add_column_mapping(mapping);
    }
    let result = copy
        .write_to_server(&conn, &mut source)
        .await
        .map(|summary| summary.rows_copied)
        .map_err(|e| e.to_string());

    let outcome = LoadOutcome {
        result,
        rows: ctx.server.rows(&table),
        fired_triggers: ctx.server.fired_triggers(),
    };
    if let Some(holder) = holder {
        holder.close().await.unwrap();
    }
    outcome
}

#[tokio::test]
async fn test_every_option_flag_changes_the_load() {
    for flag in OptionFlag::ALL {
        let off = load_with_flag(flag, false).await;
        let on = load_with_flag(flag, true).await;
        assert_ne!(off, on, "{} made no difference", flag.name());
    }
}

#[tokio::test]
async fn test_keep_nulls_overrides_column_default() {
    let defaulted = load_with_flag(OptionFlag::KeepNulls, false).await;
    assert_eq!(defaulted.result, Ok(2));
    assert_eq!(defaulted.rows[0][1], SqlValue::from("new".to_string()));
    assert_eq!(defaulted.rows[1][1], SqlValue::from("done".to_string()));

    let kept = load_with_flag(OptionFlag::KeepNulls, true).await;
    assert_eq!(kept.result, Ok(2));
    assert!(kept.rows[0][1].is_null());
    assert_eq!(kept.rows[1][1], SqlValue::from("done".to_string()));
}

#[tokio::test]
async fn test_check_constraints_only_enforced_when_asked() {
    let unchecked = load_with_flag(OptionFlag::CheckConstraints, false).await;
    assert_eq!(unchecked.result, Ok(2));
    assert_eq!(unchecked.rows[1][1], SqlValue::I32(-5));

    let checked = load_with_flag(OptionFlag::CheckConstraints, true).await;
    let message = checked.result.unwrap_err();
    assert!(message.contains("CHECK constraint \"CK_qty_non_negative\""), "{}", message);
    assert!(message.contains("column 'qty'"));
    assert!(checked.rows.is_empty());
}

#[tokio::test]
async fn test_fire_triggers_fires_once_per_batch() {
    let quiet = load_with_flag(OptionFlag::FireTriggers, false).await;
    assert_eq!(quiet.result, Ok(3));
    assert!(quiet.fired_triggers.is_empty());

    let fired = load_with_flag(OptionFlag::FireTriggers, true).await;
    assert_eq!(fired.result, Ok(3));
    assert_eq!(fired.fired_triggers, vec!["trg_codes_audit", "trg_codes_audit"]);
}

#[tokio::test]
async fn test_encrypted_column_needs_permission_to_modify() {
    let refused = load_with_flag(OptionFlag::AllowEncryptedValueModifications, false).await;
    let message = refused.result.unwrap_err();
    assert!(message.contains("Operand type clash"), "{}", message);
    assert!(message.contains("CEK_Auto1"));
    assert!(refused.rows.is_empty());

    let allowed = load_with_flag(OptionFlag::AllowEncryptedValueModifications, true).await;
    assert_eq!(allowed.result, Ok(1));
    assert_eq!(allowed.rows[0][1], SqlValue::bytes_owned(vec![0x01, 0x9f, 0x44]));
}

fn table_locked() -> BulkCopyOptions {
    BulkCopyOptions::default().with(OptionFlag::TableLock, true)
}

#[tokio::test]
async fn test_table_lock_blocks_other_loads_until_commit() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let holder = ctx.connect().await;
    let other = ctx.connect().await;

    holder.execute("BEGIN TRANSACTION").await.unwrap();
    let mut locked = BulkCopy::with_options(table_locked());
    locked.set_destination_table_name(&table.to_string()).unwrap();
    locked
        .write_to_server(&holder, &mut code_rows(&strings(&["a"])))
        .await
        .unwrap();
    assert_eq!(
        ctx.server.table_lock_owner(&table),
        Some(holder.client_connection_id().unwrap())
    );

    let mut plain = BulkCopy::new();
    plain.set_destination_table_name(&table.to_string()).unwrap();
    let err = plain
        .write_to_server(&other, &mut code_rows(&strings(&["b"])))
        .await
        .unwrap_err();
    assert_eq!(err.server_error().unwrap().number, 1222);
    assert_eq!(other.state(), ConnectionState::Connected);

    // Bulk update locks are shared between table-locked loads.
    locked
        .write_to_server(&other, &mut code_rows(&strings(&["c"])))
        .await
        .unwrap();

    holder.execute("COMMIT TRANSACTION").await.unwrap();
    assert_eq!(ctx.server.table_lock_owner(&table), None);
    plain
        .write_to_server(&other, &mut code_rows(&strings(&["d"])))
        .await
        .unwrap();
    assert_eq!(ctx.server.rows(&table).len(), 3);
}

#[tokio::test]
async fn test_table_lock_outside_transaction_ends_with_batch() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;

    let mut copy = BulkCopy::with_options(table_locked());
    copy.set_destination_table_name(&table.to_string()).unwrap();
    copy.write_to_server(&conn, &mut code_rows(&strings(&["a"])))
        .await
        .unwrap();
    assert_eq!(ctx.server.table_lock_owner(&table), None);
}

#[tokio::test]
async fn test_failed_commit_rolls_back_internal_transaction() {
    let mut ctx = TestContext::new();
    let table = ctx.create_table(codes_table());
    let conn = ctx.connect().await;
    ctx.server.fail_statement(
        "COMMIT",
        ServerError::new(
            3930,
            16,
            1,
            "The current transaction cannot be committed and cannot support operations \
             that write to the log file. Roll back the transaction.",
        ),
    );

    let options = BulkCopyOptions::default()
        .with_batch_size(1)
        .with(OptionFlag::UseInternalTransaction, true);
    let mut copy = BulkCopy::with_options(options);
    copy.set_destination_table_name(&table.to_string()).unwrap();
    let err = copy
        .write_to_server(&conn, &mut code_rows(&strings(&["a", "b"])))
        .await
        .unwrap_err();

    assert_eq!(err.server_error().unwrap().number, 3930);
    assert_eq!(copy.state(), TransferState::Failed);
    assert!(ctx.server.rows(&table).is_empty());
    assert_eq!(conn.state(), ConnectionState::Connected);

    // Nothing is left open on the session.
    let leftover = conn.execute("ROLLBACK TRANSACTION").await.unwrap_err();
    assert_eq!(leftover.server_error().unwrap().number, 3903);
}
