//! mssql-bulk-load CLI - validated bulk loading into SQL Server.

use clap::{Parser, Subcommand};
use mssql_bulk_load::core::{ColumnDescriptor, SqlType, TableName};
use mssql_bulk_load::drivers::{MemoryServer, TdsConnector};
use mssql_bulk_load::{
    BulkCopy, BulkCopyOptions, BulkLoadError, ColumnMapping, Config, Connection,
    ConnectionProperties, CsvFileRecord, OptionFlag, TransferSummary,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mssql-bulk-load")]
#[command(about = "Validated bulk loading into Microsoft SQL Server")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a CSV file into a table
    Load {
        /// CSV file to load
        #[arg(long)]
        csv: PathBuf,

        /// Destination table, e.g. dbo.orders
        #[arg(long)]
        table: String,

        #[command(flatten)]
        csv_options: CsvOptions,

        /// Override rows per batch (0 sends one batch)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Enable a bulk copy option by name (e.g. tableLock); repeatable
        #[arg(long = "option", value_name = "NAME")]
        options: Vec<String>,
    },

    /// Test the connection from the configuration file
    Check {
        /// Validity check timeout in seconds
        #[arg(long, default_value = "5")]
        timeout: i32,
    },

    /// Validate a CSV file against a table definition without a server
    Validate {
        /// YAML file with `table` and `columns`
        #[arg(long)]
        schema: PathBuf,

        /// CSV file to validate
        #[arg(long)]
        csv: PathBuf,

        #[command(flatten)]
        csv_options: CsvOptions,
    },
}

#[derive(clap::Args)]
struct CsvOptions {
    /// The file has no header row; columns bind by position
    #[arg(long)]
    no_header: bool,

    /// Field delimiter
    #[arg(long, default_value = ",")]
    delimiter: char,
}

/// Destination definition read by `validate`.
#[derive(Deserialize)]
struct SchemaFile {
    table: String,
    columns: Vec<ColumnDescriptor>,
}

#[derive(Serialize)]
struct LoadReport<'a> {
    table: &'a str,
    rows: u64,
    batches: u64,
    elapsed_ms: u128,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), BulkLoadError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(BulkLoadError::Config)?;

    match cli.command {
        Commands::Load {
            csv,
            table,
            csv_options,
            batch_size,
            options,
        } => {
            let config = Config::load(&cli.config)?;
            info!("Loaded configuration from {:?}", cli.config);

            let mut bulk_options = config.bulk_copy.clone();
            if let Some(size) = batch_size {
                bulk_options.batch_size = size;
            }
            apply_option_flags(&mut bulk_options, &options)?;

            let cancel = setup_signal_handler();
            let conn =
                Connection::connect_with_cancel(&TdsConnector::new(), config.connection, &cancel)
                    .await?;

            let abort = conn.abort_handle();
            let watcher = cancel.clone();
            tokio::spawn(async move {
                watcher.cancelled().await;
                let handle = tokio::runtime::Handle::current();
                if let Err(e) = abort.abort(Some(&handle)) {
                    eprintln!("Abort failed: {}", e);
                }
            });

            let result = copy_csv(&conn, &csv, &table, &csv_options, bulk_options).await;
            conn.close().await?;
            let summary = result?;
            report(&table, &summary, cli.output_json);
        }

        Commands::Check { timeout } => {
            let config = Config::load(&cli.config)?;
            let server = config.connection.server_display();
            let cancel = setup_signal_handler();
            let conn =
                Connection::connect_with_cancel(&TdsConnector::new(), config.connection, &cancel)
                    .await?;

            let valid = conn.is_valid(timeout).await?;
            let id = conn.client_connection_id()?;
            conn.close().await?;

            if !valid {
                return Err(BulkLoadError::transfer(
                    server,
                    "the connection did not answer the validity check",
                ));
            }
            println!("Connected to {} (ClientConnectionId:{})", server, id);
        }

        Commands::Validate {
            schema,
            csv,
            csv_options,
        } => {
            let schema = load_schema(&schema)?;
            let table = TableName::parse(&schema.table)?;

            let server = MemoryServer::new();
            server.create_table(table.clone(), schema.columns.clone());
            let conn =
                Connection::connect(&server, ConnectionProperties::new("localhost")).await?;

            let result = copy_csv(
                &conn,
                &csv,
                &schema.table,
                &csv_options,
                BulkCopyOptions::default(),
            )
            .await;
            conn.close().await?;
            let summary = result?;

            if cli.output_json {
                report(&schema.table, &summary, true);
            } else {
                println!("Validated {} rows for {}", summary.rows_copied, table);
            }
        }
    }

    Ok(())
}

async fn copy_csv(
    conn: &Connection,
    path: &Path,
    table: &str,
    csv_options: &CsvOptions,
    options: BulkCopyOptions,
) -> Result<TransferSummary, BulkLoadError> {
    let delimiter = u8::try_from(csv_options.delimiter).map_err(|_| {
        BulkLoadError::usage(format!(
            "The delimiter '{}' is not a single-byte character",
            csv_options.delimiter
        ))
    })?;
    let has_header = !csv_options.no_header;
    let mut source = CsvFileRecord::open_with_delimiter(path, has_header, delimiter)?;

    let mut copy = BulkCopy::with_options(options);
    copy.set_destination_table_name(table)?;

    if has_header {
        source.declare_header_columns(SqlType::VarChar)?;
        for name in source.headers() {
            copy.add_column_mapping(ColumnMapping::new(name.as_str(), name.as_str()));
        }
    } else {
        source.declare_positional_columns(SqlType::VarChar)?;
    }

    copy.write_to_server(conn, &mut source).await
}

fn apply_option_flags(
    options: &mut BulkCopyOptions,
    names: &[String],
) -> Result<(), BulkLoadError> {
    for name in names {
        let flag = OptionFlag::from_name(name).ok_or_else(|| {
            let known: Vec<&str> = OptionFlag::ALL.iter().map(|f| f.name()).collect();
            BulkLoadError::usage(format!(
                "Unknown bulk copy option '{}'. Known options: {}",
                name,
                known.join(", ")
            ))
        })?;
        options.set(flag, true);
    }
    Ok(())
}

fn load_schema(path: &Path) -> Result<SchemaFile, BulkLoadError> {
    let content = std::fs::read_to_string(path)?;
    let schema: SchemaFile = serde_yaml::from_str(&content)?;
    Ok(schema)
}

fn report(table: &str, summary: &TransferSummary, json: bool) {
    if json {
        let report = LoadReport {
            table,
            rows: summary.rows_copied,
            batches: summary.batches,
            elapsed_ms: summary.elapsed.as_millis(),
        };
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to serialize result: {}", e),
        }
    } else {
        println!(
            "Loaded {} rows into {} in {} batches ({:.2}s)",
            summary.rows_copied,
            table,
            summary.batches,
            summary.elapsed.as_secs_f64()
        );
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("Unknown verbosity '{}'", other)),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("Unknown log format '{}'", other)),
    }

    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Aborting...", name);
                    token.cancel();
                }
                Err(e) => eprintln!("Failed to install {} handler: {}", name, e),
            }
        });
    }

    cancel_token
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Aborting...");
            token.cancel();
        }
    });

    cancel_token
}
