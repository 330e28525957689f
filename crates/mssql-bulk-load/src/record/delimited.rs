//! Delimited text file record source.
//!
//! Every field is produced as text (empty fields as NULL); the validator
//! converts text to the destination type, using the per-column format for
//! temporal columns.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{missing_row_error, RecordSource, SourceColumn};
use crate::core::{SqlType, SqlValue};
use crate::error::{BulkLoadError, Result};

type BoxedReader = Box<dyn Read + Send>;

/// A CSV (or other single-byte delimited) file.
pub struct CsvFileRecord {
    path: Option<PathBuf>,
    has_header: bool,
    delimiter: u8,
    reader: csv::Reader<BoxedReader>,
    headers: Vec<String>,
    columns: BTreeMap<u16, SourceColumn>,
    record: csv::StringRecord,
    has_current: bool,
    exhausted: bool,
    timestamp_with_timezone_format: Option<String>,
    time_with_timezone_format: Option<String>,
}

impl CsvFileRecord {
    /// Open a comma-delimited file.
    pub fn open(path: impl AsRef<Path>, has_header: bool) -> Result<Self> {
        Self::open_with_delimiter(path, has_header, b',')
    }

    pub fn open_with_delimiter(
        path: impl AsRef<Path>,
        has_header: bool,
        delimiter: u8,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = open_file(&path)?;
        let mut source = Self::build(reader, has_header, delimiter)?;
        debug!("Opened {} (header: {})", path.display(), has_header);
        source.path = Some(path);
        Ok(source)
    }

    /// Read from any byte stream. Such a source cannot be reset.
    pub fn from_reader(reader: impl Read + Send + 'static, has_header: bool) -> Result<Self> {
        Self::build(Box::new(reader), has_header, b',')
    }

    fn build(reader: BoxedReader, has_header: bool, delimiter: u8) -> Result<Self> {
        let mut reader = csv_reader(reader, has_header, delimiter);
        let headers = if has_header {
            reader.headers()?.iter().map(|h| h.trim().to_string()).collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            path: None,
            has_header,
            delimiter,
            reader,
            headers,
            columns: BTreeMap::new(),
            record: csv::StringRecord::new(),
            has_current: false,
            exhausted: false,
            timestamp_with_timezone_format: None,
            time_with_timezone_format: None,
        })
    }

    /// Declare a column read from a 1-based position in the file.
    ///
    /// An empty `name` takes the header name at that position.
    pub fn add_column_metadata(
        &mut self,
        position_in_file: u16,
        name: &str,
        sql_type: SqlType,
        precision: u32,
        scale: u32,
    ) -> Result<()> {
        if position_in_file == 0 {
            return Err(BulkLoadError::usage(
                "Column positions in a delimited file are 1-based",
            ));
        }
        let name = if name.is_empty() {
            self.headers
                .get(usize::from(position_in_file) - 1)
                .cloned()
                .unwrap_or_default()
        } else {
            name.to_string()
        };
        self.columns.insert(
            position_in_file,
            SourceColumn::new(name, sql_type).precision_scale(precision, scale),
        );
        Ok(())
    }

    /// Like [`add_column_metadata`](Self::add_column_metadata) with a chrono
    /// format for temporal text.
    pub fn add_column_metadata_with_format(
        &mut self,
        position_in_file: u16,
        name: &str,
        sql_type: SqlType,
        precision: u32,
        scale: u32,
        format: &str,
    ) -> Result<()> {
        self.add_column_metadata(position_in_file, name, sql_type, precision, scale)?;
        if let Some(column) = self.columns.get_mut(&position_in_file) {
            column.format = Some(format.to_string());
        }
        Ok(())
    }

    /// Declare every header column with the same type.
    pub fn declare_header_columns(&mut self, sql_type: SqlType) -> Result<()> {
        if self.headers.is_empty() {
            return Err(BulkLoadError::usage(
                "Cannot declare columns from a header: the file has no header row",
            ));
        }
        for (i, name) in self.headers.clone().iter().enumerate() {
            let position = u16::try_from(i + 1)
                .map_err(|_| BulkLoadError::usage("Too many columns in header"))?;
            self.add_column_metadata(position, name, sql_type, 0, 0)?;
        }
        Ok(())
    }

    /// Declare one column per field of the first record, named `column1`,
    /// `column2`, and so on. The file is re-read from the start afterwards.
    pub fn declare_positional_columns(&mut self, sql_type: SqlType) -> Result<()> {
        let width = if self.reader.read_record(&mut self.record)? {
            self.record.len()
        } else {
            0
        };
        self.reset()?;
        for i in 1..=width {
            let position = u16::try_from(i)
                .map_err(|_| BulkLoadError::usage("Too many fields in the first record"))?;
            self.add_column_metadata(position, &format!("column{}", position), sql_type, 0, 0)?;
        }
        Ok(())
    }

    /// Format for datetimeoffset columns without their own format.
    pub fn set_timestamp_with_timezone_format(&mut self, format: impl Into<String>) {
        self.timestamp_with_timezone_format = Some(format.into());
    }

    /// Format for time columns without their own format.
    pub fn set_time_with_timezone_format(&mut self, format: impl Into<String>) {
        self.time_with_timezone_format = Some(format.into());
    }

    /// Header names, if the file has a header row.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl RecordSource for CsvFileRecord {
    fn column_ordinals(&self) -> Vec<u16> {
        self.columns.keys().copied().collect()
    }

    fn column(&self, ordinal: u16) -> Option<&SourceColumn> {
        self.columns.get(&ordinal)
    }

    fn advance(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        if self.reader.read_record(&mut self.record)? {
            self.has_current = true;
            Ok(true)
        } else {
            self.has_current = false;
            self.exhausted = true;
            Ok(false)
        }
    }

    fn row_values(&mut self) -> Result<Vec<SqlValue<'static>>> {
        if !self.has_current {
            return Err(missing_row_error());
        }
        self.has_current = false;

        let line = self.record.position().map(|p| p.line()).unwrap_or(0);
        self.columns
            .iter()
            .map(|(position, column)| {
                let field = self
                    .record
                    .get(usize::from(*position) - 1)
                    .ok_or_else(|| {
                        BulkLoadError::usage(format!(
                            "Line {}: column {} ({}) is missing; the line has {} fields",
                            line,
                            position,
                            column.name,
                            self.record.len()
                        ))
                    })?;
                if field.is_empty() {
                    Ok(SqlValue::Null(column.sql_type.null_type()))
                } else {
                    Ok(SqlValue::text_owned(field.to_string()))
                }
            })
            .collect()
    }

    fn date_time_format(&self, ordinal: u16) -> Option<&str> {
        let column = self.columns.get(&ordinal)?;
        if let Some(format) = column.format.as_deref() {
            return Some(format);
        }
        match column.sql_type {
            SqlType::DateTimeOffset => self.timestamp_with_timezone_format.as_deref(),
            SqlType::Time => self.time_with_timezone_format.as_deref(),
            _ => None,
        }
    }

    fn reset(&mut self) -> Result<()> {
        let path = self.path.as_ref().ok_or_else(|| {
            BulkLoadError::usage("A record source built from a stream cannot be reset")
        })?;
        let mut reader = csv_reader(open_file(path)?, self.has_header, self.delimiter);
        if self.has_header {
            reader.headers()?;
        }
        self.reader = reader;
        self.has_current = false;
        self.exhausted = false;
        Ok(())
    }
}

fn open_file(path: &Path) -> Result<BoxedReader> {
    let file = File::open(path)?;
    Ok(Box::new(BufReader::new(file)))
}

fn csv_reader(reader: BoxedReader, has_header: bool, delimiter: u8) -> csv::Reader<BoxedReader> {
    csv::ReaderBuilder::new()
        .has_headers(has_header)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(reader)
}
