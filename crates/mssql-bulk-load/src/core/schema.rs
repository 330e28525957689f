//! Destination column metadata.
//!
//! A [`ColumnDescriptor`] is what the validator checks every value against:
//! the SQL Server type, its declared length or precision/scale, nullability
//! and whether the server generates the value (identity).

use std::fmt;

use serde::{Deserialize, Serialize};

use super::value::SqlNullType;

/// Marker for `(max)` lengths.
pub const MAX_LENGTH: i32 = -1;

/// Largest precision SQL Server accepts for decimal/numeric.
pub const MAX_DECIMAL_PRECISION: u8 = 38;

/// Largest fractional-second scale for time, datetime2 and datetimeoffset.
pub const MAX_TEMPORAL_SCALE: u8 = 7;

/// SQL Server column types supported by the bulk loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlType {
    Char,
    VarChar,
    NChar,
    NVarChar,
    Binary,
    VarBinary,
    Bit,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Decimal,
    Numeric,
    Money,
    SmallMoney,
    Real,
    Float,
    Date,
    Time,
    DateTime,
    DateTime2,
    SmallDateTime,
    DateTimeOffset,
    UniqueIdentifier,
}

/// Broad type categories that drive validation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    /// Padded character data and fixed-size scalars (char, nchar, uniqueidentifier).
    FixedLength,
    /// Length-bounded character data (varchar, nvarchar).
    VariableLength,
    Temporal,
    Binary,
    Boolean,
    Numeric,
}

impl SqlType {
    /// Look up a type by its SQL Server name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        let t = match name.trim().to_lowercase().as_str() {
            "char" => SqlType::Char,
            "varchar" => SqlType::VarChar,
            "nchar" => SqlType::NChar,
            "nvarchar" => SqlType::NVarChar,
            "binary" => SqlType::Binary,
            "varbinary" => SqlType::VarBinary,
            "bit" => SqlType::Bit,
            "tinyint" => SqlType::TinyInt,
            "smallint" => SqlType::SmallInt,
            "int" => SqlType::Int,
            "bigint" => SqlType::BigInt,
            "decimal" => SqlType::Decimal,
            "numeric" => SqlType::Numeric,
            "money" => SqlType::Money,
            "smallmoney" => SqlType::SmallMoney,
            "real" => SqlType::Real,
            "float" => SqlType::Float,
            "date" => SqlType::Date,
            "time" => SqlType::Time,
            "datetime" => SqlType::DateTime,
            "datetime2" => SqlType::DateTime2,
            "smalldatetime" => SqlType::SmallDateTime,
            "datetimeoffset" => SqlType::DateTimeOffset,
            "uniqueidentifier" => SqlType::UniqueIdentifier,
            _ => return None,
        };
        Some(t)
    }

    /// SQL Server type name.
    pub fn name(self) -> &'static str {
        match self {
            SqlType::Char => "char",
            SqlType::VarChar => "varchar",
            SqlType::NChar => "nchar",
            SqlType::NVarChar => "nvarchar",
            SqlType::Binary => "binary",
            SqlType::VarBinary => "varbinary",
            SqlType::Bit => "bit",
            SqlType::TinyInt => "tinyint",
            SqlType::SmallInt => "smallint",
            SqlType::Int => "int",
            SqlType::BigInt => "bigint",
            SqlType::Decimal => "decimal",
            SqlType::Numeric => "numeric",
            SqlType::Money => "money",
            SqlType::SmallMoney => "smallmoney",
            SqlType::Real => "real",
            SqlType::Float => "float",
            SqlType::Date => "date",
            SqlType::Time => "time",
            SqlType::DateTime => "datetime",
            SqlType::DateTime2 => "datetime2",
            SqlType::SmallDateTime => "smalldatetime",
            SqlType::DateTimeOffset => "datetimeoffset",
            SqlType::UniqueIdentifier => "uniqueidentifier",
        }
    }

    pub fn family(self) -> TypeFamily {
        match self {
            SqlType::Char | SqlType::NChar | SqlType::UniqueIdentifier => TypeFamily::FixedLength,
            SqlType::VarChar | SqlType::NVarChar => TypeFamily::VariableLength,
            SqlType::Binary | SqlType::VarBinary => TypeFamily::Binary,
            SqlType::Bit => TypeFamily::Boolean,
            SqlType::TinyInt
            | SqlType::SmallInt
            | SqlType::Int
            | SqlType::BigInt
            | SqlType::Decimal
            | SqlType::Numeric
            | SqlType::Money
            | SqlType::SmallMoney
            | SqlType::Real
            | SqlType::Float => TypeFamily::Numeric,
            SqlType::Date
            | SqlType::Time
            | SqlType::DateTime
            | SqlType::DateTime2
            | SqlType::SmallDateTime
            | SqlType::DateTimeOffset => TypeFamily::Temporal,
        }
    }

    /// Values shorter than the declared length are padded (char, nchar, binary).
    pub fn is_padded(self) -> bool {
        matches!(self, SqlType::Char | SqlType::NChar | SqlType::Binary)
    }

    /// Whether the declared length is meaningful for this type.
    pub fn has_length(self) -> bool {
        matches!(
            self,
            SqlType::Char
                | SqlType::VarChar
                | SqlType::NChar
                | SqlType::NVarChar
                | SqlType::Binary
                | SqlType::VarBinary
        )
    }

    pub fn is_unicode(self) -> bool {
        matches!(self, SqlType::NChar | SqlType::NVarChar)
    }

    /// Types whose scale is a fractional-second precision.
    pub fn has_fractional_seconds(self) -> bool {
        matches!(
            self,
            SqlType::Time | SqlType::DateTime2 | SqlType::DateTimeOffset
        )
    }

    /// Type hint used when a NULL is sent for this type.
    pub fn null_type(self) -> SqlNullType {
        match self {
            SqlType::Char | SqlType::VarChar | SqlType::NChar | SqlType::NVarChar => {
                SqlNullType::String
            }
            SqlType::Binary | SqlType::VarBinary => SqlNullType::Bytes,
            SqlType::Bit => SqlNullType::Bool,
            SqlType::TinyInt | SqlType::SmallInt => SqlNullType::I16,
            SqlType::Int => SqlNullType::I32,
            SqlType::BigInt => SqlNullType::I64,
            SqlType::Decimal | SqlType::Numeric | SqlType::Money | SqlType::SmallMoney => {
                SqlNullType::Decimal
            }
            SqlType::Real => SqlNullType::F32,
            SqlType::Float => SqlNullType::F64,
            SqlType::Date => SqlNullType::Date,
            SqlType::Time => SqlNullType::Time,
            SqlType::DateTime | SqlType::DateTime2 | SqlType::SmallDateTime => {
                SqlNullType::DateTime
            }
            SqlType::DateTimeOffset => SqlNullType::DateTimeOffset,
            SqlType::UniqueIdentifier => SqlNullType::Uuid,
        }
    }

    /// Precision and scale the server assumes when none is declared.
    fn default_precision_scale(self) -> (u8, u8) {
        match self {
            SqlType::Decimal | SqlType::Numeric => (18, 0),
            SqlType::Money => (19, 4),
            SqlType::SmallMoney => (10, 4),
            SqlType::Time => (16, 7),
            SqlType::DateTime2 => (27, 7),
            SqlType::DateTimeOffset => (34, 7),
            SqlType::SmallDateTime => (16, 0),
            SqlType::DateTime => (23, 3),
            SqlType::Date => (10, 0),
            _ => (0, 0),
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn default_nullable() -> bool {
    true
}

/// Metadata for one destination column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ColumnSpec")]
pub struct ColumnDescriptor {
    /// 1-based position in the destination table.
    pub ordinal: u16,

    pub name: String,

    #[serde(rename = "type")]
    pub sql_type: SqlType,

    /// Declared length in characters (character types) or bytes (binary).
    /// `-1` means `(max)`; zero for types without a length.
    pub max_length: i32,

    pub precision: u8,

    pub scale: u8,

    pub is_nullable: bool,

    pub is_identity: bool,
}

/// Serialized column definition; omitted attributes take the type defaults.
#[derive(Deserialize)]
struct ColumnSpec {
    ordinal: u16,
    name: String,
    #[serde(rename = "type")]
    sql_type: SqlType,
    max_length: Option<i32>,
    precision: Option<u8>,
    scale: Option<u8>,
    #[serde(default = "default_nullable")]
    is_nullable: bool,
    #[serde(default)]
    is_identity: bool,
}

impl From<ColumnSpec> for ColumnDescriptor {
    fn from(spec: ColumnSpec) -> Self {
        let mut column = ColumnDescriptor::new(spec.ordinal, spec.name, spec.sql_type);
        if let Some(length) = spec.max_length {
            column.max_length = length;
        }
        if let Some(precision) = spec.precision {
            column.precision = precision;
        }
        if let Some(scale) = spec.scale {
            column.scale = scale;
        }
        column.is_nullable = spec.is_nullable;
        if spec.is_identity {
            column = column.identity();
        }
        column
    }
}

impl ColumnDescriptor {
    /// Create a nullable column with the type's default precision/scale.
    pub fn new(ordinal: u16, name: impl Into<String>, sql_type: SqlType) -> Self {
        let (precision, scale) = sql_type.default_precision_scale();
        let max_length = if sql_type.has_length() { 1 } else { 0 };
        Self {
            ordinal,
            name: name.into(),
            sql_type,
            max_length,
            precision,
            scale,
            is_nullable: true,
            is_identity: false,
        }
    }

    /// Set the declared length (characters or bytes).
    pub fn length(mut self, length: i32) -> Self {
        self.max_length = length;
        self
    }

    /// Declare a `(max)` length.
    pub fn max(mut self) -> Self {
        self.max_length = MAX_LENGTH;
        self
    }

    pub fn precision_scale(mut self, precision: u8, scale: u8) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    /// Set fractional-second scale for time, datetime2 and datetimeoffset.
    pub fn scale(mut self, scale: u8) -> Self {
        self.scale = scale;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self.is_nullable = false;
        self
    }

    /// Declared maximum length, or `None` for `(max)`.
    pub fn length_limit(&self) -> Option<usize> {
        if self.max_length == MAX_LENGTH {
            None
        } else {
            Some(self.max_length.max(0) as usize)
        }
    }

    /// Full type as written in DDL, e.g. `varchar(2)` or `decimal(5,2)`.
    pub fn type_display(&self) -> String {
        let t = self.sql_type;
        if t.has_length() {
            match self.length_limit() {
                None => format!("{}(max)", t),
                Some(n) => format!("{}({})", t, n),
            }
        } else if matches!(t, SqlType::Decimal | SqlType::Numeric) {
            format!("{}({},{})", t, self.precision, self.scale)
        } else if t.has_fractional_seconds() {
            format!("{}({})", t, self.scale)
        } else {
            t.name().to_string()
        }
    }
}
