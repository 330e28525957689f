//! Client-side value validation and coercion.
//!
//! Every value is checked against its destination column before it is
//! queued, so an invalid value is reported with the column and value that
//! caused it instead of failing a whole batch on the server.
//!
//! Rules are applied in order:
//!
//! 1. NULL against a non-nullable column is rejected.
//! 2. The value's kind must be convertible to the destination family.
//! 3. The converted value must fit the declared length, precision or range.
//!
//! Accepted values come back shaped for the wire: padded to fixed lengths,
//! rounded to the column's scale, hex text decoded to bytes.

mod numeric;
mod temporal;
mod text;

use std::fmt;

use crate::core::{ColumnDescriptor, SqlType, SqlValue, TypeFamily};

/// Per-value information that comes from the record source.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoercionContext<'a> {
    /// chrono format for temporal text in this column.
    pub date_time_format: Option<&'a str>,
}

/// Result of validating one value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Accepted(SqlValue<'static>),
    Rejected(Rejection),
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationOutcome::Accepted(_))
    }

    /// Turn the outcome into a `Result`, for use with `?`.
    pub fn into_result(self) -> Result<SqlValue<'static>, Rejection> {
        match self {
            ValidationOutcome::Accepted(v) => Ok(v),
            ValidationOutcome::Rejected(r) => Err(r),
        }
    }
}

/// Unit of a length limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    Characters,
    Bytes,
    Digits,
}

impl fmt::Display for SizeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SizeUnit::Characters => "characters",
            SizeUnit::Bytes => "bytes",
            SizeUnit::Digits => "digits",
        })
    }
}

/// Why a value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The value is longer than the declared length or precision.
    ValueTooLarge {
        dest_type: String,
        value_size: usize,
        max_size: usize,
        unit: SizeUnit,
    },
    /// The value's kind is compatible but this value cannot be represented.
    ConversionFailed { from: String, to: String },
    /// NULL sent to a non-nullable column.
    NullNotAllowed { dest_type: String },
    /// The value's kind can never be converted to the destination type.
    IncompatibleType { from: String, to: String },
    /// The value is outside the destination type's range.
    OutOfRange { dest_type: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ValueTooLarge {
                dest_type,
                value_size,
                max_size,
                unit,
            } => write!(
                f,
                "value too large for destination {}: the value has {} {} but at most {} are allowed",
                dest_type, value_size, unit, max_size
            ),
            RejectReason::ConversionFailed { from, to } => {
                write!(f, "conversion failed from {} to {}", from, to)
            }
            RejectReason::NullNotAllowed { dest_type } => write!(
                f,
                "null value not allowed for non-nullable destination of type {}",
                dest_type
            ),
            RejectReason::IncompatibleType { from, to } => {
                write!(f, "cannot convert a value of type {} to {}", from, to)
            }
            RejectReason::OutOfRange { dest_type } => {
                write!(f, "value out of range for destination {}", dest_type)
            }
        }
    }
}

/// A rejected value with the column it was headed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub ordinal: u16,
    pub column: String,
    /// Short rendering of the offending value.
    pub value: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (column {} [{}], value {})",
            self.reason, self.ordinal, self.column, self.value
        )
    }
}

impl std::error::Error for Rejection {}

/// Validate `value` against `dest` and convert it to the destination shape.
pub fn coerce(
    value: &SqlValue<'_>,
    dest: &ColumnDescriptor,
    ctx: &CoercionContext<'_>,
) -> ValidationOutcome {
    match coerce_value(value, dest, ctx) {
        Ok(v) => ValidationOutcome::Accepted(v),
        Err(reason) => ValidationOutcome::Rejected(Rejection {
            reason,
            ordinal: dest.ordinal,
            column: dest.name.clone(),
            value: value.describe(),
        }),
    }
}

fn coerce_value(
    value: &SqlValue<'_>,
    dest: &ColumnDescriptor,
    ctx: &CoercionContext<'_>,
) -> Result<SqlValue<'static>, RejectReason> {
    if value.is_null() {
        if !dest.is_nullable {
            return Err(RejectReason::NullNotAllowed {
                dest_type: dest.type_display(),
            });
        }
        return Ok(SqlValue::Null(dest.sql_type.null_type()));
    }

    match dest.sql_type.family() {
        TypeFamily::FixedLength if dest.sql_type == SqlType::UniqueIdentifier => {
            text::to_guid(value, dest)
        }
        TypeFamily::FixedLength | TypeFamily::VariableLength => text::to_character(value, dest),
        TypeFamily::Binary => text::to_binary(value, dest),
        TypeFamily::Boolean => numeric::to_bit(value, dest),
        TypeFamily::Numeric => numeric::to_numeric(value, dest),
        TypeFamily::Temporal => temporal::to_temporal(value, dest, ctx),
    }
}

fn incompatible(value: &SqlValue<'_>, dest: &ColumnDescriptor) -> RejectReason {
    RejectReason::IncompatibleType {
        from: value.kind_name().to_string(),
        to: dest.sql_type.name().to_string(),
    }
}

fn conversion_failed(from: &str, dest: &ColumnDescriptor) -> RejectReason {
    RejectReason::ConversionFailed {
        from: from.to_string(),
        to: dest.sql_type.name().to_string(),
    }
}

fn out_of_range(dest: &ColumnDescriptor) -> RejectReason {
    RejectReason::OutOfRange {
        dest_type: dest.type_display(),
    }
}
