//! Character, binary and uniqueidentifier destinations.

use std::borrow::Cow;

use uuid::Uuid;

use super::{conversion_failed, incompatible, RejectReason, SizeUnit};
use crate::core::{ColumnDescriptor, SqlType, SqlValue};

pub(super) fn to_character(
    value: &SqlValue<'_>,
    dest: &ColumnDescriptor,
) -> Result<SqlValue<'static>, RejectReason> {
    let text: Cow<'_, str> = match value {
        SqlValue::Text(s) => Cow::Borrowed(s.as_ref()),
        SqlValue::Bytes(b) => Cow::Owned(hex::encode_upper(b.as_ref())),
        SqlValue::Null(_) => return Err(incompatible(value, dest)),
        other => Cow::Owned(other.to_string()),
    };

    let length = text.chars().count();
    let Some(max) = dest.length_limit() else {
        return Ok(SqlValue::text_owned(text.into_owned()));
    };

    if length > max {
        return Err(RejectReason::ValueTooLarge {
            dest_type: dest.type_display(),
            value_size: length,
            max_size: max,
            unit: SizeUnit::Characters,
        });
    }

    let mut owned = text.into_owned();
    if dest.sql_type.is_padded() {
        owned.extend(std::iter::repeat(' ').take(max - length));
    }
    Ok(SqlValue::text_owned(owned))
}

/// Binary destinations accept raw bytes or hex text; both forms share the
/// same length limit.
pub(super) fn to_binary(
    value: &SqlValue<'_>,
    dest: &ColumnDescriptor,
) -> Result<SqlValue<'static>, RejectReason> {
    let mut bytes = match value {
        SqlValue::Bytes(b) => b.to_vec(),
        SqlValue::Text(s) => {
            decode_hex(s).ok_or_else(|| conversion_failed(value.kind_name(), dest))?
        }
        SqlValue::Uuid(u) => u.to_bytes_le().to_vec(),
        other => return Err(incompatible(other, dest)),
    };

    if let Some(max) = dest.length_limit() {
        if bytes.len() > max {
            return Err(RejectReason::ValueTooLarge {
                dest_type: dest.type_display(),
                value_size: bytes.len(),
                max_size: max,
                unit: SizeUnit::Bytes,
            });
        }
        if dest.sql_type == SqlType::Binary {
            bytes.resize(max, 0);
        }
    }

    Ok(SqlValue::bytes_owned(bytes))
}

pub(super) fn to_guid(
    value: &SqlValue<'_>,
    dest: &ColumnDescriptor,
) -> Result<SqlValue<'static>, RejectReason> {
    match value {
        SqlValue::Uuid(u) => Ok(SqlValue::Uuid(*u)),
        SqlValue::Text(s) => {
            let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}');
            Uuid::parse_str(trimmed)
                .map(SqlValue::Uuid)
                .map_err(|_| conversion_failed(value.kind_name(), dest))
        }
        SqlValue::Bytes(b) if b.len() == 16 => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(b);
            Ok(SqlValue::Uuid(Uuid::from_bytes_le(raw)))
        }
        SqlValue::Bytes(_) => Err(conversion_failed(value.kind_name(), dest)),
        other => Err(incompatible(other, dest)),
    }
}

/// Decode hex text, with or without a `0x` prefix. Odd lengths are invalid.
fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(digits).ok()
}
