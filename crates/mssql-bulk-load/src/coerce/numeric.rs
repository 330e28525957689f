//! Bit and numeric destinations.

use std::str::FromStr;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use super::{conversion_failed, incompatible, out_of_range, RejectReason, SizeUnit};
use crate::core::{ColumnDescriptor, SqlType, SqlValue};

const MONEY_SCALE: u32 = 4;

pub(super) fn to_bit(
    value: &SqlValue<'_>,
    dest: &ColumnDescriptor,
) -> Result<SqlValue<'static>, RejectReason> {
    let bit = match value {
        SqlValue::Bool(b) => *b,
        SqlValue::I16(v) => *v != 0,
        SqlValue::I32(v) => *v != 0,
        SqlValue::I64(v) => *v != 0,
        SqlValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => true,
            "0" | "false" => false,
            _ => return Err(conversion_failed(value.kind_name(), dest)),
        },
        other => return Err(incompatible(other, dest)),
    };
    Ok(SqlValue::Bool(bit))
}

pub(super) fn to_numeric(
    value: &SqlValue<'_>,
    dest: &ColumnDescriptor,
) -> Result<SqlValue<'static>, RejectReason> {
    match dest.sql_type {
        SqlType::TinyInt => integer(value, dest, 0, 255).map(|n| SqlValue::I16(n as i16)),
        SqlType::SmallInt => integer(value, dest, i16::MIN.into(), i16::MAX.into())
            .map(|n| SqlValue::I16(n as i16)),
        SqlType::Int => {
            integer(value, dest, i32::MIN.into(), i32::MAX.into()).map(|n| SqlValue::I32(n as i32))
        }
        SqlType::BigInt => {
            integer(value, dest, i64::MIN.into(), i64::MAX.into()).map(|n| SqlValue::I64(n as i64))
        }
        SqlType::Decimal | SqlType::Numeric => exact(value, dest).map(SqlValue::Decimal),
        SqlType::Money => money(
            value,
            dest,
            Decimal::new(i64::MIN, MONEY_SCALE),
            Decimal::new(i64::MAX, MONEY_SCALE),
        ),
        SqlType::SmallMoney => money(
            value,
            dest,
            Decimal::new(i32::MIN.into(), MONEY_SCALE),
            Decimal::new(i32::MAX.into(), MONEY_SCALE),
        ),
        SqlType::Real => {
            let f = float(value, dest)? as f32;
            if f.is_finite() {
                Ok(SqlValue::F32(f))
            } else {
                Err(out_of_range(dest))
            }
        }
        SqlType::Float => float(value, dest).map(SqlValue::F64),
        _ => Err(incompatible(value, dest)),
    }
}

fn integer(
    value: &SqlValue<'_>,
    dest: &ColumnDescriptor,
    min: i128,
    max: i128,
) -> Result<i128, RejectReason> {
    let n = match value {
        SqlValue::Bool(b) => i128::from(*b),
        SqlValue::I16(v) => i128::from(*v),
        SqlValue::I32(v) => i128::from(*v),
        SqlValue::I64(v) => i128::from(*v),
        SqlValue::Text(s) => match s.trim().parse::<i128>() {
            Ok(n) => n,
            Err(_) => truncate(to_decimal(value, dest)?, dest)?,
        },
        _ => truncate(to_decimal(value, dest)?, dest)?,
    };

    if n < min || n > max {
        return Err(out_of_range(dest));
    }
    Ok(n)
}

fn truncate(d: Decimal, dest: &ColumnDescriptor) -> Result<i128, RejectReason> {
    d.trunc().to_i128().ok_or_else(|| out_of_range(dest))
}

/// Round to the column scale, then check the integer digits fit.
fn exact(value: &SqlValue<'_>, dest: &ColumnDescriptor) -> Result<Decimal, RejectReason> {
    let scale = u32::from(dest.scale);
    let precision = u32::from(dest.precision);
    let mut rounded = to_decimal(value, dest)?
        .round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);

    let integer_digits = integer_digit_count(&rounded);
    if integer_digits > precision.saturating_sub(scale) {
        return Err(RejectReason::ValueTooLarge {
            dest_type: dest.type_display(),
            value_size: (integer_digits + scale) as usize,
            max_size: precision as usize,
            unit: SizeUnit::Digits,
        });
    }

    rounded.rescale(scale);
    Ok(rounded)
}

fn money(
    value: &SqlValue<'_>,
    dest: &ColumnDescriptor,
    min: Decimal,
    max: Decimal,
) -> Result<SqlValue<'static>, RejectReason> {
    let mut d = to_decimal(value, dest)?
        .round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    if d < min || d > max {
        return Err(out_of_range(dest));
    }
    d.rescale(MONEY_SCALE);
    Ok(SqlValue::Decimal(d))
}

fn float(value: &SqlValue<'_>, dest: &ColumnDescriptor) -> Result<f64, RejectReason> {
    let f = match value {
        SqlValue::Bool(b) => f64::from(u8::from(*b)),
        SqlValue::I16(v) => f64::from(*v),
        SqlValue::I32(v) => f64::from(*v),
        SqlValue::I64(v) => *v as f64,
        SqlValue::F32(v) => f64::from(*v),
        SqlValue::F64(v) => *v,
        SqlValue::Decimal(d) => d.to_f64().ok_or_else(|| out_of_range(dest))?,
        SqlValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| conversion_failed(value.kind_name(), dest))?,
        other => return Err(incompatible(other, dest)),
    };
    if !f.is_finite() {
        return Err(out_of_range(dest));
    }
    Ok(f)
}

fn to_decimal(value: &SqlValue<'_>, dest: &ColumnDescriptor) -> Result<Decimal, RejectReason> {
    match value {
        SqlValue::Bool(b) => Ok(Decimal::from(u8::from(*b))),
        SqlValue::I16(v) => Ok(Decimal::from(*v)),
        SqlValue::I32(v) => Ok(Decimal::from(*v)),
        SqlValue::I64(v) => Ok(Decimal::from(*v)),
        SqlValue::Decimal(d) => Ok(*d),
        SqlValue::F32(f) => Decimal::from_f32(*f).ok_or_else(|| out_of_range(dest)),
        SqlValue::F64(f) => Decimal::from_f64(*f).ok_or_else(|| out_of_range(dest)),
        SqlValue::Text(s) => {
            let s = s.trim();
            Decimal::from_str(s)
                .or_else(|_| Decimal::from_scientific(s))
                .map_err(|_| {
                    // Lexically valid numbers that do not fit a Decimal are out of range.
                    if s.parse::<f64>().map(f64::is_finite).unwrap_or(false) {
                        out_of_range(dest)
                    } else {
                        conversion_failed(value.kind_name(), dest)
                    }
                })
        }
        other => Err(incompatible(other, dest)),
    }
}

fn integer_digit_count(d: &Decimal) -> u32 {
    let whole = d.trunc().abs().to_string();
    let digits = whole.split('.').next().unwrap_or("0");
    if digits.trim_start_matches('0').is_empty() {
        0
    } else {
        digits.trim_start_matches('0').len() as u32
    }
}
