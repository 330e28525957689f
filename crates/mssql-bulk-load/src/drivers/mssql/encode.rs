//! Validated values to tiberius column data.
//!
//! Values reaching this point have been coerced to the destination type,
//! so the destination type alone picks the TDS representation.

use std::borrow::Cow;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::prelude::ToPrimitive;
use tiberius::numeric::Numeric;
use tiberius::time::{Date, DateTime, DateTime2, DateTimeOffset, SmallDateTime, Time};
use tiberius::ColumnData;

use crate::core::{ColumnDescriptor, SqlType, SqlValue};
use crate::error::{BulkLoadError, Result};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Typed NULL for a destination column.
pub(super) fn null_for(sql_type: SqlType) -> ColumnData<'static> {
    match sql_type {
        SqlType::Char | SqlType::VarChar | SqlType::NChar | SqlType::NVarChar => {
            ColumnData::String(None)
        }
        SqlType::Binary | SqlType::VarBinary => ColumnData::Binary(None),
        SqlType::Bit => ColumnData::Bit(None),
        SqlType::TinyInt => ColumnData::U8(None),
        SqlType::SmallInt => ColumnData::I16(None),
        SqlType::Int => ColumnData::I32(None),
        SqlType::BigInt => ColumnData::I64(None),
        SqlType::Decimal | SqlType::Numeric => ColumnData::Numeric(None),
        SqlType::Money | SqlType::SmallMoney | SqlType::Float => ColumnData::F64(None),
        SqlType::Real => ColumnData::F32(None),
        SqlType::Date => ColumnData::Date(None),
        SqlType::Time => ColumnData::Time(None),
        SqlType::DateTime => ColumnData::DateTime(None),
        SqlType::SmallDateTime => ColumnData::SmallDateTime(None),
        SqlType::DateTime2 => ColumnData::DateTime2(None),
        SqlType::DateTimeOffset => ColumnData::DateTimeOffset(None),
        SqlType::UniqueIdentifier => ColumnData::Guid(None),
    }
}

/// Encode a value for `dest`.
pub(super) fn encode(
    value: &SqlValue<'_>,
    dest: &ColumnDescriptor,
    table: &str,
) -> Result<ColumnData<'static>> {
    let mismatch = || {
        BulkLoadError::transfer(
            table,
            format!(
                "column {} ({}) cannot be sent a {} value",
                dest.name,
                dest.type_display(),
                value.kind_name()
            ),
        )
    };

    let data = match (dest.sql_type, value) {
        (t, SqlValue::Null(_)) => null_for(t),
        (_, SqlValue::Text(s)) => ColumnData::String(Some(Cow::Owned(s.to_string()))),
        (_, SqlValue::Bytes(b)) => ColumnData::Binary(Some(Cow::Owned(b.to_vec()))),
        (_, SqlValue::Uuid(u)) => ColumnData::Guid(Some(*u)),
        (_, SqlValue::Bool(b)) => ColumnData::Bit(Some(*b)),
        (SqlType::TinyInt, SqlValue::I16(v)) => {
            ColumnData::U8(Some(u8::try_from(*v).map_err(|_| mismatch())?))
        }
        (_, SqlValue::I16(v)) => ColumnData::I16(Some(*v)),
        (_, SqlValue::I32(v)) => ColumnData::I32(Some(*v)),
        (_, SqlValue::I64(v)) => ColumnData::I64(Some(*v)),
        (_, SqlValue::F32(v)) => ColumnData::F32(Some(*v)),
        (_, SqlValue::F64(v)) => ColumnData::F64(Some(*v)),
        (SqlType::Money | SqlType::SmallMoney, SqlValue::Decimal(d)) => {
            ColumnData::F64(Some(d.to_f64().ok_or_else(mismatch)?))
        }
        (_, SqlValue::Decimal(d)) => ColumnData::Numeric(Some(Numeric::new_with_scale(
            d.mantissa(),
            d.scale() as u8,
        ))),
        (SqlType::Date, SqlValue::Date(d)) => ColumnData::Date(Some(date(*d).ok_or_else(mismatch)?)),
        (SqlType::Time, SqlValue::Time(t)) => ColumnData::Time(Some(time(*t, dest.scale))),
        (SqlType::DateTime, SqlValue::DateTime(dt)) => {
            ColumnData::DateTime(Some(datetime(*dt).ok_or_else(mismatch)?))
        }
        (SqlType::SmallDateTime, SqlValue::DateTime(dt)) => {
            ColumnData::SmallDateTime(Some(smalldatetime(*dt).ok_or_else(mismatch)?))
        }
        (SqlType::DateTime2, SqlValue::DateTime(dt)) => {
            ColumnData::DateTime2(Some(datetime2(*dt, dest.scale).ok_or_else(mismatch)?))
        }
        (SqlType::DateTimeOffset, SqlValue::DateTimeOffset(dto)) => {
            let utc = datetime2(dto.naive_utc(), dest.scale).ok_or_else(mismatch)?;
            let offset_minutes = i16::try_from(dto.offset().local_minus_utc() / 60)
                .map_err(|_| mismatch())?;
            ColumnData::DateTimeOffset(Some(DateTimeOffset::new(utc, offset_minutes)))
        }
        _ => return Err(mismatch()),
    };
    Ok(data)
}

fn days_since(date: NaiveDate, epoch: NaiveDate) -> i64 {
    (date - epoch).num_days()
}

fn nanos_of_day(t: NaiveTime) -> u64 {
    u64::from(t.num_seconds_from_midnight()) * NANOS_PER_SEC + u64::from(t.nanosecond())
}

fn date(d: NaiveDate) -> Option<Date> {
    let epoch = NaiveDate::from_ymd_opt(1, 1, 1)?;
    u32::try_from(days_since(d, epoch)).ok().map(Date::new)
}

/// Time in increments of 10^-scale seconds.
fn time(t: NaiveTime, scale: u8) -> Time {
    let unit = 10u64.pow(9 - u32::from(scale.min(7)));
    Time::new(nanos_of_day(t) / unit, scale.min(7))
}

fn datetime2(dt: NaiveDateTime, scale: u8) -> Option<DateTime2> {
    Some(DateTime2::new(date(dt.date())?, time(dt.time(), scale)))
}

/// Days since 1900-01-01 and 1/300 second ticks.
fn datetime(dt: NaiveDateTime) -> Option<DateTime> {
    let epoch = NaiveDate::from_ymd_opt(1900, 1, 1)?;
    let days = i32::try_from(days_since(dt.date(), epoch)).ok()?;
    let millis = nanos_of_day(dt.time()) / 1_000_000;
    let ticks = u32::try_from((millis * 300 + 500) / 1000).ok()?;
    Some(DateTime::new(days, ticks))
}

/// Days since 1900-01-01 and minutes since midnight.
fn smalldatetime(dt: NaiveDateTime) -> Option<SmallDateTime> {
    let epoch = NaiveDate::from_ymd_opt(1900, 1, 1)?;
    let days = u16::try_from(days_since(dt.date(), epoch)).ok()?;
    let minutes = u16::try_from(dt.time().num_seconds_from_midnight() / 60).ok()?;
    Some(SmallDateTime::new(days, minutes))
}
