//! Date and time destinations.
//!
//! Input precision is checked before rounding: datetime and smalldatetime
//! accept at most millisecond input, the other types at most 100ns. A value
//! that passes is rounded half-up to the storage granularity of the column
//! (one minute for smalldatetime, 1/300 s for datetime, `10^-scale` seconds
//! otherwise).
//!
//! datetime and smalldatetime values go to the server in their character
//! form, so failures for those types name "character string" as the source.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Timelike, Utc,
};

use super::{conversion_failed, incompatible, out_of_range, CoercionContext, RejectReason};
use crate::core::schema::MAX_TEMPORAL_SCALE;
use crate::core::{ColumnDescriptor, SqlType, SqlValue};

const NANOS_PER_SECOND: i64 = 1_000_000_000;
const NANOS_PER_MINUTE: i64 = 60 * NANOS_PER_SECOND;
const NANOS_PER_DAY: i64 = 86_400 * NANOS_PER_SECOND;

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f %:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%d %H:%M %:z",
];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d"];
const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

#[derive(Debug, Clone, Copy)]
enum Parsed {
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Offset(DateTime<FixedOffset>),
}

impl Parsed {
    fn time(&self) -> NaiveTime {
        match self {
            Parsed::DateTime(dt) => dt.time(),
            Parsed::Date(_) => NaiveTime::MIN,
            Parsed::Time(t) => *t,
            Parsed::Offset(o) => o.naive_local().time(),
        }
    }

    /// Local date and time; time-only values sit on 1900-01-01.
    fn naive(&self) -> NaiveDateTime {
        match self {
            Parsed::DateTime(dt) => *dt,
            Parsed::Date(d) => d.and_time(NaiveTime::MIN),
            Parsed::Time(t) => base_date().and_time(*t),
            Parsed::Offset(o) => o.naive_local(),
        }
    }
}

/// Rounding granularity of a destination.
#[derive(Debug, Clone, Copy)]
enum Step {
    Nanos(i64),
    /// 1/300 second, stored by datetime.
    DateTimeTick,
}

impl Step {
    fn for_scale(scale: u8) -> Self {
        let scale = u32::from(scale.min(MAX_TEMPORAL_SCALE));
        Step::Nanos(10_i64.pow(9 - scale))
    }

    fn round(self, nanos: i64) -> i64 {
        match self {
            Step::Nanos(step) => (nanos + step / 2) / step * step,
            Step::DateTimeTick => {
                let ticks = (nanos * 300 + NANOS_PER_SECOND / 2) / NANOS_PER_SECOND;
                // Ticks render as .000, .003 and .007 milliseconds.
                ((ticks * 10 + 1) / 3) * 1_000_000
            }
        }
    }
}

pub(super) fn to_temporal(
    value: &SqlValue<'_>,
    dest: &ColumnDescriptor,
    ctx: &CoercionContext<'_>,
) -> Result<SqlValue<'static>, RejectReason> {
    let parsed = match value {
        SqlValue::Text(s) => parse_text(s.trim(), ctx.date_time_format)
            .ok_or_else(|| conversion_failed(value.kind_name(), dest))?,
        SqlValue::DateTime(v) => Parsed::DateTime(*v),
        SqlValue::Date(v) => Parsed::Date(*v),
        SqlValue::Time(v) => Parsed::Time(*v),
        SqlValue::DateTimeOffset(v) => Parsed::Offset(*v),
        other => return Err(incompatible(other, dest)),
    };

    let source_kind = match dest.sql_type {
        SqlType::DateTime | SqlType::SmallDateTime => "character string",
        _ => value.kind_name(),
    };
    check_input_precision(&parsed, dest, source_kind)?;

    match dest.sql_type {
        SqlType::Date => {
            let date = parsed.naive().date();
            check_year(date, dest)?;
            Ok(SqlValue::Date(date))
        }
        SqlType::Time => {
            let nanos = nanos_of_day(parsed.time());
            let rounded = Step::for_scale(dest.scale).round(nanos);
            if rounded >= NANOS_PER_DAY {
                return Err(out_of_range(dest));
            }
            Ok(SqlValue::Time(NaiveTime::MIN + Duration::nanoseconds(rounded)))
        }
        SqlType::DateTime2 => {
            let dt = round_datetime(parsed.naive(), Step::for_scale(dest.scale), dest)?;
            check_year(dt.date(), dest)?;
            Ok(SqlValue::DateTime(dt))
        }
        SqlType::DateTimeOffset => {
            let offset = match parsed {
                Parsed::Offset(o) => *o.offset(),
                _ => utc_offset(),
            };
            let local = round_datetime(parsed.naive(), Step::for_scale(dest.scale), dest)?;
            check_year(local.date(), dest)?;
            let dto = offset
                .from_local_datetime(&local)
                .single()
                .ok_or_else(|| out_of_range(dest))?;
            Ok(SqlValue::DateTimeOffset(dto))
        }
        SqlType::DateTime => {
            let dt = round_datetime(parsed.naive(), Step::DateTimeTick, dest)?;
            let min = ymd(1753, 1, 1).and_time(NaiveTime::MIN);
            let max = ymd(9999, 12, 31)
                .and_hms_milli_opt(23, 59, 59, 997)
                .unwrap_or(NaiveDateTime::MAX);
            if dt < min || dt > max {
                return Err(out_of_range(dest));
            }
            Ok(SqlValue::DateTime(dt))
        }
        SqlType::SmallDateTime => {
            let dt = round_datetime(parsed.naive(), Step::Nanos(NANOS_PER_MINUTE), dest)?;
            let min = base_date().and_time(NaiveTime::MIN);
            let max = ymd(2079, 6, 6)
                .and_hms_opt(23, 59, 0)
                .unwrap_or(NaiveDateTime::MAX);
            if dt < min || dt > max {
                return Err(out_of_range(dest));
            }
            Ok(SqlValue::DateTime(dt))
        }
        _ => Err(incompatible(value, dest)),
    }
}

fn check_input_precision(
    parsed: &Parsed,
    dest: &ColumnDescriptor,
    source_kind: &str,
) -> Result<(), RejectReason> {
    let granularity = match dest.sql_type {
        SqlType::DateTime | SqlType::SmallDateTime => 1_000_000,
        _ => 100,
    };
    let fraction = parsed.time().nanosecond() % 1_000_000_000;
    if fraction % granularity != 0 {
        return Err(conversion_failed(source_kind, dest));
    }
    Ok(())
}

fn round_datetime(
    dt: NaiveDateTime,
    step: Step,
    dest: &ColumnDescriptor,
) -> Result<NaiveDateTime, RejectReason> {
    let midnight = dt.date().and_time(NaiveTime::MIN);
    let rounded = step.round(nanos_of_day(dt.time()));
    midnight
        .checked_add_signed(Duration::nanoseconds(rounded))
        .ok_or_else(|| out_of_range(dest))
}

fn nanos_of_day(t: NaiveTime) -> i64 {
    i64::from(t.num_seconds_from_midnight()) * NANOS_PER_SECOND
        + i64::from(t.nanosecond() % 1_000_000_000)
}

fn check_year(date: NaiveDate, dest: &ColumnDescriptor) -> Result<(), RejectReason> {
    if (1..=9999).contains(&date.year()) {
        Ok(())
    } else {
        Err(out_of_range(dest))
    }
}

fn parse_text(s: &str, format: Option<&str>) -> Option<Parsed> {
    match format {
        Some(fmt) => parse_with(s, &[fmt]),
        None => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(Parsed::Offset)
            .or_else(|| parse_with(s, OFFSET_FORMATS))
            .or_else(|| parse_with(s, DATETIME_FORMATS))
            .or_else(|| parse_with(s, DATE_FORMATS))
            .or_else(|| parse_with(s, TIME_FORMATS)),
    }
}

/// Try each format as offset, date-time, date and time, in that order.
fn parse_with(s: &str, formats: &[&str]) -> Option<Parsed> {
    formats.iter().find_map(|fmt| {
        DateTime::parse_from_str(s, fmt)
            .map(Parsed::Offset)
            .or_else(|_| NaiveDateTime::parse_from_str(s, fmt).map(Parsed::DateTime))
            .or_else(|_| NaiveDate::parse_from_str(s, fmt).map(Parsed::Date))
            .or_else(|_| NaiveTime::parse_from_str(s, fmt).map(Parsed::Time))
            .ok()
    })
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or(NaiveDate::MIN)
}

fn base_date() -> NaiveDate {
    ymd(1900, 1, 1)
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}
