//! Billing month keys
//!
//! Billing documents are keyed by a six-digit `YYYYMM` month. Callers send
//! the month in several shapes, resolved in this order:
//!
//! 1. an explicit `yyyymm` field
//! 2. a `month` object `{year, month}`
//! 3. the date of the first line item (`this_month_lines`, then `next_month_lines`)
//! 4. the current month in the billing timezone
//!
//! Malformed values fall through to the next source without an error.

use chrono::{DateTime, Datelike, FixedOffset, Offset, Utc};
use serde::Serialize;
use serde_json::Value;

/// Line item fields that may carry a date, in lookup order
const LINE_DATE_FIELDS: &[&str] = &["note_date", "date", "dateStr"];

/// Which input produced the month key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonthKeySource {
    Explicit,
    MonthObject,
    LineDate,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthKey {
    pub yyyymm: String,
    pub year: i32,
    pub month: u32,
    pub source: MonthKeySource,
}

impl MonthKey {
    /// Build a key from calendar parts. Month must be 1..=12.
    pub fn from_parts(year: i32, month: u32, source: MonthKeySource) -> Option<Self> {
        if !(1..=12).contains(&month) {
            return None;
        }
        Some(Self {
            yyyymm: format!("{}{:02}", year, month),
            year,
            month,
            source,
        })
    }
}

/// Derive the month key for a billing request body
pub fn derive_month_key(body: &Value, now: DateTime<FixedOffset>) -> MonthKey {
    if let Some(key) = body.get("yyyymm").and_then(explicit_key) {
        return key;
    }

    if let Some(key) = body.get("month").and_then(month_object_key) {
        return key;
    }

    if let Some(key) = line_date_key(body) {
        return key;
    }

    tracing::warn!(
        body_keys = ?body.as_object().map(|m| m.keys().cloned().collect::<Vec<_>>()),
        "No usable month in billing request, falling back to current month"
    );
    current_month_key(now)
}

/// The current month in the given timezone
pub fn current_month_key(now: DateTime<FixedOffset>) -> MonthKey {
    MonthKey {
        yyyymm: format!("{}{:02}", now.year(), now.month()),
        year: now.year(),
        month: now.month(),
        source: MonthKeySource::Fallback,
    }
}

/// Now in a fixed UTC offset (hours), e.g. 9 for KST
pub fn now_in_offset(offset_hours: i32) -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(offset_hours * 3600).unwrap_or_else(|| Utc.fix());
    Utc::now().with_timezone(&offset)
}

fn explicit_key(value: &Value) -> Option<MonthKey> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let (year, month) = parse_date_text(&text)?;
    MonthKey::from_parts(year, month, MonthKeySource::Explicit)
}

fn month_object_key(value: &Value) -> Option<MonthKey> {
    let year = value.get("year").and_then(as_int)?;
    let month = value.get("month").and_then(as_int)?;
    let year = i32::try_from(year).ok()?;
    let month = u32::try_from(month).ok()?;
    MonthKey::from_parts(year, month, MonthKeySource::MonthObject)
}

fn line_date_key(body: &Value) -> Option<MonthKey> {
    ["this_month_lines", "next_month_lines"]
        .iter()
        .filter_map(|field| body.get(*field).and_then(Value::as_array))
        .filter_map(|lines| lines.first())
        .find_map(|line| {
            LINE_DATE_FIELDS
                .iter()
                .filter_map(|f| line.get(*f).and_then(Value::as_str))
                .find_map(parse_date_text)
        })
        .and_then(|(year, month)| MonthKey::from_parts(year, month, MonthKeySource::LineDate))
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extract `(year, month)` from free text such as `"2025. 10. 02."`,
/// `"20251002"`, `"202510"` or `"2025-10-02"`.
pub fn parse_date_text(text: &str) -> Option<(i32, u32)> {
    let groups: Vec<&str> = text
        .split(|c: char| !c.is_ascii_digit())
        .filter(|g| !g.is_empty())
        .collect();
    let first = groups.first()?;

    let (year, month) = match first.len() {
        8 | 6 => (&first[0..4], &first[4..6]),
        4 => (*first, *groups.get(1).filter(|m| m.len() <= 2)?),
        _ => return None,
    };

    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    if (1..=12).contains(&month) {
        Some((year, month))
    } else {
        None
    }
}
