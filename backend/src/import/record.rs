use crate::db::schema;
use crate::error::{truncate_chars, RowError, RowErrorKind};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use log::warn;

/// Minimum number of positional columns for a usable record.
pub const MIN_COLUMNS: usize = 8;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
];

/// A subscriber row ready to be written to a staging table.
///
/// Column order in the source: id, number, last name, first name, middle
/// name, address, memo1, memo2, birth place, birth date, imsi.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriberRecord {
    pub original_id: Option<i64>,
    pub number: String,
    pub last_name: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub address: Option<String>,
    pub memo1: Option<String>,
    pub memo2: Option<String>,
    pub birth_place: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub imsi: Option<String>,
}

/// A parsed record plus the non-fatal problems found while parsing it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedRow {
    pub record: SubscriberRecord,
    pub warnings: Vec<RowError>,
}

/// Splits a logical line into fields, honouring double quotes.
pub fn split_fields(line: &str, delimiter: u8) -> Result<Vec<String>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(line.as_bytes());

    let mut record = csv::StringRecord::new();
    if !reader.read_record(&mut record)? {
        return Ok(Vec::new());
    }
    Ok(record.iter().map(|f| f.to_string()).collect())
}

/// Parses one logical line.
///
/// Rows with fewer than `MIN_COLUMNS` fields are rejected. A bad birth date or
/// an unusable id leaves that field empty and is reported as a warning; the
/// row is still returned. Missing last/first names are accepted as empty
/// strings.
pub fn parse_record(line: &str, delimiter: u8, row_index: i64) -> Result<ParsedRow, RowError> {
    let fields = split_fields(line, delimiter)
        .map_err(|e| RowError::new(row_index, RowErrorKind::Csv, e.to_string()))?;

    if fields.len() < MIN_COLUMNS {
        return Err(RowError::new(
            row_index,
            RowErrorKind::InsufficientColumns,
            format!(
                "expected at least {} columns, found {}",
                MIN_COLUMNS,
                fields.len()
            ),
        ));
    }

    let mut warnings = Vec::new();
    let field = |idx: usize| fields.get(idx).map(|f| f.trim()).unwrap_or("");

    let original_id = match field(0) {
        "" => None,
        raw => match raw.parse::<i64>() {
            Ok(id) => Some(id),
            Err(e) => {
                warnings.push(RowError::new(
                    row_index,
                    RowErrorKind::InvalidId,
                    format!("'{}': {}", raw, e),
                ));
                None
            }
        },
    };

    let birth_date = match parse_birth_date(field(9)) {
        Ok(date) => date,
        Err(message) => {
            warnings.push(RowError::new(row_index, RowErrorKind::InvalidDate, message));
            None
        }
    };

    let w = &mut warnings;
    let record = SubscriberRecord {
        original_id,
        number: fit(row_index, "number", field(1), w),
        last_name: fit(row_index, "last_name", field(2), w),
        first_name: fit(row_index, "first_name", field(3), w),
        middle_name: optional(row_index, "middle_name", field(4), w),
        address: optional(row_index, "address", field(5), w),
        memo1: optional(row_index, "memo1", field(6), w),
        memo2: optional(row_index, "memo2", field(7), w),
        birth_place: optional(row_index, "birth_place", field(8), w),
        birth_date,
        imsi: optional(row_index, "imsi", field(10), w),
    };

    Ok(ParsedRow { record, warnings })
}

/// Truncates to the column's maximum length. A cut value is reported as a
/// `Truncated` warning; the row itself is kept.
fn fit(row_index: i64, column: &str, value: &str, warnings: &mut Vec<RowError>) -> String {
    match schema::max_len(column) {
        Some(max) if value.chars().count() > max => {
            let len = value.chars().count();
            warn!(
                "Row {}: truncating {} from {} to {} characters",
                row_index, column, len, max
            );
            warnings.push(RowError::new(
                row_index,
                RowErrorKind::Truncated,
                format!("{} cut from {} to {} characters", column, len, max),
            ));
            truncate_chars(value, max).to_string()
        }
        _ => value.to_string(),
    }
}

fn optional(
    row_index: i64,
    column: &str,
    value: &str,
    warnings: &mut Vec<RowError>,
) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(fit(row_index, column, value, warnings))
    }
}

/// `NULL` or blank yields `None`; otherwise the value must be one of the
/// accepted date or timestamp layouts with a year in 1900..=2100.
pub fn parse_birth_date(raw: &str) -> Result<Option<NaiveDate>, String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("NULL") {
        return Ok(None);
    }

    let parsed = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        });

    match parsed {
        Some(date) if (1900..=2100).contains(&date.year()) => Ok(Some(date)),
        Some(date) => Err(format!("date '{}' has year {} out of range", raw, date.year())),
        None => Err(format!("cannot parse date '{}'", raw)),
    }
}
