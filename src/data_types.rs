/*!
 * Core data types for loosely structured spreadsheet tables
 *
 * Neither input table has a fixed schema: column names are whatever the
 * author typed, and a cell may hold text, a number, a date, or nothing.
 * These types keep rows positional and column names ordered so the
 * matching engine can bind to columns discovered at runtime.
 */

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use serde::{Serialize, Serializer};

/// Date formats accepted when coercing text cells to dates
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y年%m月%d日"];

/// Time suffixes that may follow one of [`DATE_FORMATS`]
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y-%m-%d %H:%M",
];

/// Largest serial number Excel accepts (9999-12-31)
const MAX_EXCEL_SERIAL: f64 = 2_958_465.0;

/// A single spreadsheet cell
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    /// Missing value (blank cell, NaN, error cell)
    #[default]
    Empty,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDateTime),
}

impl CellValue {
    /// Build a text cell; the empty string becomes [`CellValue::Empty`]
    pub fn text<S: Into<String>>(value: S) -> Self {
        let value = value.into();
        if value.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(value)
        }
    }

    /// Whether this cell counts as missing
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    /// Total string coercion used for display and comparison keys.
    ///
    /// Missing values render as an empty string, dates as `YYYY-MM-DD`,
    /// integral floats without a trailing `.0` so numeric codes read from a
    /// workbook compare equal to the same code typed as text.
    pub fn display_string(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.clone(),
            CellValue::Int(i) => i.to_string(),
            CellValue::Float(f) if f.is_nan() => String::new(),
            CellValue::Float(f) => format_float(*f),
            CellValue::Bool(true) => "True".to_string(),
            CellValue::Bool(false) => "False".to_string(),
            CellValue::Date(dt) => dt.format("%Y-%m-%d").to_string(),
        }
    }

    /// The date held by this cell, if it is one
    pub fn as_date(&self) -> Option<NaiveDateTime> {
        match self {
            CellValue::Date(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Coerce to a date, returning `None` for anything unparseable.
    ///
    /// Numbers are read as Excel serial day counts.
    pub fn to_date(&self) -> Option<NaiveDateTime> {
        match self {
            CellValue::Date(dt) => Some(*dt),
            CellValue::Text(s) => parse_date_text(s),
            CellValue::Int(i) => excel_serial_to_datetime(*i as f64),
            CellValue::Float(f) => excel_serial_to_datetime(*f),
            CellValue::Empty | CellValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_string())
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.display_string())
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::text(value)
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::text(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Float(value)
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(value: NaiveDateTime) -> Self {
        CellValue::Date(value)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(value: NaiveDate) -> Self {
        CellValue::Date(value.and_hms_opt(0, 0, 0).unwrap_or_default())
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CellValue::Empty)
    }
}

fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Parse a date written as text in one of the layouts the MHLW sheet and
/// pharmacy exports use.
pub fn parse_date_text(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }

    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.naive_local())
}

/// Convert an Excel serial day number (1900 date system) to a datetime
pub fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 1.0 || serial > MAX_EXCEL_SERIAL {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    epoch.checked_add_signed(Duration::milliseconds(millis))
}

/// Make header names unique and non-blank.
///
/// A blank header at position `i` becomes `Unnamed: i`; a repeated name gets
/// a `.1`, `.2`, ... suffix in order of appearance.
pub fn unique_column_names<I, S>(headers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let raw: Vec<String> = headers
        .into_iter()
        .enumerate()
        .map(|(idx, name)| {
            let name = name.as_ref().trim();
            if name.is_empty() {
                format!("Unnamed: {}", idx)
            } else {
                name.to_string()
            }
        })
        .collect();

    let mut seen: HashSet<String> = HashSet::with_capacity(raw.len());
    let mut columns = Vec::with_capacity(raw.len());
    for name in raw {
        let mut candidate = name.clone();
        let mut suffix = 1;
        while seen.contains(&candidate) {
            candidate = format!("{}.{}", name, suffix);
            suffix += 1;
        }
        seen.insert(candidate.clone());
        columns.push(candidate);
    }
    columns
}

/// An in-memory table: ordered column names plus positional rows
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    /// Column names, unique, in sheet order
    pub columns: Vec<String>,
    /// Rows, each exactly `columns.len()` cells long
    pub rows: Vec<Vec<CellValue>>,
}

impl Table {
    /// Create a table, padding or truncating rows to the column count
    pub fn new(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, CellValue::Empty);
                row
            })
            .collect();
        Self { columns, rows }
    }

    /// Convenience constructor from header names and convertible cells
    pub fn from_rows<S, R, C>(columns: &[S], rows: R) -> Self
    where
        S: AsRef<str>,
        R: IntoIterator<Item = Vec<C>>,
        C: Into<CellValue>,
    {
        let columns = unique_column_names(columns.iter().map(|c| c.as_ref()));
        let rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(Into::into).collect())
            .collect();
        Self::new(columns, rows)
    }

    /// Number of data rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no data rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of columns
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Position of a column by exact name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell at (`row`, `column`), `None` when out of range
    pub fn cell(&self, row: usize, column: usize) -> Option<&CellValue> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// Drop rows in which every cell is missing
    pub fn drop_empty_rows(&mut self) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| row.iter().any(|cell| !cell.is_empty()));
        before - self.rows.len()
    }

    /// Replace the header with the first data row and remove that row
    pub fn promote_first_row_to_header(&mut self) -> bool {
        if self.rows.is_empty() {
            return false;
        }
        let first = self.rows.remove(0);
        self.columns = unique_column_names(first.iter().map(CellValue::display_string));
        true
    }

    /// Iterate `(column name, cell)` pairs of one row
    pub fn record(&self, row: usize) -> impl Iterator<Item = (&str, &CellValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.rows.get(row).into_iter().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_string_is_total() {
        assert_eq!(CellValue::Empty.display_string(), "");
        assert_eq!(CellValue::Float(f64::NAN).display_string(), "");
        assert_eq!(CellValue::Float(1234567890.0).display_string(), "1234567890");
        assert_eq!(CellValue::Float(2.5).display_string(), "2.5");
        assert_eq!(CellValue::Int(-7).display_string(), "-7");
        assert_eq!(CellValue::Bool(true).display_string(), "True");
        let date = NaiveDate::from_ymd_opt(2026, 2, 6).unwrap();
        assert_eq!(CellValue::from(date).display_string(), "2026-02-06");
    }

    #[test]
    fn test_text_constructor_maps_empty_to_missing() {
        assert!(CellValue::text("").is_empty());
        assert!(!CellValue::text(" ").is_empty());
        assert!(CellValue::from(None::<&str>).is_empty());
    }

    #[test]
    fn test_to_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2026, 2, 6).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(CellValue::text("2026-02-06").to_date(), Some(expected));
        assert_eq!(CellValue::text("2026/02/06").to_date(), Some(expected));
        assert_eq!(CellValue::text("2026年2月6日").to_date(), Some(expected));
        assert_eq!(CellValue::text("2026-02-06 00:00:00").to_date(), Some(expected));
        assert_eq!(CellValue::Float(46059.0).to_date(), Some(expected));
        assert_eq!(CellValue::text("未定").to_date(), None);
        assert_eq!(CellValue::Empty.to_date(), None);
        assert_eq!(CellValue::Float(-3.0).to_date(), None);
    }

    #[test]
    fn test_unique_column_names() {
        let names = unique_column_names(["品名", "", "品名", "品名", " JAN "]);
        assert_eq!(names, vec!["品名", "Unnamed: 1", "品名.1", "品名.2", "JAN"]);
    }

    #[test]
    fn test_table_pads_short_rows() {
        let table = Table::from_rows(&["a", "b", "c"], vec![vec!["x"]]);
        assert_eq!(table.rows[0].len(), 3);
        assert_eq!(table.cell(0, 2), Some(&CellValue::Empty));
    }

    #[test]
    fn test_drop_empty_rows() {
        let mut table = Table::from_rows(
            &["a", "b"],
            vec![
                vec![CellValue::Empty, CellValue::Empty],
                vec![CellValue::text("x"), CellValue::Empty],
                vec![CellValue::Float(f64::NAN), CellValue::Empty],
            ],
        );
        assert_eq!(table.drop_empty_rows(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_promote_first_row_to_header() {
        let mut table = Table::from_rows(
            &["Unnamed: 0", "Unnamed: 1"],
            vec![vec!["①薬剤区分", "②薬効分類"], vec!["内用薬", "114"]],
        );
        assert!(table.promote_first_row_to_header());
        assert_eq!(table.columns, vec!["①薬剤区分", "②薬効分類"]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.cell(0, 0), Some(&CellValue::text("内用薬")));
    }
}
