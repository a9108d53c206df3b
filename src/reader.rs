/*!
 * Spreadsheet reader and reference table loader
 *
 * This module reads the first sheet of an Excel workbook (or a CSV export)
 * into a [`Table`], and turns the cached MHLW supply-status workbook into a
 * [`ReferenceTable`] with its update-date, drug-code and drug-name columns
 * resolved.
 *
 * Loading the reference table is the one place where spreadsheet errors are
 * allowed to stop: [`ReferenceTable::load`] returns them, and
 * [`ReferenceTable::load_or_log`] is the non-raising boundary the matcher
 * uses, reporting any failure as "not loaded".
 */

use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, open_workbook_auto_from_rs, Data, Range, Reader};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    Result, SupplyCheckError, ErrorContext,
    constants::{ITEMS_PER_PAGE, SUPPORTED_EXTENSIONS},
    data_types::{unique_column_names, CellValue, Table},
    normalize::normalize_text,
    schema::{ColumnPatterns, ResolvedColumns},
};

/// Source format of a spreadsheet, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetFormat {
    /// Anything calamine opens: xlsx, xlsm, xlsb, xls, ods
    Workbook,
    /// Comma-separated text, UTF-8 or Shift_JIS
    Csv,
}

impl SheetFormat {
    /// Detect the format from a file name or path
    pub fn from_name(name: &str) -> Result<Self> {
        let extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "csv" => Ok(SheetFormat::Csv),
            ext if SUPPORTED_EXTENSIONS.contains(&ext) => Ok(SheetFormat::Workbook),
            ext => Err(SupplyCheckError::unsupported_format(ext)),
        }
    }
}

/// Reads the first (or a chosen) sheet of a spreadsheet into a [`Table`]
#[derive(Debug, Clone, Default)]
pub struct SpreadsheetReader {
    /// Zero-based worksheet index for workbook formats
    sheet_index: usize,
}

impl SpreadsheetReader {
    /// Create a reader for the first worksheet
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a different worksheet
    pub fn with_sheet_index(mut self, index: usize) -> Self {
        self.sheet_index = index;
        self
    }

    /// Read a spreadsheet from disk
    pub fn read_path<P: AsRef<Path>>(&self, path: P) -> Result<Table> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(SupplyCheckError::file_not_found_with_suggestion(path.to_path_buf()));
        }

        let format = SheetFormat::from_name(&path.to_string_lossy())?;
        let table = match format {
            SheetFormat::Workbook => {
                let mut workbook = open_workbook_auto(path).map_err(|e| SupplyCheckError::Spreadsheet {
                    message: format!("Failed to open workbook: {}", e),
                    context: ErrorContext::for_file(path),
                })?;
                let range = first_range(&mut workbook, self.sheet_index, path)?;
                table_from_range(&range)
            }
            SheetFormat::Csv => {
                let bytes = std::fs::read(path)?;
                table_from_csv_bytes(&bytes).map_err(|e| with_file_context(e, path))?
            }
        };

        tracing::debug!(
            path = %path.display(),
            columns = table.width(),
            rows = table.len(),
            "Read spreadsheet"
        );
        Ok(table)
    }

    /// Read a spreadsheet held in memory, e.g. an upload.
    ///
    /// `file_name` is only used to pick the format.
    pub fn read_bytes(&self, bytes: &[u8], file_name: &str) -> Result<Table> {
        match SheetFormat::from_name(file_name)? {
            SheetFormat::Workbook => {
                let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
                    .map_err(|e| SupplyCheckError::Spreadsheet {
                        message: format!("Failed to open workbook '{}': {}", file_name, e),
                        context: ErrorContext::default(),
                    })?;
                let range = first_range(&mut workbook, self.sheet_index, Path::new(file_name))?;
                Ok(table_from_range(&range))
            }
            SheetFormat::Csv => table_from_csv_bytes(bytes),
        }
    }
}

fn with_file_context(err: SupplyCheckError, path: &Path) -> SupplyCheckError {
    match err {
        SupplyCheckError::CsvParse { message, line, .. } => SupplyCheckError::CsvParse {
            message,
            line,
            context: ErrorContext::for_file(path),
        },
        other => other,
    }
}

fn first_range<RS, R>(workbook: &mut R, index: usize, path: &Path) -> Result<Range<Data>>
where
    RS: Read + Seek,
    R: Reader<RS>,
    R::Error: std::fmt::Display,
{
    match workbook.worksheet_range_at(index) {
        Some(Ok(range)) => Ok(range),
        Some(Err(e)) => Err(SupplyCheckError::Spreadsheet {
            message: format!("Failed to read worksheet {}: {}", index, e),
            context: ErrorContext::for_file(path),
        }),
        None => Err(SupplyCheckError::Spreadsheet {
            message: format!("Workbook has no worksheet at index {}", index),
            context: ErrorContext::for_file(path),
        }),
    }
}

/// Convert a calamine cell
fn cell_from_data(data: &Data) -> CellValue {
    match data {
        Data::Empty | Data::Error(_) => CellValue::Empty,
        Data::String(s) => CellValue::text(s.as_str()),
        Data::Int(i) => CellValue::Int(*i),
        Data::Float(f) => CellValue::Float(*f),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(CellValue::Date)
            .unwrap_or(CellValue::Empty),
        Data::DateTimeIso(s) => crate::data_types::parse_date_text(s)
            .map(CellValue::Date)
            .unwrap_or_else(|| CellValue::text(s.as_str())),
        Data::DurationIso(s) => CellValue::text(s.as_str()),
    }
}

/// First row is the header; the rest are data rows
fn table_from_range(range: &Range<Data>) -> Table {
    let mut rows = range.rows();
    let columns = match rows.next() {
        Some(header) => unique_column_names(header.iter().map(|d| cell_from_data(d).display_string())),
        None => return Table::default(),
    };
    let rows = rows
        .map(|row| row.iter().map(cell_from_data).collect())
        .collect();
    Table::new(columns, rows)
}

/// Decode CSV bytes as UTF-8, falling back to Shift_JIS
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, had_errors) = encoding_rs::SHIFT_JIS.decode(bytes);
            if had_errors {
                tracing::warn!("CSV is neither valid UTF-8 nor Shift_JIS; undecodable bytes were replaced");
            }
            text.into_owned()
        }
    }
}

fn table_from_csv_bytes(bytes: &[u8]) -> Result<Table> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = reader.records();
    let columns = match records.next() {
        Some(header) => unique_column_names(header?.iter()),
        None => return Ok(Table::default()),
    };

    let mut rows = Vec::new();
    for record in records {
        let record = record?;
        rows.push(record.iter().map(CellValue::text).collect());
    }
    Ok(Table::new(columns, rows))
}

/// The MHLW supply-status table with its key columns resolved.
///
/// Immutable once built; share it between threads behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ReferenceTable {
    table: Table,
    columns: ResolvedColumns,
    source: Option<PathBuf>,
}

impl ReferenceTable {
    /// Load the reference table from the cached spreadsheet at `path`
    pub fn load<P: AsRef<Path>>(path: P, patterns: &ColumnPatterns) -> Result<Self> {
        let path = path.as_ref();
        let table = SpreadsheetReader::new().read_path(path)?;
        let mut reference = Self::from_table(table, patterns);
        reference.source = Some(path.to_path_buf());

        tracing::info!(
            path = %path.display(),
            rows = reference.len(),
            update_date_column = reference.columns.update_date.as_deref().unwrap_or("-"),
            drug_code_column = reference.columns.drug_code.as_deref().unwrap_or("-"),
            drug_name_column = reference.columns.drug_name.as_deref().unwrap_or("-"),
            "Loaded MHLW supply-status table"
        );
        Ok(reference)
    }

    /// Load, logging and swallowing any failure.
    ///
    /// `None` means "not loaded": the matcher reports it as a failed check
    /// instead of raising.
    pub fn load_or_log<P: AsRef<Path>>(path: P, patterns: &ColumnPatterns) -> Option<Self> {
        let path = path.as_ref();
        match Self::load(path, patterns) {
            Ok(reference) => Some(reference),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load MHLW data");
                None
            }
        }
    }

    /// Build from an already-read table: fix the header, drop blank rows,
    /// resolve key columns and coerce the update-date column.
    pub fn from_table(mut table: Table, patterns: &ColumnPatterns) -> Self {
        let has_alternate_header = table
            .cell(0, 0)
            .map(|cell| cell.display_string() == patterns.alternate_header_marker)
            .unwrap_or(false);
        if has_alternate_header {
            table.promote_first_row_to_header();
        }

        let dropped = table.drop_empty_rows();
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped empty rows from reference table");
        }

        let columns = patterns.resolve(&table.columns);

        if let Some(idx) = columns.update_date.as_deref().and_then(|c| table.column_index(c)) {
            let mut unparseable = 0usize;
            for cell in table.rows.iter_mut().filter_map(|row| row.get_mut(idx)) {
                let coerced = cell.to_date();
                if coerced.is_none() && !cell.is_empty() {
                    unparseable += 1;
                }
                *cell = coerced.map(CellValue::Date).unwrap_or(CellValue::Empty);
            }
            if unparseable > 0 {
                tracing::debug!(unparseable, "Update dates that could not be parsed were treated as missing");
            }
        }

        Self {
            table,
            columns,
            source: None,
        }
    }

    /// The underlying table
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Resolved key columns
    pub fn columns(&self) -> &ResolvedColumns {
        &self.columns
    }

    /// File this table was loaded from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Number of usable rows
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether there are no usable rows
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Position of the update-date column, if one resolved
    pub fn update_date_index(&self) -> Option<usize> {
        self.index_of(self.columns.update_date.as_deref())
    }

    /// Position of the drug-code column, if one resolved
    pub fn code_index(&self) -> Option<usize> {
        self.index_of(self.columns.drug_code.as_deref())
    }

    /// Position of the drug-name column, if one resolved
    pub fn name_index(&self) -> Option<usize> {
        self.index_of(self.columns.drug_name.as_deref())
    }

    fn index_of(&self, column: Option<&str>) -> Option<usize> {
        column.and_then(|c| self.table.column_index(c))
    }

    /// Every row as an ordered `column -> display string` map
    pub fn records(&self) -> Vec<Map<String, Value>> {
        (0..self.table.len()).map(|row| self.record(row)).collect()
    }

    fn record(&self, row: usize) -> Map<String, Value> {
        self.table
            .record(row)
            .map(|(column, cell)| (column.to_string(), Value::String(cell.display_string())))
            .collect()
    }

    /// Search and page through the raw table.
    ///
    /// A row matches when any of its normalized cells contains the
    /// normalized search term. Pages are 1-based.
    pub fn preview(&self, search: Option<&str>, page: usize, per_page: usize) -> PreviewPage {
        let per_page = if per_page == 0 { ITEMS_PER_PAGE } else { per_page };
        let needle = search.map(normalize_text).filter(|s| !s.is_empty());

        let matching: Vec<usize> = (0..self.table.len())
            .filter(|&row| match &needle {
                Some(needle) => self.table.rows[row]
                    .iter()
                    .any(|cell| normalize_text(&cell.display_string()).contains(needle.as_str())),
                None => true,
            })
            .collect();

        let total_rows = matching.len();
        let total_pages = total_rows.div_ceil(per_page).max(1);
        let page = page.clamp(1, total_pages);
        let data = matching
            .iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .map(|&row| self.record(row))
            .collect();

        PreviewPage {
            columns: self.table.columns.clone(),
            data,
            total_rows,
            page,
            per_page,
            total_pages,
        }
    }
}

/// One page of the raw reference table
#[derive(Debug, Clone, Serialize)]
pub struct PreviewPage {
    pub columns: Vec<String>,
    pub data: Vec<Map<String, Value>>,
    pub total_rows: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_sheet_format_detection() {
        assert_eq!(SheetFormat::from_name("a.XLSX").unwrap(), SheetFormat::Workbook);
        assert_eq!(SheetFormat::from_name("/tmp/b.xls").unwrap(), SheetFormat::Workbook);
        assert_eq!(SheetFormat::from_name("c.csv").unwrap(), SheetFormat::Csv);
        assert!(SheetFormat::from_name("d.pdf").is_err());
        assert!(SheetFormat::from_name("noext").is_err());
    }

    #[test]
    fn test_read_csv_with_bom_and_duplicate_headers() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "pharmacy.csv",
            "\u{feff}YJコード,品名,品名,\n1149019F1560,ロキソニン錠60mg,,\n".as_bytes(),
        );
        let table = SpreadsheetReader::new().read_path(&path).unwrap();
        assert_eq!(table.columns, vec!["YJコード", "品名", "品名.1", "Unnamed: 3"]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.cell(0, 1), Some(&CellValue::text("ロキソニン錠60mg")));
        assert_eq!(table.cell(0, 2), Some(&CellValue::Empty));
    }

    #[test]
    fn test_read_shift_jis_csv() {
        let (encoded, _, _) = encoding_rs::SHIFT_JIS.encode("薬品名\nカロナール錠200\n");
        let table = SpreadsheetReader::new().read_bytes(&encoded, "list.csv").unwrap();
        assert_eq!(table.columns, vec!["薬品名"]);
        assert_eq!(table.cell(0, 0), Some(&CellValue::text("カロナール錠200")));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = SpreadsheetReader::new().read_path("/nonexistent/mhlw_latest.xlsx").unwrap_err();
        assert!(matches!(err, SupplyCheckError::FileNotFound { .. }));
    }

    #[test]
    fn test_corrupt_workbook_is_spreadsheet_error() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "broken.xlsx", b"not a zip archive");
        let err = SpreadsheetReader::new().read_path(&path).unwrap_err();
        assert!(matches!(err, SupplyCheckError::Spreadsheet { .. }));
    }

    #[test]
    fn test_from_table_promotes_alternate_header() {
        let table = Table::from_rows(
            &["医薬品供給状況", "", "", ""],
            vec![
                vec!["①薬剤区分", "⑤YJコード", "⑥品名", "⑳当該品目の更新日"],
                vec!["内用薬", "1149019F1560", "ロキソニン錠60mg", "2026-02-06"],
                vec!["", "", "", ""],
                vec!["内用薬", "1141007F1063", "カロナール錠200", "未定"],
            ],
        );
        let reference = ReferenceTable::from_table(table, &ColumnPatterns::default());

        assert_eq!(reference.table().columns[0], "①薬剤区分");
        assert_eq!(reference.len(), 2);
        assert_eq!(reference.columns().drug_code.as_deref(), Some("⑤YJコード"));
        assert_eq!(reference.columns().drug_name.as_deref(), Some("⑥品名"));
        assert_eq!(reference.update_date_index(), Some(3));

        let expected = NaiveDate::from_ymd_opt(2026, 2, 6).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(reference.table().cell(0, 3), Some(&CellValue::Date(expected)));
        // unparseable dates degrade to missing for that row only
        assert_eq!(reference.table().cell(1, 3), Some(&CellValue::Empty));
    }

    #[test]
    fn test_from_table_without_alternate_header_keeps_header() {
        let table = Table::from_rows(&["⑤YJコード", "⑥品名"], vec![vec!["A1", "薬A"]]);
        let reference = ReferenceTable::from_table(table, &ColumnPatterns::default());
        assert_eq!(reference.table().columns, vec!["⑤YJコード", "⑥品名"]);
        assert_eq!(reference.len(), 1);
        assert_eq!(reference.update_date_index(), None);
    }

    #[test]
    fn test_load_or_log_swallows_missing_file() {
        assert!(ReferenceTable::load_or_log("/nonexistent/mhlw_latest.xlsx", &ColumnPatterns::default()).is_none());
    }

    #[test]
    fn test_load_records_source_path() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "mhlw.csv", "⑤YJコード,⑥品名\nA1,薬A\n".as_bytes());
        let reference = ReferenceTable::load(&path, &ColumnPatterns::default()).unwrap();
        assert_eq!(reference.source(), Some(path.as_path()));
        assert_eq!(reference.records()[0]["⑥品名"], Value::String("薬A".to_string()));
    }

    #[test]
    fn test_preview_search_and_paging() {
        let rows: Vec<Vec<String>> = (0..25)
            .map(|i| vec![format!("CODE{:02}", i), if i % 2 == 0 { "ロキソニン".into() } else { "カロナール".into() }])
            .collect();
        let table = Table::from_rows(&["⑤YJコード", "⑥品名"], rows);
        let reference = ReferenceTable::from_table(table, &ColumnPatterns::default());

        let page = reference.preview(None, 3, 10);
        assert_eq!(page.total_rows, 25);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.data.len(), 5);

        // full-width search term folds to the half-width codes
        let page = reference.preview(Some("ｃｏｄｅ0"), 1, 100);
        assert_eq!(page.total_rows, 10);

        let page = reference.preview(Some("ロキソニン"), 99, 5);
        assert_eq!(page.total_rows, 13);
        assert_eq!(page.page, 3);
    }
}
