/*!
 * Matching engine: pharmacy table × MHLW supply-status table
 *
 * [`SupplyMatcher::match_and_filter`] joins an uploaded pharmacy table
 * against the reference table on normalized drug codes (falling back to
 * drug names), drops duplicate pharmacy codes, and keeps only drugs whose
 * supply status was updated within the recency window.
 *
 * The indexes are rebuilt on every call from the shared, read-only
 * reference table, so a single matcher can serve concurrent checks.
 */

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    constants::{DEFAULT_DAYS_BACK, NAME_PREFIX_LEN, NAME_PREFIX_MIN_LEN},
    data_types::{CellValue, Table},
    normalize::normalize_cell,
    reader::ReferenceTable,
    schema::{find_column, ColumnPatterns},
};

/// One output row: `pharmacy_*` fields followed by `mhlw_*` fields
pub type MatchedRow = Map<String, Value>;

/// Counters reported with every check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchStats {
    /// Rows in the uploaded table
    pub pharmacy_rows: usize,
    /// Rows that matched the reference table (after code dedup)
    pub matched_rows: usize,
    /// Matched rows with an update inside the recency window
    pub recent_updates: usize,
}

/// Result of one check, serializable as a JSON response body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub success: bool,
    pub message: String,
    pub data: Vec<MatchedRow>,
    pub stats: MatchStats,
}

impl MatchResult {
    /// A failed check carrying only a message and the row count
    pub fn failure<S: Into<String>>(message: S, pharmacy_rows: usize) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Vec::new(),
            stats: MatchStats {
                pharmacy_rows,
                ..Default::default()
            },
        }
    }
}

/// Lookup structures over the reference table, keyed by normalized text.
///
/// Values are reference row positions in table order.
#[derive(Debug, Default)]
pub struct MatchIndex {
    pub code_index: HashMap<String, Vec<usize>>,
    pub name_index: HashMap<String, Vec<usize>>,
    pub name_prefix_index: HashMap<String, Vec<usize>>,
}

impl MatchIndex {
    /// Build all three indexes in one pass
    pub fn build(reference: &ReferenceTable) -> Self {
        let mut index = Self::default();
        let code_idx = reference.code_index();
        let name_idx = reference.name_index();

        for (pos, row) in reference.table().rows.iter().enumerate() {
            if let Some(code) = code_idx.map(|i| normalize_cell(cell_in(row, i))).filter(|c| !c.is_empty()) {
                index.code_index.entry(code).or_default().push(pos);
            }
            if let Some(name) = name_idx.map(|i| normalize_cell(cell_in(row, i))).filter(|n| !n.is_empty()) {
                if name.chars().count() > NAME_PREFIX_MIN_LEN {
                    index
                        .name_prefix_index
                        .entry(name_prefix(&name))
                        .or_default()
                        .push(pos);
                }
                index.name_index.entry(name).or_default().push(pos);
            }
        }

        index
    }

    /// Code lookup; empty keys never match
    pub fn by_code(&self, code: &str) -> &[usize] {
        if code.is_empty() {
            return &[];
        }
        self.code_index.get(code).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Exact name lookup, then prefix lookup for names longer than
    /// [`NAME_PREFIX_MIN_LEN`] characters
    pub fn by_name(&self, name: &str) -> &[usize] {
        if name.is_empty() {
            return &[];
        }
        if let Some(rows) = self.name_index.get(name).filter(|r| !r.is_empty()) {
            return rows;
        }
        if name.chars().count() > NAME_PREFIX_MIN_LEN {
            if let Some(rows) = self.name_prefix_index.get(&name_prefix(name)) {
                return rows;
            }
        }
        &[]
    }
}

static EMPTY_CELL: CellValue = CellValue::Empty;

/// Cell `column` of a row; short rows read as empty
fn cell_in(row: &[CellValue], column: usize) -> &CellValue {
    row.get(column).unwrap_or(&EMPTY_CELL)
}

/// Cell at (`row`, `column`); out-of-range positions read as empty
fn cell_at(table: &Table, row: usize, column: usize) -> &CellValue {
    table.cell(row, column).unwrap_or(&EMPTY_CELL)
}

/// Oldest update time that still counts as recent.
///
/// Windows beyond the representable date range accept everything (positive)
/// or nothing (negative).
fn recency_cutoff(now: NaiveDateTime, days_back: i64) -> NaiveDateTime {
    Duration::try_days(days_back)
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(if days_back >= 0 { NaiveDateTime::MIN } else { NaiveDateTime::MAX })
}

/// First [`NAME_PREFIX_LEN`] characters of a normalized name
fn name_prefix(name: &str) -> String {
    name.chars().take(NAME_PREFIX_LEN).collect()
}

/// Matches pharmacy tables against a loaded MHLW reference table
#[derive(Debug, Clone)]
pub struct SupplyMatcher {
    reference: Option<Arc<ReferenceTable>>,
    patterns: ColumnPatterns,
}

impl SupplyMatcher {
    /// Create a matcher over an already-loaded (or absent) reference table
    pub fn new(reference: Option<Arc<ReferenceTable>>, patterns: ColumnPatterns) -> Self {
        Self { reference, patterns }
    }

    /// Load the reference table from `path`; a load failure leaves the
    /// matcher in the "not loaded" state rather than erroring
    pub fn from_path<P: AsRef<Path>>(path: P, patterns: ColumnPatterns) -> Self {
        let reference = ReferenceTable::load_or_log(path, &patterns).map(Arc::new);
        Self::new(reference, patterns)
    }

    /// The reference table, if loaded
    pub fn reference(&self) -> Option<&ReferenceTable> {
        self.reference.as_deref()
    }

    /// Whether a reference table is loaded
    pub fn is_loaded(&self) -> bool {
        self.reference.is_some()
    }

    /// Match with the default window of [`DEFAULT_DAYS_BACK`] days
    pub fn match_recent(&self, pharmacy: &Table) -> MatchResult {
        self.match_and_filter(pharmacy, DEFAULT_DAYS_BACK)
    }

    /// Match `pharmacy` and keep drugs updated within `days_back` days of now
    pub fn match_and_filter(&self, pharmacy: &Table, days_back: i64) -> MatchResult {
        self.match_and_filter_at(pharmacy, days_back, Local::now().naive_local())
    }

    /// [`match_and_filter`](Self::match_and_filter) against an explicit clock
    pub fn match_and_filter_at(&self, pharmacy: &Table, days_back: i64, now: NaiveDateTime) -> MatchResult {
        let pharmacy_rows = pharmacy.len();

        let reference = match self.reference.as_deref() {
            Some(reference) => reference,
            None => return MatchResult::failure("MHLW data not loaded", pharmacy_rows),
        };
        if reference.is_empty() {
            return MatchResult::failure("MHLW data is empty", pharmacy_rows);
        }

        // Pharmacy columns resolve with the same pattern lists as the reference
        let ph_code_idx = find_column(&pharmacy.columns, &self.patterns.drug_code)
            .and_then(|c| pharmacy.column_index(c));
        let mut ph_name_idx = find_column(&pharmacy.columns, &self.patterns.drug_name)
            .and_then(|c| pharmacy.column_index(c));
        if ph_name_idx.is_none() && pharmacy.width() == 1 {
            ph_name_idx = Some(0);
        }

        let index = MatchIndex::build(reference);
        let update_idx = reference.update_date_index();
        let cutoff = recency_cutoff(now, days_back);

        let mut stats = MatchStats {
            pharmacy_rows,
            ..Default::default()
        };
        let mut data = Vec::new();
        let mut seen_codes: HashSet<String> = HashSet::new();

        for (pos, row) in pharmacy.rows.iter().enumerate() {
            let code = ph_code_idx.map(|i| normalize_cell(cell_in(row, i))).unwrap_or_default();

            let mut matches = index.by_code(&code);
            if matches.is_empty() {
                if let Some(i) = ph_name_idx {
                    matches = index.by_name(&normalize_cell(cell_in(row, i)));
                }
            }
            if matches.is_empty() {
                continue;
            }

            if !code.is_empty() && !seen_codes.insert(code) {
                continue;
            }

            stats.matched_rows += 1;

            let recent = match update_idx {
                None => true,
                Some(u) => matches.iter().any(|&m| {
                    cell_at(reference.table(), m, u)
                        .as_date()
                        .map(|date| date >= cutoff)
                        .unwrap_or(false)
                }),
            };

            if recent {
                stats.recent_updates += 1;
                data.push(format_result_row(pharmacy, pos, reference.table(), matches[0]));
            }
        }

        tracing::debug!(
            pharmacy_rows = stats.pharmacy_rows,
            matched_rows = stats.matched_rows,
            recent_updates = stats.recent_updates,
            days_back,
            "Matched pharmacy table"
        );

        MatchResult {
            success: true,
            message: format!("Matched {} drugs with recent updates", data.len()),
            data,
            stats,
        }
    }

    /// Combine several matched reference rows into one output row.
    ///
    /// The ingredient name comes from the first row, the distinct
    /// specifications of all rows are joined with newlines, and the other
    /// reference fields come from the first row. `match_and_filter` does not
    /// use this format; it emits one representative row per pharmacy row.
    pub fn format_result_row_grouped(&self, pharmacy: &Table, pharmacy_row: usize, matches: &[usize]) -> MatchedRow {
        let mut result = Map::new();
        append_fields(&mut result, "pharmacy_", pharmacy, pharmacy_row, &[]);

        let (reference, first) = match (self.reference.as_deref(), matches.first()) {
            (Some(reference), Some(&first)) => (reference.table(), first),
            _ => return result,
        };

        let ingredient_col = find_column(&reference.columns, &self.patterns.ingredient)
            .and_then(|c| reference.column_index(c));
        let spec_col = find_column(&reference.columns, &self.patterns.specification)
            .and_then(|c| reference.column_index(c));

        let ingredient_name = match ingredient_col {
            Some(i) => cell_at(reference, first, i).display_string(),
            None => ["医薬品名", "薬品名"]
                .iter()
                .filter_map(|c| reference.column_index(c))
                .map(|i| cell_at(reference, first, i).display_string())
                .find(|s| !s.is_empty())
                .unwrap_or_default(),
        };

        let mut specs: Vec<String> = Vec::new();
        if let Some(s) = spec_col {
            for &m in matches {
                let spec = cell_at(reference, m, s).display_string();
                if !spec.is_empty() && !specs.contains(&spec) {
                    specs.push(spec);
                }
            }
        }

        result.insert("mhlw_ingredient_name".to_string(), Value::String(ingredient_name));
        result.insert("mhlw_spec".to_string(), Value::String(specs.join("\n")));

        let skip: Vec<usize> = ingredient_col.into_iter().chain(spec_col).collect();
        append_fields(&mut result, "mhlw_", reference, first, &skip);
        result
    }
}

/// Flatten one pharmacy row and one reference row into an output row
pub fn format_result_row(pharmacy: &Table, pharmacy_row: usize, reference: &Table, reference_row: usize) -> MatchedRow {
    let mut result = Map::new();
    append_fields(&mut result, "pharmacy_", pharmacy, pharmacy_row, &[]);
    append_fields(&mut result, "mhlw_", reference, reference_row, &[]);
    result
}

/// Copy every non-internal field of `row`, prefixing the column name.
/// Columns named with a leading `_` are internal markers and skipped.
fn append_fields(out: &mut MatchedRow, prefix: &str, table: &Table, row: usize, skip: &[usize]) {
    for (idx, (column, cell)) in table.record(row).enumerate() {
        if column.is_empty() || column.starts_with('_') || skip.contains(&idx) {
            continue;
        }
        out.insert(format!("{}{}", prefix, column), Value::String(render_cell(cell)));
    }
}

fn render_cell(cell: &CellValue) -> String {
    match cell {
        CellValue::Date(dt) => dt.format("%Y-%m-%d").to_string(),
        other => other.display_string(),
    }
}
