/*!
 * # supplycheck: MHLW drug supply-status checker
 *
 * Matches a pharmacy's drug list against the supply-status workbook the
 * Japanese Ministry of Health, Labour and Welfare (MHLW) publishes, and
 * reports the drugs whose supply status changed recently.
 *
 * ## Features
 *
 * - **Robust column detection**: headers are found by exact, substring and
 *   width-insensitive matching, so differently laid out pharmacy exports work
 * - **Code-first matching**: YJ/drug codes first, drug names as a fallback
 * - **Recency filter**: keep only drugs updated in the last N days
 * - **Cached downloads**: the workbook is re-downloaded only when the MHLW
 *   server reports a change (feature `download`)
 * - **Multiple export formats**: JSON, JSON Lines and CSV
 *
 * ## Quick Start
 *
 * ```no_run
 * use supplycheck::prelude::*;
 *
 * # fn main() -> Result<()> {
 * let config = CheckerConfig::load();
 * let matcher = SupplyMatcher::from_path(config.excel_path(), config.patterns.clone());
 *
 * let pharmacy = SpreadsheetReader::new().read_path("stock.xlsx")?;
 * let result = matcher.match_and_filter(&pharmacy, config.days_back);
 *
 * println!("{}", result.message);
 * result.export("recent.csv", ExportFormat::Csv)?;
 * # Ok(())
 * # }
 * ```
 *
 * ## Refreshing the cache
 *
 * ```no_run
 * # use supplycheck::prelude::*;
 * # async fn refresh() {
 * let mut downloader = SupplyDownloader::new(CheckerConfig::load());
 * let outcome = downloader.fetch_and_cache(false).await;
 * println!("{}", outcome.message);
 * # }
 * ```
 *
 * ## Serving checks
 *
 * [`service::SupplyService`] keeps the parsed reference table in memory,
 * runs refreshes single-flight on a background thread and bounds each
 * upload check by a timeout.
 *
 * The workbook is published at
 * https://www.mhlw.go.jp/stf/seisakunitsuite/bunya/kenkou_iryou/iryou/kouhatu-iyaku/04_00003.html
 */

// Re-export error types from root
pub use error::{SupplyCheckError, Result, ErrorContext, ExportFormat};

// Public modules
pub mod normalize;
pub mod data_types;
pub mod schema;
pub mod reader;
pub mod matcher;
pub mod download;
pub mod service;
pub mod export;
pub mod error;
pub mod config;

/// Prelude module for convenient imports
///
/// Import everything you need with:
/// ```
/// use supplycheck::prelude::*;
/// ```
pub mod prelude {
    pub use crate::data_types::{CellValue, Table};
    pub use crate::normalize::normalize_text;
    pub use crate::schema::{find_column, ColumnPatterns, ResolvedColumns};
    pub use crate::reader::{ReferenceTable, SpreadsheetReader, PreviewPage};
    pub use crate::matcher::{MatchResult, MatchStats, MatchedRow, SupplyMatcher};
    pub use crate::download::{CacheResult, CacheStatus, SupplyDownloader};
    pub use crate::service::{RefreshStatus, SupplyService, TableCache};
    pub use crate::export::{CsvExporter, JsonExporter, MatchExporter, ResultExporter};
    pub use crate::config::{CheckerConfig, ConfigBuilder};
    pub use crate::error::{SupplyCheckError, Result};
    pub use crate::ExportFormat;
}

/// Supply-check constants
pub mod constants {
    /// Default recency window in days
    pub const DEFAULT_DAYS_BACK: i64 = 10;

    /// Characters of a normalized drug name used as its prefix key
    pub const NAME_PREFIX_LEN: usize = 5;

    /// Names must be longer than this to get a prefix key
    pub const NAME_PREFIX_MIN_LEN: usize = 3;

    /// Default page size for reference table previews
    pub const ITEMS_PER_PAGE: usize = 100;

    /// File extensions the spreadsheet reader accepts
    pub const SUPPORTED_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods", "csv"];
}

/// Common recipes and utility functions
pub mod cookbook {
    use std::path::Path;

    use crate::prelude::*;

    /// Check a pharmacy file on disk against the cached MHLW table
    ///
    /// # Example
    /// ```no_run
    /// # use supplycheck::prelude::*;
    /// # use supplycheck::cookbook::check_pharmacy_file;
    /// # fn main() -> Result<()> {
    /// let result = check_pharmacy_file(&CheckerConfig::load(), "stock.csv")?;
    /// for row in &result.data {
    ///     println!("{:?}", row.get("mhlw_⑥品名"));
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn check_pharmacy_file<P: AsRef<Path>>(config: &CheckerConfig, path: P) -> Result<MatchResult> {
        let pharmacy = SpreadsheetReader::new().read_path(path)?;
        let matcher = SupplyMatcher::from_path(config.excel_path(), config.patterns.clone());
        Ok(matcher.match_and_filter(&pharmacy, config.days_back))
    }

    /// Pharmacy-side drug names of the matched rows, in output order
    pub fn matched_drug_names(result: &MatchResult) -> Vec<String> {
        result
            .data
            .iter()
            .filter_map(|row| {
                row.iter()
                    .filter(|(key, _)| key.starts_with("pharmacy_"))
                    .find(|(key, _)| key.contains('名'))
                    .and_then(|(_, value)| value.as_str().map(str::to_string))
            })
            .collect()
    }
}
