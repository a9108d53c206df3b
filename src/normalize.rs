/*!
 * Text normalization for comparison keys
 *
 * Spreadsheet authors mix full-width and half-width forms of the same code
 * (`ＹＪ１２３` vs `YJ123`). Every code and name comparison in the crate goes
 * through [`normalize_text`]: two values match if and only if their
 * normalized forms are equal.
 */

use unicode_normalization::UnicodeNormalization;

use crate::data_types::CellValue;

/// Fold width (NFKC), lowercase and trim a text value.
///
/// Never fails; an empty input yields an empty string.
///
/// ```
/// use supplycheck::normalize::normalize_text;
/// assert_eq!(normalize_text("ＡＺ１２３"), "az123");
/// assert_eq!(normalize_text("  spaces  "), "spaces");
/// ```
pub fn normalize_text(text: &str) -> String {
    let folded: String = text.nfkc().collect();
    folded.to_lowercase().trim().to_string()
}

/// Normalize a cell; missing values yield an empty key.
pub fn normalize_cell(value: &CellValue) -> String {
    if value.is_empty() {
        return String::new();
    }
    normalize_text(&value.display_string())
}

/// Normalize an optional text value, `None` yields an empty key.
pub fn normalize_opt(text: Option<&str>) -> String {
    text.map(normalize_text).unwrap_or_default()
}
