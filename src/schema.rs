/*!
 * Column patterns and column resolution
 *
 * Neither the MHLW sheet nor a pharmacy export has a fixed schema, so the
 * columns the matcher needs are located at runtime from ordered lists of
 * candidate names. The lists are configuration data: [`ColumnPatterns`]
 * holds the literals the MHLW sheet and common pharmacy systems use, and can
 * be overridden from the config file.
 */

use serde::{Deserialize, Serialize};

use crate::normalize::normalize_text;

/// Header of the MHLW "date of last update other than ⑫" column
pub const UPDATE_DATE_COLUMN_PATTERN: &str = "⑳当該品目";

/// First cell of the descriptive header row some MHLW releases ship above
/// the real header
pub const ALTERNATE_HEADER_MARKER: &str = "①薬剤区分";

/// Drug-code candidates in priority order
pub const DRUG_CODE_COLUMN_PATTERNS: &[&str] = &[
    // Official MHLW format
    "⑤YJコード",
    // YJ code variants
    "YJコード", "YJ-コード", "YJコード番号",
    // Drug code variants
    "医薬品コード", "医薬品キー", "医薬品番号", "医薬品ID",
    "薬品コード", "薬品キー", "薬品番号", "薬品ID",
    // Product/item code variants
    "製品コード", "商品コード", "品目コード",
    // Database codes
    "NDBコード", "HOTコード", "JAN",
];

/// Drug-name candidates in priority order
pub const DRUG_NAME_COLUMN_PATTERNS: &[&str] = &[
    // Official MHLW format
    "⑥品名",
    // Brand/product name variants
    "医薬品名", "医薬品正式名", "医薬品正式品名",
    "薬品名", "薬品正式名",
    "品名", "正式品名",
    "製品名", "商品名", "製品正式名",
    "販売名",
];

/// Ingredient-name candidates (grouped output)
pub const INGREDIENT_COLUMN_PATTERNS: &[&str] = &["③成分名", "成分名", "③", "ingredient"];

/// Specification/unit candidates (grouped output)
pub const SPEC_COLUMN_PATTERNS: &[&str] = &["④規格単位", "規格単位", "④", "specification"];

/// Domain terms that mark a pattern list as code-related
const CODE_TERMS: (&str, &str) = ("code", "コード");

/// Domain terms that mark a pattern list as name-related
const NAME_TERMS: (&str, &str) = ("name", "名");

/// Ordered candidate names for every logical column the crate resolves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPatterns {
    /// Update-date column (single fixed marker)
    #[serde(default = "default_update_date")]
    pub update_date: String,

    /// First-cell value that identifies a descriptive pre-header row
    #[serde(default = "default_alternate_header")]
    pub alternate_header_marker: String,

    /// Drug-code candidates in priority order
    #[serde(default = "default_drug_code")]
    pub drug_code: Vec<String>,

    /// Drug-name candidates in priority order
    #[serde(default = "default_drug_name")]
    pub drug_name: Vec<String>,

    /// Ingredient-name candidates
    #[serde(default = "default_ingredient")]
    pub ingredient: Vec<String>,

    /// Specification/unit candidates
    #[serde(default = "default_specification")]
    pub specification: Vec<String>,
}

fn owned(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}

fn default_update_date() -> String {
    UPDATE_DATE_COLUMN_PATTERN.to_string()
}

fn default_alternate_header() -> String {
    ALTERNATE_HEADER_MARKER.to_string()
}

fn default_drug_code() -> Vec<String> {
    owned(DRUG_CODE_COLUMN_PATTERNS)
}

fn default_drug_name() -> Vec<String> {
    owned(DRUG_NAME_COLUMN_PATTERNS)
}

fn default_ingredient() -> Vec<String> {
    owned(INGREDIENT_COLUMN_PATTERNS)
}

fn default_specification() -> Vec<String> {
    owned(SPEC_COLUMN_PATTERNS)
}

impl Default for ColumnPatterns {
    fn default() -> Self {
        Self {
            update_date: default_update_date(),
            alternate_header_marker: default_alternate_header(),
            drug_code: default_drug_code(),
            drug_name: default_drug_name(),
            ingredient: default_ingredient(),
            specification: default_specification(),
        }
    }
}

/// Columns resolved against one table's schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedColumns {
    pub update_date: Option<String>,
    pub drug_code: Option<String>,
    pub drug_name: Option<String>,
}

impl ColumnPatterns {
    /// Resolve update-date, drug-code and drug-name columns in `schema`
    pub fn resolve<S: AsRef<str>>(&self, schema: &[S]) -> ResolvedColumns {
        ResolvedColumns {
            update_date: find_column(schema, std::slice::from_ref(&self.update_date))
                .map(str::to_string),
            drug_code: find_column(schema, &self.drug_code).map(str::to_string),
            drug_name: find_column(schema, &self.drug_name).map(str::to_string),
        }
    }
}

/// Find the schema column best matching a prioritized list of patterns.
///
/// Tiers, first one with a hit wins:
/// 1. exact match
/// 2. case-insensitive substring
/// 3. normalized (width-folded) substring
/// 4. semantic fallback on the domain terms for "code" / "name"
///
/// Within a tier, schema order breaks ties. `None` means the signal is
/// unavailable for this table.
pub fn find_column<'a, S, P>(schema: &'a [S], patterns: &[P]) -> Option<&'a str>
where
    S: AsRef<str>,
    P: AsRef<str>,
{
    let columns = || schema.iter().map(AsRef::as_ref);

    // 1. Exact
    for col in columns() {
        if patterns.iter().any(|p| col == p.as_ref()) {
            return Some(col);
        }
    }

    // 2. Case-insensitive substring
    let lowered: Vec<String> = patterns.iter().map(|p| p.as_ref().to_lowercase()).collect();
    for col in columns() {
        let col_lower = col.to_lowercase();
        if lowered.iter().any(|p| col_lower.contains(p.as_str())) {
            return Some(col);
        }
    }

    // 3. Normalized substring
    let normalized: Vec<String> = patterns.iter().map(|p| normalize_text(p.as_ref())).collect();
    for col in columns() {
        let col_normalized = normalize_text(col);
        if normalized.iter().any(|p| col_normalized.contains(p.as_str())) {
            return Some(col);
        }
    }

    // 4. Semantic fallback
    if mentions_any(patterns, CODE_TERMS) {
        if let Some(col) = columns().find(|col| contains_term(col, CODE_TERMS)) {
            return Some(col);
        }
    }
    if mentions_any(patterns, NAME_TERMS) {
        if let Some(col) = columns().find(|col| contains_term(col, NAME_TERMS)) {
            return Some(col);
        }
    }

    None
}

fn contains_term(value: &str, (latin, japanese): (&str, &str)) -> bool {
    value.contains(japanese) || value.to_lowercase().contains(latin)
}

fn mentions_any<P: AsRef<str>>(patterns: &[P], terms: (&str, &str)) -> bool {
    patterns.iter().any(|p| contains_term(p.as_ref(), terms))
}
