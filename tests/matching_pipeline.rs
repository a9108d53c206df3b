/*!
 * End-to-end checks of the matching pipeline
 *
 * Reference and pharmacy tables are written to a temporary directory as CSV
 * (the reader treats CSV and workbooks the same after parsing), loaded the
 * way the service loads them, and matched against a fixed clock.
 *
 * The network test at the bottom talks to the live MHLW site and is ignored
 * by default. Run it with: cargo test --features download -- --ignored
 */

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use supplycheck::prelude::*;
use tempfile::TempDir;

/// MHLW layout with a descriptive row above the real header
const REFERENCE_CSV: &str = "\
医療用医薬品供給状況,,,,,,
①薬剤区分,③成分名,④規格単位,⑤YJコード,⑥品名,⑪出荷対応の状況,⑳当該品目の情報を更新した日
内用薬,ロキソプロフェンナトリウム水和物,60mg1錠,1149019F1560,ロキソニン錠60mg,限定出荷,2026-02-05
内用薬,アムロジピンベシル酸塩,5mg1錠,2171022F1020,アムロジピン錠5mg「サワイ」,通常出荷,2025-11-01
,,,,,,
外用薬,ジクロフェナクナトリウム,1%1g,2649729N1020,ボルタレンゲル1%,供給停止,2026-02-01
";

fn now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 2, 8)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .unwrap()
}

struct Fixture {
    dir: TempDir,
    config: CheckerConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("reference.csv"), REFERENCE_CSV).unwrap();
        let config = CheckerConfig {
            excel_file_name: "reference.csv".to_string(),
            ..ConfigBuilder::new().cache_dir(dir.path()).days_back(10).build()
        };
        Self { dir, config }
    }

    fn pharmacy(&self, name: &str, contents: &str) -> Table {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        SpreadsheetReader::new().read_path(&path).unwrap()
    }

    fn matcher(&self) -> SupplyMatcher {
        SupplyMatcher::from_path(self.config.excel_path(), self.config.patterns.clone())
    }
}

#[test]
fn reference_table_promotes_header_and_drops_blank_rows() {
    let fixture = Fixture::new();
    let reference = ReferenceTable::load(fixture.config.excel_path(), &fixture.config.patterns).unwrap();

    assert_eq!(reference.len(), 3);
    assert_eq!(reference.columns().drug_code.as_deref(), Some("⑤YJコード"));
    assert_eq!(reference.columns().drug_name.as_deref(), Some("⑥品名"));
    assert_eq!(
        reference.columns().update_date.as_deref(),
        Some("⑳当該品目の情報を更新した日")
    );
}

#[test]
fn pharmacy_export_matches_by_code_then_name() {
    let fixture = Fixture::new();
    let pharmacy = fixture.pharmacy(
        "stock.csv",
        "YJコード,医薬品名,在庫数\n\
         1149019F1560,ロキソニン,120\n\
         ,ボルタレンゲル1%,3\n\
         2171022F1020,アムロジピン,40\n\
         1149019F1560,ロキソニン（重複）,5\n\
         0000000X0000,未収載品,1\n",
    );

    let result = fixture.matcher().match_and_filter_at(&pharmacy, 10, now());

    assert!(result.success);
    assert_eq!(result.message, "Matched 2 drugs with recent updates");
    assert_eq!(result.stats.pharmacy_rows, 5);
    // the duplicate code is dropped, the unknown code does not match
    assert_eq!(result.stats.matched_rows, 3);
    assert_eq!(result.stats.recent_updates, 2);

    let first = &result.data[0];
    assert_eq!(first["pharmacy_YJコード"], "1149019F1560");
    assert_eq!(first["pharmacy_在庫数"], "120");
    assert_eq!(first["mhlw_⑪出荷対応の状況"], "限定出荷");
    assert_eq!(first["mhlw_⑳当該品目の情報を更新した日"], "2026-02-05");

    // matched by name since the code cell is empty
    let second = &result.data[1];
    assert_eq!(second["pharmacy_医薬品名"], "ボルタレンゲル1%");
    assert_eq!(second["mhlw_⑤YJコード"], "2649729N1020");

    let keys: Vec<&String> = first.keys().collect();
    assert!(keys.iter().position(|k| k.starts_with("mhlw_")) > keys.iter().rposition(|k| k.starts_with("pharmacy_")));
}

#[test]
fn single_column_upload_is_treated_as_drug_names() {
    let fixture = Fixture::new();
    let pharmacy = fixture.pharmacy("names.csv", "在庫品\nロキソニン錠６０ｍｇ\nアムロジピン錠5mg「サワイ」\n");

    let result = fixture.matcher().match_and_filter_at(&pharmacy, 10, now());

    assert!(result.success);
    // full-width digits fold to ASCII before matching
    assert_eq!(result.stats.matched_rows, 2);
    assert_eq!(result.data.len(), 1);
    assert_eq!(result.data[0]["mhlw_⑥品名"], "ロキソニン錠60mg");
}

#[test]
fn widening_the_window_never_loses_rows() {
    let fixture = Fixture::new();
    let pharmacy = fixture.pharmacy("stock.csv", "YJコード\n1149019F1560\n2171022F1020\n2649729N1020\n");
    let matcher = fixture.matcher();

    let counts: Vec<usize> = [0, 3, 10, 100, 1000]
        .iter()
        .map(|&days| matcher.match_and_filter_at(&pharmacy, days, now()).stats.recent_updates)
        .collect();
    assert!(counts.windows(2).all(|w| w[0] <= w[1]), "{:?}", counts);
    assert_eq!(counts.last(), Some(&3));
}

#[test]
fn missing_cache_reports_not_loaded() {
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new().cache_dir(dir.path()).build();
    let matcher = SupplyMatcher::from_path(config.excel_path(), config.patterns.clone());
    let pharmacy = Table::from_rows(&["医薬品名"], vec![vec!["ロキソニン"]]);

    let result = matcher.match_recent(&pharmacy);
    assert!(!result.success);
    assert_eq!(result.message, "MHLW data not loaded");
    assert!(result.data.is_empty());
}

#[test]
fn results_export_in_every_format() {
    let fixture = Fixture::new();
    let pharmacy = fixture.pharmacy("stock.csv", "YJコード,医薬品名\n1149019F1560,ロキソニン\n");
    let result = fixture.matcher().match_and_filter_at(&pharmacy, 10, now());

    for (format, file) in [
        (ExportFormat::Json, "out.json"),
        (ExportFormat::JsonLines, "out.jsonl"),
        (ExportFormat::Csv, "out.csv"),
    ] {
        let path = fixture.dir.path().join(file);
        result.export(&path, format).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("ロキソニン錠60mg"), "{} output: {}", format, text);
    }
}

#[test]
fn shared_reference_serves_concurrent_checks() {
    let fixture = Fixture::new();
    let cache = Arc::new(TableCache::from_config(&fixture.config));
    let pharmacy = Arc::new(fixture.pharmacy("stock.csv", "YJコード\n1149019F1560\n2649729N1020\n"));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let pharmacy = Arc::clone(&pharmacy);
            std::thread::spawn(move || cache.matcher().match_and_filter_at(&pharmacy, 10, now()))
        })
        .collect();

    for handle in handles {
        let result = handle.join().unwrap();
        assert_eq!(result.data.len(), 2);
    }
}

#[test]
fn service_check_runs_on_blocking_worker() {
    let fixture = Fixture::new();
    let service = SupplyService::new(fixture.config.clone());

    let result = tokio_test::block_on(service.check_upload_with(
        "YJコード\n1149019F1560\n".as_bytes().to_vec(),
        "stock.csv",
        365_000,
    ));
    assert!(result.success);
    assert_eq!(result.data.len(), 1);
}

#[cfg(feature = "download")]
#[tokio::test]
#[ignore]
async fn live_fetch_and_cache() {
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new().cache_dir(dir.path()).build();
    let mut downloader = SupplyDownloader::new(config.clone());

    let first = downloader.fetch_and_cache(false).await;
    assert!(first.success, "{}", first.message);
    assert!(!first.cached);
    assert!(config.excel_path().exists());

    // Unchanged validators mean no second download
    let second = downloader.fetch_and_cache(false).await;
    assert!(second.success && second.cached, "{}", second.message);

    let reference = ReferenceTable::load(config.excel_path(), &config.patterns).unwrap();
    assert!(reference.columns().update_date.is_some());
    assert!(reference.columns().drug_code.is_some());
}
