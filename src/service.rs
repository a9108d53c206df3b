/*!
 * Service layer: table cache, background refresh and timed upload checks
 *
 * [`TableCache`] memoizes the parsed reference table between checks and is
 * invalidated whenever a refresh replaces the cached workbook.
 * [`RefreshCoordinator`] runs at most one refresh at a time on its own
 * thread. [`check_upload`] parses an uploaded spreadsheet and matches it on
 * a blocking worker, bounded by a wall-clock timeout.
 */

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::{
    config::CheckerConfig,
    download::{CacheResult, SupplyDownloader},
    matcher::{MatchResult, SupplyMatcher},
    reader::{ReferenceTable, SpreadsheetReader},
    schema::ColumnPatterns,
    SupplyCheckError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicked refresh must not wedge the service
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lazily loaded, shareable reference table
#[derive(Debug)]
pub struct TableCache {
    path: PathBuf,
    patterns: ColumnPatterns,
    table: Mutex<Option<Arc<ReferenceTable>>>,
}

impl TableCache {
    pub fn new<P: Into<PathBuf>>(path: P, patterns: ColumnPatterns) -> Self {
        Self {
            path: path.into(),
            patterns,
            table: Mutex::new(None),
        }
    }

    pub fn from_config(config: &CheckerConfig) -> Self {
        Self::new(config.excel_path(), config.patterns.clone())
    }

    /// The cached table, loading it on first use.
    ///
    /// Load failures are logged and not memoized, so the next call retries.
    pub fn get_cached_table(&self) -> Option<Arc<ReferenceTable>> {
        let mut slot = lock(&self.table);
        if let Some(table) = slot.as_ref() {
            return Some(Arc::clone(table));
        }
        let loaded = ReferenceTable::load_or_log(&self.path, &self.patterns).map(Arc::new);
        *slot = loaded.clone();
        loaded
    }

    /// Drop the memoized table; checks already holding it keep their `Arc`
    pub fn invalidate(&self) {
        *lock(&self.table) = None;
        tracing::debug!(path = %self.path.display(), "Invalidated reference table cache");
    }

    /// Matcher over the current table (unloaded if it cannot be read)
    pub fn matcher(&self) -> SupplyMatcher {
        SupplyMatcher::new(self.get_cached_table(), self.patterns.clone())
    }
}

/// State of the background refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RefreshStatus {
    Idle,
    Running { started_at: DateTime<Local> },
    Succeeded { at: DateTime<Local>, message: String },
    Failed { at: DateTime<Local>, reason: String },
}

/// Outcome a refresh job reports back: `Ok(message)` or `Err(reason)`
pub type RefreshOutcome = std::result::Result<String, String>;

/// Single-flight runner for refresh jobs
#[derive(Debug, Clone)]
pub struct RefreshCoordinator {
    status: Arc<Mutex<RefreshStatus>>,
    cache: Arc<TableCache>,
}

impl RefreshCoordinator {
    pub fn new(cache: Arc<TableCache>) -> Self {
        Self {
            status: Arc::new(Mutex::new(RefreshStatus::Idle)),
            cache,
        }
    }

    /// Start `job` on a new thread.
    ///
    /// Returns `false` without queuing anything when a refresh is already
    /// running.
    pub fn start<F>(&self, job: F) -> bool
    where
        F: FnOnce() -> RefreshOutcome + Send + 'static,
    {
        {
            let mut status = lock(&self.status);
            if matches!(*status, RefreshStatus::Running { .. }) {
                tracing::info!("Refresh already running");
                return false;
            }
            *status = RefreshStatus::Running { started_at: Local::now() };
        }

        let status = Arc::clone(&self.status);
        let cache = Arc::clone(&self.cache);
        let spawned = thread::Builder::new()
            .name("supplycheck-refresh".to_string())
            .spawn(move || {
                let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                    Ok(outcome) => outcome,
                    Err(_) => Err("refresh job panicked".to_string()),
                };
                let next = match outcome {
                    Ok(message) => {
                        cache.invalidate();
                        tracing::info!(%message, "Refresh finished");
                        RefreshStatus::Succeeded { at: Local::now(), message }
                    }
                    Err(reason) => {
                        tracing::warn!(%reason, "Refresh failed");
                        RefreshStatus::Failed { at: Local::now(), reason }
                    }
                };
                *lock(&status) = next;
            });

        if let Err(e) = spawned {
            *lock(&self.status) = RefreshStatus::Failed {
                at: Local::now(),
                reason: format!("failed to spawn refresh thread: {}", e),
            };
            return false;
        }
        true
    }

    pub fn status(&self) -> RefreshStatus {
        lock(&self.status).clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), RefreshStatus::Running { .. })
    }
}

/// Parse an upload and match it against `matcher`, bounded by `timeout`
pub async fn check_upload(
    matcher: SupplyMatcher,
    bytes: Vec<u8>,
    file_name: String,
    days_back: i64,
    timeout: Duration,
) -> MatchResult {
    let task = tokio::task::spawn_blocking(move || {
        match SpreadsheetReader::new().read_bytes(&bytes, &file_name) {
            Ok(pharmacy) => matcher.match_and_filter(&pharmacy, days_back),
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "Failed to parse upload");
                MatchResult::failure(format!("Error processing file: {}", e), 0)
            }
        }
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => MatchResult::failure(format!("Error processing file: {}", join_error), 0),
        Err(_) => {
            let err = SupplyCheckError::Timeout {
                operation: "upload check".to_string(),
                seconds: timeout.as_secs(),
            };
            tracing::warn!(error = %err, "Upload check timed out");
            MatchResult::failure(err.to_string(), 0)
        }
    }
}

/// Ties the cache, the refresh coordinator and upload checks together
#[derive(Debug, Clone)]
pub struct SupplyService {
    config: CheckerConfig,
    cache: Arc<TableCache>,
    refresh: RefreshCoordinator,
}

impl SupplyService {
    pub fn new(config: CheckerConfig) -> Self {
        let cache = Arc::new(TableCache::from_config(&config));
        let refresh = RefreshCoordinator::new(Arc::clone(&cache));
        Self { config, cache, refresh }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    pub fn cache(&self) -> &TableCache {
        &self.cache
    }

    pub fn refresh_status(&self) -> RefreshStatus {
        self.refresh.status()
    }

    /// Check an upload with the configured window and timeout
    pub async fn check_upload(&self, bytes: Vec<u8>, file_name: &str) -> MatchResult {
        self.check_upload_with(bytes, file_name, self.config.days_back).await
    }

    /// Check an upload with an explicit recency window
    pub async fn check_upload_with(&self, bytes: Vec<u8>, file_name: &str, days_back: i64) -> MatchResult {
        check_upload(
            self.cache.matcher(),
            bytes,
            file_name.to_string(),
            days_back,
            self.config.check_timeout(),
        )
        .await
    }

    /// Start a background fetch-and-cache; `false` if one is in flight
    pub fn start_refresh(&self, force: bool) -> bool {
        let config = self.config.clone();
        self.refresh.start(move || run_refresh(config, force))
    }

    /// Run a fetch-and-cache on the current task and invalidate the cache
    pub async fn refresh_now(&self, force: bool) -> CacheResult {
        let mut downloader = SupplyDownloader::new(self.config.clone());
        let result = downloader.fetch_and_cache(force).await;
        if let Err(e) = downloader.record_check() {
            tracing::warn!(error = %e, "Failed to record check time");
        }
        if result.success && !result.cached {
            self.cache.invalidate();
        }
        result
    }
}

fn run_refresh(config: CheckerConfig, force: bool) -> RefreshOutcome {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start runtime: {}", e))?;
    let mut downloader = SupplyDownloader::new(config);
    let result = runtime.block_on(downloader.fetch_and_cache(force));
    if let Err(e) = downloader.record_check() {
        tracing::warn!(error = %e, "Failed to record check time");
    }
    if result.success {
        Ok(result.message)
    } else {
        Err(result.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::TempDir;

    const REFERENCE_CSV: &str = "\
薬価基準収載医薬品コード,⑥品名,⑳当該品目の情報を更新した日
1149019F1560,ロキソニン錠60mg,2026-02-05
2171014G1020,アムロジピン錠5mg,2025-06-01
";

    fn write_reference(dir: &TempDir) -> CheckerConfig {
        let config = crate::config::ConfigBuilder::new().cache_dir(dir.path()).build();
        let path = dir.path().join("reference.csv");
        std::fs::write(&path, REFERENCE_CSV).unwrap();
        CheckerConfig {
            excel_file_name: "reference.csv".to_string(),
            ..config
        }
    }

    fn wait_until_idle(coordinator: &RefreshCoordinator) -> RefreshStatus {
        for _ in 0..200 {
            if !coordinator.is_running() {
                return coordinator.status();
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("refresh did not finish");
    }

    #[test]
    fn test_table_cache_memoizes_and_invalidates() {
        let dir = TempDir::new().unwrap();
        let config = write_reference(&dir);
        let cache = TableCache::from_config(&config);

        let first = cache.get_cached_table().unwrap();
        let second = cache.get_cached_table().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);

        cache.invalidate();
        let third = cache.get_cached_table().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_table_cache_missing_file_is_not_loaded() {
        let dir = TempDir::new().unwrap();
        let config = crate::config::ConfigBuilder::new().cache_dir(dir.path()).build();
        let cache = TableCache::from_config(&config);
        assert!(cache.get_cached_table().is_none());
        assert!(!cache.matcher().is_loaded());
    }

    #[test]
    fn test_refresh_is_single_flight() {
        let dir = TempDir::new().unwrap();
        let config = write_reference(&dir);
        let cache = Arc::new(TableCache::from_config(&config));
        let coordinator = RefreshCoordinator::new(Arc::clone(&cache));
        assert_eq!(coordinator.status(), RefreshStatus::Idle);

        let (release_tx, release_rx) = mpsc::channel::<()>();
        assert!(coordinator.start(move || {
            release_rx.recv().ok();
            Ok("updated".to_string())
        }));
        assert!(coordinator.is_running());

        // A second start while the first is in flight is rejected
        assert!(!coordinator.start(|| Ok("second".to_string())));

        release_tx.send(()).unwrap();
        match wait_until_idle(&coordinator) {
            RefreshStatus::Succeeded { message, .. } => assert_eq!(message, "updated"),
            other => panic!("unexpected status {:?}", other),
        }

        // Once finished a new refresh may start
        assert!(coordinator.start(|| Err("offline".to_string())));
        match wait_until_idle(&coordinator) {
            RefreshStatus::Failed { reason, .. } => assert_eq!(reason, "offline"),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_successful_refresh_invalidates_cache() {
        let dir = TempDir::new().unwrap();
        let config = write_reference(&dir);
        let cache = Arc::new(TableCache::from_config(&config));
        let before = cache.get_cached_table().unwrap();

        let coordinator = RefreshCoordinator::new(Arc::clone(&cache));
        assert!(coordinator.start(|| Ok("done".to_string())));
        wait_until_idle(&coordinator);

        let after = cache.get_cached_table().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_panicking_job_is_reported_as_failure() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(TableCache::new(dir.path().join("none.xlsx"), ColumnPatterns::default()));
        let coordinator = RefreshCoordinator::new(cache);
        assert!(coordinator.start(|| panic!("boom")));
        assert!(matches!(wait_until_idle(&coordinator), RefreshStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_check_upload_reports_parse_errors() {
        let result = check_upload(
            SupplyMatcher::new(None, ColumnPatterns::default()),
            b"irrelevant".to_vec(),
            "upload.pdf".to_string(),
            10,
            Duration::from_secs(5),
        )
        .await;
        assert!(!result.success);
        assert!(result.message.starts_with("Error processing file:"));
    }

    #[tokio::test]
    async fn test_check_upload_without_reference() {
        let result = check_upload(
            SupplyMatcher::new(None, ColumnPatterns::default()),
            "医薬品名\nロキソニン錠60mg\n".as_bytes().to_vec(),
            "upload.csv".to_string(),
            10,
            Duration::from_secs(5),
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.message, "MHLW data not loaded");
        assert_eq!(result.stats.pharmacy_rows, 1);
    }

    #[tokio::test]
    async fn test_service_check_upload_matches_by_code() {
        let dir = TempDir::new().unwrap();
        let config = write_reference(&dir);
        let service = SupplyService::new(config);

        let upload = "薬品コード,医薬品名\n1149019F1560,ロキソニン\n9999999X9999,不明な薬\n";
        let result = service
            .check_upload_with(upload.as_bytes().to_vec(), "stock.csv", 36500)
            .await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.stats.pharmacy_rows, 2);
        assert_eq!(result.data.len(), 1);
        assert_eq!(result.data[0]["pharmacy_薬品コード"], "1149019F1560");
    }

    #[tokio::test]
    async fn test_check_upload_times_out() {
        let big: String = std::iter::once("医薬品名\n".to_string())
            .chain((0..200_000).map(|i| format!("薬{}\n", i)))
            .collect();
        let result = check_upload(
            SupplyMatcher::new(None, ColumnPatterns::default()),
            big.into_bytes(),
            "upload.csv".to_string(),
            10,
            Duration::from_nanos(1),
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.message, "Operation timed out after 0s: upload check");
    }
}
