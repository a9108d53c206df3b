/*!
 * Download and cache the MHLW supply-status workbook
 *
 * This module locates the current workbook link on the MHLW page, checks the
 * remote cache validators (ETag, Last-Modified, Content-Length) and only
 * re-downloads when something changed. The workbook and its metadata sidecar
 * are replaced atomically (write to a temp file in the cache directory, then
 * rename), so a concurrent match never sees a half-written file.
 *
 * Network failures never escape [`SupplyDownloader::fetch_and_cache`]: when
 * a cached workbook exists, the result reports it as still usable.
 */

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::CheckerConfig;
use crate::Result;
#[cfg(not(feature = "download"))]
use crate::SupplyCheckError;

/// Placeholder shown when a date or file name cannot be determined
pub const UNKNOWN: &str = "不明";

lazy_static! {
    static ref HREF_RE: Regex =
        Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"']+)["']"#).unwrap();
    static ref FILE_DATE_RE: Regex = Regex::new(r"([0-9]{6})").unwrap();
}

/// Cache validators and bookkeeping persisted next to the workbook
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub last_modified: String,
    #[serde(default)]
    pub content_length: String,
    /// When the workbook was last downloaded (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<String>,
    /// Workbook URL the cache was downloaded from
    #[serde(default)]
    pub url: String,
    /// When a scheduled check last ran (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<String>,
}

/// Validators read from a HEAD request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMeta {
    pub etag: String,
    pub last_modified: String,
    pub content_length: String,
}

impl CacheMeta {
    /// Whether the cache differs from what the server currently advertises
    pub fn differs_from(&self, remote: &RemoteMeta, url: &str) -> bool {
        self.etag != remote.etag
            || self.last_modified != remote.last_modified
            || self.content_length != remote.content_length
            || self.url != url
    }

    /// Date of the cached data: from the file name, else from Last-Modified
    pub fn data_date(&self) -> String {
        let from_name = extract_date_from_filename(&self.url);
        if from_name != UNKNOWN {
            return from_name;
        }
        parse_http_date(&self.last_modified)
    }
}

/// Outcome of a fetch-and-cache run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheResult {
    /// Whether a usable workbook is on disk afterwards
    pub success: bool,
    pub message: String,
    /// True when the existing cache is being used instead of a fresh download
    pub cached: bool,
    /// Date of the data now in the cache (`YYYY-MM-DD` or [`UNKNOWN`])
    pub last_checked: Option<String>,
    /// Whether the workbook existed before this run
    pub file_exists: bool,
}

/// Current cache state, read without touching the network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub file_exists: bool,
    pub file_size: u64,
    pub downloaded_at: Option<String>,
    pub last_modified: Option<String>,
    pub url: String,
    pub file_date: String,
    pub checked_at: Option<String>,
}

/// Extract the file name from a URL
pub fn extract_filename(url: &str) -> String {
    match url.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => UNKNOWN.to_string(),
    }
}

/// Extract the data date from names like `260206iyakuhinkyoukyu.xlsx`
/// (`YYMMDD`) as `2026-02-06`
pub fn extract_date_from_filename(url: &str) -> String {
    let filename = url.rsplit('/').next().unwrap_or("");
    FILE_DATE_RE
        .captures(filename)
        .and_then(|caps| caps.get(1))
        .and_then(|m| {
            let digits = m.as_str();
            let year: u32 = digits[0..2].parse().ok()?;
            let month: u32 = digits[2..4].parse().ok()?;
            let day: u32 = digits[4..6].parse().ok()?;
            Some(format!("{:04}-{:02}-{:02}", 2000 + year, month, day))
        })
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Parse an HTTP date (`Mon, 08 Feb 2026 00:00:00 GMT`) to `YYYY-MM-DD`
pub fn parse_http_date(value: &str) -> String {
    DateTime::parse_from_rfc2822(value.trim())
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| UNKNOWN.to_string())
}

/// Find the first `.xlsx` link in an HTML page, resolved against `base_url`
pub fn find_xlsx_link(html: &str, base_url: &str) -> Option<String> {
    let href = HREF_RE
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .find(|href| href.to_lowercase().contains(".xlsx"))?;

    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    resolve_url(base_url, href)
}

#[cfg(feature = "download")]
fn resolve_url(base_url: &str, href: &str) -> Option<String> {
    reqwest::Url::parse(base_url)
        .and_then(|base| base.join(href))
        .map(|url| url.to_string())
        .ok()
}

#[cfg(not(feature = "download"))]
fn resolve_url(base_url: &str, href: &str) -> Option<String> {
    // Without an URL parser only root-relative links can be resolved
    let scheme_end = base_url.find("://")? + 3;
    let host_end = base_url[scheme_end..].find('/').map(|i| i + scheme_end).unwrap_or(base_url.len());
    if href.starts_with('/') {
        Some(format!("{}{}", &base_url[..host_end], href))
    } else {
        let dir_end = base_url.rfind('/').filter(|&i| i >= host_end).unwrap_or(host_end);
        Some(format!("{}/{}", &base_url[..dir_end], href))
    }
}

/// Write `contents` to `path` through a temp file in the same directory
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Downloads the MHLW workbook and keeps the on-disk cache current
pub struct SupplyDownloader {
    config: CheckerConfig,
    meta: CacheMeta,
    excel_url: Option<String>,
    #[cfg(feature = "download")]
    client: Option<reqwest::Client>,
}

impl SupplyDownloader {
    /// Create a downloader, loading the metadata sidecar if present
    pub fn new(config: CheckerConfig) -> Self {
        let meta = Self::load_meta(&config.meta_path());
        Self {
            config,
            meta,
            excel_url: None,
            #[cfg(feature = "download")]
            client: None,
        }
    }

    fn load_meta(path: &Path) -> CacheMeta {
        if !path.exists() {
            return CacheMeta::default();
        }
        match std::fs::read_to_string(path)
            .map_err(crate::SupplyCheckError::from)
            .and_then(|text| serde_json::from_str(&text).map_err(Into::into))
        {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load cache metadata");
                CacheMeta::default()
            }
        }
    }

    fn save_meta(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.meta)?;
        write_atomic(&self.config.meta_path(), &json)
    }

    /// Cached metadata
    pub fn meta(&self) -> &CacheMeta {
        &self.meta
    }

    /// Path of the cached workbook
    pub fn excel_path(&self) -> PathBuf {
        self.config.excel_path()
    }

    /// Current cache state without checking for updates
    pub fn status(&self) -> CacheStatus {
        let path = self.config.excel_path();
        let file_size = std::fs::metadata(&path).map(|m| m.len()).ok();
        CacheStatus {
            file_exists: file_size.is_some(),
            file_size: file_size.unwrap_or(0),
            downloaded_at: self.meta.downloaded_at.clone(),
            last_modified: Some(self.meta.last_modified.clone()).filter(|s| !s.is_empty()),
            url: self.meta.url.clone(),
            file_date: extract_date_from_filename(&self.meta.url),
            checked_at: self.meta.checked_at.clone(),
        }
    }

    /// Record that a scheduled check ran, whatever its outcome
    pub fn record_check(&mut self) -> Result<()> {
        self.meta.checked_at = Some(Local::now().to_rfc3339());
        self.save_meta()
    }

    /// Fall back to the cached workbook when one exists
    fn fallback(&self, file_exists: bool, failure: &str, cached_message: impl FnOnce(&str, &str) -> String) -> CacheResult {
        if !file_exists {
            return CacheResult {
                success: false,
                message: failure.to_string(),
                cached: false,
                last_checked: None,
                file_exists,
            };
        }
        let date = self.meta.data_date();
        let filename = extract_filename(&self.meta.url);
        CacheResult {
            success: true,
            message: cached_message(&date, &filename),
            cached: true,
            last_checked: Some(date),
            file_exists,
        }
    }
}

#[cfg(feature = "download")]
impl SupplyDownloader {
    /// Point `excel_url` at the link recorded with the cached workbook.
    ///
    /// A link scraped by an earlier run is replaced whenever the metadata
    /// has one, so a stale link cannot outlive a newer cached download.
    fn reset_excel_url(&mut self) -> Option<String> {
        let cached_url = Some(self.meta.url.clone()).filter(|u| !u.is_empty());
        if cached_url.is_some() {
            self.excel_url = cached_url.clone();
        }
        cached_url
    }

    fn client(&mut self) -> Result<reqwest::Client> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let user_agent = self
            .config
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("supplycheck/{}", env!("CARGO_PKG_VERSION")));
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| crate::SupplyCheckError::Custom {
                message: format!("Failed to create HTTP client: {}", e),
                suggestion: Some("Check your network configuration".to_string()),
            })?;
        self.client = Some(client.clone());
        Ok(client)
    }

    /// Scrape the MHLW page for the workbook link
    pub async fn find_excel_link(&mut self) -> Result<String> {
        let client = self.client()?;
        let page_url = self.config.mhlw_main_url.clone();
        let response = client
            .get(&page_url)
            .timeout(std::time::Duration::from_secs(self.config.scrape_timeout_secs))
            .send()
            .await?
            .error_for_status()?;
        let html = response.text().await?;

        find_xlsx_link(&html, &page_url).ok_or(crate::SupplyCheckError::LinkNotFound { page_url })
    }

    /// Read cache validators with a HEAD request
    pub async fn remote_metadata(&mut self, url: &str) -> Result<RemoteMeta> {
        let client = self.client()?;
        let response = client
            .head(url)
            .timeout(std::time::Duration::from_secs(self.config.meta_timeout_secs))
            .send()
            .await?
            .error_for_status()?;

        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };

        Ok(RemoteMeta {
            etag: header(reqwest::header::ETAG),
            last_modified: header(reqwest::header::LAST_MODIFIED),
            content_length: header(reqwest::header::CONTENT_LENGTH),
        })
    }

    /// Stream the workbook into a temp file, then swap it into place
    pub async fn download_excel(&mut self, url: &str) -> Result<u64> {
        use futures_util::StreamExt;
        use tokio::io::AsyncWriteExt;

        let client = self.client()?;
        let response = client
            .get(url)
            .timeout(std::time::Duration::from_secs(self.config.download_timeout_secs))
            .send()
            .await?
            .error_for_status()?;

        let target = self.config.excel_path();
        let dir = target.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = NamedTempFile::new_in(&dir)?;
        let mut file = tokio::fs::File::from_std(tmp.reopen()?);

        #[cfg(feature = "progress")]
        let progress_bar = response.content_length().map(|total| {
            let pb = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb
        });

        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            #[cfg(feature = "progress")]
            if let Some(ref pb) = progress_bar {
                pb.set_position(downloaded);
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(feature = "progress")]
        if let Some(pb) = progress_bar {
            pb.finish_and_clear();
        }

        tmp.persist(&target).map_err(|e| e.error)?;
        tracing::info!(url, bytes = downloaded, path = %target.display(), "Downloaded MHLW workbook");
        Ok(downloaded)
    }

    /// Check for a newer workbook and download it when needed.
    ///
    /// Never fails: every network error degrades to the cached workbook when
    /// one exists, otherwise to `success: false`.
    pub async fn fetch_and_cache(&mut self, force: bool) -> CacheResult {
        let excel_path = self.config.excel_path();
        let file_exists = excel_path.exists();

        // Prefer the cached URL; scrape only when there is none
        let cached_url = self.reset_excel_url();
        if self.excel_url.is_none() {
            match self.find_excel_link().await {
                Ok(url) => self.excel_url = Some(url),
                Err(e) => tracing::warn!(error = %e, "Failed to scrape MHLW page"),
            }
        }

        let mut url = match self.excel_url.clone() {
            Some(url) => url,
            None => {
                return self.fallback(file_exists, "Failed to find Excel download link", |date, _| {
                    format!("新しいデータが見つかりません。{}のデータを使用しています", date)
                })
            }
        };

        let mut remote = self.remote_metadata(&url).await;
        if remote.is_err() && cached_url.as_deref() == Some(url.as_str()) {
            // The cached link may have been replaced by a newer release
            if let Ok(scraped) = self.find_excel_link().await {
                if scraped != url {
                    url = scraped;
                    self.excel_url = Some(url.clone());
                    remote = self.remote_metadata(&url).await;
                }
            }
        }
        let remote = match remote {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Failed to get remote metadata");
                return self.fallback(file_exists, "Failed to get remote metadata", |date, _| {
                    format!("最新情報の確認に失敗しました。{}のデータを使用しています", date)
                });
            }
        };

        let needs_update = force || !file_exists || self.meta.differs_from(&remote, &url);
        if !needs_update {
            return CacheResult {
                success: true,
                message: format!(
                    "✅ データは最新です。{}（{}）",
                    extract_date_from_filename(&url),
                    extract_filename(&url)
                ),
                cached: true,
                last_checked: Some(extract_date_from_filename(&url)),
                file_exists,
            };
        }

        if let Err(e) = self.download_excel(&url).await {
            tracing::warn!(url = %url, error = %e, "Failed to download Excel");
            return self.fallback(file_exists, "Failed to download Excel", |date, filename| {
                format!("ダウンロードに失敗しました。{}（{}）のデータを使用しています", date, filename)
            });
        }

        self.meta = CacheMeta {
            etag: remote.etag,
            last_modified: remote.last_modified,
            content_length: remote.content_length,
            downloaded_at: Some(Local::now().to_rfc3339()),
            url: url.clone(),
            checked_at: self.meta.checked_at.take(),
        };
        if let Err(e) = self.save_meta() {
            tracing::warn!(error = %e, "Failed to save cache metadata");
        }

        let date = extract_date_from_filename(&url);
        CacheResult {
            success: true,
            message: format!("✅ データが更新されました。{}（{}）", date, extract_filename(&url)),
            cached: false,
            last_checked: Some(date),
            file_exists,
        }
    }
}

#[cfg(not(feature = "download"))]
impl SupplyDownloader {
    /// Without the `download` feature only the existing cache can be used
    pub async fn fetch_and_cache(&mut self, _force: bool) -> CacheResult {
        let file_exists = self.config.excel_path().exists();
        let failure = SupplyCheckError::feature_required("download").to_string();
        self.fallback(file_exists, &failure, |date, _| {
            format!("ダウンロード機能が無効です。{}のデータを使用しています", date)
        })
    }
}
