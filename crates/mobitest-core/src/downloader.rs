//! Downloading iOS builds from the distribution site.
//!
//! The site lists one HTML page per build. The page for a version carries an
//! `<a class="ipa">` link to the package itself.
//!
//! # Example
//!
//! ```no_run
//! use mobitest_core::config::MobitestConfig;
//! use mobitest_core::downloader::IpaDownloader;
//!
//! # async fn example() -> Result<(), mobitest_core::downloader::DownloadError> {
//! let downloader = IpaDownloader::from_config(&MobitestConfig::load())?;
//! let path = downloader.download_ipa("2.9.26.19736").await?;
//! println!("saved to {}", path.display());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use reqwest::Url;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::MobitestConfig;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("No download URL configured")]
    NotConfigured,

    #[error("No page found for version {0}")]
    VersionNotFound(String),

    #[error("Empty response from {0}")]
    EmptyResponse(String),

    #[error("No package link on {0}")]
    LinkNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn anchor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<a\b([^>]*)>").unwrap_or_else(|e| panic!("bad anchor regex: {e}")))
}

fn attr(attrs: &str, name: &str) -> Option<String> {
    // Attribute values may use either quote style.
    let pattern = format!(r#"(?i)\b{name}\s*=\s*(?:"([^"]*)"|'([^']*)')"#);
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(attrs)?;
    caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string())
}

fn hrefs(html: &str) -> impl Iterator<Item = (String, Option<String>)> + '_ {
    anchor_re().captures_iter(html).filter_map(|caps| {
        let attrs = caps.get(1)?.as_str();
        Some((attr(attrs, "href")?, attr(attrs, "class")))
    })
}

/// First link on a listing page that mentions `version` and points at an `.html` page.
pub fn extract_version_page(html: &str, version: &str) -> Option<String> {
    hrefs(html)
        .map(|(href, _)| href)
        .find(|href| href.contains(version) && href.ends_with(".html"))
}

/// The `href` of the first `<a class="ipa">` on a build page.
pub fn extract_ipa_link(html: &str) -> Option<String> {
    hrefs(html)
        .find(|(_, class)| {
            class
                .as_deref()
                .map(|c| c.split_whitespace().any(|c| c == "ipa"))
                .unwrap_or(false)
        })
        .map(|(href, _)| href)
        .filter(|href| !href.is_empty())
}

/// Resolves `href` against the page it appeared on.
pub fn resolve_link(page: &str, href: &str) -> Result<String, DownloadError> {
    let base = Url::parse(page).map_err(|e| DownloadError::InvalidUrl(format!("{page}: {e}")))?;
    base.join(href)
        .map(|u| u.to_string())
        .map_err(|e| DownloadError::InvalidUrl(format!("{href}: {e}")))
}

/// Progress milestone (0..=10) reached after `downloaded` of `total` bytes.
fn decile(downloaded: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (downloaded.saturating_mul(10) / total).min(10)
}

pub struct IpaDownloader {
    client: reqwest::Client,
    base_url: String,
    download_dir: PathBuf,
}

impl IpaDownloader {
    /// Creates the download directory if needed.
    pub fn new(base_url: impl Into<String>, download_dir: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        let download_dir = download_dir.into();
        if !download_dir.exists() {
            std::fs::create_dir_all(&download_dir)?;
            info!(dir = %download_dir.display(), "created download directory");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            download_dir,
        })
    }

    /// Uses `app.ipa_download_url` and `app.pkgs_dir`.
    pub fn from_config(config: &MobitestConfig) -> Result<Self, DownloadError> {
        if config.app.ipa_download_url.is_empty() {
            return Err(DownloadError::NotConfigured);
        }
        Self::new(config.app.ipa_download_url.clone(), config.app.pkgs_dir.clone())
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        let text = self.client.get(url).send().await?.error_for_status()?.text().await?;
        if text.is_empty() {
            return Err(DownloadError::EmptyResponse(url.to_string()));
        }
        debug!(url, len = text.len(), "page fetched");
        Ok(text)
    }

    /// Resolves the package URL for `version` through the listing and build pages.
    pub async fn get_download_url(&self, version: &str) -> Result<String, DownloadError> {
        let listing = self.fetch_text(&self.base_url).await?;
        let page = extract_version_page(&listing, version).ok_or_else(|| DownloadError::VersionNotFound(version.to_string()))?;
        let page_url = resolve_link(&self.base_url, &page)?;
        info!(page = %page_url, "version page found");

        let detail = self.fetch_text(&page_url).await?;
        let href = extract_ipa_link(&detail).ok_or_else(|| DownloadError::LinkNotFound(page_url.clone()))?;
        let url = resolve_link(&page_url, &href)?;
        info!(url = %url, "download url resolved");
        Ok(url)
    }

    /// Downloads `version` to `<download_dir>/app_<version>.ipa`.
    pub async fn download_ipa(&self, version: &str) -> Result<PathBuf, DownloadError> {
        let url = self.get_download_url(version).await?;
        let dest = self.download_dir.join(format!("app_{version}.ipa"));
        info!(version, url = %url, "download started");

        let mut response = self.client.get(&url).send().await?.error_for_status()?;
        let total = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(&dest).await?;
        let mut downloaded = 0u64;
        let mut reported = 0u64;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            let step = decile(downloaded, total);
            if step > reported {
                reported = step;
                info!(percent = step * 10, downloaded, total, "download progress");
            }
        }
        file.flush().await?;

        info!(path = %dest.display(), bytes = downloaded, "download finished");
        Ok(dest)
    }
}
