//! Allure 2 result files.
//!
//! Each test case becomes one `<uuid>-result.json` in the results directory;
//! attachments sit beside it as `<uuid>-attachment.<ext>`. The `allure` CLI
//! turns the directory into a report.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Environment variable naming the results directory for a test run.
pub const ALLURE_DIR_ENV: &str = "MOBITEST_ALLURE_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
    Broken,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    /// File name relative to the results directory.
    pub source: String,
    #[serde(rename = "type")]
    pub mime: String,
}

/// One test case result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub uuid: String,
    pub history_id: String,
    pub name: String,
    pub full_name: String,
    pub status: Status,
    pub status_details: StatusDetails,
    pub stage: String,
    /// Epoch milliseconds.
    pub start: i64,
    pub stop: i64,
    pub labels: Vec<Label>,
    pub attachments: Vec<Attachment>,
}

impl TestResult {
    /// Starts a result clocked from now, with host and framework labels.
    pub fn start(name: impl Into<String>, full_name: impl Into<String>) -> Self {
        let full_name = full_name.into();
        let now = Utc::now().timestamp_millis();
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            uuid: Uuid::new_v4().to_string(),
            history_id: full_name.clone(),
            name: name.into(),
            full_name,
            status: Status::Passed,
            status_details: StatusDetails::default(),
            stage: "running".to_string(),
            start: now,
            stop: now,
            labels: vec![
                Label { name: "host".into(), value: host },
                Label { name: "framework".into(), value: "mobitest".into() },
            ],
            attachments: Vec::new(),
        }
    }

    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push(Label {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn feature(self, value: impl Into<String>) -> Self {
        self.label("feature", value)
    }

    pub fn story(self, value: impl Into<String>) -> Self {
        self.label("story", value)
    }

    pub fn suite(self, value: impl Into<String>) -> Self {
        self.label("suite", value)
    }

    /// Marks the result finished now.
    pub fn finish(&mut self, status: Status, message: Option<String>) {
        self.status = status;
        self.status_details.message = message;
        self.stage = "finished".to_string();
        self.stop = Utc::now().timestamp_millis();
    }

    pub fn label_value(&self, name: &str) -> Option<&str> {
        self.labels.iter().find(|l| l.name == name).map(|l| l.value.as_str())
    }
}

/// Writes results and attachments into one results directory.
#[derive(Debug, Clone)]
pub struct AllureWriter {
    results_dir: PathBuf,
}

impl AllureWriter {
    /// Creates the results directory if needed.
    pub fn new(results_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let results_dir = results_dir.into();
        std::fs::create_dir_all(&results_dir)?;
        Ok(Self { results_dir })
    }

    /// Uses `MOBITEST_ALLURE_DIR` when set, `fallback` otherwise.
    pub fn from_env(fallback: &Path) -> std::io::Result<Self> {
        match std::env::var(ALLURE_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::new(fallback),
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Removes every file from the results directory.
    pub fn clean(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.results_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
            removed += 1;
        }
        debug!(dir = %self.results_dir.display(), removed, "allure results cleaned");
        Ok(removed)
    }

    /// Stores `bytes` as an attachment of `result`.
    pub fn attach(&self, result: &mut TestResult, name: &str, bytes: &[u8], mime: &str, extension: &str) -> std::io::Result<PathBuf> {
        let source = format!("{}-attachment.{}", Uuid::new_v4(), extension.trim_start_matches('.'));
        let path = self.results_dir.join(&source);
        std::fs::write(&path, bytes)?;
        result.attachments.push(Attachment {
            name: name.to_string(),
            source,
            mime: mime.to_string(),
        });
        Ok(path)
    }

    /// Attaches a zipped report bundle under a name derived from the test file.
    pub fn attach_report_bundle(&self, result: &mut TestResult, zip: &Path, file_name: &str) -> std::io::Result<PathBuf> {
        let bytes = std::fs::read(zip)?;
        let name = format!("{file_name} - Report bundle (download to view).zip");
        let path = self.attach(result, &name, &bytes, "application/zip", "zip")?;
        info!(attachment = %name, "report bundle attached");
        Ok(path)
    }

    /// Writes `<uuid>-result.json`.
    pub fn write(&self, result: &TestResult) -> std::io::Result<PathBuf> {
        let path = self.results_dir.join(format!("{}-result.json", result.uuid));
        let json = serde_json::to_string_pretty(result)?;
        std::fs::write(&path, json)?;
        debug!(path = %path.display(), status = ?result.status, "allure result written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_json_shape() {
        let mut result = TestResult::start("test_login", "cases/android/test_login.rs::test_login")
            .feature("Android")
            .story("login");
        result.finish(Status::Failed, Some("Assertion failed: no avatar".into()));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "finished");
        assert_eq!(json["fullName"], "cases/android/test_login.rs::test_login");
        assert_eq!(json["historyId"], json["fullName"]);
        assert_eq!(json["statusDetails"]["message"], "Assertion failed: no avatar");
        assert!(json["start"].as_i64().unwrap() <= json["stop"].as_i64().unwrap());
        assert_eq!(result.label_value("feature"), Some("Android"));
        assert_eq!(result.label_value("framework"), Some("mobitest"));
    }

    #[test]
    fn attachments_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let writer = AllureWriter::new(dir.path().join("results")).unwrap();
        let zip = dir.path().join("bundle.zip");
        std::fs::write(&zip, b"PK\x05\x06").unwrap();

        let mut result = TestResult::start("t", "t");
        writer.attach_report_bundle(&mut result, &zip, "test_home.rs").unwrap();
        let written = writer.write(&result).unwrap();

        assert_eq!(result.attachments.len(), 1);
        let att = &result.attachments[0];
        assert_eq!(att.name, "test_home.rs - Report bundle (download to view).zip");
        assert_eq!(att.mime, "application/zip");
        assert!(att.source.ends_with("-attachment.zip"));
        assert!(writer.results_dir().join(&att.source).exists());
        assert!(written.file_name().unwrap().to_string_lossy().ends_with("-result.json"));

        assert_eq!(writer.clean().unwrap(), 2);
        assert_eq!(std::fs::read_dir(writer.results_dir()).unwrap().count(), 0);
    }
}
