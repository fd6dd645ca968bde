//! Per-script report bundles.
//!
//! A bundle lives at `<export_dir>/<file_name>/<timestamp>/<script_name>.log/`
//! and holds `log.html`, a copy of the step log and every step screenshot. The
//! directory is written once and then zipped for attachment to the Allure
//! result.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use mobitest_core::report::{zip_dir, ExportLayout, ReportExporter};
//!
//! # fn example() -> Result<(), mobitest_core::report::ReportError> {
//! let layout = ExportLayout::new("export_dir", Path::new("cases/home/test_home.rs"), "2024-05-01-10_00_00");
//! let bundle = ReportExporter::new(layout).export(Path::new("cases/home/log/test_home"))?;
//! zip_dir(&bundle, Path::new("report.zip"))?;
//! # Ok(())
//! # }
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::action::{StepLog, StepResult};
use crate::session::STEP_LOG_FILENAME;

/// Name of the rendered report inside a bundle.
pub const REPORT_HTML: &str = "log.html";

/// Entries never copied into bundles or archives.
const SKIPPED_NAMES: &[&str] = &["__pycache__", ".DS_Store"];

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Log directory not found: {0}")]
    MissingLogDir(PathBuf),

    #[error("Invalid test file path: {0}")]
    InvalidTestFile(PathBuf),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Where the bundle of one test file goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportLayout {
    pub export_dir: PathBuf,
    /// Test file name including extension.
    pub file_name: String,
    /// Test file name without extension.
    pub script_name: String,
    pub timestamp: String,
}

impl ExportLayout {
    pub fn new(export_dir: impl Into<PathBuf>, test_file: &Path, timestamp: impl Into<String>) -> Self {
        let file_name = test_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let script_name = test_file
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            export_dir: export_dir.into(),
            file_name,
            script_name,
            timestamp: timestamp.into(),
        }
    }

    /// `<export_dir>/<file_name>/<timestamp>/<script_name>.log`
    pub fn bundle_dir(&self) -> PathBuf {
        self.export_dir
            .join(&self.file_name)
            .join(&self.timestamp)
            .join(format!("{}.log", self.script_name))
    }

    pub fn report_html(&self) -> PathBuf {
        self.bundle_dir().join(REPORT_HTML)
    }
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

pub struct ReportExporter {
    layout: ExportLayout,
}

impl ReportExporter {
    pub fn new(layout: ExportLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ExportLayout {
        &self.layout
    }

    /// Copies the script log directory into the bundle and renders `log.html`.
    ///
    /// Returns the bundle directory.
    pub fn export(&self, log_root: &Path) -> Result<PathBuf, ReportError> {
        if self.layout.file_name.is_empty() {
            return Err(ReportError::InvalidTestFile(PathBuf::from(&self.layout.file_name)));
        }
        if !log_root.is_dir() {
            return Err(ReportError::MissingLogDir(log_root.to_path_buf()));
        }

        let bundle = self.layout.bundle_dir();
        std::fs::create_dir_all(&bundle)?;

        let mut copied = 0usize;
        for entry in std::fs::read_dir(log_root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !entry.file_type()?.is_file() || SKIPPED_NAMES.contains(&name.as_ref()) {
                continue;
            }
            std::fs::copy(entry.path(), bundle.join(name.as_ref()))?;
            copied += 1;
        }

        let steps = read_step_log(&log_root.join(STEP_LOG_FILENAME))?;
        let html = render_html(&self.layout, &steps);
        std::fs::write(bundle.join(REPORT_HTML), html)?;

        info!(bundle = %bundle.display(), files = copied, steps = steps.len(), "report exported");
        Ok(bundle)
    }
}

/// Reads a JSON Lines step log. A missing file is an empty log; bad lines are skipped.
pub fn read_step_log(path: &Path) -> Result<Vec<StepLog>, ReportError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut steps = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StepLog>(&line) {
            Ok(step) => steps.push(step),
            Err(e) => warn!(line = n + 1, error = %e, "skipping unreadable step"),
        }
    }
    Ok(steps)
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Renders the step table of a bundle.
pub fn render_html(layout: &ExportLayout, steps: &[StepLog]) -> String {
    let passed = steps.iter().filter(|s| s.result.is_success()).count();
    let title = escape(&layout.script_name);

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str(&format!("<title>{title}</title>\n"));
    html.push_str(
        "<style>\n\
         body { font-family: sans-serif; margin: 2em; }\n\
         table { border-collapse: collapse; width: 100%; }\n\
         th, td { border: 1px solid #ccc; padding: 4px 8px; text-align: left; vertical-align: top; }\n\
         tr.failed { background: #fdd; }\n\
         img { max-width: 240px; }\n\
         </style>\n</head>\n<body>\n",
    );
    html.push_str(&format!("<h1>{title}</h1>\n"));
    html.push_str(&format!(
        "<p>Run {} &middot; {} of {} steps passed</p>\n",
        escape(&layout.timestamp),
        passed,
        steps.len()
    ));
    html.push_str("<table>\n<tr><th>#</th><th>Time</th><th>Step</th><th>Detail</th><th>Status</th><th>Duration</th><th>Screen</th></tr>\n");

    for (i, step) in steps.iter().enumerate() {
        let (class, status) = match &step.result {
            StepResult::Success => ("passed", "ok".to_string()),
            StepResult::Failure(msg) => ("failed", format!("failed: {}", escape(msg))),
        };
        let duration = step.duration_ms.map(|ms| format!("{ms} ms")).unwrap_or_default();
        let screen = step
            .screenshot
            .as_deref()
            .map(|s| {
                let s = escape(s);
                format!("<a href=\"{s}\"><img src=\"{s}\" alt=\"{s}\"></a>")
            })
            .unwrap_or_default();
        html.push_str(&format!(
            "<tr class=\"{class}\"><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{status}</td><td>{duration}</td><td>{screen}</td></tr>\n",
            i + 1,
            step.timestamp.format("%H:%M:%S%.3f"),
            step.step.name(),
            escape(&step.step.describe()),
        ));
    }

    html.push_str("</table>\n</body>\n</html>\n");
    html
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

fn is_skipped(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|n| SKIPPED_NAMES.contains(&n))
        .unwrap_or(false)
}

/// Deflate-compresses `src` into `dest` with entry names relative to `src`.
///
/// Files that cannot be read are logged and left out. Returns the number of
/// files written.
pub fn zip_dir(src: &Path, dest: &Path) -> Result<usize, ReportError> {
    if !src.is_dir() {
        return Err(ReportError::MissingLogDir(src.to_path_buf()));
    }

    let mut zip = ZipWriter::new(File::create(dest)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut written = 0usize;

    let walker = WalkDir::new(src).sort_by_file_name().into_iter().filter_entry(|e| !is_skipped(e));
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "failed to walk report directory");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        // Zip entry names always use forward slashes.
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let bytes = match std::fs::read(entry.path()) {
            Ok(b) => b,
            Err(e) => {
                error!(file = %entry.path().display(), error = %e, "failed to read file for archive");
                continue;
            }
        };
        zip.start_file(name.as_str(), options)?;
        zip.write_all(&bytes)?;
        debug!(entry = %name, "added to archive");
        written += 1;
    }

    zip.finish()?;
    info!(archive = %dest.display(), files = written, "report archived");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::StepKind;

    #[test]
    fn bundle_dir_layout() {
        let layout = ExportLayout::new("export_dir", Path::new("cases/home/test_home.rs"), "2024-05-01-10_00_00");
        assert_eq!(
            layout.bundle_dir(),
            PathBuf::from("export_dir/test_home.rs/2024-05-01-10_00_00/test_home.log")
        );
        assert_eq!(
            layout.report_html(),
            PathBuf::from("export_dir/test_home.rs/2024-05-01-10_00_00/test_home.log/log.html")
        );
    }

    #[test]
    fn html_escapes_and_marks_failures() {
        let layout = ExportLayout::new("e", Path::new("test_x.rs"), "ts");
        let steps = vec![
            StepLog::new(StepKind::Text { text: "<b>".into(), enter: false }, StepResult::Success, Some("step_001.png".into()), Some(5)),
            StepLog::new(StepKind::Home, StepResult::Failure("no session".into()), None, None),
        ];
        let html = render_html(&layout, &steps);
        assert!(html.contains("&lt;b&gt;"));
        assert!(!html.contains("<b>"));
        assert!(html.contains("tr class=\"failed\""));
        assert!(html.contains("failed: no session"));
        assert!(html.contains("src=\"step_001.png\""));
        assert!(html.contains("1 of 2 steps passed"));
    }

    #[test]
    fn step_log_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STEP_LOG_FILENAME);
        let good = serde_json::to_string(&StepLog::new(StepKind::Wake, StepResult::Success, None, None)).unwrap();
        std::fs::write(&path, format!("{good}\nnot json\n\n{good}\n")).unwrap();
        assert_eq!(read_step_log(&path).unwrap().len(), 2);
        assert!(read_step_log(&dir.path().join("missing.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn export_requires_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ReportExporter::new(ExportLayout::new(dir.path(), Path::new("test_x.rs"), "ts"));
        let err = exporter.export(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ReportError::MissingLogDir(_)));
    }
}
