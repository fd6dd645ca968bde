//! Tracing subscriber setup shared by the CLI and the test fixtures.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::{LogFormat, MobitestConfig};

/// Installs the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `config.log.level`.
/// Events go to stderr as text or JSON lines (`config.log.format`). When
/// `config.log.file` is set, a plain-text copy goes through a non-blocking
/// writer to a daily-rolling file under the export dir.
///
/// Keep the returned guard alive for as long as events should reach the file.
/// Later calls in the same process are no-ops and return `None`.
pub fn init_logging(config: &MobitestConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    let stderr_layer = match config.log.format {
        LogFormat::Text => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let (file_layer, guard) = match log_file_target(config) {
        Some((dir, name)) => {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                eprintln!("cannot create log directory {}: {e}", dir.display());
            }
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    match installed {
        Ok(()) => guard,
        Err(_) => {
            tracing::trace!("tracing subscriber already installed");
            None
        }
    }
}

/// Directory and file-name prefix of the log file, when one is configured.
fn log_file_target(config: &MobitestConfig) -> Option<(PathBuf, OsString)> {
    let path = config.export_dir.join(config.log.file.as_ref()?);
    let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "mobitest.log".into());
    Some((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_file_by_default() {
        assert!(log_file_target(&MobitestConfig::default()).is_none());
    }

    #[test]
    fn file_lands_under_export_dir() {
        let mut config = MobitestConfig::default();
        config.export_dir = PathBuf::from("/tmp/reports");
        config.log.file = Some(PathBuf::from("logs/run.log"));
        let (dir, name) = log_file_target(&config).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/reports/logs"));
        assert_eq!(name, OsString::from("run.log"));
    }
}
