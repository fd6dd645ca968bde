//! `mobitest run`: runs the case collection and renders the Allure report.
//!
//! The run is a sequence of child processes:
//!
//! 1. `cargo test -p <package> -- --ignored --test-threads=1`, with
//!    `TEST_TIMESTAMP`, `MOBITEST_DEVICE` and `MOBITEST_ALLURE_DIR` exported
//!    so every test module shares one timestamp, platform and results dir.
//! 2. `allure generate -c -o <report> <results>`
//! 3. `allure serve <results>` unless serving is disabled.
//!
//! The exit code of the run is the exit code of the test process.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use mobitest_core::allure::{AllureWriter, ALLURE_DIR_ENV};
use mobitest_core::config::{MobitestConfig, CONFIG_ENV};
use mobitest_core::platform::{Platform, DEVICE_ENV};
use mobitest_core::timestamp::{run_timestamp, TIMESTAMP_ENV};
use tokio::process::Command;
use tracing::{error, info, warn};

/// Package holding the device test cases.
pub const CASES_PACKAGE: &str = "mobitest-cases";

/// Everything needed to launch one run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub platform: Platform,
    pub timestamp: String,
    pub package: String,
    /// Substring filter passed to the test harness.
    pub filter: Option<String>,
    pub results_dir: PathBuf,
    pub report_dir: PathBuf,
    pub config_path: Option<PathBuf>,
    pub serve: bool,
}

impl RunPlan {
    pub fn new(platform: Platform, config: &MobitestConfig) -> Self {
        Self {
            platform,
            timestamp: run_timestamp().to_string(),
            package: CASES_PACKAGE.to_string(),
            filter: None,
            results_dir: absolute(&config.allure.result_dir),
            report_dir: absolute(&config.allure.report_dir),
            config_path: None,
            serve: true,
        }
    }

    /// Arguments after `cargo`.
    pub fn test_args(&self) -> Vec<String> {
        let mut args = vec!["test".to_string(), "-p".to_string(), self.package.clone(), "--".to_string()];
        if let Some(filter) = &self.filter {
            args.push(filter.clone());
        }
        args.push("--ignored".to_string());
        args.push("--test-threads=1".to_string());
        args
    }

    /// Environment exported to the test process.
    pub fn test_env(&self) -> Vec<(&'static str, OsString)> {
        let mut env = vec![
            (TIMESTAMP_ENV, OsString::from(&self.timestamp)),
            (DEVICE_ENV, OsString::from(self.platform.as_str())),
            (ALLURE_DIR_ENV, self.results_dir.clone().into_os_string()),
        ];
        if let Some(path) = &self.config_path {
            env.push((CONFIG_ENV, absolute(path).into_os_string()));
        }
        env
    }

    pub fn generate_args(&self) -> Vec<OsString> {
        vec![
            "generate".into(),
            "-c".into(),
            "-o".into(),
            self.report_dir.clone().into_os_string(),
            self.results_dir.clone().into_os_string(),
        ]
    }

    pub fn serve_args(&self) -> Vec<OsString> {
        vec!["serve".into(), self.results_dir.clone().into_os_string()]
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// `cargo` as invoked by the surrounding cargo, if any.
fn cargo_program() -> OsString {
    std::env::var_os("CARGO").unwrap_or_else(|| "cargo".into())
}

/// Exit code of a finished process; signals map to 1.
pub fn exit_code(status: &ExitStatus) -> u8 {
    match status.code() {
        Some(0) => 0,
        Some(code) => u8::try_from(code).unwrap_or(1).max(1),
        None => 1,
    }
}

/// Runs the plan and returns the exit code of the test process.
pub async fn run(plan: &RunPlan) -> std::io::Result<u8> {
    info!(
        platform = %plan.platform,
        timestamp = %plan.timestamp,
        results = %plan.results_dir.display(),
        "test run started"
    );

    let removed = AllureWriter::new(&plan.results_dir)?.clean()?;
    info!(removed, "allure results cleaned");

    let status = Command::new(cargo_program())
        .args(plan.test_args())
        .envs(plan.test_env())
        .status()
        .await?;
    let code = exit_code(&status);
    if code == 0 {
        info!("test run passed");
    } else {
        warn!(code, "test run failed");
    }

    match Command::new("allure").args(plan.generate_args()).status().await {
        Ok(s) if s.success() => info!(report = %plan.report_dir.display(), "allure report generated"),
        Ok(s) => error!(status = %s, "allure generate failed"),
        Err(e) => {
            error!(error = %e, "allure CLI not available, skipping report");
            return Ok(code);
        }
    }

    if plan.serve {
        if let Err(e) = Command::new("allure").args(plan.serve_args()).status().await {
            error!(error = %e, "allure serve failed");
        }
    }
    Ok(code)
}
