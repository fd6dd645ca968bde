//! Lifecycle management for WebDriverAgent on physical iOS devices.
//!
//! This module builds and launches WebDriverAgent with `xcodebuild`, forwards
//! its port over USB with `iproxy`, health-checks it over HTTP, and launches
//! apps through it.
//!
//! # Overview
//!
//! [`WdaLifecycle::start`] runs the full startup sequence:
//!
//! 1. **Resolve** the device UDID (`idevice_id -l`) and the WDA checkout
//! 2. **Kill** any stale WebDriverAgent runner
//! 3. **Build and run** `WebDriverAgentRunner` via `xcodebuild test`
//! 4. **Forward** the WDA port with `iproxy`
//! 5. **Wait for ready** by polling `GET /status`
//!
//! # Example
//!
//! ```no_run
//! use mobitest_core::config::WdaConfig;
//! use mobitest_core::ios::{start_app_by_wda, LaunchOptions, WdaLifecycle};
//! use mobitest_core::wda::WdaClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let lifecycle = WdaLifecycle::new(WdaConfig::default());
//! let _runner = lifecycle.start().await?;
//!
//! let client = WdaClient::new(lifecycle.url());
//! start_app_by_wda(&client, "com.apple.Preferences", &LaunchOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{mobitest_dir, WdaConfig};
use crate::wda::{AppState, WdaClient, WdaError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors specific to WDA lifecycle operations.
#[derive(Error, Debug)]
pub enum WdaLifecycleError {
    /// None of the candidate WebDriverAgent checkouts exist.
    #[error("WebDriverAgent project not found, searched: {0:?}")]
    ProjectNotFound(Vec<PathBuf>),

    /// `idevice_id -l` reported no attached iOS device.
    #[error("No iOS device connected")]
    NoDevice,

    /// `xcodebuild` exited before WDA became reachable.
    #[error("xcodebuild exited early: {0}")]
    BuildExited(String),

    /// WDA did not answer `/status` within the startup timeout.
    #[error("WebDriverAgent failed to become ready within timeout")]
    StartupTimeout,

    /// A tool exited with a non-zero status.
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("WDA error: {0}")]
    Wda(#[from] WdaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Host tools
// ---------------------------------------------------------------------------

/// Default WebDriverAgent checkout locations, relative to the home directory.
const DEFAULT_PROJECT_DIRS: [&str; 4] = [
    "Library/Application Support/Airtest/iOS/WebDriverAgent",
    ".airtest/iOS/WebDriverAgent",
    "Documents/code/WebDriverAgent",
    "Documents/code/iOS-Tagent",
];

/// Candidate WDA checkouts: configured paths first, then the defaults.
pub fn wda_project_candidates(extra: &[PathBuf]) -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    extra
        .iter()
        .cloned()
        .chain(DEFAULT_PROJECT_DIRS.iter().map(|d| home.join(d)))
        .collect()
}

/// Returns the first existing directory among `candidates`.
pub fn find_wda_project(candidates: &[PathBuf]) -> Result<PathBuf, WdaLifecycleError> {
    candidates
        .iter()
        .find(|p| p.is_dir())
        .cloned()
        .ok_or_else(|| WdaLifecycleError::ProjectNotFound(candidates.to_vec()))
}

/// Lists UDIDs of attached iOS devices via `idevice_id -l`.
pub fn list_udids() -> Result<Vec<String>, WdaLifecycleError> {
    let output = Command::new("idevice_id").arg("-l").output()?;
    if !output.status.success() {
        return Err(WdaLifecycleError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(parse_udids(&String::from_utf8_lossy(&output.stdout)))
}

/// Parses `idevice_id -l` output. Exposed for testing.
pub fn parse_udids(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.split_whitespace().next().unwrap_or(l).to_string())
        .collect()
}

/// Kills every process whose command line matches `pattern`. Exit status is ignored.
fn pkill(pattern: &str) {
    match Command::new("pkill").args(["-f", pattern]).output() {
        Ok(_) => debug!(pattern, "pkill"),
        Err(e) => warn!(pattern, error = %e, "pkill failed"),
    }
}

/// Stops any `iproxy` forwarding the given local port.
pub fn cleanup_iproxy(local_port: u16) {
    pkill(&format!("iproxy {local_port}"));
    info!(local_port, "iproxy cleaned up");
}

/// Lists apps installed on a device via `ideviceinstaller -l`.
///
/// Returns `(bundle_id, name, version)` tuples.
pub fn list_installed_apps(udid: &str) -> Result<Vec<(String, String, String)>, WdaLifecycleError> {
    let output = Command::new("ideviceinstaller")
        .args(["-u", udid, "-l"])
        .output()?;
    if !output.status.success() {
        return Err(WdaLifecycleError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(parse_installed_apps(&String::from_utf8_lossy(&output.stdout)))
}

/// Parses `ideviceinstaller -l` CSV-ish output (`CFBundleIdentifier, CFBundleVersion, CFBundleDisplayName`).
pub fn parse_installed_apps(output: &str) -> Vec<(String, String, String)> {
    output
        .lines()
        .filter(|l| !l.starts_with("CFBundleIdentifier") && !l.starts_with("Total:"))
        .filter_map(|line| {
            let mut parts = line.splitn(3, ',').map(|p| p.trim().trim_matches('"'));
            let id = parts.next().filter(|s| !s.is_empty())?.to_string();
            let version = parts.next().unwrap_or_default().to_string();
            let name = parts.next().unwrap_or_default().to_string();
            Some((id, name, version))
        })
        .collect()
}

/// Installs an `.ipa` via `ideviceinstaller -i`.
pub fn install_ipa(udid: &str, ipa: &Path) -> Result<(), WdaLifecycleError> {
    run_ideviceinstaller(udid, &["-i", &ipa.to_string_lossy()])
}

/// Removes an app via `ideviceinstaller -U`.
pub fn uninstall_app(udid: &str, bundle_id: &str) -> Result<(), WdaLifecycleError> {
    run_ideviceinstaller(udid, &["-U", bundle_id])
}

fn run_ideviceinstaller(udid: &str, args: &[&str]) -> Result<(), WdaLifecycleError> {
    let output = Command::new("ideviceinstaller")
        .args(["-u", udid])
        .args(args)
        .output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() || stdout.contains("ERROR") {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WdaLifecycleError::CommandFailed(format!("{stdout}{stderr}")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// WdaLifecycle
// ---------------------------------------------------------------------------

/// A running `xcodebuild test` process hosting WebDriverAgent.
///
/// Dropping the handle kills the runner; [`stop`](Self::stop) also waits for it.
pub struct WdaRunner {
    child: tokio::process::Child,
    pub udid: String,
    pub log_path: PathBuf,
}

impl WdaRunner {
    pub async fn stop(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to stop xcodebuild");
        }
    }
}

/// Manages WebDriverAgent for one iOS device.
pub struct WdaLifecycle {
    config: WdaConfig,
    poll_interval: Duration,
}

impl WdaLifecycle {
    pub fn new(config: WdaConfig) -> Self {
        Self {
            config,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Overrides the `/status` polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.config.startup_timeout_secs)
    }

    fn iproxy_pattern(&self) -> String {
        format!("iproxy {} {}", self.config.local_port, self.config.device_port)
    }

    /// Starts `iproxy` unless a matching process is already running.
    pub fn ensure_iproxy(&self) -> Result<(), WdaLifecycleError> {
        let running = Command::new("pgrep")
            .args(["-f", &self.iproxy_pattern()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if running {
            debug!("iproxy already running");
            return Ok(());
        }

        Command::new("iproxy")
            .args([
                self.config.local_port.to_string(),
                self.config.device_port.to_string(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        info!(
            local_port = self.config.local_port,
            device_port = self.config.device_port,
            "iproxy started"
        );
        Ok(())
    }

    /// Stops the `iproxy` started for this device.
    pub fn cleanup_iproxy(&self) {
        cleanup_iproxy(self.config.local_port);
    }

    /// Builds and launches WDA on the first attached device, then waits for it.
    ///
    /// # Errors
    ///
    /// - [`WdaLifecycleError::NoDevice`] if no device is attached
    /// - [`WdaLifecycleError::ProjectNotFound`] if no WDA checkout exists
    /// - [`WdaLifecycleError::BuildExited`] if `xcodebuild` dies during startup
    /// - [`WdaLifecycleError::StartupTimeout`] if `/status` never answers
    pub async fn start(&self) -> Result<WdaRunner, WdaLifecycleError> {
        let udid = tokio::task::spawn_blocking(list_udids)
            .await
            .map_err(|e| WdaLifecycleError::CommandFailed(e.to_string()))??
            .into_iter()
            .next()
            .ok_or(WdaLifecycleError::NoDevice)?;
        let project = find_wda_project(&wda_project_candidates(&self.config.project_paths))?;

        let span = info_span!("wda_start", udid = %udid, project = %project.display());
        async {
            pkill("WebDriverAgent");
            tokio::time::sleep(Duration::from_secs(2)).await;

            let log_dir = mobitest_dir().join("logs");
            std::fs::create_dir_all(&log_dir)?;
            let log_path = log_dir.join("xcodebuild-wda.log");
            let log_file = File::create(&log_path)?;

            let child = tokio::process::Command::new("xcodebuild")
                .arg("-project")
                .arg(project.join("WebDriverAgent.xcodeproj"))
                .args([
                    "-scheme",
                    "WebDriverAgentRunner",
                    "-destination",
                    &format!("id={udid}"),
                    "-allowProvisioningUpdates",
                    "test",
                ])
                .stdin(Stdio::null())
                .stdout(log_file.try_clone()?)
                .stderr(log_file)
                .kill_on_drop(true)
                .spawn()?;
            info!(log = %log_path.display(), "xcodebuild started");

            self.finish_startup(WdaRunner { child, udid: udid.clone(), log_path }).await
        }
        .instrument(span)
        .await
    }

    /// Forwards the port and waits for `runner` to serve; stops it on any failure.
    async fn finish_startup(&self, mut runner: WdaRunner) -> Result<WdaRunner, WdaLifecycleError> {
        let ready = match self.ensure_iproxy() {
            Ok(()) => self.wait_for_ready(Some(&mut runner)).await,
            Err(e) => Err(e),
        };
        match ready {
            Ok(()) => {
                info!("WebDriverAgent ready");
                Ok(runner)
            }
            Err(e) => {
                error!(error = %e, "WebDriverAgent startup failed");
                runner.stop().await;
                Err(e)
            }
        }
    }

    /// Polls `GET /status` until WDA answers or the startup timeout elapses.
    ///
    /// When a runner is given, its early exit aborts the wait with the tail of
    /// the xcodebuild log.
    pub async fn wait_for_ready(&self, mut runner: Option<&mut WdaRunner>) -> Result<(), WdaLifecycleError> {
        let deadline = tokio::time::Instant::now() + self.startup_timeout();
        let client = WdaClient::with_timeout(&self.config.url, Duration::from_secs(1));

        loop {
            if client.status().await.is_ok() {
                return Ok(());
            }

            if let Some(runner) = runner.as_deref_mut() {
                if let Some(status) = runner.child.try_wait()? {
                    let tail = log_tail(&runner.log_path, 20);
                    return Err(WdaLifecycleError::BuildExited(format!("{status}\n{tail}")));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(WdaLifecycleError::StartupTimeout);
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Quick health check: makes sure iproxy runs and `/status` answers.
    pub async fn check_wda_status(&self) -> bool {
        if let Err(e) = self.ensure_iproxy() {
            warn!(error = %e, "could not start iproxy");
        }
        let client = WdaClient::with_timeout(&self.config.url, Duration::from_secs(2));
        match client.status().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "WDA not reachable");
                false
            }
        }
    }
}

fn log_tail(path: &Path, lines: usize) -> String {
    let text = std::fs::read_to_string(path).unwrap_or_default();
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

// ---------------------------------------------------------------------------
// App launch with retry
// ---------------------------------------------------------------------------

/// Timing knobs for [`start_app_by_wda`].
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// How long to wait for the app to reach the foreground per attempt.
    pub wait_timeout: Duration,
    pub retry_times: u32,
    /// How long to wait for WDA's `/status` before the first attempt.
    pub status_timeout: Duration,
    pub poll_interval: Duration,
    /// Pause after terminating a running instance.
    pub settle_delay: Duration,
    /// Pause before retrying after a WDA error.
    pub retry_delay: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(30),
            retry_times: 3,
            status_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            settle_delay: Duration::from_secs(1),
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Launches an app through WDA and waits until it is in the foreground.
///
/// A running instance is terminated first so every attempt starts cold.
/// Returns `Ok(false)` when every attempt timed out without the app reaching
/// the foreground.
///
/// # Errors
///
/// - [`WdaLifecycleError::StartupTimeout`] if WDA's `/status` never answers
/// - [`WdaLifecycleError::Wda`] with the last WDA error once retries are exhausted
pub async fn start_app_by_wda(
    client: &WdaClient,
    bundle_id: &str,
    options: &LaunchOptions,
) -> Result<bool, WdaLifecycleError> {
    let span = info_span!("start_app_by_wda", bundle_id);
    async {
        wait_for_status(client, options.status_timeout, options.poll_interval).await?;

        let attempts = options.retry_times.max(1);
        for attempt in 1..=attempts {
            match launch_once(client, bundle_id, options).await {
                Ok(true) => {
                    info!(attempt, "app in foreground");
                    return Ok(true);
                }
                Ok(false) => {
                    warn!(attempt, attempts, "app did not reach foreground in time");
                }
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "launch failed, retrying");
                    client.reset_session().await;
                    tokio::time::sleep(options.retry_delay).await;
                }
                Err(e) => return Err(WdaLifecycleError::from(e)),
            }
        }
        Ok::<bool, WdaLifecycleError>(false)
    }
    .instrument(span)
    .await
}

async fn wait_for_status(
    client: &WdaClient,
    timeout: Duration,
    interval: Duration,
) -> Result<(), WdaLifecycleError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if client.status().await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(WdaLifecycleError::StartupTimeout);
        }
        tokio::time::sleep(interval).await;
    }
}

async fn launch_once(client: &WdaClient, bundle_id: &str, options: &LaunchOptions) -> Result<bool, WdaError> {
    let state = client.app_state(bundle_id).await?;
    debug!(?state, "current app state");
    if state != AppState::NotRunning {
        client.app_terminate(bundle_id).await?;
        tokio::time::sleep(options.settle_delay).await;
    }

    client.app_launch(bundle_id, true).await?;

    let deadline = tokio::time::Instant::now() + options.wait_timeout;
    loop {
        if client.app_state(bundle_id).await? == AppState::RunningForeground {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(options.poll_interval).await;
    }
}
