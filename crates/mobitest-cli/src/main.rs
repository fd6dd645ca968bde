//! Test runner and device utilities for mobitest suites.
//!
//! # Usage
//!
//! ```bash
//! # Run the Android cases and open the Allure report
//! mobitest run --device android
//!
//! # Run the iOS cases, generating the report without serving it
//! mobitest run --device ios --no-serve
//!
//! # List attached devices
//! mobitest devices
//!
//! # Check the Android toolchain and device
//! mobitest doctor
//!
//! # Install a build from the package directory
//! mobitest install --platform android --version 2.9.26.19736
//!
//! # Fetch an iOS build from the distribution site
//! mobitest download --version 2.9.26.19736
//!
//! # Bring up WebDriverAgent and launch an app through it
//! mobitest wda start
//! mobitest launch-app com.vv.work
//!
//! # Use an explicit config file and machine-readable output
//! mobitest --config ./ci.json --format json device-info --platform android
//! ```

mod runner;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mobitest_core::config::{ConfigError, LogFormat, MobitestConfig, CONFIG_ENV, LOCAL_CONFIG_FILENAME};
use mobitest_core::device_manager::{DeviceManager, ManagerError};
use mobitest_core::downloader::{DownloadError, IpaDownloader};
use mobitest_core::driver::DriverError;
use mobitest_core::env_check::run_android_checks;
use mobitest_core::installer::{AppInstaller, InstallerError};
use mobitest_core::ios::{self, start_app_by_wda, LaunchOptions, WdaLifecycle, WdaLifecycleError};
use mobitest_core::logging::init_logging;
use mobitest_core::platform::Platform;
use mobitest_core::wda::WdaClient;
use serde_json::json;
use tracing::debug;

use crate::runner::RunPlan;

/// Test runner and device utilities for mobitest suites.
#[derive(Parser)]
#[command(name = "mobitest")]
#[command(about = "Run image-driven UI test suites on Android and iOS devices")]
#[command(version)]
struct Cli {
    /// Config file to use instead of the default lookup
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Output format: text or json
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the device test cases and build the Allure report
    Run {
        /// Platform the cases run against
        #[arg(short, long, value_parser = ["ios", "android", "windows"])]
        device: String,
        /// Only run cases whose name contains this string
        #[arg(long)]
        filter: Option<String>,
        /// Package holding the cases
        #[arg(long, default_value = runner::CASES_PACKAGE)]
        package: String,
        /// Generate the report without serving it
        #[arg(long)]
        no_serve: bool,
    },

    /// List attached Android and iOS devices
    Devices,

    /// Connect a device and print its properties
    DeviceInfo {
        #[arg(short, long)]
        platform: Platform,
    },

    /// Check adb, attached devices and screenshot capability
    Doctor,

    /// Replace the installed app with a package from the package directory
    Install {
        #[arg(short, long)]
        platform: Platform,
        /// Full build version, e.g. 2.9.26.19736
        #[arg(short, long)]
        version: String,
        /// Package directory (defaults to app.pkgs_dir)
        #[arg(long)]
        pkgs_dir: Option<PathBuf>,
    },

    /// Uninstall the app under test
    Uninstall {
        #[arg(short, long)]
        platform: Platform,
    },

    /// Download an iOS build into the package directory
    Download {
        #[arg(short, long)]
        version: String,
    },

    /// Manage WebDriverAgent on the attached iOS device
    Wda {
        #[command(subcommand)]
        action: WdaAction,
    },

    /// Launch an iOS app through WebDriverAgent, retrying until it is in front
    LaunchApp {
        /// Bundle identifier
        bundle_id: String,
        /// Launch attempts
        #[arg(long, default_value = "3")]
        retries: u32,
        /// Seconds to wait for the foreground per attempt
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Wait until an Android device is attached
    WaitDevice {
        /// Seconds to wait
        #[arg(short, long, default_value = "60")]
        timeout: u64,
    },

    /// Show or create configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum WdaAction {
    /// Build and launch WebDriverAgent, then wait until it answers
    Start,
    /// Check that WebDriverAgent answers /status
    Status,
    /// Stop the iproxy port forward
    Cleanup,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration to a file
    Init {
        #[arg(default_value = LOCAL_CONFIG_FILENAME)]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum CliError {
    ActionFailed(String),
    Device(String),
    Config(String),
    Io(String),
}

impl CliError {
    fn code(&self) -> u8 {
        match self {
            CliError::ActionFailed(_) => 1,
            CliError::Device(_) => 2,
            CliError::Config(_) => 3,
            CliError::Io(_) => 4,
        }
    }

    fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::ActionFailed(msg) => write!(f, "Action failed: {}", msg),
            CliError::Device(msg) => write!(f, "Device error: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Io(e.to_string())
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Io(io) => CliError::Io(io.to_string()),
            other => CliError::Config(other.to_string()),
        }
    }
}

impl From<DriverError> for CliError {
    fn from(e: DriverError) -> Self {
        CliError::Device(e.to_string())
    }
}

impl From<ManagerError> for CliError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::Config(c) => c.into(),
            ManagerError::Io(io) => io.into(),
            other => CliError::Device(other.to_string()),
        }
    }
}

impl From<InstallerError> for CliError {
    fn from(e: InstallerError) -> Self {
        match e {
            InstallerError::Config(c) => c.into(),
            InstallerError::Driver(d) => d.into(),
            InstallerError::Io(io) => io.into(),
            other => CliError::ActionFailed(other.to_string()),
        }
    }
}

impl From<DownloadError> for CliError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::NotConfigured | DownloadError::InvalidUrl(_) => CliError::Config(e.to_string()),
            DownloadError::Http(_) => CliError::Device(e.to_string()),
            DownloadError::Io(io) => io.into(),
            other => CliError::ActionFailed(other.to_string()),
        }
    }
}

impl From<WdaLifecycleError> for CliError {
    fn from(e: WdaLifecycleError) -> Self {
        match e {
            WdaLifecycleError::ProjectNotFound(_) => CliError::Config(e.to_string()),
            WdaLifecycleError::Io(io) => io.into(),
            WdaLifecycleError::CommandFailed(_) => CliError::ActionFailed(e.to_string()),
            other => CliError::Device(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn load_config(path: Option<&PathBuf>) -> Result<MobitestConfig, CliError> {
    match path {
        Some(path) => Ok(MobitestConfig::load_from(path)?),
        None => Ok(MobitestConfig::load()),
    }
}

fn print_json(value: &serde_json::Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<u8, CliError> {
    let config = load_config(cli.config.as_ref())?;
    let json_output = cli.format == OutputFormat::Json;
    let _log_guard = if json_output {
        let mut logged = config.clone();
        logged.log.format = LogFormat::Json;
        init_logging(&logged)
    } else {
        init_logging(&config)
    };

    match cli.command {
        Command::Run { device, filter, package, no_serve } => {
            let platform: Platform = device.parse().map_err(|e| CliError::Config(format!("{e}")))?;
            let mut plan = RunPlan::new(platform, &config);
            plan.filter = filter;
            plan.package = package;
            plan.serve = !no_serve;
            plan.config_path = cli.config.clone();
            let code = runner::run(&plan).await?;
            if json_output {
                print_json(&json!({ "exit_code": code, "timestamp": plan.timestamp }))?;
            }
            return Ok(code);
        }
        Command::Devices => list_devices(json_output).await?,
        Command::DeviceInfo { platform } => device_info(&config, platform, json_output).await?,
        Command::Doctor => doctor(json_output).await?,
        Command::Install { platform, version, pkgs_dir } => {
            let mut installer = AppInstaller::new(&config);
            if let Some(dir) = pkgs_dir {
                installer = installer.with_pkgs_dir(dir);
            }
            let installed = installer.install_app(platform, &version).await?;
            if json_output {
                print_json(&json!({ "success": true, "platform": platform, "version": installed }))?;
            } else {
                println!("Installed version {}", installed);
            }
        }
        Command::Uninstall { platform } => {
            let removed = AppInstaller::new(&config).uninstall_app(platform).await?;
            if json_output {
                print_json(&json!({ "success": true, "removed": removed }))?;
            } else if removed {
                println!("Uninstalled {}", config.app.bundle_id);
            } else {
                println!("{} was not installed", config.app.bundle_id);
            }
        }
        Command::Download { version } => {
            let path = IpaDownloader::from_config(&config)?.download_ipa(&version).await?;
            if json_output {
                print_json(&json!({ "success": true, "path": path }))?;
            } else {
                println!("{}", path.display());
            }
        }
        Command::Wda { action } => wda(&config, action, json_output).await?,
        Command::LaunchApp { bundle_id, retries, timeout } => {
            let client = WdaClient::new(&config.wda.url);
            let options = LaunchOptions {
                retry_times: retries,
                wait_timeout: Duration::from_secs(timeout),
                ..LaunchOptions::default()
            };
            let launched = start_app_by_wda(&client, &bundle_id, &options).await?;
            if json_output {
                print_json(&json!({ "success": launched, "bundle_id": bundle_id }))?;
            }
            if !launched {
                return Err(CliError::ActionFailed(format!(
                    "{} did not reach the foreground after {} attempts",
                    bundle_id, retries
                )));
            }
            if !json_output {
                println!("{} is in the foreground", bundle_id);
            }
        }
        Command::WaitDevice { timeout } => {
            let found = DeviceManager::wait_for_device(Duration::from_secs(timeout)).await;
            if json_output {
                print_json(&json!({ "success": found }))?;
            }
            if !found {
                return Err(CliError::Device(format!("no device attached after {}s", timeout)));
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Show => print_json(&serde_json::to_value(&config)?)?,
            ConfigAction::Init { path, force } => {
                if path.exists() && !force {
                    return Err(CliError::Config(format!(
                        "{} already exists (use --force to overwrite)",
                        path.display()
                    )));
                }
                MobitestConfig::default().save(&path)?;
                if json_output {
                    print_json(&json!({ "success": true, "path": path }))?;
                } else {
                    println!("Wrote {}", path.display());
                }
            }
        },
    }
    Ok(0)
}

async fn list_devices(json_output: bool) -> Result<(), CliError> {
    let android = DeviceManager::get_android_devices().await;
    let ios = match tokio::task::spawn_blocking(ios::list_udids).await {
        Ok(Ok(udids)) => udids,
        Ok(Err(e)) => {
            debug!(error = %e, "idevice_id unavailable");
            Vec::new()
        }
        Err(e) => return Err(CliError::ActionFailed(e.to_string())),
    };

    if json_output {
        return print_json(&json!({ "android": android, "ios": ios }));
    }
    if android.is_empty() && ios.is_empty() {
        eprintln!("No devices found");
    }
    for serial in &android {
        println!("android  {}", serial);
    }
    for udid in &ios {
        println!("ios      {}", udid);
    }
    Ok(())
}

async fn device_info(config: &MobitestConfig, platform: Platform, json_output: bool) -> Result<(), CliError> {
    let manager = DeviceManager::new(config.clone());
    manager.connect_device(platform).await?;
    let info = manager.get_device_info(platform).await;
    manager.disconnect().await;

    if let Some(error) = info.get("error") {
        return Err(CliError::Device(error.clone()));
    }
    if json_output {
        return print_json(&serde_json::to_value(&info)?);
    }
    let width = info.keys().map(String::len).max().unwrap_or(0);
    for (key, value) in &info {
        println!("{:width$}  {}", key, value, width = width);
    }
    Ok(())
}

async fn doctor(json_output: bool) -> Result<(), CliError> {
    let report = tokio::task::spawn_blocking(run_android_checks)
        .await
        .map_err(|e| CliError::ActionFailed(e.to_string()))?;
    let (passed, total) = report.summary();

    if json_output {
        print_json(&serde_json::to_value(&report)?)?;
    } else {
        for check in &report.checks {
            let mark = if check.passed { "PASS" } else { "FAIL" };
            println!("[{}] {}: {}", mark, check.name, check.detail);
            for hint in &check.hints {
                println!("       - {}", hint);
            }
        }
        println!("{}/{} checks passed", passed, total);
    }

    if report.all_passed() {
        Ok(())
    } else {
        Err(CliError::Device(format!("{} of {} checks failed", total - passed, total)))
    }
}

async fn wda(config: &MobitestConfig, action: WdaAction, json_output: bool) -> Result<(), CliError> {
    let lifecycle = WdaLifecycle::new(config.wda.clone());
    match action {
        WdaAction::Start => {
            let runner = lifecycle.start().await?;
            if json_output {
                print_json(&json!({
                    "success": true,
                    "url": lifecycle.url(),
                    "udid": runner.udid,
                    "log": runner.log_path,
                }))?;
            } else {
                println!("WebDriverAgent ready at {} (device {})", lifecycle.url(), runner.udid);
                println!("xcodebuild log: {}", runner.log_path.display());
            }
        }
        WdaAction::Status => {
            let ready = lifecycle.check_wda_status().await;
            if json_output {
                print_json(&json!({ "ready": ready, "url": lifecycle.url() }))?;
            }
            if !ready {
                return Err(CliError::Device(format!("WebDriverAgent not reachable at {}", lifecycle.url())));
            }
            if !json_output {
                println!("WebDriverAgent ready at {}", lifecycle.url());
            }
        }
        WdaAction::Cleanup => {
            lifecycle.cleanup_iproxy();
            if json_output {
                print_json(&json!({ "success": true }))?;
            } else {
                println!("iproxy on port {} stopped", config.wda.local_port);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_error_kind() {
        assert_eq!(CliError::ActionFailed("x".into()).code(), 1);
        assert_eq!(CliError::Device("x".into()).code(), 2);
        assert_eq!(CliError::Config("x".into()).code(), 3);
        assert_eq!(CliError::Io("x".into()).code(), 4);
    }

    #[test]
    fn core_errors_map_to_kinds() {
        let e: CliError = ConfigError::UnsupportedPlatform(Platform::MacOs).into();
        assert!(matches!(e, CliError::Config(_)));

        let e: CliError = InstallerError::Unsupported(Platform::Windows).into();
        assert!(matches!(e, CliError::ActionFailed(_)));

        let e: CliError = DownloadError::NotConfigured.into();
        assert!(matches!(e, CliError::Config(_)));

        let e: CliError = WdaLifecycleError::StartupTimeout.into();
        assert!(matches!(e, CliError::Device(_)));

        let e: CliError = ManagerError::Driver(DriverError::NotConnected).into();
        assert!(matches!(e, CliError::Device(_)));
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["mobitest", "device-info", "--platform", "android", "--format", "json"]).unwrap();
        assert!(cli.format == OutputFormat::Json);
        assert!(matches!(cli.command, Command::DeviceInfo { platform: Platform::Android }));
    }

    #[test]
    fn run_rejects_unknown_device() {
        assert!(Cli::try_parse_from(["mobitest", "run", "--device", "blackberry"]).is_err());
        assert!(Cli::try_parse_from(["mobitest", "run", "--device", "ios", "--no-serve"]).is_ok());
    }
}
