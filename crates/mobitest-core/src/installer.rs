//! Installing the app under test from the local package directory.
//!
//! Packages are looked up in `pkgs_dir` by platform extension and version
//! substring. After installing, the installed version must start with the
//! first three dot-separated components of the requested version.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};

use crate::config::{ConfigError, MobitestConfig};
use crate::device_manager::default_connector;
use crate::driver::{DeviceDriver, DriverError};
use crate::platform::Platform;

#[derive(Error, Debug)]
pub enum InstallerError {
    #[error("Installing is not supported on {0}")]
    Unsupported(Platform),

    #[error("No {platform} package for version {version} (*{extension}) in {dir}")]
    PackageNotFound {
        platform: Platform,
        version: String,
        extension: &'static str,
        dir: PathBuf,
    },

    #[error("App {0} is not installed")]
    NotInstalled(String),

    #[error("Installed version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The `major.minor.patch` part of a version string.
pub fn expected_version_prefix(version: &str) -> String {
    version.split('.').take(3).collect::<Vec<_>>().join(".")
}

/// Installs and removes the configured app on a device.
pub struct AppInstaller {
    config: MobitestConfig,
    pkgs_dir: PathBuf,
    bundle_id: String,
    driver: Option<Box<dyn DeviceDriver>>,
}

impl AppInstaller {
    pub fn new(config: &MobitestConfig) -> Self {
        Self {
            config: config.clone(),
            pkgs_dir: config.app.pkgs_dir.clone(),
            bundle_id: config.app.bundle_id.clone(),
            driver: None,
        }
    }

    pub fn with_pkgs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pkgs_dir = dir.into();
        self
    }

    pub fn with_bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = bundle_id.into();
        self
    }

    /// Uses an already connected driver instead of connecting on demand.
    pub fn with_driver(mut self, driver: Box<dyn DeviceDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn pkgs_dir(&self) -> &Path {
        &self.pkgs_dir
    }

    fn ensure_supported(platform: Platform) -> Result<(), InstallerError> {
        match platform {
            Platform::Ios | Platform::Android => Ok(()),
            other => Err(InstallerError::Unsupported(other)),
        }
    }

    async fn connect_device(&mut self, platform: Platform) -> Result<&dyn DeviceDriver, InstallerError> {
        if self.driver.is_none() {
            Self::ensure_supported(platform)?;
            let uri = self.config.device_uri(platform)?;
            let mut driver = default_connector(platform, &uri, &self.config)?;
            if let Err(e) = driver.connect().await {
                error!(platform = %platform, error = %e, "failed to connect device");
                return Err(e.into());
            }
            info!(platform = %platform, "device connected");
            self.driver = Some(driver);
        }
        match self.driver.as_deref() {
            Some(driver) => Ok(driver),
            None => Err(DriverError::NotConnected.into()),
        }
    }

    /// Finds the package for `version` in the package directory.
    pub fn find_package(&self, platform: Platform, version: &str) -> Result<PathBuf, InstallerError> {
        Self::ensure_supported(platform)?;
        let extension = platform.package_extension();

        let mut names: Vec<String> = std::fs::read_dir(&self.pkgs_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();

        match names.into_iter().find(|n| n.ends_with(extension) && n.contains(version)) {
            Some(name) => {
                info!(platform = %platform, version, package = %name, "package found");
                Ok(self.pkgs_dir.join(name))
            }
            None => Err(InstallerError::PackageNotFound {
                platform,
                version: version.to_string(),
                extension,
                dir: self.pkgs_dir.clone(),
            }),
        }
    }

    async fn installed_version_on(driver: &dyn DeviceDriver, bundle_id: &str) -> Result<Option<String>, InstallerError> {
        let apps = driver.list_apps().await?;
        info!(count = apps.len(), "installed apps listed");
        Ok(apps.into_iter().find(|a| a.id == bundle_id).map(|a| a.version))
    }

    /// Version of the installed app on the connected device.
    pub async fn get_installed_version(&self) -> Result<String, InstallerError> {
        let driver = self.driver.as_deref().ok_or(DriverError::NotConnected)?;
        Self::installed_version_on(driver, &self.bundle_id)
            .await?
            .ok_or_else(|| InstallerError::NotInstalled(self.bundle_id.clone()))
    }

    /// Replaces the installed app with the package for `version`.
    pub async fn install_app(&mut self, platform: Platform, version: &str) -> Result<String, InstallerError> {
        let result = self.try_install(platform, version).await;
        if let Err(e) = &result {
            error!(platform = %platform, version, error = %e, "install failed");
        }
        result
    }

    async fn try_install(&mut self, platform: Platform, version: &str) -> Result<String, InstallerError> {
        Self::ensure_supported(platform)?;
        self.connect_device(platform).await?;
        self.uninstall_app(platform).await?;

        let package = self.find_package(platform, version)?;
        let bundle_id = self.bundle_id.clone();
        let driver = self.connect_device(platform).await?;
        info!(package = %package.display(), "installing");
        driver.install_app(&package).await?;

        let installed = Self::installed_version_on(driver, &bundle_id)
            .await?
            .ok_or_else(|| InstallerError::NotInstalled(bundle_id.clone()))?;
        let expected = expected_version_prefix(version);
        if !installed.starts_with(&expected) {
            return Err(InstallerError::VersionMismatch { expected, actual: installed });
        }
        info!(version = %installed, "app installed");
        Ok(installed)
    }

    /// Uninstalls the app if present. Returns whether anything was removed.
    pub async fn uninstall_app(&mut self, platform: Platform) -> Result<bool, InstallerError> {
        Self::ensure_supported(platform)?;
        let bundle_id = self.bundle_id.clone();
        let driver = self.connect_device(platform).await?;

        info!(bundle_id = %bundle_id, "checking installed app");
        let installed = match Self::installed_version_on(driver, &bundle_id).await {
            Ok(v) => v,
            Err(e) => {
                info!(error = %e, "could not list apps, assuming not installed");
                None
            }
        };
        let Some(version) = installed else {
            info!(bundle_id = %bundle_id, "not installed, skipping uninstall");
            return Ok(false);
        };

        info!(bundle_id = %bundle_id, version = %version, "uninstalling");
        driver.uninstall_app(&bundle_id).await?;
        info!("app uninstalled");
        Ok(true)
    }
}
