//! Module-scoped test fixture.
//!
//! One [`ModuleFixture`] serves every case of a test file. It:
//!
//! 1. Picks the platform from the test file path (or `MOBITEST_DEVICE`).
//! 2. Connects the device and opens a session logging into `<test dir>/log`.
//! 3. Records an Allure result per case and attaches the report bundle.
//! 4. Disconnects on [`teardown`](ModuleFixture::teardown).
//!
//! # Example
//!
//! ```no_run
//! use mobitest_core::fixture::ModuleFixture;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fixture = ModuleFixture::setup("tests/ios/test_home.rs").await?;
//! let outcome = fixture
//!     .case("test_home")
//!     .feature("iOS")
//!     .story("home screen")
//!     .run(|session| async move {
//!         session.home().await?;
//!         Ok(())
//!     })
//!     .await;
//! fixture.teardown().await;
//! outcome?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use crate::allure::{AllureWriter, Status, TestResult};
use crate::device_manager::{DeviceManager, ManagerError};
use crate::logging::init_logging;
use crate::platform::{resolve_platform, Platform};
use crate::report::{zip_dir, ExportLayout, ReportExporter};
use crate::session::{DeviceSession, SessionError};
use crate::timestamp::{env_timestamp, export_timestamp, TIMESTAMP_ENV};

/// Device session shared by the cases of one test file.
pub struct ModuleFixture<'m> {
    manager: &'m DeviceManager,
    test_file: PathBuf,
    platform: Platform,
    session: DeviceSession,
    _log_guard: Option<WorkerGuard>,
}

impl ModuleFixture<'static> {
    /// Sets up against the process-wide [`DeviceManager`].
    pub async fn setup(test_file: impl AsRef<Path>) -> Result<Self, ManagerError> {
        ModuleFixture::setup_with(DeviceManager::global(), test_file).await
    }
}

impl<'m> ModuleFixture<'m> {
    pub async fn setup_with(manager: &'m DeviceManager, test_file: impl AsRef<Path>) -> Result<Self, ManagerError> {
        let log_guard = init_logging(manager.config());

        let test_file = test_file.as_ref().to_path_buf();
        let test_dir = test_file.parent().unwrap_or_else(|| Path::new("."));
        let log_dir = test_dir.join("log");
        std::fs::create_dir_all(&log_dir)?;

        let platform = resolve_platform(&test_file);
        info!(platform = %platform, test_file = %test_file.display(), "platform detected");

        let session = manager.init_device(&test_file, &log_dir, platform).await?;
        Ok(Self {
            manager,
            test_file,
            platform,
            session,
            _log_guard: log_guard,
        })
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn test_file(&self) -> &Path {
        &self.test_file
    }

    fn file_name(&self) -> String {
        self.test_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Starts describing a test case.
    pub fn case(&self, name: impl Into<String>) -> CaseBuilder<'_, 'm> {
        CaseBuilder {
            fixture: self,
            name: name.into(),
            feature: None,
            story: None,
        }
    }

    /// Exports the bundle of this test file and attaches it to `result`.
    ///
    /// Requires `TEST_TIMESTAMP`; without it the report is skipped with a
    /// warning. Failures are logged and never fail the test.
    pub async fn attach_report(&self, allure: &AllureWriter, result: &mut TestResult) -> Option<PathBuf> {
        let Some(timestamp) = env_timestamp() else {
            warn!("{TIMESTAMP_ENV} is not set, skipping report bundle");
            return None;
        };

        let layout = ExportLayout::new(&self.manager.config().export_dir, &self.test_file, timestamp);
        let bundle = match ReportExporter::new(layout).export(self.session.log_dir()) {
            Ok(bundle) => bundle,
            Err(e) => {
                error!(error = %e, "report export failed");
                return None;
            }
        };

        let zip_path = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(format!("mobitest_report_{}.zip", export_timestamp()));
        let attached = match zip_dir(&bundle, &zip_path) {
            Ok(_) => match allure.attach_report_bundle(result, &zip_path, &self.file_name()) {
                Ok(_) => Some(bundle),
                Err(e) => {
                    error!(error = %e, "attaching report bundle failed");
                    None
                }
            },
            Err(e) => {
                error!(error = %e, "zipping report bundle failed");
                None
            }
        };

        if zip_path.exists() {
            match std::fs::remove_file(&zip_path) {
                Ok(()) => info!(zip = %zip_path.display(), "temporary zip removed"),
                Err(e) => error!(zip = %zip_path.display(), error = %e, "failed to remove temporary zip"),
            }
        }
        attached
    }

    /// Closes the step log and disconnects the device.
    pub async fn teardown(self) {
        self.session.close().await;
        self.manager.disconnect().await;
    }
}

/// A test case about to run on a [`ModuleFixture`].
pub struct CaseBuilder<'f, 'm> {
    fixture: &'f ModuleFixture<'m>,
    name: String,
    feature: Option<String>,
    story: Option<String>,
}

impl<'f, 'm> CaseBuilder<'f, 'm> {
    pub fn feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    pub fn story(mut self, story: impl Into<String>) -> Self {
        self.story = Some(story.into());
        self
    }

    /// Runs `body` and records its Allure result.
    ///
    /// Assertion-style errors mark the case failed; any other error marks it
    /// broken. The body's result is returned unchanged.
    pub async fn run<F, Fut>(self, body: F) -> Result<(), SessionError>
    where
        F: FnOnce(&'f DeviceSession) -> Fut,
        Fut: Future<Output = Result<(), SessionError>>,
    {
        let fixture = self.fixture;
        let file_name = fixture.file_name();
        let mut result = TestResult::start(&self.name, format!("{}::{}", fixture.test_file.display(), self.name))
            .suite(file_name.clone())
            .label("platform", fixture.platform.to_string());
        if let Some(feature) = self.feature {
            result = result.feature(feature);
        }
        if let Some(story) = self.story {
            result = result.story(story);
        }

        info!(case = %self.name, "case started");
        let outcome = body(&fixture.session).await;
        match &outcome {
            Ok(()) => {
                info!(case = %self.name, "case passed");
                result.finish(Status::Passed, None);
            }
            Err(e) if e.is_assertion() => {
                error!(case = %self.name, error = %e, "case failed");
                result.finish(Status::Failed, Some(e.to_string()));
            }
            Err(e) => {
                error!(case = %self.name, error = %e, "case broken");
                result.finish(Status::Broken, Some(e.to_string()));
            }
        }

        match AllureWriter::from_env(&fixture.manager.config().allure.result_dir) {
            Ok(allure) => {
                fixture.attach_report(&allure, &mut result).await;
                if let Err(e) = allure.write(&result) {
                    error!(error = %e, "failed to write allure result");
                }
            }
            Err(e) => error!(error = %e, "allure results directory unavailable"),
        }

        outcome
    }
}
