//! # mobitest-core
//!
//! Core library for image-driven UI test suites on Android and iOS devices.
//!
//! The crate resolves which device a test file targets, connects it through a
//! platform driver, records every UI step of the test into a log directory and
//! turns that directory into a report bundle attached to an Allure result.
//!
//! ## Modules
//!
//! - [`platform`], [`config`], [`timestamp`], [`logging`] - run-wide settings
//! - [`adb`], [`android`] - wrapper around the `adb` CLI and device queries
//! - [`wda`], [`ios`] - WebDriverAgent HTTP client and its process lifecycle
//! - [`driver`], [`android_driver`], [`ios_driver`] - the [`DeviceDriver`](driver::DeviceDriver) trait and backends
//! - [`template`] - locating reference images on screenshots
//! - [`device_manager`], [`session`], [`fixture`], [`popup`] - connection lifecycle and the test API
//! - [`action`], [`report`], [`allure`] - step log, HTML bundles and Allure results
//! - [`installer`], [`downloader`], [`env_check`] - app packages and environment checks
//!
//! ## External Dependencies
//!
//! Android needs `adb` on `PATH`. iOS needs a WebDriverAgent checkout plus
//! `xcodebuild`, `iproxy`, `idevice_id` and `ideviceinstaller`. Rendering
//! reports needs the `allure` CLI.
//!
//! ## Example
//!
//! ```no_run
//! use mobitest_core::fixture::ModuleFixture;
//! use mobitest_core::template::Template;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fixture = ModuleFixture::setup("tests/android/test_settings.rs").await?;
//! fixture
//!     .case("open_settings")
//!     .run(|session| async move {
//!         session.start_app("com.android.settings").await?;
//!         session.wait(&Template::new("templates/settings_title.png")).await?;
//!         Ok(())
//!     })
//!     .await?;
//! fixture.teardown().await;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod adb;
pub mod allure;
pub mod android;
pub mod android_driver;
pub mod config;
pub mod device_manager;
pub mod downloader;
pub mod driver;
pub mod env_check;
pub mod fixture;
pub mod installer;
pub mod ios;
pub mod ios_driver;
pub mod logging;
pub mod platform;
pub mod popup;
pub mod report;
pub mod session;
pub mod template;
pub mod timestamp;
pub mod wda;
