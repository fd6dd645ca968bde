//! Shared helpers for the device test cases under `tests/`.
//!
//! Every case file opens a [`ModuleFixture`](mobitest_core::fixture::ModuleFixture)
//! with [`case_file`], so the platform is read from the file's directory
//! (`tests/android/...`, `tests/ios/...`) and logs land beside it.
//!
//! The cases are `#[ignore]`d and only run through `mobitest run`, which
//! passes `--ignored` and exports the run timestamp.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mobitest_core::android::AndroidDevice;
use mobitest_core::driver::DriverError;
use mobitest_core::popup::{PopupConfig, PopupHandler};
use mobitest_core::session::SessionError;
use mobitest_core::template::Template;

/// Bundle id of the messaging app under test on iOS.
pub const IM_BUNDLE_ID: &str = "com.vv.work";

/// System settings, present on every Android image.
pub const ANDROID_SETTINGS: &str = "com.android.settings";

/// Resolution the iOS templates were captured at.
pub const IOS_RESOLUTION: (u32, u32) = (1242, 2688);

/// Pause after each tap so the next screen can render.
pub const STEP_PAUSE: Duration = Duration::from_secs(2);

fn crate_root() -> &'static Path {
    Path::new(env!("CARGO_MANIFEST_DIR"))
}

/// Absolute path of a case file, e.g. `case_file("tests/ios/test_home.rs")`.
pub fn case_file(relative: impl AsRef<Path>) -> PathBuf {
    crate_root().join(relative)
}

pub fn templates_dir() -> PathBuf {
    crate_root().join("templates")
}

/// A template image shipped in `templates/`.
pub fn template(name: &str) -> Template {
    Template::new(name).in_dir(&templates_dir())
}

/// An iOS template with its recorded position.
pub fn ios_template(name: &str, x: f64, y: f64) -> Template {
    let (w, h) = IOS_RESOLUTION;
    template(name).record_pos(x, y).resolution(w, h)
}

/// Popup sweeper using the close buttons in `templates/`.
pub fn popup_handler() -> PopupHandler {
    let configs = PopupConfig::defaults()
        .into_iter()
        .map(|c| PopupConfig::new(c.template.in_dir(&templates_dir()), c.name))
        .collect();
    PopupHandler::new(configs)
}

/// Runs a blocking adb query against the first attached Android device.
pub async fn with_android<T, F>(query: F) -> Result<T, SessionError>
where
    T: Send + 'static,
    F: FnOnce(&AndroidDevice) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let device = AndroidDevice::first().map_err(DriverError::from)?;
        Ok(query(&device))
    })
    .await
    .map_err(|e| SessionError::Io(std::io::Error::other(e)))?
}

/// Names and errors of the cases that did not pass.
pub fn failures<N: std::fmt::Display>(outcomes: Vec<(N, Result<(), SessionError>)>) -> Vec<String> {
    outcomes
        .into_iter()
        .filter_map(|(name, outcome)| outcome.err().map(|e| format!("{name}: {e}")))
        .collect()
}
