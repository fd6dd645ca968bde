//! Android basics: device properties, installed apps, app launch and gestures.

use std::time::Duration;

use mobitest_cases::{case_file, failures, with_android, ANDROID_SETTINGS};
use mobitest_core::fixture::ModuleFixture;

/// Screen size assumed for the gesture case.
const SCREEN: (i32, i32) = (1080, 1920);

#[tokio::test]
#[ignore = "needs a connected Android device"]
async fn test_android_basics() {
    let fixture = ModuleFixture::setup(case_file("tests/android/test_android_demo.rs"))
        .await
        .expect("device setup failed");
    let mut outcomes = Vec::new();

    let device_info = fixture
        .case("test_get_device_info")
        .feature("Android basics")
        .story("device info")
        .run(|session| async move {
            let info = with_android(|d| d.device_info()).await?;
            session.assert_true(!info.serial.is_empty(), "device serial present").await?;
            session
                .assert_true(info.android_version != "unknown", "android version present")
                .await?;
            session
                .comment(&format!("{} {} (Android {})", info.brand, info.model, info.android_version))
                .await;
            Ok(())
        })
        .await;
    outcomes.push(("test_get_device_info".to_string(), device_info));

    let apps = fixture
        .case("test_get_installed_apps")
        .feature("Android basics")
        .story("installed apps")
        .run(|session| async move {
            let apps = with_android(|d| d.installed_apps()).await?;
            session.assert_true(!apps.is_empty(), "installed app list is not empty").await?;
            session.comment(&format!("{} apps, first: {:?}", apps.len(), &apps[..apps.len().min(5)])).await;
            Ok(())
        })
        .await;
    outcomes.push(("test_get_installed_apps".to_string(), apps));

    let basics = fixture
        .case("test_basic_operations")
        .feature("Android basics")
        .story("basic operations")
        .run(|session| async move {
            session.snapshot(Some("test_screenshot.png"), None).await?;
            session.home().await?;
            session.sleep(Duration::from_secs(2)).await;
            let activity = with_android(|d| d.current_activity()).await?;
            session.comment(&format!("current activity: {activity}")).await;
            session.snapshot(Some("test_screenshot_after_home.png"), None).await?;
            Ok(())
        })
        .await;
    outcomes.push(("test_basic_operations".to_string(), basics));

    for package in [ANDROID_SETTINGS, "com.android.calculator2"] {
        let name = format!("test_app_launch[{package}]");
        let launch = fixture
            .case(&name)
            .feature("Android basics")
            .story("app launch")
            .run(|session| async move {
                let installed = with_android(|d| d.installed_apps()).await?;
                if !installed.iter().any(|p| p == package) {
                    session.comment(&format!("{package} not installed, skipping")).await;
                    return Ok(());
                }
                session.start_app(package).await?;
                session.sleep(Duration::from_secs(3)).await;
                let short = package.rsplit('.').next().unwrap_or(package);
                session.snapshot(Some(format!("app_launch_{short}.png").as_str()), None).await?;
                let activity = with_android(|d| d.current_activity()).await?;
                session.comment(&format!("activity after launch: {activity}")).await;
                session.stop_app(package).await?;
                session.home().await
            })
            .await;
        if launch.is_err() {
            let _ = fixture.session().home().await;
        }
        outcomes.push((name, launch));
    }

    let gestures = fixture
        .case("test_gesture_operations")
        .feature("Android gestures")
        .run(|session| async move {
            let (w, h) = SCREEN;
            session.home().await?;
            session.sleep(Duration::from_secs(2)).await;
            session.snapshot(Some("gesture_test_start.png"), None).await?;

            session.swipe((w / 2, h * 3 / 4), (w / 2, h / 4)).await?;
            session.sleep(Duration::from_secs(2)).await;
            session.snapshot(Some("gesture_test_after_swipe.png"), None).await?;

            session.touch((w / 2, h / 2)).await?;
            session.sleep(Duration::from_secs(1)).await;
            session.snapshot(Some("gesture_test_after_touch.png"), None).await?;
            session.home().await
        })
        .await;
    outcomes.push(("test_gesture_operations".to_string(), gestures));

    fixture.teardown().await;
    let failed = failures(outcomes);
    assert!(failed.is_empty(), "{failed:#?}");
}
