//! Home key and app icon on the iOS springboard.

use mobitest_cases::{case_file, failures, ios_template, STEP_PAUSE};
use mobitest_core::fixture::ModuleFixture;

#[tokio::test]
#[ignore = "needs a connected iOS device with WebDriverAgent"]
async fn test_home() {
    let fixture = ModuleFixture::setup(case_file("tests/ios/test_home.rs"))
        .await
        .expect("device setup failed");

    let home = fixture
        .case("test_home")
        .feature("Home key")
        .run(|session| async move {
            session.keyevent("HOME").await?;
            session.touch(ios_template("app_icon.png", -0.11, 0.214)).await?;
            session.sleep(STEP_PAUSE).await;
            session.keyevent("HOME").await
        })
        .await;

    fixture.teardown().await;
    let failed = failures(vec![("test_home", home)]);
    assert!(failed.is_empty(), "{failed:#?}");
}
