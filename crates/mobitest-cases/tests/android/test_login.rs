//! Launch the game client and tap through its login screen.

use std::time::Duration;

use mobitest_cases::{case_file, failures, popup_handler, template, STEP_PAUSE};
use mobitest_core::fixture::ModuleFixture;

const GAME_PACKAGE: &str = "com.hkhy.fishingarenaUnityDebugFalseTrueFalse";

#[tokio::test]
#[ignore = "needs a connected Android device with the game installed"]
async fn test_login() {
    let fixture = ModuleFixture::setup(case_file("tests/android/test_login.rs"))
        .await
        .expect("device setup failed");
    let popups = popup_handler();

    let login = fixture
        .case("test_login")
        .feature("Login")
        .story("tap the login button after launch")
        .run(|session| {
            let popups = &popups;
            async move {
                session.home().await?;
                session.start_app(GAME_PACKAGE).await?;
                session.sleep(Duration::from_secs(20)).await;
                popups.dismiss(session).await;

                let button = template("login_button.png").record_pos(-0.002, 0.157).resolution(2376, 1080);
                session.touch(&button).await?;
                session.sleep(STEP_PAUSE).await;
                session.stop_app(GAME_PACKAGE).await?;
                session.home().await
            }
        })
        .await;

    fixture.teardown().await;
    let failed = failures(vec![("test_login", login)]);
    assert!(failed.is_empty(), "{failed:#?}");
}
