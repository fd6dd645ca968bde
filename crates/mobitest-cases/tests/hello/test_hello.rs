//! Send "hello" to a contact, pasting the name through the clipboard.
//!
//! Lives outside a platform directory, so it runs on iOS unless
//! `MOBITEST_DEVICE` says otherwise.

use std::time::Duration;

use mobitest_cases::{case_file, failures, ios_template, STEP_PAUSE};
use mobitest_core::fixture::ModuleFixture;

#[tokio::test]
#[ignore = "needs a connected device"]
async fn test_hello() {
    let fixture = ModuleFixture::setup(case_file("tests/hello/test_hello.rs"))
        .await
        .expect("device setup failed");

    let hello = fixture
        .case("test_hello")
        .feature("Send a hello message")
        .run(|session| async move {
            session.home().await?;
            session.touch(ios_template("app_icon.png", -0.11, 0.214)).await?;
            session.sleep(STEP_PAUSE).await;
            session.touch(ios_template("messages_tab.png", -0.393, 0.939)).await?;
            session.touch(ios_template("search_icon.png", 0.332, -0.92)).await?;

            session.paste("zhang", false).await?;
            let result = session
                .wait_with(&ios_template("search_result.png", -0.085, -0.452), Duration::from_secs(10), Duration::from_secs(1))
                .await?;
            session.touch(result.center).await?;
            session.sleep(STEP_PAUSE).await;

            session.touch(ios_template("message_input.png", -0.05, 0.94)).await?;
            session.text("hello", false).await?;
            session.touch(ios_template("send_button.png", 0.375, 0.834)).await?;
            session.snapshot(Some("message_sent.png"), Some("after sending")).await?;
            session.home().await
        })
        .await;

    fixture.teardown().await;
    let failed = failures(vec![("test_hello", hello)]);
    assert!(failed.is_empty(), "{failed:#?}");
}
