//! Search a contact in the messaging app and send them a message.

use mobitest_cases::{case_file, failures, ios_template, popup_handler, IM_BUNDLE_ID, STEP_PAUSE};
use mobitest_core::fixture::ModuleFixture;

#[tokio::test]
#[ignore = "needs a connected iOS device with WebDriverAgent"]
async fn test_hello() {
    let fixture = ModuleFixture::setup(case_file("tests/ios/test_hello.rs"))
        .await
        .expect("device setup failed");
    let popups = popup_handler();

    let hello = fixture
        .case("test_hello")
        .feature("IM messaging")
        .story("search a contact and send a message")
        .run(|session| {
            let popups = &popups;
            async move {
                session.stop_app(IM_BUNDLE_ID).await?;
                session.keyevent("HOME").await?;

                session.comment("open the app from the home screen").await;
                popups
                    .run_guarded(session, || session.touch(ios_template("app_icon.png", -0.11, 0.214)))
                    .await?;
                session.sleep(STEP_PAUSE).await;

                session.comment("open the messages tab").await;
                session.touch(ios_template("messages_tab.png", -0.393, 0.939)).await?;
                session.sleep(STEP_PAUSE).await;

                session.comment("open search").await;
                session.touch(ios_template("search_icon.png", 0.332, -0.92)).await?;
                session.sleep(STEP_PAUSE).await;

                session.text("zhang", false).await?;
                session.sleep(STEP_PAUSE).await;

                session.wait(&ios_template("search_result.png", -0.085, -0.452)).await?;
                session.touch(ios_template("search_result.png", -0.085, -0.452)).await?;
                session.sleep(STEP_PAUSE).await;

                session.comment("send the message").await;
                session.touch(ios_template("message_input.png", -0.05, 0.94)).await?;
                session.text("hello", false).await?;
                session.sleep(STEP_PAUSE).await;
                session.touch(ios_template("send_button.png", 0.375, 0.834)).await?;

                session.touch(ios_template("back_arrow.png", -0.434, -0.929)).await?;
                session.touch(ios_template("cancel_button.png", 0.422, -0.935)).await?;
                session.keyevent("HOME").await
            }
        })
        .await;

    fixture.teardown().await;
    let failed = failures(vec![("test_hello", hello)]);
    assert!(failed.is_empty(), "{failed:#?}");
}
