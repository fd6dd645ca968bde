//! WebDriverAgent client, app launch retry and iOS driver against a mock WDA.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::{json, Value};

use common::{png_bytes, textured_screen, wda_value, MockRequest, MockWda};
use mobitest_core::driver::DeviceDriver;
use mobitest_core::ios::{start_app_by_wda, LaunchOptions, WdaLifecycleError};
use mobitest_core::ios_driver::IosDriver;
use mobitest_core::wda::{AppState, WdaClient, WdaError};

const BUNDLE: &str = "com.vv.work";

fn fast_options() -> LaunchOptions {
    LaunchOptions {
        wait_timeout: Duration::from_millis(200),
        retry_times: 3,
        status_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(20),
        settle_delay: Duration::from_millis(10),
        retry_delay: Duration::from_millis(10),
    }
}

/// WDA that answers status and session requests and reports app states
/// from `states` (the last entry repeats).
async fn wda_with_states(states: Vec<i64>) -> MockWda {
    let calls = Arc::new(AtomicUsize::new(0));
    MockWda::start(Arc::new(move |req: &MockRequest| {
        if req.path == "/status" {
            return wda_value(json!({ "ready": true }));
        }
        if req.path == "/session" {
            return wda_value(json!({ "sessionId": "mock-session" }));
        }
        if req.path.ends_with("/wda/apps/state") {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let state = states.get(n).or(states.last()).copied().unwrap_or(0);
            return wda_value(json!(state));
        }
        wda_value(Value::Null)
    }))
    .await
}

#[tokio::test]
async fn cold_launch_reaches_foreground() {
    let wda = wda_with_states(vec![0, 0, 4]).await;
    let client = WdaClient::new(&wda.url);

    let launched = start_app_by_wda(&client, BUNDLE, &fast_options()).await.unwrap();

    assert!(launched);
    assert_eq!(wda.count("POST", "/wda/apps/launch"), 1);
    assert_eq!(wda.count("POST", "/wda/apps/terminate"), 0);
}

#[tokio::test]
async fn running_app_is_terminated_first() {
    let wda = wda_with_states(vec![4, 4]).await;
    let client = WdaClient::new(&wda.url);

    assert!(start_app_by_wda(&client, BUNDLE, &fast_options()).await.unwrap());
    assert_eq!(wda.count("POST", "/wda/apps/terminate"), 1);

    let launch = wda
        .requests()
        .into_iter()
        .find(|r| r.path.ends_with("/wda/apps/launch"))
        .unwrap();
    let body: Value = serde_json::from_str(&launch.body).unwrap();
    assert_eq!(body["bundleId"], BUNDLE);
    assert_eq!(body["shouldWaitForQuiescence"], true);
}

#[tokio::test]
async fn gives_up_after_all_attempts_time_out() {
    let wda = wda_with_states(vec![0]).await;
    let client = WdaClient::new(&wda.url);

    let launched = start_app_by_wda(&client, BUNDLE, &fast_options()).await.unwrap();

    assert!(!launched);
    assert_eq!(wda.count("POST", "/wda/apps/launch"), 3);
}

#[tokio::test]
async fn last_wda_error_propagates_after_retries() {
    let wda = MockWda::start(Arc::new(|req: &MockRequest| {
        if req.path == "/status" {
            return wda_value(json!({ "ready": true }));
        }
        if req.path == "/session" {
            return wda_value(json!({ "sessionId": "s1" }));
        }
        if req.path.ends_with("/wda/apps/state") {
            return wda_value(json!(0));
        }
        (
            500,
            json!({ "value": { "error": "unknown error", "message": "launch refused" } }),
        )
    }))
    .await;
    let client = WdaClient::new(&wda.url);

    let err = start_app_by_wda(&client, BUNDLE, &fast_options()).await.unwrap_err();

    match err {
        WdaLifecycleError::Wda(WdaError::Api(msg)) => assert_eq!(msg, "unknown error: launch refused"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(wda.count("POST", "/wda/apps/launch"), 3);
    // every retry opens a fresh session
    assert_eq!(wda.count("POST", "/session"), 3);
}

#[tokio::test]
async fn unreachable_status_times_out() {
    let wda = MockWda::start(Arc::new(|_: &MockRequest| {
        (503, json!({ "value": { "error": "unavailable", "message": "starting" } }))
    }))
    .await;
    let client = WdaClient::new(&wda.url);

    let err = start_app_by_wda(&client, BUNDLE, &fast_options()).await.unwrap_err();
    assert!(matches!(err, WdaLifecycleError::StartupTimeout));
    assert_eq!(wda.count("POST", "/wda/apps/launch"), 0);
}

#[tokio::test]
async fn app_state_codes() {
    let wda = wda_with_states(vec![3]).await;
    let client = WdaClient::new(&wda.url);
    assert_eq!(client.app_state(BUNDLE).await.unwrap(), AppState::RunningBackground);
    // session created lazily, then reused
    client.app_state(BUNDLE).await.unwrap();
    assert_eq!(wda.count("POST", "/session"), 1);
}

#[tokio::test]
async fn ios_driver_scales_pixels_to_points() {
    let screen = png_bytes(&textured_screen(200, 300));
    let encoded = base64::engine::general_purpose::STANDARD.encode(&screen);
    let wda = MockWda::start(Arc::new(move |req: &MockRequest| match req.path.as_str() {
        "/status" => wda_value(json!({ "ready": true })),
        "/session" => wda_value(json!({ "sessionId": "s1" })),
        "/screenshot" => wda_value(json!(encoded)),
        p if p.ends_with("/window/size") => wda_value(json!({ "width": 100.0, "height": 150.0 })),
        _ => wda_value(Value::Null),
    }))
    .await;

    let mut driver = IosDriver::new(&wda.url);
    driver.connect().await.unwrap();
    assert!(driver.is_connected());
    assert_eq!(driver.screen_size().await.unwrap(), (200, 300));

    driver.tap(100, 50).await.unwrap();
    driver
        .swipe((20, 40), (20, 240), Duration::from_millis(500))
        .await
        .unwrap();

    let requests = wda.requests();
    let tap = requests.iter().find(|r| r.path.ends_with("/wda/tap/0")).unwrap();
    let body: Value = serde_json::from_str(&tap.body).unwrap();
    assert_eq!(body["x"], 50.0);
    assert_eq!(body["y"], 25.0);

    let drag = requests
        .iter()
        .find(|r| r.path.ends_with("/wda/dragfromtoforduration"))
        .unwrap();
    let body: Value = serde_json::from_str(&drag.body).unwrap();
    assert_eq!(body["toY"], 120.0);
    assert_eq!(body["duration"], 0.5);

    // the scale is measured once
    assert_eq!(wda.count("GET", "/window/size"), 1);

    driver.disconnect().await.unwrap();
    assert!(!driver.is_connected());
    assert!(driver.tap(1, 1).await.is_err());
}

#[tokio::test]
async fn ios_driver_rejects_unknown_keys() {
    let wda = wda_with_states(vec![0]).await;
    let mut driver = IosDriver::new(&wda.url);
    driver.connect().await.unwrap();

    driver.keyevent("HOME").await.unwrap();
    assert_eq!(wda.count("POST", "/wda/homescreen"), 1);
    assert!(driver.keyevent("KEYCODE_BACK").await.is_err());
}
