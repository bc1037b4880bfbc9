#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Transport built from deserialized application config.

use http::Method;
use httpmock::prelude::*;
use kubeapi_transport::{ConnectionOptions, Transport, TransportError};
use std::time::Duration;

fn options_from_config(endpoint: &str, extra: &serde_json::Value) -> ConnectionOptions {
    let mut config = serde_json::json!({
        "endpoint": endpoint,
        "default_namespace": "team-a",
    });
    for (key, value) in extra.as_object().unwrap() {
        config[key] = value.clone();
    }
    serde_json::from_value(config).unwrap()
}

#[tokio::test]
async fn configured_token_and_timeout_are_applied() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/version")
            .header("authorization", "Bearer from-config");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"major":"1","minor":"31"}"#);
    });

    let options = options_from_config(
        &server.base_url(),
        &serde_json::json!({ "access_token": "from-config", "request_timeout": "2m" }),
    );
    assert_eq!(options.request_timeout, Duration::from_secs(120));

    let transport = Transport::from_options(&options).unwrap();
    let url = options.endpoint_url().unwrap().join("version").unwrap();
    let version: serde_json::Value = transport
        .request(Method::GET, &url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    mock.assert();
    assert_eq!(version["minor"], "31");
}

#[tokio::test]
async fn configured_body_limit_is_enforced() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/big");
        then.status(200).body("x".repeat(4096));
    });

    let options = options_from_config(
        &server.base_url(),
        &serde_json::json!({ "max_body_size": 1024 }),
    );
    let transport = Transport::from_options(&options).unwrap();
    assert_eq!(transport.max_body_size(), 1024);

    let url = options.endpoint_url().unwrap().join("big").unwrap();
    let err = transport
        .request(Method::GET, &url)
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::BodyTooLarge { limit: 1024, .. }));
}

#[tokio::test]
async fn oversized_error_body_still_yields_a_preview() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/broken");
        then.status(500).body("e".repeat(64 * 1024));
    });

    let options = ConnectionOptions::for_endpoint(server.base_url());
    let transport = Transport::from_options(&options).unwrap();
    let url = options.endpoint_url().unwrap().join("broken").unwrap();
    let response = transport.request(Method::GET, &url).send().await.unwrap();

    assert_eq!(response.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.error_preview().await.unwrap(),
        "<body too large for preview>"
    );
}

#[test]
fn unknown_duration_string_is_rejected() {
    let config = serde_json::json!({
        "endpoint": "https://10.0.0.1:6443",
        "request_timeout": "soon",
    });
    assert!(serde_json::from_value::<ConnectionOptions>(config).is_err());
}
