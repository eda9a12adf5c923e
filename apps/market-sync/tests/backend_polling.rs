//! Backend Polling Integration Tests
//!
//! Runs the polling synchronizer against a mock dashboard backend over HTTP.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use market_sync::application::services::PollingSynchronizer;
use market_sync::{BackendClient, BackendConfig, PollError, PollingConfig, ResourceKind};

async fn mount_all(server: &MockServer) {
    let payloads = [
        ("/api/market-data", json!({"GC=F": [{"Date": "2026-10-15", "Close": 2010.5}]})),
        ("/api/predictions", json!({"GC=F": [{"p05": -0.01, "p50": 0.002, "p95": 0.012}]})),
        ("/api/news", json!([{"title": "Gold steadies"}])),
        ("/api/shocks", json!([])),
        ("/api/live-order", json!(null)),
        ("/api/system-status", json!({"model": "ready"})),
    ];

    for (route, body) in payloads {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }
}

fn poller(server: &MockServer, request_timeout: Duration) -> PollingSynchronizer {
    let client = BackendClient::new(&BackendConfig {
        base_url: server.uri(),
        timeout: Duration::from_secs(5),
    })
    .unwrap();

    PollingSynchronizer::new(
        Arc::new(client),
        PollingConfig {
            interval: Duration::from_secs(5),
            request_timeout,
            resources: ResourceKind::all().to_vec(),
        },
    )
}

#[tokio::test]
async fn full_cycle_commits_every_resource() {
    let server = MockServer::start().await;
    mount_all(&server).await;

    let mut poller = poller(&server, Duration::from_secs(2));
    let snapshot = poller.tick().await.unwrap();

    assert_eq!(snapshot.cycle(), 1);
    assert_eq!(snapshot.kinds().count(), 6);
    assert_eq!(
        snapshot.get(ResourceKind::Status),
        Some(&json!({"model": "ready"}))
    );
    assert_eq!(snapshot.get(ResourceKind::Order), Some(&json!(null)));
}

#[tokio::test]
async fn one_failing_endpoint_discards_the_cycle() {
    let server = MockServer::start().await;
    Mock::given(path("/api/news"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"detail": "feed down"})))
        .with_priority(1)
        .mount(&server)
        .await;
    mount_all(&server).await;

    let mut poller = poller(&server, Duration::from_secs(2));
    let failure = poller.tick().await.unwrap_err();

    assert_eq!(failure.cycle, 1);
    assert_eq!(
        failure.failures,
        vec![(ResourceKind::News, PollError::Status(500))]
    );
}

#[tokio::test]
async fn slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(path("/api/shocks"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(2)),
        )
        .with_priority(1)
        .mount(&server)
        .await;
    mount_all(&server).await;

    let mut poller = poller(&server, Duration::from_millis(200));
    let failure = poller.tick().await.unwrap_err();

    assert_eq!(
        failure.failures,
        vec![(ResourceKind::Shocks, PollError::Timeout(200))]
    );
}
