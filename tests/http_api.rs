//! HTTP facade tests, driven through the router with `tower::ServiceExt`.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use url::Url;

use common::{fake_cluster, options, wait_ready, FakeStats, PDF_MAGIC, PNG_MAGIC};
use snapcluster::auth::StaticTokens;
use snapcluster::http::{router, AppState};
use snapcluster::store::MemoryStore;
use snapcluster::{Cluster, ClusterOptions};

const TOKEN: &str = "tok-reports";

async fn test_app(render_timeout: Duration) -> (Router, Cluster, Arc<MemoryStore>) {
    app_with(options(1, 2), render_timeout).await
}

async fn app_with(
    options: ClusterOptions,
    render_timeout: Duration,
) -> (Router, Cluster, Arc<MemoryStore>) {
    let (cluster, store) = fake_cluster(options, FakeStats::new());
    wait_ready(&cluster, 1).await;
    let state = AppState {
        cluster: cluster.clone(),
        auth: Arc::new(StaticTokens::new(HashMap::from([(
            TOKEN.to_string(),
            "reports".to_string(),
        )]))),
        origin: Url::parse("http://app.test").unwrap(),
        render_timeout,
    };
    (router(state), cluster, store)
}

fn get(uri: &str, accept: Option<&str>, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(accept) = accept {
        builder = builder.header(ACCEPT, accept);
    }
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn snapshot_is_served_as_an_attachment() {
    let (app, cluster, store) = test_app(Duration::from_secs(5)).await;

    let response = app
        .oneshot(get("/quarterly?url=/dashboard&size=400px*300px", None, Some(TOKEN)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"quarterly.png\""
    );
    let body = body_bytes(response).await;
    assert!(body.starts_with(PNG_MAGIC));

    // the blob was taken, nothing is left behind
    assert!(store.is_empty());
    cluster.stop().await;
}

#[tokio::test]
async fn accept_header_selects_pdf() {
    let (app, cluster, _store) = test_app(Duration::from_secs(5)).await;

    let response = app
        .oneshot(get("/report?url=/dashboard&size=Letter", Some("application/pdf"), Some(TOKEN)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "application/pdf");
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "attachment; filename=\"report.pdf\""
    );
    assert!(body_bytes(response).await.starts_with(PDF_MAGIC));
    cluster.stop().await;
}

#[tokio::test]
async fn missing_or_unknown_token_is_unauthorized() {
    let (app, cluster, _store) = test_app(Duration::from_secs(5)).await;

    let response = app
        .clone()
        .oneshot(get("/x?url=/dashboard", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");

    let response = app
        .oneshot(get("/x?url=/dashboard", None, Some("guess")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    cluster.stop().await;
}

#[tokio::test]
async fn unsupported_accept_is_not_acceptable() {
    let (app, cluster, _store) = test_app(Duration::from_secs(5)).await;

    let response = app
        .oneshot(get("/x?url=/dashboard", Some("text/html"), Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    assert_eq!(body_json(response).await["code"], "NOT_ACCEPTABLE");
    cluster.stop().await;
}

#[tokio::test]
async fn bad_parameters_are_rejected_before_queueing() {
    let (app, cluster, _store) = test_app(Duration::from_secs(5)).await;

    let response = app
        .clone()
        .oneshot(get("/x?url=/dashboard&size=huge", None, Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_RENDER_SPEC");

    let response = app
        .oneshot(get("/x", None, Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "BAD_REQUEST");

    let stats = cluster.stats().await.unwrap();
    assert_eq!(stats.queued + stats.in_flight, 0);
    cluster.stop().await;
}

#[tokio::test]
async fn slow_render_times_out() {
    let (app, cluster, store) = test_app(Duration::from_millis(100)).await;

    let response = app
        .oneshot(get("/x?url=/hang", None, Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(response).await["code"], "TIMED_OUT");
    assert!(store.is_empty());
    cluster.stop().await;
}

#[tokio::test]
async fn render_failures_map_to_bad_gateway() {
    let (app, cluster, _store) = test_app(Duration::from_secs(5)).await;

    let response = app
        .clone()
        .oneshot(get("/x?url=/broken", None, Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["code"], "OPEN_FAILED");

    let response = app
        .oneshot(get("/x?url=/dashboard&selector=%23missing", None, Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["code"], "CLIP_TARGET_NOT_FOUND");
    cluster.stop().await;
}

#[tokio::test]
async fn expired_artifact_is_a_server_error() {
    let opts = ClusterOptions {
        result_ttl: Duration::ZERO,
        ..options(1, 2)
    };
    let (app, cluster, _store) = app_with(opts, Duration::from_secs(5)).await;

    let response = app
        .oneshot(get("/x?url=/dashboard", None, Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["code"], "ARTIFACT_MISSING");
    cluster.stop().await;
}

#[tokio::test]
async fn stopped_cluster_is_unavailable() {
    let (app, cluster, _store) = test_app(Duration::from_secs(5)).await;
    cluster.stop().await;

    let response = app
        .clone()
        .oneshot(get("/x?url=/dashboard", None, Some(TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], "CLUSTER_STOPPED");

    let response = app.oneshot(get("/healthz", None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["status"], "stopped");
}

#[tokio::test]
async fn healthz_reports_workers() {
    let (app, cluster, _store) = test_app(Duration::from_secs(5)).await;

    let response = app.oneshot(get("/healthz", None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["ready_workers"], 1);
    assert_eq!(json["queued"], 0);
    assert_eq!(json["workers"][0]["health"], "ready");
    cluster.stop().await;
}
