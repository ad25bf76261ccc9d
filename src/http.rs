//! HTTP facade
//!
//! `GET /{name}?url=&selector=&size=` renders a page of the service origin and
//! answers with the artifact as an attachment. `GET /healthz` reports the
//! cluster state.

use axum::extract::{Path, Query, State};
use axum::http::header::{ACCEPT, CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use url::Url;

use crate::auth::{bearer_token, Authenticator};
use crate::cluster::Cluster;
use crate::job::{JobState, RenderJob};
use crate::target::{parse_target, OutputFormat};
use crate::{Error, FailureReason};

/// Longest attachment base name we emit
const MAX_FILENAME_LEN: usize = 128;

/// Shared state of every request
#[derive(Clone)]
pub struct AppState {
    pub cluster: Cluster,
    pub auth: Arc<dyn Authenticator>,
    /// Scheme, host and port every rendered URL is forced onto
    pub origin: Url,
    pub render_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/{name}", get(snapshot))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Errors produced while serving a request
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] Error),

    #[error("Authentication required")]
    Unauthorized,

    #[error("None of the acceptable content types can be produced")]
    NotAcceptable,

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::NotAcceptable => (StatusCode::NOT_ACCEPTABLE, "NOT_ACCEPTABLE"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Core(core) => match core {
                Error::InvalidRenderSpec(_) => (StatusCode::BAD_REQUEST, "INVALID_RENDER_SPEC"),
                Error::TimedOut(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMED_OUT"),
                Error::Rejected(_) => (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_FULL"),
                Error::ClusterStopped => (StatusCode::SERVICE_UNAVAILABLE, "CLUSTER_STOPPED"),
                Error::Job(failure) => match failure.reason {
                    FailureReason::OpenFailed => (StatusCode::BAD_GATEWAY, "OPEN_FAILED"),
                    FailureReason::ClipTargetNotFound => {
                        (StatusCode::BAD_GATEWAY, "CLIP_TARGET_NOT_FOUND")
                    }
                    FailureReason::RenderFailed => (StatusCode::BAD_GATEWAY, "RENDER_FAILED"),
                    FailureReason::WorkerLost => (StatusCode::BAD_GATEWAY, "WORKER_LOST"),
                    FailureReason::PublishFailed => (StatusCode::BAD_GATEWAY, "PUBLISH_FAILED"),
                    FailureReason::ClusterStopped => {
                        (StatusCode::SERVICE_UNAVAILABLE, "CLUSTER_STOPPED")
                    }
                },
                Error::ArtifactMissing(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "ARTIFACT_MISSING")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self);
            "An internal error occurred".to_string()
        } else {
            if status.is_server_error() {
                warn!("Request failed: {}", self);
            }
            self.to_string()
        };

        let body = json!({
            "error": message,
            "code": code,
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    pub url: Option<String>,
    pub selector: Option<String>,
    pub size: Option<String>,
}

async fn snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<SnapshotQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers).ok_or(ApiError::Unauthorized)?;
    let identity = state
        .auth
        .authenticate(token)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    let accept = headers.get(ACCEPT).and_then(|v| v.to_str().ok());
    let format = negotiate(accept).ok_or(ApiError::NotAcceptable)?;
    let target = parse_target(query.size.as_deref(), format.kind())?;

    let raw_url = query
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing `url` parameter".into()))?;
    let url = restrict_to_origin(&state.origin, raw_url)?;
    let selector = query
        .selector
        .map(|s| s.trim().trim_start_matches('#').to_string())
        .filter(|s| !s.is_empty());

    let job = RenderJob::new(url.as_str(), format, target, selector, identity.token.as_str())
        .with_caller(identity.name.as_str());
    let handle = state.cluster.submit(job).await?;
    let key = handle.result_key();

    match handle.wait(state.render_timeout).await {
        JobState::Completed => {}
        JobState::TimedOut => return Err(Error::TimedOut(state.render_timeout).into()),
        JobState::Failed(failure) => return Err(Error::Job(failure).into()),
        other => {
            return Err(Error::RenderError(format!("job settled in non-terminal state {}", other)).into())
        }
    }

    let bytes = state
        .cluster
        .store()
        .take(&key)
        .await?
        .ok_or_else(|| Error::ArtifactMissing(key.clone()))?;

    let filename = format!("{}.{}", attachment_name(&name), format.extension());
    info!("Serving {} ({} bytes) to {}", filename, bytes.len(), identity.name);
    let headers = [
        (CONTENT_TYPE, format.content_type().to_string()),
        (
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        ),
    ];
    Ok((headers, bytes).into_response())
}

async fn healthz(State(state): State<AppState>) -> Response {
    match state.cluster.stats().await {
        Ok(stats) => {
            let status = if stats.stopped {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            let body = json!({
                "status": if stats.stopped { "stopped" } else { "ok" },
                "ready_workers": stats.ready_workers(),
                "queued": stats.queued,
                "in_flight": stats.in_flight,
                "workers": stats.workers,
            });
            (status, Json(body)).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Pick the output format from an `Accept` header. A missing header means
/// PNG; ties between equally acceptable formats go to the server's order.
pub fn negotiate(accept: Option<&str>) -> Option<OutputFormat> {
    let accept = match accept.map(str::trim).filter(|a| !a.is_empty()) {
        Some(accept) => accept,
        None => return Some(OutputFormat::Png),
    };

    let ranges: Vec<(&str, f32)> = accept.split(',').filter_map(media_range).collect();
    let mut best: Option<(OutputFormat, f32)> = None;
    for format in OutputFormat::ALL {
        let quality = quality_of(format.content_type(), &ranges);
        if quality > 0.0 && best.map_or(true, |(_, q)| quality > q) {
            best = Some((format, quality));
        }
    }
    best.map(|(format, _)| format)
}

fn media_range(item: &str) -> Option<(&str, f32)> {
    let mut parts = item.split(';').map(str::trim);
    let range = parts.next().filter(|r| !r.is_empty())?;
    let mut quality = 1.0;
    for param in parts {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("q") {
                quality = value.trim().parse::<f32>().unwrap_or(0.0).clamp(0.0, 1.0);
            }
        }
    }
    Some((range, quality))
}

/// Quality of a content type under the most specific matching range
fn quality_of(content_type: &str, ranges: &[(&str, f32)]) -> f32 {
    let main_type = content_type.split('/').next().unwrap_or_default();
    let mut best: Option<(u8, f32)> = None;
    for &(range, quality) in ranges {
        let specificity = if range.eq_ignore_ascii_case(content_type) {
            2
        } else if range
            .strip_suffix("/*")
            .is_some_and(|t| t.eq_ignore_ascii_case(main_type))
        {
            1
        } else if range == "*/*" {
            0
        } else {
            continue;
        };
        if best.map_or(true, |(s, _)| specificity > s) {
            best = Some((specificity, quality));
        }
    }
    best.map_or(0.0, |(_, q)| q)
}

/// Rebuild the caller's URL on the service origin: only its path, query and
/// fragment survive.
pub fn restrict_to_origin(origin: &Url, raw: &str) -> Result<Url, ApiError> {
    let parsed = origin
        .join(raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid `url` parameter: {}", e)))?;
    let mut url = origin.clone();
    url.set_path(parsed.path());
    url.set_query(parsed.query());
    url.set_fragment(parsed.fragment());
    Ok(url)
}

/// Attachment base name limited to a header-safe character set
pub fn attachment_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .take(MAX_FILENAME_LEN)
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "snapshot".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_defaults_to_png() {
        assert_eq!(negotiate(None), Some(OutputFormat::Png));
        assert_eq!(negotiate(Some("")), Some(OutputFormat::Png));
        assert_eq!(negotiate(Some("*/*")), Some(OutputFormat::Png));
        assert_eq!(negotiate(Some("image/*")), Some(OutputFormat::Png));
    }

    #[test]
    fn negotiation_honours_quality() {
        assert_eq!(negotiate(Some("application/pdf")), Some(OutputFormat::Pdf));
        assert_eq!(
            negotiate(Some("image/png;q=0.5, application/pdf")),
            Some(OutputFormat::Pdf)
        );
        assert_eq!(
            negotiate(Some("image/*;q=0.9, image/gif")),
            Some(OutputFormat::Gif)
        );
        assert_eq!(negotiate(Some("image/*, image/png;q=0")), Some(OutputFormat::Jpeg));
        assert_eq!(negotiate(Some("IMAGE/JPEG")), Some(OutputFormat::Jpeg));
    }

    #[test]
    fn negotiation_fails_without_acceptable_type() {
        assert_eq!(negotiate(Some("text/html")), None);
        assert_eq!(negotiate(Some("application/json, text/*")), None);
        assert_eq!(negotiate(Some("*/*;q=0")), None);
    }

    #[test]
    fn urls_are_forced_onto_the_origin() {
        let origin = Url::parse("https://app.example.com:8443").unwrap();

        let url = restrict_to_origin(&origin, "/dashboards/7?tab=2").unwrap();
        assert_eq!(url.as_str(), "https://app.example.com:8443/dashboards/7?tab=2");

        let url = restrict_to_origin(&origin, "http://evil.example.net/steal?x=1").unwrap();
        assert_eq!(url.as_str(), "https://app.example.com:8443/steal?x=1");

        let url = restrict_to_origin(&origin, "//evil.example.net/p").unwrap();
        assert_eq!(url.host_str(), Some("app.example.com"));
        assert_eq!(url.path(), "/p");
    }

    #[test]
    fn attachment_names_are_sanitized() {
        assert_eq!(attachment_name("q3-report"), "q3-report");
        assert_eq!(attachment_name("a b\"c"), "a_b_c");
        assert_eq!(attachment_name(".."), "snapshot");
        assert_eq!(attachment_name(&"x".repeat(300)).len(), MAX_FILENAME_LEN);
    }

    #[test]
    fn error_statuses() {
        let status = |e: ApiError| e.into_response().status();
        assert_eq!(status(ApiError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(status(ApiError::NotAcceptable), StatusCode::NOT_ACCEPTABLE);
        assert_eq!(
            status(Error::InvalidRenderSpec("x".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(Error::TimedOut(Duration::from_secs(1)).into()),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status(Error::Rejected(3).into()), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(Error::ArtifactMissing("snapshot:x.png".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let failure = crate::JobFailure::new(FailureReason::OpenFailed, "500");
        assert_eq!(status(Error::Job(failure).into()), StatusCode::BAD_GATEWAY);
    }
}
