//! Prometheus metrics: HTTP middleware, redemption counters and the
//! `/metrics` endpoint.

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{header, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use domain::models::{PerServerResult, SubmissionResult};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Records `http_requests_total{method,path,status}` and
/// `http_request_duration_seconds{method,path}`.
///
/// The matched route template is used as `path` so invitation codes never
/// end up in label values.
pub async fn metrics_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = method_to_str(req.method());
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    counter!(
        "http_requests_total",
        "method" => method,
        "path" => path.clone(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "http_request_duration_seconds",
        "method" => method,
        "path" => path
    )
    .record(start.elapsed().as_secs_f64());

    response
}

fn method_to_str(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        Method::PATCH => "PATCH",
        Method::HEAD => "HEAD",
        Method::OPTIONS => "OPTIONS",
        _ => "OTHER",
    }
}

/// Count a finished redemption and each server it touched.
pub fn record_submission(result: &SubmissionResult) {
    counter!("redemptions_total", "status" => result.status.as_str()).increment(1);
    for server in result.successful.iter().chain(&result.failed) {
        record_server_provisioning(server);
    }
}

fn record_server_provisioning(result: &PerServerResult) {
    let server_type = result.server_type.map(|t| t.as_str()).unwrap_or("unknown");
    let outcome = if result.success { "success" } else { "failure" };
    counter!(
        "server_provisioning_total",
        "server_type" => server_type,
        "outcome" => outcome
    )
    .increment(1);
}

/// Handler for `/metrics` in Prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Install the global Prometheus recorder. Calling it again is a no-op.
pub fn init_metrics() -> Result<(), BuildError> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets(&[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])?
        .install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::models::{RedemptionStatus, RedirectHint, ServerType};
    use uuid::Uuid;

    #[test]
    fn test_method_to_str() {
        assert_eq!(method_to_str(&Method::GET), "GET");
        assert_eq!(method_to_str(&Method::POST), "POST");
        assert_eq!(method_to_str(&Method::TRACE), "OTHER");
    }

    #[test]
    fn test_record_submission_without_recorder() {
        let result = SubmissionResult {
            status: RedemptionStatus::PartialSuccess,
            successful: vec![PerServerResult {
                server_id: Uuid::new_v4(),
                server_name: "JF".to_string(),
                server_type: Some(ServerType::Jellyfin),
                success: true,
                message: "Account created".to_string(),
            }],
            failed: vec![PerServerResult {
                server_id: Uuid::new_v4(),
                server_name: "Emby".to_string(),
                server_type: None,
                success: false,
                message: "down".to_string(),
            }],
            redirect_hint: RedirectHint::Completed,
            message: None,
        };
        record_submission(&result);
    }
}
