//! API endpoint handlers for the service.
//!
//! Three write endpoints (`/build`, `/deploy-core`, `/deploy-plugin`) and one
//! read endpoint (`/supported-platforms`), all behind Basic auth. Failures
//! carry the build log verbatim when one exists; status selection follows
//! the failure category.

use std::sync::Arc;

use axum::{
    Router,
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use forge::Kind;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::error;

pub mod build;
pub mod deploy;
pub mod platforms;

/// Request bodies above this size are rejected outright.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Query strings above this size are rejected before routing.
const MAX_QUERY_SIZE: usize = 100 * 1024;

/// Shared immutable service state.
pub struct App {
    pub settings: Arc<forge::Settings>,
    pub credentials: Option<crate::auth::Credentials>,
    pub signer: Option<forge::sign::Signer>,
}

pub type State = Arc<App>;

pub fn router(state: State) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/build", post(build::handle))
        .route("/deploy-core", post(deploy::core))
        .route("/deploy-plugin", post(deploy::plugin))
        .route("/supported-platforms", get(platforms::handle))
        .layer(middleware::from_fn(reject_oversized_query))
        .layer(middleware)
        .with_state(state)
}

async fn reject_oversized_query(request: Request, next: Next) -> Response {
    let length = request.uri().query().map_or(0, str::len);
    if length > MAX_QUERY_SIZE {
        return (StatusCode::URI_TOO_LONG, "query string too large").into_response();
    }
    next.run(request).await
}

/// The error document returned for failed requests.
#[derive(Debug, Serialize)]
struct FailureBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<String>,
}

/// Adapter mapping categorized pipeline failures onto HTTP responses.
#[derive(Debug)]
pub struct Failure(pub forge::Error);

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let error = self.0;
        let status = match error.kind() {
            Kind::Validation | Kind::Verification | Kind::Build => StatusCode::BAD_REQUEST,
            Kind::Auth => StatusCode::UNAUTHORIZED,
            Kind::Provisioning | Kind::Integrity | Kind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error!(kind = %error.kind(), message = %error.message(), "request failed");
        let body = FailureBody {
            message: error.message(),
            log: error.log().map(ToString::to_string),
        };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum_test::TestServer;

    use super::*;
    use crate::auth::Credentials;

    fn test_state(credentials: Option<Credentials>) -> State {
        let settings = forge::Settings::builder()
            .master_root("/tmp/foreman-test-master")
            .core_package("example.com/core")
            .core_prefix("core")
            .entry_package("example.com/core/entry")
            .entry_source("entry/run.go")
            .stamp_import("example.com/core/entry")
            .build();
        Arc::new(App {
            settings: Arc::new(settings),
            credentials,
            signer: None,
        })
    }

    #[tokio::test]
    async fn health_needs_no_credentials() {
        let server = TestServer::new(router(test_state(None))).unwrap();
        let response = server.get("/health").await;
        response.assert_status_ok();
        response.assert_text("ok");
    }

    #[tokio::test]
    async fn authenticated_routes_reject_missing_credentials() {
        let credentials = Credentials::new("builder", "hunter2");
        let server = TestServer::new(router(test_state(Some(credentials)))).unwrap();

        let response = server.get("/supported-platforms").await;
        response.assert_status(StatusCode::UNAUTHORIZED);

        let response = server
            .post("/deploy-core")
            .json(&serde_json::json!({"core_version": "master"}))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unconfigured_credentials_deny_everything() {
        let server = TestServer::new(router(test_state(None))).unwrap();
        let response = server
            .get("/supported-platforms")
            .add_header(
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderValue::from_static("Basic YnVpbGRlcjpodW50ZXIy"),
            )
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn oversized_query_strings_are_rejected() {
        let server = TestServer::new(router(test_state(None))).unwrap();
        let query = "q".repeat(MAX_QUERY_SIZE + 1);
        let response = server.get(&format!("/health?{query}")).await;
        response.assert_status(StatusCode::URI_TOO_LONG);
    }

    #[tokio::test]
    async fn failures_render_message_and_log() {
        let log = forge::log::BuildLog::new();
        log.line("go test: FAIL example.com/plugin");
        let error = forge::Error::logged(
            Kind::Verification,
            color_eyre::eyre::eyre!("tests failed"),
            &log,
        );

        let response = Failure(error).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message"], "tests failed");
        assert!(body["log"].as_str().unwrap().contains("FAIL example.com/plugin"));
    }
}
