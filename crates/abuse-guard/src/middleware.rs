//! axum integration.
//!
//! Install with `axum::middleware::from_fn_with_state`:
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use abuse_guard::{AbuseDetector, GuardConfig, abuse_guard_middleware};
//! use axum::{Router, middleware, routing::get};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let detector = Arc::new(AbuseDetector::new(GuardConfig::default())?);
//! let app = Router::new()
//!     .route("/", get(|| async { "ok" }))
//!     .layer(middleware::from_fn_with_state(detector, abuse_guard_middleware));
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::detector::{AbuseDetector, RequestInfo, UNKNOWN_CLIENT};

/// Machine-readable code carried by the rejection body.
pub const DDOS_DETECTED: &str = "DDOS_DETECTED";

/// Human-readable message carried by the rejection body.
pub const BLOCKED_MESSAGE: &str = "Too many requests. You have been temporarily blocked.";

/// JSON body of the rejection response.
#[derive(Debug, Clone, Serialize)]
struct BlockedBody {
    status: &'static str,
    code: &'static str,
    message: &'static str,
}

/// 429 response written for blocked clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockedResponse;

impl IntoResponse for BlockedResponse {
    fn into_response(self) -> Response {
        let body = BlockedBody {
            status: "error",
            code: DDOS_DETECTED,
            message: BLOCKED_MESSAGE,
        };

        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"status":"error","code":"DDOS_DETECTED","message":"Too many requests. You have been temporarily blocked."}"#
                .to_string()
        });

        (
            StatusCode::TOO_MANY_REQUESTS,
            [("content-type", "application/json")],
            json,
        )
            .into_response()
    }
}

/// Client identifier for a request: the peer IP, or [`UNKNOWN_CLIENT`].
#[must_use]
pub fn client_identifier(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(
            || UNKNOWN_CLIENT.to_string(),
            |ConnectInfo(addr)| addr.ip().to_string(),
        )
}

/// Middleware classifying every request before it reaches the next stage.
///
/// Blocked clients get [`BlockedResponse`]; everyone else passes through
/// untouched.
pub async fn abuse_guard_middleware(
    State(detector): State<Arc<AbuseDetector>>,
    request: Request,
    next: Next,
) -> Response {
    let info = RequestInfo::new(
        client_identifier(&request),
        request.uri().path(),
        request.method().as_str(),
    );

    if detector.evaluate(&info).await.proceeds() {
        next.run(request).await
    } else {
        BlockedResponse.into_response()
    }
}
