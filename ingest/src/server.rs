use crate::intake::{Intake, IntakeOutcome};
use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{header, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, warn};

/// largest accepted result document
pub const BODY_LIMIT: usize = 10_000_000;

pub fn router(intake: Arc<Intake>) -> Router {
    Router::new()
        .route("/put", post(put))
        .route("/config.json", get(config))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(intake)
}

fn failure(status: StatusCode, message: impl ToString) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

/// first `X-Forwarded-For` hop, else the peer
fn remote_addr(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.to_string())
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

async fn put(
    State(intake): State<Arc<Intake>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    if !is_json(request.headers()) {
        return failure(StatusCode::BAD_REQUEST, "wrong Content-Type");
    }
    let addr = remote_addr(request.headers(), peer);

    let raw = match to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(raw) => raw,
        Err(error) => {
            warn!(error = ?error, addr = %addr, "Could not read result body: {error}");
            return failure(StatusCode::PAYLOAD_TOO_LARGE, error);
        }
    };

    let accepted = {
        let addr = addr.clone();
        tokio::task::spawn_blocking(move || intake.accept(&raw, &addr)).await
    };

    match accepted {
        Ok(Ok(IntakeOutcome::Stored(_))) => (StatusCode::OK, Json("ok")).into_response(),
        Ok(Ok(IntakeOutcome::Duplicate)) => {
            (StatusCode::OK, Json("already received")).into_response()
        }
        Ok(Err(error)) if error.is_bad_request() => {
            warn!(error = ?error, addr = %addr, "Rejected result: {error}");
            failure(StatusCode::BAD_REQUEST, error)
        }
        Ok(Err(error)) => {
            error!(error = ?error, addr = %addr, "Could not store result: {error}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, error)
        }
        Err(error) => {
            error!(error = ?error, "Result intake task failed: {error}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn config(State(intake): State<Arc<Intake>>) -> Response {
    match intake.merged_catalog() {
        Ok(catalog) => Json(catalog).into_response(),
        Err(error) => {
            error!(error = ?error, "Could not build catalog: {error}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, error)
        }
    }
}
