//! HTTP route handlers.
//!
//! All handlers are thin — they delegate to the supervisor and translate
//! its errors into status codes:
//!
//! | error | status |
//! |-------|--------|
//! | unparseable request body | 400 |
//! | `ConfigInvalid` | 400 |
//! | `AlreadyRunning` | 409 |
//! | `ResolveFailed`, `MediaOpenFailed` | 502 |
//! | anything else | 500 |

use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use livecap_core::{LivecapError, SessionOverrides, StartRequest};

use crate::state::AppState;
use crate::ws::ws_handler;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/live_audio/start", post(live_audio_start))
        .route("/api/live_audio/stop", post(live_audio_stop))
        .route("/api/live_audio/status", get(live_audio_status))
        .route("/api/live_audio/ws", get(ws_handler))
        .route("/api/douyin/web/start", post(douyin_start))
        .route("/api/douyin/web/stop", post(douyin_stop))
        .route("/api/douyin/web/status", get(douyin_status))
        .route("/api/douyin/web/stream", get(douyin_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct StartBody {
    live_url: String,
    #[serde(flatten)]
    overrides: SessionOverrides,
}

#[derive(Debug, Deserialize)]
struct DouyinStartBody {
    live_id: String,
}

fn api_ok() -> Json<serde_json::Value> {
    Json(json!({ "success": true }))
}

fn api_data(data: impl serde::Serialize) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": data }))
}

fn api_error(err: &LivecapError) -> Response {
    let status = match err {
        LivecapError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
        LivecapError::AlreadyRunning => StatusCode::CONFLICT,
        LivecapError::ResolveFailed(_) | LivecapError::MediaOpenFailed(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "success": false, "error": err.to_string() }))).into_response()
}

/// A body the extractor could not parse (missing field, wrong type, bad
/// JSON) is an invalid request, not an unprocessable entity.
fn bad_request(rejection: JsonRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": rejection.body_text() })),
    )
        .into_response()
}

async fn live_audio_start(
    State(state): State<AppState>,
    body: Result<Json<StartBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection),
    };
    let request = StartRequest {
        room_ref: body.live_url,
        overrides: body.overrides,
    };
    match state.supervisor.start(request).await {
        Ok(info) => api_data(info).into_response(),
        Err(e) => api_error(&e),
    }
}

async fn live_audio_stop(State(state): State<AppState>) -> Response {
    match state.supervisor.stop().await {
        Ok(()) => api_ok().into_response(),
        Err(e) => api_error(&e),
    }
}

async fn live_audio_status(State(state): State<AppState>) -> Response {
    api_data(state.supervisor.status()).into_response()
}

async fn douyin_start(
    State(state): State<AppState>,
    body: Result<Json<DouyinStartBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection),
    };
    match state.supervisor.start_chat(&body.live_id).await {
        Ok(_) => api_ok().into_response(),
        Err(e) => api_error(&e),
    }
}

async fn douyin_stop(State(state): State<AppState>) -> Response {
    state.supervisor.stop_chat().await;
    api_ok().into_response()
}

async fn douyin_status(State(state): State<AppState>) -> Response {
    Json(state.supervisor.chat_status()).into_response()
}

/// SSE stream of normalized chat events, one JSON object per event.
async fn douyin_stream(State(state): State<AppState>) -> Response {
    let subscription = match state.supervisor.subscribe_chat() {
        Ok(sub) => sub,
        Err(e) => return api_error(&e),
    };
    let stream = futures_util::stream::unfold(subscription, |mut sub| async move {
        let event = sub.recv().await?;
        let data = serde_json::to_string(&event).ok()?;
        Some((Ok::<_, Infallible>(Event::default().data(data)), sub))
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
