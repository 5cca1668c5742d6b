// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! HTTP routes.
//!
//! | Path                                  | Response                         |
//! |---------------------------------------|----------------------------------|
//! | `/api/updates`, `/updates`, `/?api_updates` | update feed (server-sent events) |
//! | `/api/object/{name}`, `/object/{name}`, `/?api_object=name` | one GLB |
//! | `/api/export`, `/export`              | whole scene as GLBS              |
//! | anything else                         | static frontend, if configured   |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, StreamExt};
use glance_proto::{EXPORT_PATH, GLBS_MIME, GLB_MIME, SSE_RETRY_MILLIS, UPDATES_PATH};
use glance_scene::{Artifact, ExportError};
use tower::ServiceExt as _;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, warn};

use crate::state::AppState;

/// Router over `state`, with permissive CORS and the optional frontend.
pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/", get(root))
        .route(UPDATES_PATH, get(updates))
        .route("/updates", get(updates))
        .route("/api/object/{name}", get(object))
        .route("/object/{name}", get(object))
        .route(EXPORT_PATH, get(export_scene))
        .route("/export", get(export_scene));
    if let Some(dir) = state.frontend_dir() {
        app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
    }
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    app.layer(cors).with_state(state)
}

async fn root(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request: Request,
) -> Response {
    if query.contains_key("api_updates") {
        return updates_response(&state).await;
    }
    if let Some(name) = query.get("api_object") {
        return object_response(&state, name, &headers).await;
    }
    match state.frontend_dir() {
        Some(dir) => match ServeFile::new(dir.join("index.html")).oneshot(request).await {
            Ok(response) => response.into_response(),
            Err(never) => match never {},
        },
        None => (
            StatusCode::NOT_FOUND,
            "no frontend configured; the API lives under /api",
        )
            .into_response(),
    }
}

async fn updates(State(state): State<Arc<AppState>>) -> Response {
    updates_response(&state).await
}

async fn updates_response(state: &AppState) -> Response {
    if state.is_shutting_down() && state.client_seen() {
        warn!("rejecting update feed request: server is shutting down");
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    state.mark_client_seen();
    let guard = state.drain().read().await;
    let subscription = state.registry().subscribe(true, true);
    debug!("viewer attached to update feed");

    let retry = stream::once(async {
        Ok::<_, axum::Error>(Event::default().retry(Duration::from_millis(SSE_RETRY_MILLIS)))
    });
    let events = stream::unfold(Some((subscription, guard)), |held| async move {
        let (mut subscription, guard) = held?;
        let event = subscription.recv().await?;
        let frame = Event::default().json_data(event.to_record());
        if event.is_shutdown() {
            debug!("update feed finished after shutdown sentinel");
            drop(guard);
            return Some((frame, None));
        }
        Some((frame, Some((subscription, guard))))
    });
    Sse::new(retry.chain(events))
        .keep_alive(KeepAlive::new().interval(state.keep_alive()))
        .into_response()
}

async fn object(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    object_response(&state, &name, &headers).await
}

async fn object_response(state: &AppState, name: &str, headers: &HeaderMap) -> Response {
    let _guard = state.drain().read().await;
    match state.cache().export(name).await {
        Ok(artifact) => glb_response(name, &artifact, headers),
        Err(err) => export_error(&err),
    }
}

fn glb_response(name: &str, artifact: &Artifact, headers: &HeaderMap) -> Response {
    let hash = artifact.hash.to_hex();
    let etag = format!("\"{hash}\"");
    let built = if etag_matches(headers, &hash) {
        Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, etag)
            .body(Body::empty())
    } else {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, GLB_MIME)
            .header(header::CONTENT_LENGTH, artifact.bytes.len())
            .header(
                header::CONTENT_DISPOSITION,
                attachment(&format!("{name}.glb")),
            )
            .header(header::ETAG, etag)
            .body(Body::from(artifact.bytes.clone()))
    };
    built.unwrap_or_else(|err| internal_error(&err))
}

async fn export_scene(State(state): State<Arc<AppState>>) -> Response {
    let guard = state.drain().read().await;
    let chunks = state
        .cache()
        .export_glbs(|_, _| true)
        .map(move |chunk| {
            let _held = &guard;
            chunk
        });
    Response::builder()
        .header(header::CONTENT_TYPE, GLBS_MIME)
        .header(header::CONTENT_DISPOSITION, attachment("scene.glbs"))
        .body(Body::from_stream(chunks))
        .unwrap_or_else(|err| internal_error(&err))
}

/// `If-None-Match` lists `hash` (weak or strong) or `*`.
fn etag_matches(headers: &HeaderMap, hash: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|tag| tag.trim().trim_start_matches("W/").trim_matches('"'))
        .any(|tag| tag == hash || tag == "*")
}

fn attachment(filename: &str) -> HeaderValue {
    let safe: String = filename
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn export_error(err: &ExportError) -> Response {
    match err {
        ExportError::NotFound { name } => {
            debug!(name = %name, "export requested for unknown object");
            (StatusCode::NOT_FOUND, err.to_string()).into_response()
        }
        other => {
            warn!(error = %other, "export failed");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

fn internal_error(err: &dyn std::error::Error) -> Response {
    warn!(error = %err, "failed to build response");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}
