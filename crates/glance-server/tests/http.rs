// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Route behaviour, exercised in-process through the router.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use glance_proto::{glbs, parse_event_stream, UpdateRecord, GLBS_MIME, GLB_MIME};
use glance_scene::mock::{CountingTessellator, MockShape, SummaryEncoder};
use glance_scene::{SceneObject, ShowOptions};
use glance_server::{router, AppState, Settings};
use tokio::time::timeout;
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    state: Arc<AppState>,
    tessellator: Arc<CountingTessellator>,
}

fn fixture_with(settings: &Settings) -> Fixture {
    let tessellator = Arc::new(CountingTessellator::new());
    let state = AppState::new(settings, tessellator.clone(), Arc::new(SummaryEncoder)).unwrap();
    Fixture {
        state: Arc::new(state),
        tessellator,
    }
}

fn fixture() -> Fixture {
    fixture_with(&Settings {
        build_workers: 2,
        ..Settings::default()
    })
}

impl Fixture {
    fn show(&self, name: &str, object: impl Into<SceneObject>) {
        self.state
            .registry()
            .show_one(name, object.into(), &ShowOptions::default().keep_others())
            .unwrap();
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn send(&self, request: Request<Body>) -> Response {
        timeout(WAIT, router(Arc::clone(&self.state)).oneshot(request))
            .await
            .expect("request hung")
            .unwrap()
    }
}

async fn body(response: Response) -> Bytes {
    timeout(WAIT, to_bytes(response.into_body(), usize::MAX))
        .await
        .expect("body hung")
        .unwrap()
}

fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> &'a str {
    response.headers()[name].to_str().unwrap()
}

#[tokio::test]
async fn object_download_carries_glb_headers() {
    let fx = fixture();
    fx.show("part", Bytes::from_static(b"glTF-part"));
    let hash = fx
        .state
        .registry()
        .latest("part")
        .unwrap()
        .content_hash
        .to_hex();

    let response = fx.get("/api/object/part").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_TYPE), GLB_MIME);
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), "9");
    assert_eq!(
        header_str(&response, header::CONTENT_DISPOSITION),
        "attachment; filename=\"part.glb\""
    );
    assert_eq!(header_str(&response, header::ETAG), format!("\"{hash}\""));
    assert_eq!(&body(response).await[..], b"glTF-part");
}

#[tokio::test]
async fn matching_etag_is_not_modified() {
    let fx = fixture();
    fx.show("part", Bytes::from_static(b"glTF"));
    let first = fx.get("/api/object/part").await;
    let etag = first.headers()[header::ETAG].clone();

    let revalidated = fx
        .send(
            Request::get("/api/object/part")
                .header(header::IF_NONE_MATCH, etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(revalidated.status(), StatusCode::NOT_MODIFIED);
    assert!(body(revalidated).await.is_empty());

    let stale = fx
        .send(
            Request::get("/api/object/part")
                .header(header::IF_NONE_MATCH, "\"0000\"")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(stale.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_and_removed_objects_are_404() {
    let fx = fixture();
    fx.show("gone", Bytes::from_static(b"glTF"));
    fx.state.registry().remove("gone");
    for uri in ["/api/object/gone", "/api/object/never"] {
        assert_eq!(fx.get(uri).await.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn build_failures_are_500_then_recover() {
    let fx = fixture();
    fx.tessellator.fail_next(1);
    fx.show("solid", SceneObject::Solid(Arc::new(MockShape::face("f"))));

    let failed = fx.get("/api/object/solid").await;
    assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let message = body(failed).await;
    assert!(!message.is_empty());

    let ok = fx.get("/api/object/solid").await;
    assert_eq!(ok.status(), StatusCode::OK);
    assert!(body(ok).await.starts_with(b"glTF"));
}

#[tokio::test]
async fn object_aliases_serve_the_same_bytes() {
    let fx = fixture();
    fx.show("a b", Bytes::from_static(b"glTF-ab"));
    for uri in ["/api/object/a%20b", "/object/a%20b", "/?api_object=a%20b"] {
        let response = fx.get(uri).await;
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        assert_eq!(&body(response).await[..], b"glTF-ab", "{uri}");
    }
}

#[tokio::test]
async fn update_feed_replays_scene_and_ends_after_sentinel() {
    let fx = fixture();
    fx.show("a", Bytes::from_static(b"A"));
    fx.show("b", Bytes::from_static(b"B"));
    fx.state.registry().remove("a");
    fx.state.begin_shutdown();

    let response = fx.get("/api/updates").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(header_str(&response, header::CONTENT_TYPE).starts_with("text/event-stream"));
    let text = String::from_utf8(body(response).await.to_vec()).unwrap();
    assert!(text.contains("retry: 100") || text.contains("retry:100"), "{text}");

    let records = parse_event_stream(&text).unwrap();
    let summary: Vec<(&str, Option<bool>)> = records
        .iter()
        .map(|r| (r.name.as_str(), r.is_remove))
        .collect();
    assert_eq!(
        summary,
        vec![("b", Some(false)), ("a", Some(true)), ("__shutdown", None)]
    );
    let b_hash = fx.state.registry().latest("b").unwrap().content_hash.to_hex();
    assert_eq!(records[0], UpdateRecord::shown("b", b_hash));
    assert!(records[2].is_shutdown());
    assert_eq!(fx.state.drain().readers(), 0);
}

#[tokio::test]
async fn update_feed_aliases_are_served() {
    for uri in ["/updates", "/?api_updates"] {
        let fx = fixture();
        fx.state.begin_shutdown();
        let response = fx.get(uri).await;
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        let text = String::from_utf8(body(response).await.to_vec()).unwrap();
        let records = parse_event_stream(&text).unwrap();
        assert!(records.last().unwrap().is_shutdown(), "{uri}");
    }
}

#[tokio::test]
async fn update_feed_is_refused_once_shutting_down_with_a_viewer_seen() {
    let fx = fixture();
    fx.state.begin_shutdown();
    let first = fx.get("/api/updates").await;
    assert_eq!(first.status(), StatusCode::OK);
    body(first).await;
    assert!(fx.state.client_seen());

    let second = fx.get("/api/updates").await;
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn live_events_reach_an_attached_viewer() {
    let fx = fixture();
    let response = fx.get("/api/updates").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(fx.state.client_seen());
    assert_eq!(fx.state.drain().readers(), 1);

    fx.show("late", Bytes::from_static(b"L"));
    fx.state.begin_shutdown();
    let text = String::from_utf8(body(response).await.to_vec()).unwrap();
    let names: Vec<String> = parse_event_stream(&text)
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["late", "__shutdown"]);
    assert_eq!(fx.state.drain().readers(), 0);
}

#[tokio::test]
async fn idle_update_feed_sends_keep_alive_comments() {
    let fx = fixture_with(&Settings {
        build_workers: 1,
        keep_alive_secs: 0.05,
        ..Settings::default()
    });
    let response = fx.get("/api/updates").await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut frames = response.into_body().into_data_stream();
    let mut text = String::new();
    while text.matches(":\n\n").count() < 2 {
        let frame = timeout(WAIT, frames.next())
            .await
            .expect("no keep-alive before timeout")
            .expect("feed ended early")
            .unwrap();
        text.push_str(&String::from_utf8_lossy(&frame));
    }
    assert!(text.starts_with("retry"), "{text}");
    assert!(parse_event_stream(&text).unwrap().is_empty(), "{text}");
}

#[tokio::test]
async fn dropping_the_update_feed_releases_its_subscription() {
    let fx = fixture();
    let response = fx.get("/api/updates").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(fx.state.drain().readers(), 1);
    assert_eq!(fx.state.registry().subscriber_count(), 1);

    drop(response);
    assert_eq!(fx.state.drain().readers(), 0);
    assert_eq!(fx.state.registry().subscriber_count(), 0);
}

#[tokio::test]
async fn scene_export_is_a_glbs_stream_in_name_order() {
    let fx = fixture();
    fx.show("b", Bytes::from_static(b"BB"));
    fx.show("a", Bytes::from_static(b"A"));
    fx.show("c", SceneObject::Solid(Arc::new(MockShape::face("f"))));

    for uri in ["/api/export", "/export"] {
        let response = fx.get(uri).await;
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        assert_eq!(header_str(&response, header::CONTENT_TYPE), GLBS_MIME);
        assert_eq!(
            header_str(&response, header::CONTENT_DISPOSITION),
            "attachment; filename=\"scene.glbs\""
        );
        let blobs = glbs::decode(&body(response).await).unwrap();
        assert_eq!(blobs.len(), 3);
        assert_eq!(&blobs[0][..], b"A");
        assert_eq!(&blobs[1][..], b"BB");
        assert!(blobs[2].starts_with(b"glTF"));
    }
    assert_eq!(fx.tessellator.calls(), 1);
}

#[tokio::test]
async fn cors_allows_any_origin() {
    let fx = fixture();
    fx.show("a", Bytes::from_static(b"A"));
    let response = fx
        .send(
            Request::get("/api/object/a")
                .header(header::ORIGIN, "http://viewer.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(
        header_str(&response, header::ACCESS_CONTROL_ALLOW_ORIGIN),
        "*"
    );
}

#[tokio::test]
async fn frontend_directory_is_served_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<html>viewer</html>").unwrap();
    std::fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();
    let fx = fixture_with(&Settings {
        build_workers: 1,
        frontend_dir: Some(dir.path().to_path_buf()),
        ..Settings::default()
    });

    let index = fx.get("/").await;
    assert_eq!(index.status(), StatusCode::OK);
    assert_eq!(&body(index).await[..], b"<html>viewer</html>");
    let script = fx.get("/app.js").await;
    assert_eq!(script.status(), StatusCode::OK);
    assert_eq!(&body(script).await[..], b"console.log(1)");
    assert_eq!(fx.get("/missing.css").await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn root_without_frontend_is_404() {
    let fx = fixture();
    assert_eq!(fx.get("/").await.status(), StatusCode::NOT_FOUND);
}
