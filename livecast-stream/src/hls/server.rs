// HLS HTTP delivery
//
// Stateless handlers over shared read-only state:
// - GET /stream.m3u8            master playlist
// - GET /stream_{bitrate}.m3u8  media playlist (bitrate only selects the URI)
// - GET /segment_{id}.ts        segment bytes, 404 unless the store lists the id
// - GET /stats                  JSON counters
// - GET /player                 HTML player page

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use handlebars::Handlebars;
use livecast_core::StreamConfig;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::{playlist::PlaylistGenerator, store::SegmentStore};
use crate::stats::Stats;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
const CORS_MAX_AGE: Duration = Duration::from_secs(86400);
const PLAYER_TEMPLATE: &str = include_str!("player.html");

/// Renders the player page
pub struct PlayerPage {
    handlebars: Handlebars<'static>,
}

impl PlayerPage {
    pub fn new() -> Result<Self, handlebars::TemplateError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars.register_template_string("player", PLAYER_TEMPLATE)?;
        Ok(Self { handlebars })
    }

    pub fn render(&self, stream_url: &str, server_url: &str) -> Result<String, handlebars::RenderError> {
        self.handlebars.render(
            "player",
            &json!({
                "stream_url": stream_url,
                "server_url": server_url,
            }),
        )
    }
}

/// Shared state of every handler
#[derive(Clone)]
pub struct HlsState {
    store: Arc<SegmentStore>,
    playlists: Arc<PlaylistGenerator>,
    stats: Arc<Stats>,
    player: Arc<PlayerPage>,
}

impl HlsState {
    pub fn new(
        config: &StreamConfig,
        store: Arc<SegmentStore>,
        stats: Arc<Stats>,
    ) -> Result<Self, handlebars::TemplateError> {
        Ok(Self {
            store,
            playlists: Arc::new(PlaylistGenerator::new(config)),
            stats,
            player: Arc::new(PlayerPage::new()?),
        })
    }
}

/// Build the delivery router
pub fn router(state: HlsState) -> Router {
    Router::new()
        .route("/stream.m3u8", get(serve_master))
        .route("/player", get(serve_player))
        .route("/stats", get(serve_stats))
        .route("/{file}", get(serve_file))
        .layer(axum::middleware::map_response(add_cors_headers))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE])
                .max_age(CORS_MAX_AGE),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Cross-origin headers on every response, not only on preflight
async fn add_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}

pub struct HlsServer {
    address: String,
    state: HlsState,
    shutdown_token: CancellationToken,
}

impl HlsServer {
    pub fn new(address: String, state: HlsState) -> Self {
        Self {
            address,
            state,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops accepting and drains in-flight requests
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn start(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.address).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!("HLS HTTP server listening on {}", listener.local_addr()?);
        tracing::info!("Web player available at http://{}/player", listener.local_addr()?);

        let shutdown_token = self.shutdown_token;
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
            .await?;

        tracing::info!("HLS HTTP server shut down gracefully");
        Ok(())
    }
}

fn playlist_response(m3u8: String) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        m3u8,
    )
        .into_response()
}

async fn serve_master(State(state): State<HlsState>) -> Response {
    tracing::debug!("Master playlist requested");
    playlist_response(state.playlists.master())
}

async fn serve_stats(State(state): State<HlsState>) -> Response {
    Json(state.stats.snapshot()).into_response()
}

async fn serve_player(State(state): State<HlsState>, headers: HeaderMap) -> Response {
    let server_url = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|host| is_plain_host(host))
        .map(|host| format!("http://{host}"))
        .unwrap_or_default();

    match state.player.render("/stream.m3u8", &server_url) {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!("Failed to render player page: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `host[:port]` made of characters that are safe to embed in the page
fn is_plain_host(host: &str) -> bool {
    !host.is_empty()
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b':' | b'[' | b']'))
}

/// Dispatch `stream_{bitrate}.m3u8` and `segment_{id}.ts`
async fn serve_file(Path(file): Path<String>, State(state): State<HlsState>) -> Response {
    if let Some(bitrate) = file
        .strip_prefix("stream_")
        .and_then(|rest| rest.strip_suffix(".m3u8"))
        .filter(|b| !b.is_empty())
    {
        tracing::debug!(bitrate, "Media playlist requested");
        return playlist_response(state.playlists.media_from_store(&state.store));
    }

    if let Some(id) = file
        .strip_prefix("segment_")
        .and_then(|rest| rest.strip_suffix(".ts"))
        .and_then(|id| id.parse::<u64>().ok())
    {
        return serve_segment(&state, id).await;
    }

    (StatusCode::NOT_FOUND, "Not found").into_response()
}

async fn serve_segment(state: &HlsState, id: u64) -> Response {
    let Some(segment) = state.store.find(id) else {
        tracing::debug!("Segment not in window: {}", id);
        return (StatusCode::NOT_FOUND, "Segment not found").into_response();
    };

    match state.store.storage().read(&segment.file_name()).await {
        Ok(data) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE),
                (header::CACHE_CONTROL, "public, max-age=90"),
            ],
            data,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Segment {} listed but file is gone", id);
            (StatusCode::NOT_FOUND, "Segment not found").into_response()
        }
        Err(e) => {
            tracing::error!("Failed to read segment {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::store::{segment_file_name, Segment};
    use crate::storage::FileStorage;
    use axum::body::Body;
    use axum::http::Request;
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Fixture {
        state: HlsState,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path()));
        let mut config = StreamConfig::default();
        config.hls.playlist_size = 2;
        let store = Arc::new(SegmentStore::new(4, storage));
        let state = HlsState::new(&config, store, Arc::new(Stats::new())).unwrap();
        Fixture { state, dir }
    }

    async fn publish(fixture: &Fixture, id: u64, data: &'static [u8]) {
        let path = fixture.dir.path().join(segment_file_name(id));
        std::fs::write(&path, data).unwrap();
        fixture
            .state
            .store
            .append(Segment {
                id,
                path,
                started_at: tokio::time::Instant::now(),
                duration: Duration::from_secs(4),
            })
            .await;
    }

    async fn get(state: &HlsState, uri: &str) -> Response {
        router(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body(response: Response) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_master_playlist() {
        let fixture = fixture();
        let response = get(&fixture.state, "/stream.m3u8").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            PLAYLIST_CONTENT_TYPE
        );
        let text = body(response).await;
        assert!(std::str::from_utf8(&text)
            .unwrap()
            .contains("/stream_2000000.m3u8"));
    }

    #[tokio::test]
    async fn test_media_playlist_window() {
        let fixture = fixture();
        for id in 1..=3 {
            publish(&fixture, id, b"ts").await;
        }

        let response = get(&fixture.state, "/stream_1000000.m3u8").await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body(response).await.to_vec()).unwrap();
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:2\n"));
        assert!(!text.contains("/segment_1.ts"));
        assert!(text.contains("/segment_2.ts"));
        assert!(text.contains("/segment_3.ts"));
    }

    #[tokio::test]
    async fn test_segment_bytes() {
        let fixture = fixture();
        publish(&fixture, 1, b"\x47exact segment bytes").await;

        let response = get(&fixture.state, "/segment_1.ts").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], SEGMENT_CONTENT_TYPE);
        assert_eq!(body(response).await, Bytes::from_static(b"\x47exact segment bytes"));
    }

    #[tokio::test]
    async fn test_unknown_segment_is_404() {
        let fixture = fixture();
        publish(&fixture, 1, b"ts").await;

        // never appended
        assert_eq!(get(&fixture.state, "/segment_7.ts").await.status(), StatusCode::NOT_FOUND);
        // file exists on disk but the store does not list it
        std::fs::write(fixture.dir.path().join("segment_2.ts"), b"open").unwrap();
        assert_eq!(get(&fixture.state, "/segment_2.ts").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(get(&fixture.state, "/segment_x.ts").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(get(&fixture.state, "/other.txt").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_evicted_segment_is_404() {
        let fixture = fixture();
        for id in 1..=5 {
            publish(&fixture, id, b"ts").await;
        }
        // retained = 4, so segment 1 is gone from the store and the disk
        assert_eq!(get(&fixture.state, "/segment_1.ts").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(get(&fixture.state, "/segment_2.ts").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stats_json() {
        let fixture = fixture();
        fixture.state.stats.record_error();

        let response = get(&fixture.state, "/stats").await;
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(json["encoding_errors"], 1);
        assert_eq!(json["processed_video_frames"], 0);
        assert_eq!(json["video_fps"], 0.0);
    }

    #[tokio::test]
    async fn test_player_page() {
        let fixture = fixture();
        let response = router(fixture.state.clone())
            .oneshot(
                Request::builder()
                    .uri("/player")
                    .header(header::HOST, "localhost:8080")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let html = String::from_utf8(body(response).await.to_vec()).unwrap();
        assert!(html.contains("http://localhost:8080/stream.m3u8"));
    }

    #[test]
    fn test_player_ignores_unsafe_host() {
        let page = PlayerPage::new().unwrap();
        assert!(!is_plain_host("evil\"<script>"));
        let html = page.render("/stream.m3u8", "").unwrap();
        assert!(html.contains("const src = \"/stream.m3u8\""));
    }

    #[tokio::test]
    async fn test_cors_on_every_response() {
        let fixture = fixture();
        for uri in ["/stream.m3u8", "/stats", "/segment_99.ts"] {
            let response = get(&fixture.state, uri).await;
            let headers = response.headers();
            assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
            assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "GET, POST, OPTIONS");
            assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");
            assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "86400");
        }
    }

    #[tokio::test]
    async fn test_preflight() {
        let fixture = fixture();
        let response = router(fixture.state.clone())
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/stream.m3u8")
                    .header(header::ORIGIN, "http://example.com")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_success());
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
