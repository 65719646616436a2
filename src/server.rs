//! HTTP surface: live page, MJPEG stream, single frames and status

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use chrono::Local;
use futures::{future, StreamExt};
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_stream::wrappers::IntervalStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::capture::encode_jpeg;
use crate::config::StreamConfig;
use crate::error::Result;
use crate::overlay;
use crate::state::SharedState;

const BOUNDARY: &str = "frame";
const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

struct ServerState {
    app: SharedState,
    /// Shown while no camera frame exists, stamped per part
    placeholder: RgbImage,
    /// Unstamped placeholder, used if stamping fails
    placeholder_jpeg: Bytes,
    jpeg_quality: u8,
    frame_interval: Duration,
}

impl ServerState {
    fn stamped_placeholder(&self) -> Bytes {
        let mut frame = self.placeholder.clone();
        overlay::stamp_timestamp(&mut frame, Local::now());
        match encode_jpeg(&frame, self.jpeg_quality) {
            Ok(jpeg) => Bytes::from(jpeg),
            Err(e) => {
                warn!("Failed to encode placeholder: {}", e);
                self.placeholder_jpeg.clone()
            }
        }
    }
}

/// Status reported by `GET /status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub camera_connected: bool,
    pub streaming: bool,
    pub timestamp: String,
    pub frame_count: u64,
    pub faces_detected: u64,
    pub faces_saved: u64,
    pub pending_captures: Option<i64>,
    pub camera: Option<String>,
}

impl StatusReport {
    pub fn collect(state: &SharedState) -> Self {
        Self {
            camera_connected: state.camera_connected(),
            streaming: state.is_streaming(),
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            frame_count: *state.frame_count.read(),
            faces_detected: *state.faces_detected.read(),
            faces_saved: *state.faces_saved.read(),
            pending_captures: state.pending_captures(),
            camera: state.camera.read().clone(),
        }
    }
}

/// Build the router.
///
/// # Errors
///
/// Returns an error if the placeholder frame cannot be encoded.
pub fn router(state: SharedState, config: &StreamConfig) -> Result<Router> {
    let placeholder = overlay::placeholder_frame();
    let placeholder_jpeg = Bytes::from(encode_jpeg(&placeholder, config.jpeg_quality)?);
    let state = ServerState {
        app: state,
        placeholder,
        placeholder_jpeg,
        jpeg_quality: config.jpeg_quality,
        frame_interval: Duration::from_millis(config.frame_interval_ms.max(1)),
    };

    Ok(Router::new()
        .route("/", get(index_handler))
        .route("/video_feed", get(mjpeg_stream_handler))
        .route("/stream", get(mjpeg_stream_handler))
        .route("/frame.jpg", get(frame_handler))
        .route("/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state)))
}

/// Encapsulate one JPEG as a multipart part.
fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut data = Vec::with_capacity(header.len() + jpeg.len() + 2);
    data.extend_from_slice(header.as_bytes());
    data.extend_from_slice(jpeg);
    data.extend_from_slice(b"\r\n");
    Bytes::from(data)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn frame_handler(State(state): State<Arc<ServerState>>) -> Response {
    match state.app.current_frame.read().clone() {
        Some(frame) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            ],
            frame,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response(),
    }
}

async fn mjpeg_stream_handler(State(state): State<Arc<ServerState>>) -> Response {
    let app = state.app.clone();
    let stream = IntervalStream::new(interval(state.frame_interval))
        .take_while(move |_| future::ready(!app.is_shutting_down()))
        .map(move |_| {
            let frame = state.app.current_frame.read().clone();
            let part = match frame {
                Some(jpeg) => mjpeg_part(&jpeg),
                None => mjpeg_part(&state.stamped_placeholder()),
            };
            Ok::<_, std::convert::Infallible>(part)
        });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(MJPEG_CONTENT_TYPE)),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn status_handler(State(state): State<Arc<ServerState>>) -> Response {
    // Counting pending rows takes the storage lock.
    let app = state.app.clone();
    match tokio::task::spawn_blocking(move || StatusReport::collect(&app)).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>facecam live view</title>
    <style>
        * { margin: 0; padding: 0; box-sizing: border-box; }
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: linear-gradient(135deg, #1a1a2e 0%, #16213e 50%, #0f3460 100%);
            min-height: 100vh;
            display: flex;
            flex-direction: column;
            align-items: center;
            padding: 20px;
            color: #e0e0e0;
        }
        h1 {
            font-size: 2.2rem;
            font-weight: 300;
            letter-spacing: 2px;
            margin-bottom: 10px;
        }
        .status { font-size: 0.9rem; margin-bottom: 20px; color: #888; }
        .status.online { color: #4ade80; }
        .video-container {
            background: #000;
            border-radius: 16px;
            overflow: hidden;
            box-shadow: 0 20px 60px rgba(0, 0, 0, 0.5);
            border: 1px solid rgba(255, 255, 255, 0.1);
        }
        #stream { display: block; max-width: 100%; max-height: 75vh; }
        .controls { display: flex; gap: 15px; margin-top: 25px; }
        button, .link-btn {
            background: linear-gradient(135deg, #667eea 0%, #764ba2 100%);
            border: none;
            color: white;
            padding: 12px 28px;
            font-size: 1rem;
            border-radius: 30px;
            cursor: pointer;
            text-decoration: none;
        }
        .stats { margin-top: 25px; font-size: 0.85rem; color: #888; display: flex; gap: 30px; }
        .stat-value { color: #00d4ff; font-weight: 600; }
        .urls { margin-top: 25px; font-size: 0.85rem; color: #aaa; line-height: 1.6; }
    </style>
</head>
<body>
    <h1>facecam live</h1>
    <p class="status" id="status">connecting...</p>

    <div class="video-container">
        <img id="stream" src="/video_feed" alt="Live stream">
    </div>

    <div class="controls">
        <button onclick="location.reload()">Reload</button>
        <a href="/frame.jpg" target="_blank" class="link-btn">Snapshot</a>
        <button onclick="toggleFullscreen()">Fullscreen</button>
    </div>

    <div class="stats">
        <div>Frames: <span class="stat-value" id="frames">0</span></div>
        <div>FPS: <span class="stat-value" id="fps">--</span></div>
        <div>Faces: <span class="stat-value" id="faces">0</span></div>
        <div>Saved: <span class="stat-value" id="saved">0</span></div>
        <div>Pending: <span class="stat-value" id="pending">--</span></div>
    </div>

    <div class="urls">
        Web interface: <span id="webUrl"></span><br>
        MJPEG stream (VLC/OBS): <span id="streamUrl"></span><br>
        Status: <span id="statusUrl"></span>
    </div>

    <script>
        const base = window.location.origin;
        document.getElementById('webUrl').textContent = base;
        document.getElementById('streamUrl').textContent = base + '/video_feed';
        document.getElementById('statusUrl').textContent = base + '/status';

        function toggleFullscreen() {
            const img = document.getElementById('stream');
            if (document.fullscreenElement) {
                document.exitFullscreen();
            } else {
                img.requestFullscreen();
            }
        }

        document.getElementById('stream').onerror = function () {
            setTimeout(() => { this.src = '/video_feed?' + Date.now(); }, 3000);
        };

        let lastCount = 0;
        setInterval(async () => {
            try {
                const res = await fetch('/status');
                const data = await res.json();
                const status = document.getElementById('status');
                status.textContent = data.camera_connected ? 'online: ' + data.camera : 'camera not available';
                status.className = data.camera_connected ? 'status online' : 'status';
                document.getElementById('frames').textContent = data.frame_count;
                document.getElementById('fps').textContent = data.frame_count - lastCount;
                document.getElementById('faces').textContent = data.faces_detected;
                document.getElementById('saved').textContent = data.faces_saved;
                document.getElementById('pending').textContent = data.pending_captures ?? '--';
                lastCount = data.frame_count;
            } catch (e) {}
        }, 1000);
    </script>
</body>
</html>"##;
