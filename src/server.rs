//! Web server for the preview display and corner picking UI

use anyhow::Result;
use arc_swap::ArcSwap;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use image::{ImageOutputFormat, RgbImage};
use parking_lot::{Mutex, RwLock};
use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};

use crate::apply::Method;
use crate::bench::FrameSink;
use crate::canvas::Canvas;
use crate::config::{Config, Point, Resolution};
use crate::session::{CalibrationSession, Phase, SessionError, CORNER_LABELS};

/// Embedded static files for the web UI
#[derive(RustEmbed)]
#[folder = "static/"]
struct StaticAssets;

const JPEG_QUALITY: u8 = 70;

/// Shared application state
pub struct AppState {
    /// Configuration (saved corners end up here)
    pub config: Arc<RwLock<Config>>,
    /// Path to save configuration
    config_path: Option<PathBuf>,
    /// Corner picking state machine
    pub session: Mutex<CalibrationSession>,
    /// Latest corrected frame (JPEG encoded)
    preview_frame: ArcSwap<Vec<u8>>,
    /// Source frame with picked corners drawn (JPEG encoded)
    source_frame: ArcSwap<Vec<u8>>,
    /// Raised by the Escape key in the UI or by Ctrl-C
    stop: Arc<AtomicBool>,
    resolution: Resolution,
    method: Method,
}

impl AppState {
    pub fn new(
        config: Arc<RwLock<Config>>,
        config_path: Option<PathBuf>,
        session: CalibrationSession,
        method: Method,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let resolution = session.resolution();
        Self {
            config,
            config_path,
            session: Mutex::new(session),
            preview_frame: ArcSwap::from_pointee(Vec::new()),
            source_frame: ArcSwap::from_pointee(Vec::new()),
            stop,
            resolution,
            method,
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Update the preview frame (called from the apply thread)
    pub fn update_preview(&self, rgb_data: &[u8]) {
        match encode_jpeg(rgb_data, self.resolution, JPEG_QUALITY) {
            Ok(jpeg) => self.preview_frame.store(Arc::new(jpeg)),
            Err(e) => tracing::debug!("Failed to encode preview: {}", e),
        }
    }

    /// Update the annotated source frame shown while picking corners
    pub fn update_source_preview(&self, image: &RgbImage) {
        match encode_jpeg(image.as_raw(), self.resolution, JPEG_QUALITY) {
            Ok(jpeg) => self.source_frame.store(Arc::new(jpeg)),
            Err(e) => tracing::debug!("Failed to encode source preview: {}", e),
        }
    }

    pub fn get_preview(&self) -> Arc<Vec<u8>> {
        self.preview_frame.load_full()
    }

    pub fn get_source_preview(&self) -> Arc<Vec<u8>> {
        self.source_frame.load_full()
    }

    /// Store the session corners in the config file
    pub fn save_corners(&self) -> Result<()> {
        let corners = {
            let session = self.session.lock();
            if session.is_fixed() {
                anyhow::bail!(SessionError::Fixed);
            }
            session
                .corners()
                .ok_or_else(|| anyhow::anyhow!("Pick all four corners before saving"))?
        };

        let mut config = self.config.write();
        config.calibration.corners = Some(corners);
        match &self.config_path {
            Some(path) => config.save(path),
            None => anyhow::bail!("No config file given (use --config)"),
        }
    }
}

/// Encode RGB data to JPEG
fn encode_jpeg(rgb_data: &[u8], resolution: Resolution, quality: u8) -> Result<Vec<u8>> {
    use std::io::Cursor;

    let img = RgbImage::from_raw(resolution.width, resolution.height, rgb_data.to_vec())
        .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))?;

    let mut jpeg_data = Vec::new();
    let mut cursor = Cursor::new(&mut jpeg_data);
    img.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality))?;

    Ok(jpeg_data)
}

/// Publishes the canvas to the web preview, at most every `interval`
pub struct PreviewSink {
    state: Arc<AppState>,
    interval: Duration,
    last: Option<Instant>,
}

impl PreviewSink {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            interval: Duration::from_millis(100),
            last: None,
        }
    }
}

impl FrameSink for PreviewSink {
    fn name(&self) -> &str {
        "web preview"
    }

    fn present(&mut self, canvas: &Canvas) -> Result<()> {
        if self.last.is_some_and(|t| t.elapsed() < self.interval) {
            return Ok(());
        }
        self.state.update_preview(&canvas.to_rgb());
        self.last = Some(Instant::now());
        Ok(())
    }
}

/// Run the web server
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        // Static files and UI
        .route("/", get(index_handler))
        .route("/static/*path", get(static_handler))
        // Corner picking
        .route("/api/session", get(get_session))
        .route("/api/session/point", post(add_point))
        .route("/api/session/reset", post(reset_session))
        .route("/api/session/save", post(save_session))
        // Preview
        .route("/api/preview", get(get_preview))
        .route("/api/preview/stream", get(preview_stream))
        .route("/api/source", get(get_source))
        // Control
        .route("/api/stop", post(stop))
        .route("/api/info", get(get_info))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Web server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Serve the main index page
async fn index_handler() -> impl IntoResponse {
    match StaticAssets::get("index.html") {
        Some(content) => Html(content.data.to_vec()).into_response(),
        None => (StatusCode::NOT_FOUND, "Index not found").into_response(),
    }
}

/// Serve static files
async fn static_handler(axum::extract::Path(path): axum::extract::Path<String>) -> impl IntoResponse {
    let path = path.trim_start_matches('/');

    match StaticAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            (
                [(axum::http::header::CONTENT_TYPE, mime.as_ref())],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

#[derive(Serialize)]
struct LabeledPoint {
    label: &'static str,
    x: f64,
    y: f64,
}

#[derive(Serialize)]
struct SessionResponse {
    phase: Phase,
    points: Vec<LabeledPoint>,
    width: u32,
    height: u32,
    /// Picking, reset and save are unavailable
    fixed: bool,
}

fn session_response(session: &CalibrationSession) -> SessionResponse {
    let resolution = session.resolution();
    SessionResponse {
        phase: session.phase(),
        points: session
            .points()
            .into_iter()
            .zip(CORNER_LABELS)
            .map(|(p, label)| LabeledPoint { label, x: p.x, y: p.y })
            .collect(),
        width: resolution.width,
        height: resolution.height,
        fixed: session.is_fixed(),
    }
}

async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionResponse> {
    Json(session_response(&state.session.lock()))
}

#[derive(Deserialize)]
struct PointRequest {
    x: f64,
    y: f64,
}

/// Pixel containing a click at `(x, y)`; clicks on the far edge stay on the last pixel
fn click_to_pixel(x: f64, y: f64, resolution: Resolution) -> Point {
    let right = resolution.width.saturating_sub(1) as f64;
    let bottom = resolution.height.saturating_sub(1) as f64;
    Point::new(x.floor().min(right), y.floor().min(bottom))
}

/// Add the next corner (pixel coordinates of the source frame)
async fn add_point(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PointRequest>,
) -> impl IntoResponse {
    let mut session = state.session.lock();
    let point = click_to_pixel(req.x, req.y, session.resolution());
    match session.add_point(point) {
        Ok(_) => Json(session_response(&session)).into_response(),
        Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
    }
}

async fn reset_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut session = state.session.lock();
    match session.reset() {
        Ok(()) => Json(session_response(&session)).into_response(),
        Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
    }
}

async fn save_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.save_corners() {
        Ok(()) => Json(serde_json::json!({
            "status": "saved",
            "corners": state.config.read().calibration.corners,
        }))
        .into_response(),
        Err(e) if e.is::<SessionError>() => (StatusCode::CONFLICT, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn jpeg_response(frame: Arc<Vec<u8>>) -> axum::response::Response {
    if frame.is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response();
    }

    (
        [(axum::http::header::CONTENT_TYPE, "image/jpeg")],
        frame.as_ref().clone(),
    )
        .into_response()
}

/// Get current corrected frame (JPEG)
async fn get_preview(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    jpeg_response(state.get_preview())
}

/// Get the source frame with the picked corners (JPEG)
async fn get_source(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    jpeg_response(state.get_source_preview())
}

/// MJPEG stream endpoint for continuous preview
async fn preview_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use axum::body::Body;
    use tokio_stream::StreamExt;

    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        Duration::from_millis(100), // ~10 fps for preview
    ))
    .map(move |_| {
        let frame = state.get_preview();
        if frame.is_empty() {
            return Ok::<_, std::convert::Infallible>(
                "--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_string().into_bytes(),
            );
        }

        let mut response = Vec::new();
        response.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
        response.extend_from_slice(frame.len().to_string().as_bytes());
        response.extend_from_slice(b"\r\n\r\n");
        response.extend_from_slice(&frame);
        response.extend_from_slice(b"\r\n");

        Ok(response)
    });

    let body = Body::from_stream(stream);

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        body,
    )
}

/// Cancel the running benchmark or calibration loop
async fn stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("Stop requested from the web UI");
    state.request_stop();
    Json(serde_json::json!({ "stopped": true }))
}

#[derive(Serialize)]
struct InfoResponse {
    version: String,
    width: u32,
    height: u32,
    method: Method,
    stopped: bool,
}

async fn get_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        width: state.resolution.width,
        height: state.resolution.height,
        method: state.method,
        stopped: state.is_stop_requested(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CornerSet;

    fn state(resolution: Resolution) -> AppState {
        AppState::new(
            Arc::new(RwLock::new(Config::default())),
            None,
            CalibrationSession::new(resolution),
            Method::Sequential,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_encode_jpeg() {
        let resolution = Resolution::new(8, 8);
        let jpeg = encode_jpeg(&vec![128u8; 8 * 8 * 3], resolution, 70).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        assert!(encode_jpeg(&[0u8; 5], resolution, 70).is_err());
    }

    #[test]
    fn test_preview_sink_publishes() {
        let resolution = Resolution::new(8, 4);
        let state = Arc::new(state(resolution));
        assert!(state.get_preview().is_empty());

        let mut sink = PreviewSink::new(state.clone());
        sink.present(&Canvas::new(resolution)).unwrap();
        assert!(!state.get_preview().is_empty());
    }

    #[test]
    fn test_stop_flag() {
        let state = state(Resolution::new(4, 4));
        assert!(!state.is_stop_requested());
        state.request_stop();
        assert!(state.is_stop_requested());
    }

    #[test]
    fn test_save_corners_needs_config_path() {
        let resolution = Resolution::new(16, 16);
        let state = state(resolution);
        assert!(state.save_corners().is_err());

        *state.session.lock() = CalibrationSession::with_corners(resolution, CornerSet::canonical(resolution));
        assert!(state.save_corners().is_err());
        assert!(state.config.read().calibration.corners.is_some());
    }

    #[test]
    fn test_session_response_labels() {
        let resolution = Resolution::new(16, 16);
        let session = CalibrationSession::with_corners(resolution, CornerSet::canonical(resolution));
        let response = session_response(&session);

        assert_eq!(response.phase, Phase::Ready);
        assert_eq!(response.points.len(), 4);
        assert_eq!(response.points[2].label, "Bottom Right");
        assert_eq!(response.points[2].x, 15.0);
        assert!(!response.fixed);
    }

    #[test]
    fn test_click_on_last_pixel() {
        let resolution = Resolution::new(1920, 1080);
        assert_eq!(click_to_pixel(1919.6, 1079.9, resolution), Point::new(1919.0, 1079.0));
        assert_eq!(click_to_pixel(1920.0, 1080.0, resolution), Point::new(1919.0, 1079.0));
        assert_eq!(click_to_pixel(10.7, 0.2, resolution), Point::new(10.0, 0.0));

        let mut session = CalibrationSession::new(resolution);
        assert!(session.add_point(click_to_pixel(1919.6, 1079.6, resolution)).is_ok());
    }

    #[test]
    fn test_fixed_session_cannot_be_edited() {
        let resolution = Resolution::new(16, 16);
        let state = state(resolution);
        *state.session.lock() = CalibrationSession::fixed(resolution, CornerSet::canonical(resolution));

        let err = state.save_corners().unwrap_err();
        assert!(err.is::<SessionError>());
        assert!(state.config.read().calibration.corners.is_none());

        let response = session_response(&state.session.lock());
        assert!(response.fixed);
        assert_eq!(response.phase, Phase::Running);
    }
}
