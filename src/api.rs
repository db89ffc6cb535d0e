#![forbid(unsafe_code)]

//! HTTP surface. Every handler is a thin wrapper around [`JobRunner`] or the
//! [`Sweeper`]; failures are rendered as `{"success": false, "error": ...}`.

use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::JobError;
use crate::jobs::{Artifact, JobMode, JobRunner};
use crate::metadata::VideoInfo;
use crate::retention::{SweepReport, Sweeper};
use crate::sanitize::sanitize;
use crate::security::is_safe_file_name;
use crate::ytdlp::ExternalTool;

/// Routes served under `/api`, logged at startup.
pub const ROUTES: &[&str] = &[
    "GET    /api/health",
    "GET    /api/config",
    "POST   /api/video-info",
    "POST   /api/download (binary)",
    "POST   /api/download-mp3 (binary)",
    "POST   /api/download-url (returns URL)",
    "POST   /api/download-mp3-url (returns URL)",
    "GET    /downloads/{filename}",
    "POST   /api/cleanup-all",
    "DELETE /api/cleanup/{filename}",
];

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub jobs: Arc<JobRunner>,
    pub sweeper: Arc<Sweeper>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, tool: Arc<dyn ExternalTool>) -> Self {
        let jobs = Arc::new(JobRunner::new(config.clone(), tool));
        let sweeper = Arc::new(Sweeper::new(config.output_dir.clone(), config.retention));
        Self {
            config,
            jobs,
            sweeper,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match &err {
            JobError::Validation(_) => Self::bad_request(err.to_string()),
            JobError::NotFound(_) => Self::not_found(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Body accepted by every job endpoint. A missing or unreadable body is
/// treated like one without `url`.
#[derive(Debug, Default, Deserialize)]
pub struct MediaRequest {
    pub url: Option<String>,
    pub format: Option<String>,
}

fn media_request(payload: Result<Json<MediaRequest>, JsonRejection>) -> MediaRequest {
    match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection, "unreadable request body");
            MediaRequest::default()
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
    timestamp: String,
}

#[derive(Serialize)]
struct VideoInfoResponse {
    success: bool,
    data: VideoInfo,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadLinkResponse {
    success: bool,
    download_url: String,
    file_name: String,
    file_size: u64,
    message: &'static str,
}

#[derive(Serialize)]
struct MessageResponse {
    success: bool,
    message: &'static str,
    #[serde(flatten)]
    report: Option<SweepReport>,
}

pub fn router(state: AppState) -> Router {
    let cors = match HeaderValue::from_str(&state.config.cors_origin) {
        Ok(origin) => CorsLayer::new().allow_origin(origin),
        Err(err) => {
            warn!(
                origin = %state.config.cors_origin,
                error = %err,
                "invalid CORS_ORIGIN, cross-origin requests disabled"
            );
            CorsLayer::new()
        }
    }
    .allow_methods(tower_http::cors::Any)
    .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(config))
        .route("/api/video-info", post(video_info))
        .route("/api/download", post(download_binary))
        .route("/api/download-mp3", post(download_audio_binary))
        .route("/api/download-url", post(download_link))
        .route("/api/download-mp3-url", post(download_audio_link))
        .route("/api/cleanup-all", post(cleanup_all))
        .route("/api/cleanup/{filename}", delete(cleanup_file))
        .route("/downloads/{filename}", get(serve_download))
        .fallback(fallback)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback(req: Request<Body>) -> ApiError {
    ApiError::not_found(format!("Cannot {} {}", req.method(), req.uri().path()))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        message: "Server is running",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

async fn config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "config": state.config.summary(),
    }))
}

async fn video_info(
    State(state): State<AppState>,
    payload: Result<Json<MediaRequest>, JsonRejection>,
) -> ApiResult<Json<VideoInfoResponse>> {
    let request = media_request(payload);
    let data = state
        .jobs
        .video_info(request.url.as_deref())
        .await
        .inspect_err(|err| log_job_error(JobMode::VideoInfo, err))?;
    Ok(Json(VideoInfoResponse {
        success: true,
        data,
    }))
}

async fn download_binary(
    State(state): State<AppState>,
    payload: Result<Json<MediaRequest>, JsonRejection>,
) -> ApiResult<Response> {
    run_binary(state, media_request(payload), JobMode::DownloadBinary).await
}

async fn download_audio_binary(
    State(state): State<AppState>,
    payload: Result<Json<MediaRequest>, JsonRejection>,
) -> ApiResult<Response> {
    run_binary(state, media_request(payload), JobMode::DownloadAudioBinary).await
}

async fn download_link(
    State(state): State<AppState>,
    payload: Result<Json<MediaRequest>, JsonRejection>,
) -> ApiResult<Json<DownloadLinkResponse>> {
    run_link(state, media_request(payload), JobMode::DownloadUrlRef).await
}

async fn download_audio_link(
    State(state): State<AppState>,
    payload: Result<Json<MediaRequest>, JsonRejection>,
) -> ApiResult<Json<DownloadLinkResponse>> {
    run_link(state, media_request(payload), JobMode::DownloadAudioUrlRef).await
}

async fn run_download(
    state: &AppState,
    request: &MediaRequest,
    mode: JobMode,
) -> ApiResult<Artifact> {
    state
        .jobs
        .download(request.url.as_deref(), mode, request.format.as_deref())
        .await
        .inspect_err(|err| log_job_error(mode, err))
        .map_err(ApiError::from)
}

async fn run_binary(state: AppState, request: MediaRequest, mode: JobMode) -> ApiResult<Response> {
    let artifact = run_download(&state, &request, mode).await?;
    stream_artifact(artifact).await
}

async fn run_link(
    state: AppState,
    request: MediaRequest,
    mode: JobMode,
) -> ApiResult<Json<DownloadLinkResponse>> {
    let artifact = run_download(&state, &request, mode).await?;
    let download_url = format!(
        "{}/downloads/{}",
        state.config.public_base_url(),
        urlencoding::encode(&artifact.file_name)
    );
    Ok(Json(DownloadLinkResponse {
        success: true,
        download_url,
        file_name: artifact.display_name.clone(),
        file_size: artifact.size,
        message: "File ready for download",
    }))
}

fn log_job_error(mode: JobMode, err: &JobError) {
    if err.is_client_error() {
        debug!(mode = mode.as_str(), error = %err, "rejected request");
    } else {
        error!(mode = mode.as_str(), error = %err, "job failed");
    }
}

/// Streams the artifact and deletes it once the body is dropped, which covers
/// a complete transfer as well as a client that went away half-way.
async fn stream_artifact(artifact: Artifact) -> ApiResult<Response> {
    let content_type = artifact.mode.content_type();
    let size = artifact.size;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        sanitize(&artifact.display_name)
    );
    let disposition = HeaderValue::from_str(&disposition)
        .map_err(|err| ApiError::internal(format!("building Content-Disposition: {err}")))?;

    let cleanup = artifact.delete_on_drop();
    let file = File::open(cleanup.path())
        .await
        .map_err(|err| ApiError::internal(format!("opening downloaded file: {err}")))?;
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _ = &cleanup;
        chunk
    });

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    Ok(response)
}

async fn serve_download(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !is_safe_file_name(&filename) {
        return Err(file_not_found());
    }
    stream_file(state.jobs.output_dir().join(&filename), &headers).await
}

async fn cleanup_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Json<MessageResponse>> {
    if !is_safe_file_name(&filename) {
        return Err(ApiError::bad_request("Invalid filename"));
    }
    let path: PathBuf = state.jobs.output_dir().join(&filename);
    tokio::fs::remove_file(&path).await.map_err(|err| {
        warn!(file = %filename, error = %err, "manual delete failed");
        ApiError::internal(err.to_string())
    })?;
    info!(file = %filename, "deleted on request");
    Ok(Json(MessageResponse {
        success: true,
        message: "File deleted successfully",
        report: None,
    }))
}

async fn cleanup_all(State(state): State<AppState>) -> ApiResult<Json<MessageResponse>> {
    info!("manual cleanup triggered via API");
    let report = state.sweeper.sweep().await.map_err(ApiError::from)?;
    Ok(Json(MessageResponse {
        success: true,
        message: "Cleanup completed successfully",
        report: Some(report),
    }))
}

/// Serves a file from disk with single-range support.
async fn stream_file(path: PathBuf, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path).await.map_err(|_| file_not_found())?;
    let metadata = file.metadata().await.map_err(|_| file_not_found())?;
    if !metadata.is_file() {
        return Err(file_not_found());
    }
    let size = metadata.len();

    let guessed = MimeGuess::from_path(&path).first();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            insert_header(
                &mut response,
                header::CONTENT_RANGE,
                format!("bytes */{size}"),
            );
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| file_not_found())?;
            let stream = ReaderStream::new(file.take(length));
            let mut response = Body::from_stream(stream).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            insert_header(
                &mut response,
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{size}"),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
    } else {
        let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        response
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = guessed
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn file_not_found() -> ApiError {
    JobError::NotFound("File not found".to_string()).into()
}

fn insert_header(response: &mut Response, name: header::HeaderName, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(name, value);
    }
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let range = range.trim();
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::{FakeBehavior, FakeTool, eventually};
    use axum::body::to_bytes;
    use serde_json::Value;
    use std::time::{Duration, SystemTime};
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    struct TestApp {
        _dir: TempDir,
        output: PathBuf,
        tool: Arc<FakeTool>,
        app: Router,
    }

    impl TestApp {
        fn new(tool: FakeTool) -> Self {
            Self::with_config(tool, |_| {})
        }

        fn with_config(tool: FakeTool, tweak: impl FnOnce(&mut AppConfig)) -> Self {
            let dir = tempdir().unwrap();
            let output = dir.path().join("downloads");
            std::fs::create_dir_all(&output).unwrap();
            let mut config = AppConfig::new(&output, 3000);
            tweak(&mut config);
            let tool = Arc::new(tool);
            let state = AppState::new(Arc::new(config), tool.clone());
            Self {
                _dir: dir,
                output,
                tool,
                app: router(state),
            }
        }

        async fn send(&self, request: Request<Body>) -> Response {
            self.app.clone().oneshot(request).await.unwrap()
        }

        async fn call(&self, method: &str, uri: &str) -> Response {
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            self.send(request).await
        }

        async fn post_json(&self, uri: &str, body: Value) -> Response {
            self.send(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
        }

        fn files(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(&self.output)
                .unwrap()
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
    }

    async fn json_body(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = TestApp::new(FakeTool::new(FakeBehavior::Nothing));
        let response = app.call("GET", "/api/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["message"], "Server is running");
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn cors_allows_only_the_configured_origin() {
        let app = TestApp::with_config(FakeTool::new(FakeBehavior::Nothing), |config| {
            config.cors_origin = "https://ui.example.test".into();
        });
        let with_origin = |origin: &str| {
            Request::builder()
                .uri("/api/health")
                .header(header::ORIGIN, origin)
                .body(Body::empty())
                .unwrap()
        };

        let response = app.send(with_origin("https://ui.example.test")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://ui.example.test"
        );

        let response = app.send(with_origin("https://evil.example.test")).await;
        assert!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none()
        );

        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/api/download")
            .header(header::ORIGIN, "https://ui.example.test")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.send(preflight).await;
        assert!(response.status().is_success());
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://ui.example.test"
        );
        assert_eq!(app.tool.call_count(), 0);
    }

    #[tokio::test]
    async fn config_echoes_active_settings() {
        let app = TestApp::with_config(FakeTool::new(FakeBehavior::Nothing), |config| {
            config.rate_limit = Some("5M".into());
            config.max_concurrent_downloads = Some(4);
        });
        let response = app.call("GET", "/api/config").await;
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["config"]["port"], 3000);
        assert_eq!(body["config"]["ytdlpRateLimit"], "5M");
        assert_eq!(body["config"]["maxConcurrentDownloads"], 4);
    }

    #[tokio::test]
    async fn missing_url_is_rejected_without_spawning() {
        let app = TestApp::new(FakeTool::writing("x", "mp4", b"x"));
        for uri in [
            "/api/video-info",
            "/api/download",
            "/api/download-mp3",
            "/api/download-url",
            "/api/download-mp3-url",
        ] {
            let response = app.post_json(uri, json!({"format": "best"})).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            let body = json_body(response).await;
            assert_eq!(body["success"], false);
            assert_eq!(body["error"], "URL is required");
        }
        assert_eq!(app.tool.call_count(), 0);
    }

    #[tokio::test]
    async fn non_json_body_is_a_validation_error() {
        let app = TestApp::new(FakeTool::new(FakeBehavior::Nothing));
        let response = app
            .send(
                Request::post("/api/download")
                    .body(Body::from("url=https://v.test"))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.tool.call_count(), 0);
    }

    #[tokio::test]
    async fn video_info_returns_projection() {
        let app = TestApp::new(FakeTool::new(FakeBehavior::Stdout(
            serde_json::to_vec(&json!({
                "title": "My Title",
                "duration": 10,
                "uploader": "me",
                "webpage_url": "https://v.test",
                "formats": [{"format_id": "18", "ext": "mp4", "quality": 1, "filesize": 99, "vcodec": "avc1"}]
            }))
            .unwrap(),
        )));
        let response = app
            .post_json("/api/video-info", json!({"url": "https://v.test"}))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["title"], "My Title");
        assert!(body["data"].get("webpage_url").is_none());
        assert_eq!(
            body["data"]["formats"][0],
            json!({"format_id": "18", "ext": "mp4", "quality": 1, "filesize": 99})
        );
    }

    #[tokio::test]
    async fn video_info_parse_failure_is_500() {
        let app = TestApp::new(FakeTool::new(FakeBehavior::Stdout(b"oops".to_vec())));
        let response = app
            .post_json("/api/video-info", json!({"url": "https://v.test"}))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn binary_download_streams_and_deletes() {
        let content = b"0123456789abcdef".repeat(64);
        let app = TestApp::new(FakeTool::writing("My Title", "mp4", &content));
        let response = app
            .post_json("/api/download", json!({"url": "https://v.test/1"}))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"My Title.mp4\""
        );
        assert_eq!(headers[header::CONTENT_LENGTH], content.len().to_string());
        assert_eq!(app.files().len(), 1);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), content.as_slice());
        assert!(eventually(|| app.files().is_empty()).await);
    }

    #[tokio::test]
    async fn audio_download_sanitizes_header_filename() {
        let app = TestApp::new(FakeTool::writing("Rock | Roll: \"Live\" é", "mp3", b"ID3"));
        let response = app
            .post_json("/api/download-mp3", json!({"url": "https://v.test/2"}))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"Rock - Roll- Live .mp3\""
        );
        let mp3_args = app.tool.last_call().unwrap();
        assert!(mp3_args.contains(&"--audio-format".to_string()));
        drop(response);
        assert!(eventually(|| app.files().is_empty()).await);
    }

    #[tokio::test]
    async fn missing_artifact_yields_500() {
        let app = TestApp::new(FakeTool::new(FakeBehavior::Nothing));
        let response = app
            .post_json("/api/download", json!({"url": "https://v.test/3"}))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Downloaded file not found");
    }

    #[tokio::test]
    async fn subprocess_failure_yields_500_with_message() {
        let app = TestApp::new(FakeTool::new(FakeBehavior::Fail(
            "yt-dlp exited with exit status: 1: ERROR: Unsupported URL".into(),
        )));
        let response = app
            .post_json("/api/download-url", json!({"url": "https://nope.test"}))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("Unsupported URL"));
    }

    #[tokio::test]
    async fn link_download_keeps_file_and_encodes_url() {
        let app = TestApp::with_config(FakeTool::writing("My Title", "mp4", b"12345"), |config| {
            config.server_url = Some("https://dl.example.test/".into());
        });
        let request = json!({"url": "https://v.test/4", "format": "18"});
        let response = app.post_json("/api/download-url", request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;

        let files = app.files();
        assert_eq!(files.len(), 1);
        let on_disk = &files[0];
        assert!(on_disk.ends_with("_My Title.mp4"));
        assert_eq!(
            body["downloadUrl"],
            format!(
                "https://dl.example.test/downloads/{}",
                urlencoding::encode(on_disk)
            )
        );
        assert!(
            body["downloadUrl"]
                .as_str()
                .unwrap()
                .ends_with("_My%20Title.mp4")
        );
        assert_eq!(body["fileName"], "My Title.mp4");
        assert_eq!(body["fileSize"], 5);
        assert_eq!(body["message"], "File ready for download");
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn link_download_defaults_to_host_and_port() {
        let app = TestApp::new(FakeTool::writing("Song", "mp3", b"1"));
        let response = app
            .post_json("/api/download-mp3-url", json!({"url": "https://v.test/5"}))
            .await;
        let body = json_body(response).await;
        assert!(
            body["downloadUrl"]
                .as_str()
                .unwrap()
                .starts_with("http://localhost:3000/downloads/")
        );
        assert_eq!(app.files().len(), 1);
    }

    #[tokio::test]
    async fn link_then_fetch_serves_bytes() {
        let app = TestApp::new(FakeTool::writing("Clip", "mp4", b"clip-bytes"));
        let response = app
            .post_json("/api/download-url", json!({"url": "https://v.test/6"}))
            .await;
        let body = json_body(response).await;
        let url = body["downloadUrl"].as_str().unwrap();
        let path = url.strip_prefix("http://localhost:3000").unwrap();

        let response = app.call("GET", path).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"clip-bytes");
        assert_eq!(app.files().len(), 1);
    }

    #[tokio::test]
    async fn static_serve_supports_ranges() {
        let app = TestApp::new(FakeTool::new(FakeBehavior::Nothing));
        std::fs::write(app.output.join("t_a.bin"), b"0123456789").unwrap();
        let response = app
            .send(
                Request::get("/downloads/t_a.bin")
                    .header(header::RANGE, "bytes=2-5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"2345");
    }

    #[tokio::test]
    async fn static_serve_missing_file_is_404() {
        let app = TestApp::new(FakeTool::new(FakeBehavior::Nothing));
        let response = app.call("GET", "/downloads/ghost.mp4").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = app.call("GET", "/downloads/..%2Fsecret").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cleanup_single_file() {
        let app = TestApp::new(FakeTool::new(FakeBehavior::Nothing));
        std::fs::write(app.output.join("t_a.mp4"), b"x").unwrap();
        let response = app.call("DELETE", "/api/cleanup/t_a.mp4").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["message"], "File deleted successfully");
        assert!(app.files().is_empty());

        let response = app.call("DELETE", "/api/cleanup/t_a.mp4").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["success"], false);
    }

    #[tokio::test]
    async fn cleanup_rejects_traversal() {
        let app = TestApp::new(FakeTool::new(FakeBehavior::Nothing));
        let response = app.call("DELETE", "/api/cleanup/..").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cleanup_all_runs_a_sweep() {
        let app = TestApp::new(FakeTool::new(FakeBehavior::Nothing));
        let old = app.output.join("old.mp4");
        std::fs::write(&old, b"x").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3 * 3600))
            .unwrap();
        std::fs::write(app.output.join("new.mp4"), b"x").unwrap();

        let response = app.call("POST", "/api/cleanup-all").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["message"], "Cleanup completed successfully");
        assert_eq!(body["deleted"], 1);
        assert_eq!(body["remaining"], 1);
        assert_eq!(app.files(), vec!["new.mp4"]);
    }

    #[tokio::test]
    async fn unknown_api_route_is_json_404() {
        let app = TestApp::new(FakeTool::new(FakeBehavior::Nothing));
        let response = app.call("GET", "/api/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["success"], false);
    }

    #[test]
    fn range_header_parsing() {
        let value = |raw: &str| HeaderValue::from_str(raw).unwrap();
        assert_eq!(parse_range_header(&value("bytes=0-"), 10), Some((0, 9)));
        assert_eq!(parse_range_header(&value("bytes=-3"), 10), Some((7, 9)));
        assert_eq!(parse_range_header(&value("bytes=5-2"), 10), None);
        assert_eq!(parse_range_header(&value("items=0-1"), 10), None);
        assert_eq!(parse_range_header(&value("bytes=0-1,3-4"), 10), None);
    }

    #[test]
    fn job_errors_map_to_status_codes() {
        let err: ApiError = JobError::validation("URL is required").into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err: ApiError = JobError::ArtifactNotFound.into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        let err: ApiError = JobError::Timeout {
            after: Duration::from_secs(1),
        }
        .into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "yt-dlp timed out after 1000ms");
    }
}
