//! HTTP surface.

use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::error::ServiceError;
use crate::index::SessionRecord;
use crate::lifecycle::SessionError;
use crate::orchestrator::{DownloadAccepted, DownloadOrchestrator, PlaylistOutcome, with_sessions};
use crate::probe::{self, MediaInfo};
use crate::translate::ErrorCode;
use crate::ytdlp::DownloadOptions;

pub const SERVICE_NAME: &str = "redstream-api";

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<DownloadOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<DownloadOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", post(info))
        .route("/api/download", post(download))
        .route("/api/download/playlist", post(download_playlist))
        .route("/api/download/{download_id}", get(list_files))
        .route("/api/download/{download_id}/{filename}", get(get_file))
        .route("/api/status/{download_id}", get(status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error envelope: `{error, detail, code}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: String,
    error: String,
    detail: String,
}

impl ApiError {
    fn new(
        status: StatusCode,
        code: impl Into<String>,
        error: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code: code.into(),
            error: error.into(),
            detail: detail.into(),
        }
    }

    fn validation(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "Invalid request",
            detail,
        )
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(detail) => Self::validation(detail),
            ServiceError::Extraction(translated) => Self::new(
                extraction_status(translated.code),
                translated.code.as_str(),
                translated.error,
                translated.detail,
            ),
            ServiceError::Download(translated) => Self::new(
                StatusCode::BAD_REQUEST,
                translated.code.as_str(),
                translated.error,
                translated.detail,
            ),
            ServiceError::Integrity => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "INTEGRITY_ERROR",
                "Download produced no file",
                "The download finished but no media file was written.",
            ),
            ServiceError::Session(SessionError::NotFound { what }) => {
                let error = if what == "file" {
                    "File not found"
                } else {
                    "Download not found"
                };
                Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", error, format!("{what} not found"))
            }
            ServiceError::Session(SessionError::InvalidName(name)) => Self::new(
                StatusCode::BAD_REQUEST,
                "INVALID_NAME",
                "Invalid file name",
                format!("{name:?} is not a plain file name"),
            ),
            ServiceError::Session(err @ SessionError::Storage { .. }) => {
                error!(error = %err, "storage failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE_ERROR",
                    "Storage error",
                    "The server could not access its download storage.",
                )
            }
            ServiceError::Internal(detail) => {
                error!(error = %detail, "internal failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal error",
                    detail,
                )
            }
        }
    }
}

fn extraction_status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::VideoUnavailable => StatusCode::NOT_FOUND,
        ErrorCode::YoutubeBotCheck | ErrorCode::PrivateVideo => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ServiceError::from(err).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.error,
            "detail": self.detail,
            "code": self.code,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct InfoRequest {
    #[serde(default)]
    pub url: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub format_id: String,
    #[serde(default)]
    pub extract_audio: bool,
    #[serde(default = "default_true")]
    pub include_thumbnail: bool,
    #[serde(default)]
    pub include_subtitles: bool,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistRequest {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub format_id: String,
    #[serde(default)]
    pub extract_audio: bool,
    #[serde(default = "default_true")]
    pub include_thumbnail: bool,
    #[serde(default)]
    pub include_subtitles: bool,
}

fn options(extract_audio: bool, include_thumbnail: bool, include_subtitles: bool) -> DownloadOptions {
    DownloadOptions {
        extract_audio,
        include_thumbnail,
        include_subtitles,
    }
}

#[derive(Debug, Serialize)]
struct HealthPayload {
    status: &'static str,
    service: &'static str,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct FileListing {
    files: Vec<String>,
}

async fn health() -> Json<HealthPayload> {
    Json(HealthPayload {
        status: "healthy",
        service: SERVICE_NAME,
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn info(
    State(state): State<AppState>,
    payload: Result<Json<InfoRequest>, JsonRejection>,
) -> ApiResult<Json<MediaInfo>> {
    let Json(request) = payload?;
    let info = probe::probe(state.orchestrator.tool(), &request.url).await?;
    Ok(Json(info))
}

async fn download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Json<DownloadAccepted>> {
    let Json(request) = payload?;
    let accepted = state
        .orchestrator
        .start_single(
            &request.url,
            &request.format_id,
            options(
                request.extract_audio,
                request.include_thumbnail,
                request.include_subtitles,
            ),
        )
        .await?;
    Ok(Json(accepted))
}

async fn download_playlist(
    State(state): State<AppState>,
    payload: Result<Json<PlaylistRequest>, JsonRejection>,
) -> ApiResult<Json<PlaylistOutcome>> {
    let Json(request) = payload?;
    let outcome = state
        .orchestrator
        .start_playlist(
            &request.urls,
            &request.format_id,
            options(
                request.extract_audio,
                request.include_thumbnail,
                request.include_subtitles,
            ),
        )
        .await?;
    Ok(Json(outcome))
}

async fn list_files(
    State(state): State<AppState>,
    AxumPath(download_id): AxumPath<String>,
) -> ApiResult<Json<FileListing>> {
    let files = with_sessions(state.orchestrator.sessions(), move |sessions| {
        sessions.list_artifacts(&download_id)
    })
    .await?;
    Ok(Json(FileListing { files }))
}

async fn get_file(
    State(state): State<AppState>,
    AxumPath((download_id, filename)): AxumPath<(String, String)>,
) -> ApiResult<Response> {
    let name = filename.clone();
    let path = with_sessions(state.orchestrator.sessions(), move |sessions| {
        sessions.resolve(&download_id, Some(&name))
    })
    .await?;
    stream_file(path, &filename).await
}

async fn status(
    State(state): State<AppState>,
    AxumPath(download_id): AxumPath<String>,
) -> ApiResult<Json<SessionRecord>> {
    let record = with_sessions(state.orchestrator.sessions(), move |sessions| {
        sessions.status(&download_id)
    })
    .await?;
    Ok(Json(record))
}

/// Streams `path` as an attachment. A file evicted between resolution and
/// open is reported as missing.
async fn stream_file(path: PathBuf, filename: &str) -> ApiResult<Response> {
    let not_found = || ApiError::from(SessionError::NotFound { what: "file" });
    let file = File::open(&path).await.map_err(|_| not_found())?;
    let length = file.metadata().await.map_err(|_| not_found())?.len();

    let body = Body::from_stream(ReaderStream::new(file));
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// `attachment` with an ASCII fallback name plus the RFC 5987 UTF-8 form.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        percent_encode(filename)
    )
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionMode;
    use crate::index::SessionIndex;
    use crate::lifecycle::SessionManager;
    use crate::ytdlp::stub::StubTool;
    use axum::body::to_bytes;
    use axum::http::{Method, Request};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    fn app(root: &TempDir, tool: StubTool, mode: ExecutionMode) -> (Router, Arc<DownloadOrchestrator>) {
        let index = Arc::new(SessionIndex::open_in_memory().unwrap());
        let sessions =
            Arc::new(SessionManager::new(root.path(), Duration::from_secs(1800)).with_index(index));
        let orchestrator = Arc::new(DownloadOrchestrator::new(sessions, Arc::new(tool), mode));
        (router(AppState::new(Arc::clone(&orchestrator))), orchestrator)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn send_json(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, bytes) = send(app, request).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_service() {
        let root = tempdir().unwrap();
        let (app, _) = app(&root, StubTool::default(), ExecutionMode::Async);
        let (status, body) = send_json(app, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], SERVICE_NAME);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn info_rejects_blank_url() {
        let root = tempdir().unwrap();
        let (app, _) = app(&root, StubTool::default(), ExecutionMode::Async);
        let (status, body) = send_json(app, post_json("/api/info", json!({"url": " "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn malformed_json_is_a_validation_error() {
        let root = tempdir().unwrap();
        let (app, _) = app(&root, StubTool::default(), ExecutionMode::Async);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/download")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send_json(app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn info_returns_generic_formats_first() {
        let root = tempdir().unwrap();
        let tool = StubTool {
            probe_json: Some(json!({"id": "abc", "title": "Clip", "duration": 9})),
            ..StubTool::default()
        };
        let (app, _) = app(&root, tool, ExecutionMode::Async);
        let (status, body) =
            send_json(app, post_json("/api/info", json!({"url": "https://v/abc"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Clip");
        assert_eq!(body["is_playlist"], false);
        assert_eq!(body["formats"][0]["format_id"], "bestvideo+bestaudio/best");
    }

    #[tokio::test]
    async fn info_failure_carries_translated_code() {
        let root = tempdir().unwrap();
        let (app, _) = app(
            &root,
            StubTool::failing(&["https://v/gone"]),
            ExecutionMode::Async,
        );
        let (status, body) =
            send_json(app, post_json("/api/info", json!({"url": "https://v/gone"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "VIDEO_UNAVAILABLE");
        assert_eq!(body["error"], "Video unavailable");
    }

    async fn info_failure(stderr: &str) -> (StatusCode, Value) {
        let root = tempdir().unwrap();
        let tool = StubTool {
            probe_error: Some(stderr.to_string()),
            ..StubTool::failing(&["https://v/x"])
        };
        let (app, _) = app(&root, tool, ExecutionMode::Async);
        send_json(app, post_json("/api/info", json!({"url": "https://v/x"}))).await
    }

    #[tokio::test]
    async fn info_bot_check_is_forbidden() {
        let (status, body) =
            info_failure("ERROR: [youtube] x: Sign in to confirm you're not a bot").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "YOUTUBE_BOT_CHECK");
    }

    #[tokio::test]
    async fn info_private_video_is_forbidden() {
        let (status, body) = info_failure("ERROR: [youtube] x: Private video").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "PRIVATE_VIDEO");
    }

    #[tokio::test]
    async fn info_other_failures_are_extraction_errors() {
        let raw = "ERROR: Unsupported URL: https://v/x";
        let (status, body) = info_failure(raw).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "EXTRACTION_ERROR");
        assert_eq!(body["detail"], raw);
    }

    #[tokio::test]
    async fn sync_download_then_list_and_fetch() {
        let root = tempdir().unwrap();
        let (app, _) = app(&root, StubTool::default(), ExecutionMode::Sync);

        let (status, body) = send_json(
            app.clone(),
            post_json(
                "/api/download",
                json!({"url": "https://v/clip", "format_id": "22"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["filename"], "clip.mp4");
        let id = body["download_id"].as_str().unwrap().to_string();

        let (status, listing) = send_json(app.clone(), get(&format!("/api/download/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing, json!({"files": ["clip.mp4"]}));

        let response = app
            .clone()
            .oneshot(get(&format!("/api/download/{id}/clip.mp4")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment; filename=\"clip.mp4\""));
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"media");

        let (status, record) = send_json(app, get(&format!("/api/status/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["status"], "done");
    }

    #[tokio::test]
    async fn async_download_acknowledges_immediately() {
        let root = tempdir().unwrap();
        let (app, _) = app(&root, StubTool::default(), ExecutionMode::Async);
        let (status, body) = send_json(
            app,
            post_json(
                "/api/download",
                json!({"url": "https://v/clip", "format_id": "best"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "downloading");
        assert!(body["download_id"].is_string());
    }

    #[tokio::test]
    async fn integrity_failure_is_unprocessable() {
        let root = tempdir().unwrap();
        let tool = StubTool {
            write_nothing: true,
            ..StubTool::default()
        };
        let (app, _) = app(&root, tool, ExecutionMode::Sync);
        let (status, body) = send_json(
            app,
            post_json("/api/download", json!({"url": "https://v/x", "format_id": "22"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "INTEGRITY_ERROR");
    }

    #[tokio::test]
    async fn playlist_reports_counts() {
        let root = tempdir().unwrap();
        let (app, _) = app(
            &root,
            StubTool::failing(&["https://v/b"]),
            ExecutionMode::Async,
        );
        let (status, body) = send_json(
            app,
            post_json(
                "/api/download/playlist",
                json!({"urls": ["https://v/a", "https://v/b", "https://v/c"]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["success_count"], 2);
        assert_eq!(body["error_count"], 1);
        assert_eq!(body["errors"][0]["url"], "https://v/b");
        assert_eq!(body["files"], json!(["a.mp4", "c.mp4"]));
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_not_found() {
        let root = tempdir().unwrap();
        let (app, _) = app(&root, StubTool::default(), ExecutionMode::Async);
        for uri in [
            "/api/download/3f2b8f9e-1c1d-4c7e-9a57-0d4f5e0b6a11",
            "/api/download/not-a-session",
            "/api/download/3f2b8f9e-1c1d-4c7e-9a57-0d4f5e0b6a11/clip.mp4",
            "/api/status/3f2b8f9e-1c1d-4c7e-9a57-0d4f5e0b6a11",
        ] {
            let (status, body) = send_json(app.clone(), get(uri)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(body["code"], "NOT_FOUND");
        }
    }

    #[tokio::test]
    async fn traversal_in_filename_is_rejected() {
        let root = tempdir().unwrap();
        let (app, orchestrator) = app(&root, StubTool::default(), ExecutionMode::Async);
        let session = orchestrator.sessions().create_session().unwrap();
        let (status, body) = send_json(
            app,
            get(&format!("/api/download/{}/..%2F..%2Fsecret", session.id)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_NAME");
    }

    #[tokio::test]
    async fn sidecars_are_hidden_from_listing() {
        let root = tempdir().unwrap();
        let (app, orchestrator) = app(&root, StubTool::default(), ExecutionMode::Async);
        let session = orchestrator.sessions().create_session().unwrap();
        std::fs::write(session.dir.join("video.mp4"), b"v").unwrap();
        std::fs::write(session.dir.join("video.jpg"), b"j").unwrap();

        let (_, listing) = send_json(app, get(&format!("/api/download/{}", session.id))).await;
        assert_eq!(listing, json!({"files": ["video.mp4"]}));
    }

    #[test]
    fn content_disposition_escapes_non_ascii() {
        let value = content_disposition("été \"live\".mp3");
        assert_eq!(
            value,
            "attachment; filename=\"_t_ _live_.mp3\"; filename*=UTF-8''%C3%A9t%C3%A9%20%22live%22.mp3"
        );
    }
}
