//! Turns download requests into tool invocations inside fresh sessions.
//!
//! Single downloads run either inline or as a detached task depending on the
//! configured [`ExecutionMode`]. Playlists always run inline: every URL is
//! fetched into one shared session and failures are collected per URL instead
//! of aborting the batch.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::ExecutionMode;
use crate::error::ServiceError;
use crate::formats::BEST_SELECTOR;
use crate::index::{SessionFailure, SessionStatus};
use crate::lifecycle::{SessionError, SessionId, SessionManager};
use crate::translate::{translate, truncate_chars};
use crate::ytdlp::{DownloadJob, DownloadOptions, MediaTool};

/// Container every playlist item is merged into.
pub const PLAYLIST_MERGE_FORMAT: &str = "mp4";
/// Per-URL error text in playlist results is cut to this many characters.
pub const PLAYLIST_ERROR_LIMIT: usize = 100;

const INTEGRITY_CODE: &str = "INTEGRITY_ERROR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DownloadAccepted {
    /// Running in the background; poll the status or listing endpoints.
    Downloading { download_id: String },
    Completed {
        download_id: String,
        filename: String,
    },
}

impl DownloadAccepted {
    pub fn download_id(&self) -> &str {
        match self {
            DownloadAccepted::Downloading { download_id }
            | DownloadAccepted::Completed { download_id, .. } => download_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistError {
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistOutcome {
    pub status: &'static str,
    pub download_id: String,
    pub files: Vec<String>,
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<PlaylistError>,
}

pub struct DownloadOrchestrator {
    sessions: Arc<SessionManager>,
    tool: Arc<dyn MediaTool>,
    mode: ExecutionMode,
}

impl DownloadOrchestrator {
    pub fn new(sessions: Arc<SessionManager>, tool: Arc<dyn MediaTool>, mode: ExecutionMode) -> Self {
        Self {
            sessions,
            tool,
            mode,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn tool(&self) -> &dyn MediaTool {
        self.tool.as_ref()
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub async fn start_single(
        &self,
        url: &str,
        selector: &str,
        options: DownloadOptions,
    ) -> Result<DownloadAccepted, ServiceError> {
        let (url, selector) = (url.trim(), selector.trim());
        if url.is_empty() || selector.is_empty() {
            return Err(ServiceError::validation("URL and format_id are required"));
        }

        let session = with_sessions(&self.sessions, |sessions| sessions.create_session()).await?;
        let download_id = session.id.to_string();
        let job = DownloadJob::new(url, &session.dir, selector, options);
        info!(session = %session.id, url, selector = %job.selector, mode = %self.mode, "download accepted");

        match self.mode {
            ExecutionMode::Sync => {
                let filename = execute(&self.sessions, self.tool.as_ref(), session.id, &job).await?;
                Ok(DownloadAccepted::Completed {
                    download_id,
                    filename,
                })
            }
            ExecutionMode::Async => {
                let sessions = Arc::clone(&self.sessions);
                let tool = Arc::clone(&self.tool);
                let id = session.id;
                tokio::spawn(async move {
                    match execute(&sessions, tool.as_ref(), id, &job).await {
                        Ok(filename) => info!(session = %id, filename, "download finished"),
                        Err(err) => warn!(session = %id, error = %err, "background download failed"),
                    }
                });
                Ok(DownloadAccepted::Downloading { download_id })
            }
        }
    }

    pub async fn start_playlist(
        &self,
        urls: &[String],
        selector: &str,
        options: DownloadOptions,
    ) -> Result<PlaylistOutcome, ServiceError> {
        if urls.is_empty() {
            return Err(ServiceError::validation("at least one URL is required"));
        }
        if urls.iter().any(|url| url.trim().is_empty()) {
            return Err(ServiceError::validation("playlist URLs must not be blank"));
        }
        let selector = match selector.trim() {
            "" => BEST_SELECTOR,
            chosen => chosen,
        };

        let session = with_sessions(&self.sessions, |sessions| sessions.create_session()).await?;
        let id = session.id;
        info!(session = %id, count = urls.len(), selector, "playlist download started");
        record(&self.sessions, id, SessionStatus::Running, None).await;

        let mut success_count = 0;
        let mut errors = Vec::new();
        for url in urls {
            let url = url.trim();
            let job = DownloadJob::new(url, &session.dir, selector, options)
                .merge_into(PLAYLIST_MERGE_FORMAT);
            match self.tool.download(&job).await {
                Ok(()) => success_count += 1,
                Err(err) => {
                    warn!(session = %id, url, error = %err, "playlist item failed");
                    errors.push(PlaylistError {
                        url: url.to_owned(),
                        error: truncate_chars(&err.to_string(), PLAYLIST_ERROR_LIMIT),
                    });
                }
            }
        }

        let download_id = id.to_string();
        let listing_id = download_id.clone();
        let files = with_sessions(&self.sessions, move |sessions| {
            sessions.list_artifacts(&listing_id)
        })
        .await?;

        match errors.first() {
            Some(first) if success_count == 0 => {
                let failure = SessionFailure::from(&translate(&first.error));
                record(&self.sessions, id, SessionStatus::Failed, Some(failure)).await;
            }
            _ => record(&self.sessions, id, SessionStatus::Done, None).await,
        }

        info!(
            session = %id,
            success_count,
            error_count = errors.len(),
            "playlist download finished"
        );
        Ok(PlaylistOutcome {
            status: "completed",
            download_id,
            files,
            success_count,
            error_count: errors.len(),
            errors,
        })
    }
}

/// Runs one job to completion and keeps the session status in step. Returns
/// the first primary artifact.
async fn execute(
    sessions: &Arc<SessionManager>,
    tool: &dyn MediaTool,
    id: SessionId,
    job: &DownloadJob,
) -> Result<String, ServiceError> {
    record(sessions, id, SessionStatus::Running, None).await;

    if let Err(err) = tool.download(job).await {
        let translated = err.translate();
        record(
            sessions,
            id,
            SessionStatus::Failed,
            Some(SessionFailure::from(&translated)),
        )
        .await;
        return Err(ServiceError::Download(translated));
    }

    let listing_id = id.to_string();
    let files = with_sessions(sessions, move |sessions| sessions.list_artifacts(&listing_id)).await?;
    match files.into_iter().next() {
        Some(filename) => {
            record(sessions, id, SessionStatus::Done, None).await;
            Ok(filename)
        }
        None => {
            let failure = SessionFailure::new(
                INTEGRITY_CODE,
                ServiceError::Integrity.to_string(),
            );
            record(sessions, id, SessionStatus::Failed, Some(failure)).await;
            Err(ServiceError::Integrity)
        }
    }
}

/// Runs filesystem and index work off the async executor.
pub(crate) async fn with_sessions<T, F>(
    sessions: &Arc<SessionManager>,
    work: F,
) -> Result<T, ServiceError>
where
    F: FnOnce(&SessionManager) -> Result<T, SessionError> + Send + 'static,
    T: Send + 'static,
{
    let sessions = Arc::clone(sessions);
    Ok(tokio::task::spawn_blocking(move || work(&sessions)).await??)
}

async fn record(
    sessions: &Arc<SessionManager>,
    id: SessionId,
    status: SessionStatus,
    failure: Option<SessionFailure>,
) {
    let result = with_sessions(sessions, move |sessions| {
        sessions.record_status(&id, status, failure.as_ref());
        Ok(())
    })
    .await;
    if let Err(err) = result {
        warn!(session = %id, %status, error = %err, "status update did not run");
    }
}
