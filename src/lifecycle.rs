//! Ownership of download session directories.
//!
//! Every accepted download gets its own directory `root/<uuid>`. The directory
//! is the whole session: yt-dlp writes into it, the file endpoints read from
//! it, and the sweep deletes it once it is older than the configured expiry.
//!
//! A session's age is measured from the earlier of its recorded creation time
//! (when a [`SessionIndex`] is attached) and the directory's mtime. Writes into
//! the directory therefore never postpone eviction, and directories the index
//! has never heard of still age out.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::index::{SessionFailure, SessionIndex, SessionRecord, SessionStatus};

/// Extensions of thumbnail/subtitle sidecars and of yt-dlp's partial files.
/// None of these are offered to clients as downloadable artifacts.
pub const SIDECAR_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "vtt", "srt", "ass", "lrc", "part", "ytdl",
];

/// Evicted directories are renamed to this prefix before being deleted so the
/// live path disappears in a single step.
const STAGING_PREFIX: &str = ".evicting-";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{operation} failed for {}", path.display())]
    Storage {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{what} not found")]
    NotFound { what: &'static str },
    #[error("invalid file name {0:?}")]
    InvalidName(String),
}

impl SessionError {
    fn storage(operation: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Storage {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }

    fn download_not_found() -> Self {
        Self::NotFound { what: "download" }
    }
}

/// Random 128-bit session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Accepts only the canonical lowercase hyphenated rendering produced by
    /// [`SessionId::generate`]. Anything else, including traversal attempts,
    /// cannot name a session and is reported as not found.
    pub fn parse(value: &str) -> Result<Self, SessionError> {
        let uuid = Uuid::parse_str(value).map_err(|_| SessionError::download_not_found())?;
        let id = Self(uuid);
        if id.to_string() != value {
            return Err(SessionError::download_not_found());
        }
        Ok(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// A freshly created, empty session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub dir: PathBuf,
}

/// A session that is past its expiry.
#[derive(Debug, Clone)]
pub struct ExpiredSession {
    pub id: SessionId,
    pub path: PathBuf,
    pub age: Duration,
}

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub removed: Vec<SessionId>,
    pub retained: usize,
    pub failed: usize,
    pub purged_staging: usize,
}

enum RootEntry {
    Session(SessionId, PathBuf),
    Staged(PathBuf),
}

#[derive(Debug)]
pub struct SessionManager {
    root: PathBuf,
    expiry: Duration,
    index: Option<Arc<SessionIndex>>,
}

impl SessionManager {
    pub fn new(root: impl Into<PathBuf>, expiry: Duration) -> Self {
        Self {
            root: root.into(),
            expiry,
            index: None,
        }
    }

    pub fn with_index(mut self, index: Arc<SessionIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Allocates a new session directory. The directory exists on return, so
    /// callers may hand its path to the downloader straight away.
    pub fn create_session(&self) -> Result<Session, SessionError> {
        fs::create_dir_all(&self.root)
            .map_err(|err| SessionError::storage("creating download root", &self.root, err))?;

        let id = SessionId::generate();
        let dir = self.session_dir(&id);
        fs::create_dir(&dir)
            .map_err(|err| SessionError::storage("creating session directory", &dir, err))?;

        if let Some(index) = &self.index
            && let Err(err) = index.insert(&id.to_string(), Utc::now())
        {
            warn!(session = %id, error = %err, "could not index new session");
        }

        debug!(session = %id, dir = %dir.display(), "session created");
        Ok(Session { id, dir })
    }

    /// Maps a session id (and optionally a file inside it) to an existing path.
    pub fn resolve(&self, id: &str, filename: Option<&str>) -> Result<PathBuf, SessionError> {
        let id = SessionId::parse(id)?;
        if let Some(name) = filename {
            validate_filename(name)?;
        }

        let dir = self.session_dir(&id);
        if !dir.is_dir() {
            return Err(SessionError::download_not_found());
        }

        match filename {
            None => Ok(dir),
            Some(name) => {
                let path = dir.join(name);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(SessionError::NotFound { what: "file" })
                }
            }
        }
    }

    /// Primary artifacts directly inside the session directory, sorted by name.
    /// Every listed name resolves through [`SessionManager::resolve`].
    pub fn list_artifacts(&self, id: &str) -> Result<Vec<String>, SessionError> {
        let dir = self.resolve(id, None)?;
        let entries = fs::read_dir(&dir).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => SessionError::download_not_found(),
            _ => SessionError::storage("listing session directory", &dir, err),
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| SessionError::storage("reading session entry", &dir, err))?;
            let is_file = entry.file_type().map(|kind| kind.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_sidecar(&name) {
                continue;
            }
            if validate_filename(&name).is_err() {
                warn!(dir = %dir.display(), file = %name, "skipping artifact that cannot be served");
                continue;
            }
            files.push(name);
        }

        files.sort();
        Ok(files)
    }

    /// Records a status transition. Index failures are logged only; the
    /// download itself is unaffected by bookkeeping problems.
    pub fn record_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        failure: Option<&SessionFailure>,
    ) {
        if let Some(index) = &self.index
            && let Err(err) = index.set_status(&id.to_string(), status, failure)
        {
            warn!(session = %id, %status, error = %err, "could not record session status");
        }
    }

    /// Current status of a session. Sessions missing from the index (or a
    /// manager running without one) are described from the directory alone.
    pub fn status(&self, id: &str) -> Result<SessionRecord, SessionError> {
        let dir = self.resolve(id, None)?;
        let parsed = SessionId::parse(id)?;

        if let Some(index) = &self.index {
            match index.get(id) {
                Ok(Some(record)) => return Ok(record),
                Ok(None) => {}
                Err(err) => warn!(session = %parsed, error = %err, "could not read session index"),
            }
        }

        let modified = fs::metadata(&dir)
            .and_then(|meta| meta.modified())
            .map_err(|err| SessionError::storage("reading session metadata", &dir, err))?;
        let modified = DateTime::<Utc>::from(modified);
        let status = if self.list_artifacts(id)?.is_empty() {
            SessionStatus::Pending
        } else {
            SessionStatus::Done
        };

        Ok(SessionRecord {
            download_id: parsed.to_string(),
            status,
            error: None,
            created_at: modified,
            updated_at: modified,
        })
    }

    /// Sessions whose age exceeds the expiry at `now`, without touching them.
    pub fn expired_sessions(&self, now: SystemTime) -> Vec<ExpiredSession> {
        self.scan_root()
            .into_iter()
            .filter_map(|entry| match entry {
                RootEntry::Session(id, path) => {
                    let age = self.age(&id, &path, now)?;
                    (age > self.expiry).then_some(ExpiredSession { id, path, age })
                }
                RootEntry::Staged(_) => None,
            })
            .collect()
    }

    /// Removes every expired session. Each directory is handled on its own:
    /// a failure is logged and counted, and the pass moves on.
    pub fn sweep(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        let mut staged = Vec::new();

        for entry in self.scan_root() {
            match entry {
                RootEntry::Staged(path) => staged.push(path),
                RootEntry::Session(id, path) => match self.evict_if_expired(&id, &path, now) {
                    Ok(true) => report.removed.push(id),
                    Ok(false) => report.retained += 1,
                    Err(err) => {
                        warn!(session = %id, error = %err, "could not evict session");
                        report.failed += 1;
                    }
                },
            }
        }

        // Purged after eviction so leftovers from this pass go too.
        for path in staged {
            match fs::remove_dir_all(&path) {
                Ok(()) => report.purged_staging += 1,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "could not purge staged session");
                    report.failed += 1;
                }
            }
        }

        self.forget_vanished_sessions();

        if !report.removed.is_empty() || report.failed > 0 {
            info!(
                removed = report.removed.len(),
                retained = report.retained,
                failed = report.failed,
                "eviction sweep finished"
            );
        }
        report
    }

    fn evict_if_expired(
        &self,
        id: &SessionId,
        path: &Path,
        now: SystemTime,
    ) -> Result<bool, SessionError> {
        // Re-read the age right before acting; the scan may be stale.
        let Some(age) = self.age(id, path, now) else {
            return Ok(false);
        };
        if age <= self.expiry {
            return Ok(false);
        }

        let staged = self.root.join(format!("{STAGING_PREFIX}{id}"));
        fs::rename(path, &staged)
            .map_err(|err| SessionError::storage("staging expired session", path, err))?;

        if let Err(err) = fs::remove_dir_all(&staged) {
            // The live path is already gone; the next pass purges the rest.
            warn!(session = %id, error = %err, "expired session left in staging");
        }

        if let Some(index) = &self.index
            && let Err(err) = index.remove(&id.to_string())
        {
            warn!(session = %id, error = %err, "could not drop evicted session from index");
        }

        info!(session = %id, age_minutes = age.as_secs() / 60, "evicted expired session");
        Ok(true)
    }

    fn age(&self, id: &SessionId, path: &Path, now: SystemTime) -> Option<Duration> {
        let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok();
        let recorded = self.index.as_ref().and_then(|index| {
            index
                .created_at(&id.to_string())
                .map_err(|err| warn!(session = %id, error = %err, "could not read creation time"))
                .ok()
                .flatten()
                .map(SystemTime::from)
        });

        let born = match (modified, recorded) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return None,
        };
        Some(now.duration_since(born).unwrap_or(Duration::ZERO))
    }

    fn scan_root(&self) -> Vec<RootEntry> {
        if !self.root.is_dir() {
            return Vec::new();
        }

        WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(error = %err, "could not read download root entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?;
                if name.starts_with(STAGING_PREFIX) {
                    return Some(RootEntry::Staged(entry.path().to_path_buf()));
                }
                let id = SessionId::parse(name).ok()?;
                Some(RootEntry::Session(id, entry.path().to_path_buf()))
            })
            .collect()
    }

    fn forget_vanished_sessions(&self) {
        let Some(index) = &self.index else {
            return;
        };
        let ids = match index.ids() {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "could not list indexed sessions");
                return;
            }
        };
        for id in ids {
            if self.root.join(&id).is_dir() {
                continue;
            }
            if let Err(err) = index.remove(&id) {
                warn!(session = %id, error = %err, "could not drop vanished session from index");
            }
        }
    }
}

/// True for thumbnails, subtitles and other files hidden from listings.
pub fn is_sidecar(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SIDECAR_EXTENSIONS
                .iter()
                .any(|sidecar| ext.eq_ignore_ascii_case(sidecar))
        })
}

/// A file name must be one plain path component.
fn validate_filename(name: &str) -> Result<(), SessionError> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !name.contains("..");
    if plain {
        Ok(())
    } else {
        Err(SessionError::InvalidName(name.to_owned()))
    }
}
