use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{
    fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/redstream.toml";
pub const DEFAULT_DOWNLOAD_ROOT: &str = "downloads";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_FILE_EXPIRY_MINUTES: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 300;
pub const DEFAULT_UPDATE_INTERVAL_HOURS: u64 = 24;
pub const DEFAULT_TOOL: &str = "yt-dlp";
pub const DEFAULT_CACHE_DIR: &str = "/tmp/yt-dlp-cache";
pub const INDEX_FILE_NAME: &str = "sessions.db";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const DEFAULT_REFERER: &str = "https://www.youtube.com";

/// Whether download requests wait for the tool or return at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sync,
    #[default]
    Async,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Sync => "sync",
            ExecutionMode::Async => "async",
        })
    }
}

impl FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(ExecutionMode::Sync),
            "async" => Ok(ExecutionMode::Async),
            other => Err(anyhow!("unknown execution mode {other:?} (expected sync or async)")),
        }
    }
}

/// How the extraction tool is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    pub program: PathBuf,
    pub user_agent: String,
    pub referer: String,
    /// Extra request headers in yt-dlp's `Field:Value` form.
    pub headers: Vec<String>,
    pub extractor_args: Option<String>,
    pub socket_timeout_seconds: u64,
    pub retries: u32,
    pub fragment_retries: u32,
    pub cache_dir: Option<PathBuf>,
    pub ffmpeg_location: Option<PathBuf>,
    pub cookies: Option<PathBuf>,
    /// Program followed by its arguments.
    pub update_command: Vec<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_TOOL),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: DEFAULT_REFERER.to_string(),
            headers: vec![
                "Accept-Language:en-US,en;q=0.9".to_string(),
                "Accept-Encoding:gzip, deflate".to_string(),
                "Accept:text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"
                    .to_string(),
            ],
            extractor_args: Some("youtube:lang=en;skip=hls,dash".to_string()),
            socket_timeout_seconds: 30,
            retries: 5,
            fragment_retries: 10,
            cache_dir: Some(PathBuf::from(DEFAULT_CACHE_DIR)),
            ffmpeg_location: None,
            cookies: None,
            update_command: vec![DEFAULT_TOOL.to_string(), "-U".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub download_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub file_expiry_minutes: u64,
    pub sweep_interval_seconds: u64,
    pub update_interval_hours: u64,
    pub auto_update: bool,
    pub execution_mode: ExecutionMode,
    /// Defaults to `sessions.db` inside the download root.
    pub index_path: Option<PathBuf>,
    pub tool: ToolConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from(DEFAULT_DOWNLOAD_ROOT),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            file_expiry_minutes: DEFAULT_FILE_EXPIRY_MINUTES,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
            update_interval_hours: DEFAULT_UPDATE_INTERVAL_HOURS,
            auto_update: true,
            execution_mode: ExecutionMode::default(),
            index_path: None,
            tool: ToolConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn file_expiry(&self) -> Duration {
        Duration::from_secs(self.file_expiry_minutes * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// `None` when self-update is switched off.
    pub fn update_interval(&self) -> Option<Duration> {
        self.auto_update
            .then(|| Duration::from_secs(self.update_interval_hours * 3600))
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.download_root.join(INDEX_FILE_NAME))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_root.as_os_str().is_empty() {
            bail!("download_root must not be empty");
        }
        if self.file_expiry_minutes == 0 {
            bail!("file_expiry_minutes must be greater than zero");
        }
        if self.sweep_interval_seconds == 0 {
            bail!("sweep_interval_seconds must be greater than zero");
        }
        if self.auto_update && self.update_interval_hours == 0 {
            bail!("update_interval_hours must be greater than zero");
        }
        if self.tool.update_command.is_empty() && self.auto_update {
            bail!("tool.update_command must not be empty when auto_update is on");
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Applies `REDSTREAM_*` overrides. `lookup` abstracts the environment so
    /// tests do not have to mutate the real one.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = var("REDSTREAM_DOWNLOAD_ROOT") {
            self.download_root = PathBuf::from(value);
        }
        if let Some(value) = var("REDSTREAM_HOST") {
            self.host = value;
        }
        if let Some(value) = var("REDSTREAM_PORT") {
            self.port = parse_var("REDSTREAM_PORT", &value)?;
        }
        if let Some(value) = var("REDSTREAM_FILE_EXPIRY_MINUTES") {
            self.file_expiry_minutes = parse_var("REDSTREAM_FILE_EXPIRY_MINUTES", &value)?;
        }
        if let Some(value) = var("REDSTREAM_SWEEP_INTERVAL_SECONDS") {
            self.sweep_interval_seconds = parse_var("REDSTREAM_SWEEP_INTERVAL_SECONDS", &value)?;
        }
        if let Some(value) = var("REDSTREAM_UPDATE_INTERVAL_HOURS") {
            self.update_interval_hours = parse_var("REDSTREAM_UPDATE_INTERVAL_HOURS", &value)?;
        }
        if let Some(value) = var("REDSTREAM_EXECUTION_MODE") {
            self.execution_mode = value.parse()?;
        }
        if let Some(value) = var("REDSTREAM_YTDLP") {
            self.tool.program = PathBuf::from(value);
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Parsing {key} from environment"))
}

pub fn read_config_file(path: &Path) -> Result<Option<ServiceConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let cfg = toml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))?;
    Ok(Some(cfg))
}

/// File, then environment. An explicitly named file must exist; the default
/// location is optional.
pub fn load_service_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let mut cfg = match path {
        Some(path) => read_config_file(path)?
            .ok_or_else(|| anyhow!("Missing config file at {}", path.display()))?,
        None => read_config_file(Path::new(DEFAULT_CONFIG_PATH))?.unwrap_or_default(),
    };
    cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = ServiceConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.file_expiry(), Duration::from_secs(30 * 60));
        assert_eq!(cfg.index_path(), PathBuf::from("downloads/sessions.db"));
        assert_eq!(cfg.update_interval(), Some(Duration::from_secs(24 * 3600)));
        assert_eq!(cfg.execution_mode, ExecutionMode::Async);
    }

    #[test]
    fn read_config_file_fills_missing_fields() {
        let file = make_config(
            "download_root = \"/srv/dl\"\nport = 9000\nexecution_mode = \"sync\"\n\n[tool]\nprogram = \"/opt/yt-dlp\"\n",
        );
        let cfg = read_config_file(file.path()).unwrap().unwrap();
        assert_eq!(cfg.download_root, PathBuf::from("/srv/dl"));
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.execution_mode, ExecutionMode::Sync);
        assert_eq!(cfg.tool.program, PathBuf::from("/opt/yt-dlp"));
        assert_eq!(cfg.tool.retries, 5);
        assert_eq!(cfg.host, DEFAULT_HOST);
    }

    #[test]
    fn read_config_file_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_config_file(&dir.path().join("absent.toml")).unwrap().is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = make_config("download_rot = \"/typo\"\n");
        assert!(read_config_file(file.path()).is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_service_config(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("Missing config file"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut cfg = ServiceConfig {
            port: 9000,
            ..ServiceConfig::default()
        };
        cfg.apply_env_overrides(env(&[
            ("REDSTREAM_PORT", "7000"),
            ("REDSTREAM_EXECUTION_MODE", "SYNC"),
            ("REDSTREAM_DOWNLOAD_ROOT", "/data"),
            ("REDSTREAM_HOST", "  "),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.execution_mode, ExecutionMode::Sync);
        assert_eq!(cfg.download_root, PathBuf::from("/data"));
        assert_eq!(cfg.host, DEFAULT_HOST);
    }

    #[test]
    fn bad_env_values_name_the_variable() {
        let mut cfg = ServiceConfig::default();
        let err = cfg
            .apply_env_overrides(env(&[("REDSTREAM_PORT", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("REDSTREAM_PORT"));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let cfg = ServiceConfig {
            sweep_interval_seconds: 0,
            ..ServiceConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ServiceConfig {
            file_expiry_minutes: 0,
            ..ServiceConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ServiceConfig {
            update_interval_hours: 0,
            auto_update: false,
            ..ServiceConfig::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.update_interval(), None);
    }

    #[test]
    fn explicit_index_path_is_kept() {
        let cfg = ServiceConfig {
            index_path: Some(PathBuf::from("/var/lib/redstream/index.db")),
            ..ServiceConfig::default()
        };
        assert_eq!(cfg.index_path(), PathBuf::from("/var/lib/redstream/index.db"));
    }
}
