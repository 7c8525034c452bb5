//! Process-level adapter around yt-dlp.
//!
//! Everything the service asks of the extraction tool goes through
//! [`MediaTool`]: a metadata probe, a download into a session directory, and a
//! self-update. [`YtDlp`] implements it by spawning the real binary; tests swap
//! in the stub from [`stub`].

use std::{
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::ToolConfig;
use crate::formats::BEST_AUDIO_SELECTOR;
use crate::probe::RawInfo;
use crate::translate::{TranslatedError, translate, translate_extraction};

/// Output template placed inside the session directory.
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
/// Title rewrites applied before the output template is filled in.
pub const TITLE_DOT_RUNS: &str = r"\.{2,}";
pub const TITLE_TRAILING_DOTS: &str = r"\.+$";
/// Codec and bitrate used when audio extraction is requested.
pub const AUDIO_CODEC: &str = "mp3";
pub const AUDIO_QUALITY: &str = "192K";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("could not launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    /// The tool ran and reported a failure; holds its stderr.
    #[error("{0}")]
    Failed(String),
    #[error("unreadable probe output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("the extraction tool returned no result")]
    Empty,
}

impl ToolError {
    pub fn translate(&self) -> TranslatedError {
        translate(&self.to_string())
    }

    /// Classification used when the failure came from a metadata probe.
    pub fn translate_extraction(&self) -> TranslatedError {
        translate_extraction(&self.to_string())
    }
}

/// Client-selectable switches for one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    pub extract_audio: bool,
    pub include_thumbnail: bool,
    pub include_subtitles: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            extract_audio: false,
            include_thumbnail: true,
            include_subtitles: false,
        }
    }
}

/// Post-processing step run by the tool after the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcessor {
    ExtractAudio {
        codec: &'static str,
        quality: &'static str,
    },
}

/// Fully resolved description of one tool invocation.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub output_dir: PathBuf,
    pub selector: String,
    pub write_thumbnail: bool,
    pub write_subtitles: bool,
    pub merge_output_format: Option<String>,
    pub post_processor: Option<PostProcessor>,
}

impl DownloadJob {
    /// Audio extraction overrides whatever selector the client chose.
    pub fn new(url: &str, output_dir: &Path, selector: &str, options: DownloadOptions) -> Self {
        let (selector, post_processor) = if options.extract_audio {
            (
                BEST_AUDIO_SELECTOR.to_owned(),
                Some(PostProcessor::ExtractAudio {
                    codec: AUDIO_CODEC,
                    quality: AUDIO_QUALITY,
                }),
            )
        } else {
            (selector.to_owned(), None)
        };

        Self {
            url: url.to_owned(),
            output_dir: output_dir.to_path_buf(),
            selector,
            write_thumbnail: options.include_thumbnail,
            write_subtitles: options.include_subtitles,
            merge_output_format: None,
            post_processor,
        }
    }

    pub fn merge_into(mut self, container: &str) -> Self {
        if self.post_processor.is_none() {
            self.merge_output_format = Some(container.to_owned());
        }
        self
    }

    pub fn output_template(&self) -> PathBuf {
        self.output_dir.join(OUTPUT_TEMPLATE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    AlreadyCurrent,
}

#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Resolves `url` without downloading anything.
    async fn probe(&self, url: &str) -> Result<RawInfo, ToolError>;
    /// Runs the transfer (and post-processing) described by `job`.
    async fn download(&self, job: &DownloadJob) -> Result<(), ToolError>;
    /// Upgrades the tool in place.
    async fn update(&self) -> Result<UpdateOutcome, ToolError>;
}

/// The real yt-dlp binary.
#[derive(Debug, Clone)]
pub struct YtDlp {
    config: ToolConfig,
}

impl YtDlp {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    pub fn program(&self) -> &Path {
        &self.config.program
    }

    /// Network, retry and cache flags shared by every invocation.
    fn common_args(&self) -> Vec<String> {
        let cfg = &self.config;
        let mut args = vec![
            "--user-agent".to_owned(),
            cfg.user_agent.clone(),
            "--referer".to_owned(),
            cfg.referer.clone(),
            "--socket-timeout".to_owned(),
            cfg.socket_timeout_seconds.to_string(),
            "--retries".to_owned(),
            cfg.retries.to_string(),
            "--fragment-retries".to_owned(),
            cfg.fragment_retries.to_string(),
        ];
        for header in &cfg.headers {
            args.push("--add-header".to_owned());
            args.push(header.clone());
        }
        if let Some(extractor_args) = &cfg.extractor_args {
            args.push("--extractor-args".to_owned());
            args.push(extractor_args.clone());
        }
        match &cfg.cache_dir {
            Some(dir) => {
                args.push("--cache-dir".to_owned());
                args.push(dir.to_string_lossy().into_owned());
            }
            None => args.push("--no-cache-dir".to_owned()),
        }
        if let Some(ffmpeg) = &cfg.ffmpeg_location {
            args.push("--ffmpeg-location".to_owned());
            args.push(ffmpeg.to_string_lossy().into_owned());
        }
        if let Some(cookies) = &cfg.cookies
            && cookies.exists()
        {
            args.push("--cookies".to_owned());
            args.push(cookies.to_string_lossy().into_owned());
        }
        args
    }

    pub fn probe_args(&self, url: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.extend(
            ["--dump-single-json", "--skip-download", "--no-progress", "--"]
                .map(str::to_owned),
        );
        args.push(url.to_owned());
        args
    }

    pub fn download_args(&self, job: &DownloadJob) -> Vec<String> {
        let mut args = self.common_args();
        args.push("--format".to_owned());
        args.push(job.selector.clone());
        args.push("--output".to_owned());
        args.push(job.output_template().to_string_lossy().into_owned());
        // File names containing ".." are refused by the file endpoint. The
        // template adds its own dot before the extension, so a title may
        // neither hold a run of dots nor end in one.
        args.extend(["--replace-in-metadata", "title", TITLE_DOT_RUNS, "."].map(str::to_owned));
        args.extend(["--replace-in-metadata", "title", TITLE_TRAILING_DOTS, ""].map(str::to_owned));
        args.extend(["--no-progress", "--newline"].map(str::to_owned));

        if job.write_thumbnail {
            args.push("--write-thumbnail".to_owned());
        }
        if job.write_subtitles {
            args.push("--write-subs".to_owned());
        }
        if let Some(container) = &job.merge_output_format {
            args.push("--merge-output-format".to_owned());
            args.push(container.clone());
        }
        match &job.post_processor {
            Some(PostProcessor::ExtractAudio { codec, quality }) => {
                args.push("--extract-audio".to_owned());
                args.push("--audio-format".to_owned());
                args.push((*codec).to_owned());
                args.push("--audio-quality".to_owned());
                args.push((*quality).to_owned());
            }
            None => {}
        }

        args.push("--".to_owned());
        args.push(job.url.clone());
        args
    }

    async fn run(&self, program: &Path, args: &[String]) -> Result<Output, ToolError> {
        debug!(program = %program.display(), ?args, "running extraction tool");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ToolError::Launch {
                program: program.display().to_string(),
                source,
            })
    }
}

#[async_trait]
impl MediaTool for YtDlp {
    async fn probe(&self, url: &str) -> Result<RawInfo, ToolError> {
        let output = self.run(&self.config.program, &self.probe_args(url)).await?;
        if !output.status.success() {
            return Err(failure_from(&output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Err(ToolError::Empty);
        }
        Ok(serde_json::from_str(trimmed)?)
    }

    async fn download(&self, job: &DownloadJob) -> Result<(), ToolError> {
        let output = self
            .run(&self.config.program, &self.download_args(job))
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(failure_from(&output))
        }
    }

    async fn update(&self) -> Result<UpdateOutcome, ToolError> {
        let Some((program, args)) = self.config.update_command.split_first() else {
            return Err(ToolError::Failed("no update command configured".to_owned()));
        };
        let output = self.run(Path::new(program), args).await?;
        if !output.status.success() {
            return Err(failure_from(&output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("Successfully installed") || stdout.contains("Updated yt-dlp") {
            Ok(UpdateOutcome::Updated)
        } else {
            Ok(UpdateOutcome::AlreadyCurrent)
        }
    }
}

/// Prefers the tool's own `ERROR:` lines, falling back to the exit status.
fn failure_from(output: &Output) -> ToolError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let errors: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("ERROR"))
        .collect();

    let message = if !errors.is_empty() {
        errors.join("\n")
    } else if !stderr.trim().is_empty() {
        stderr.trim().to_owned()
    } else {
        format!("extraction tool exited with {}", output.status)
    };
    ToolError::Failed(message)
}

#[cfg(test)]
pub mod stub {
    //! In-process stand-in for yt-dlp.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct StubTool {
        pub probe_json: Option<serde_json::Value>,
        /// Stderr reported for probes of `failing_urls`.
        pub probe_error: Option<String>,
        pub failing_urls: HashSet<String>,
        /// When set, downloads succeed without writing a primary file.
        pub write_nothing: bool,
        pub jobs: Mutex<Vec<DownloadJob>>,
        pub updates: AtomicUsize,
    }

    impl StubTool {
        pub fn failing(urls: &[&str]) -> Self {
            Self {
                failing_urls: urls.iter().map(|url| url.to_string()).collect(),
                ..Self::default()
            }
        }

        pub fn update_count(&self) -> usize {
            self.updates.load(Ordering::SeqCst)
        }
    }

    /// File name the stub writes for `url`: its last path/query segment.
    pub fn stub_file_name(url: &str, extract_audio: bool) -> String {
        let stem = url
            .rsplit(['/', '='])
            .find(|part| !part.is_empty())
            .unwrap_or("media");
        let ext = if extract_audio { AUDIO_CODEC } else { "mp4" };
        format!("{stem}.{ext}")
    }

    #[async_trait]
    impl MediaTool for StubTool {
        async fn probe(&self, url: &str) -> Result<RawInfo, ToolError> {
            if self.failing_urls.contains(url) {
                let message = self
                    .probe_error
                    .clone()
                    .unwrap_or_else(|| "ERROR: Video unavailable".into());
                return Err(ToolError::Failed(message));
            }
            match &self.probe_json {
                Some(json) => Ok(serde_json::from_value(json.clone())?),
                None => Err(ToolError::Empty),
            }
        }

        async fn download(&self, job: &DownloadJob) -> Result<(), ToolError> {
            self.jobs.lock().push(job.clone());
            if self.failing_urls.contains(&job.url) {
                return Err(ToolError::Failed(format!(
                    "ERROR: Unsupported URL: {}",
                    job.url
                )));
            }
            if job.write_thumbnail {
                std::fs::write(job.output_dir.join("cover.jpg"), b"jpeg").unwrap();
            }
            if !self.write_nothing {
                let name = stub_file_name(&job.url, job.post_processor.is_some());
                std::fs::write(job.output_dir.join(name), b"media").unwrap();
            }
            Ok(())
        }

        async fn update(&self) -> Result<UpdateOutcome, ToolError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(UpdateOutcome::AlreadyCurrent)
        }
    }
}
