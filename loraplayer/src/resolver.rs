//! Turns page URLs into directly playable stream URLs by running an
//! external resolver (yt-dlp compatible command line).

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::ResolveError;
use crate::process::ProcessHandle;
use crate::settings::ResolverSettings;

const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";
const SHORT_ID_LEN: usize = 11;
const FORMAT_UNAVAILABLE: &str = "Requested format is not available";
const KILL_GRACE: Duration = Duration::from_millis(200);

/// One `play()` call, as seen by the resolver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackRequest {
    raw_url: String,
    normalized_url: String,
    is_playlist: bool,
}

impl PlaybackRequest {
    /// Request for the resolver: short video ids are expanded.
    pub fn new(raw_url: &str) -> Self {
        let normalized_url = normalize_url(raw_url);
        let is_playlist = looks_like_playlist(&normalized_url);
        Self {
            raw_url: raw_url.to_string(),
            normalized_url,
            is_playlist,
        }
    }

    /// Request handed to the engine as is.
    pub fn direct(raw_url: &str) -> Self {
        Self {
            raw_url: raw_url.to_string(),
            normalized_url: raw_url.trim().to_string(),
            is_playlist: false,
        }
    }

    pub fn raw_url(&self) -> &str {
        &self.raw_url
    }

    pub fn normalized_url(&self) -> &str {
        &self.normalized_url
    }

    pub fn is_playlist(&self) -> bool {
        self.is_playlist
    }
}

/// URLs the engine can play directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedStream {
    pub primary_url: String,
    pub additional_urls: Vec<String>,
    /// Page the stream was extracted from, sent as `Referer`.
    pub referer: Option<String>,
}

impl ResolvedStream {
    pub fn direct(url: &str) -> Self {
        Self {
            primary_url: url.to_string(),
            additional_urls: Vec::new(),
            referer: None,
        }
    }
}

pub fn is_short_id(value: &str) -> bool {
    value.len() == SHORT_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Trims the input and expands bare 11-character video ids to a watch URL.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if is_short_id(trimmed) {
        format!("{WATCH_URL_PREFIX}{trimmed}")
    } else {
        trimmed.to_string()
    }
}

pub fn looks_like_playlist(url: &str) -> bool {
    url.contains("list=") || url.contains("playlist")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatMode {
    /// Explicit audio format selector plus HLS hints.
    Preferred,
    /// Generic "print the URL" invocation.
    Reduced,
}

/// Argument list for one resolver run. The target URL is always last.
pub fn build_args(
    request: &PlaybackRequest,
    mode: FormatMode,
    cookies_file: Option<&PathBuf>,
) -> Vec<String> {
    let mut args = vec!["-g".to_string()];
    if mode == FormatMode::Preferred {
        args.extend(
            ["-f", "bestaudio/best", "--hls-prefer-ffmpeg", "--hls-use-mpegts"]
                .map(String::from),
        );
    }
    args.push(
        if request.is_playlist() {
            "--yes-playlist"
        } else {
            "--no-playlist"
        }
        .to_string(),
    );
    if let Some(cookies) = cookies_file {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }
    args.push(request.normalized_url().to_string());
    args
}

/// Raw result of one resolver run.
#[derive(Debug, Default)]
pub struct ResolverOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ResolverOutput {
    /// Whether a second run with the reduced argument set is worth it.
    pub fn wants_fallback(&self) -> bool {
        self.stdout.trim().is_empty() || self.stderr.contains(FORMAT_UNAVAILABLE)
    }

    pub fn parse(&self, referer: &str) -> Result<ResolvedStream, ResolveError> {
        let mut lines = self
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty());

        let Some(primary) = lines.next() else {
            return Err(ResolveError::EmptyOutput {
                stderr: self.stderr.clone(),
            });
        };
        if !(primary.starts_with("http://") || primary.starts_with("https://")) {
            return Err(ResolveError::UnexpectedOutput(primary.to_string()));
        }

        Ok(ResolvedStream {
            primary_url: primary.to_string(),
            additional_urls: lines.map(str::to_string).collect(),
            referer: Some(referer.to_string()),
        })
    }
}

/// Outcome of a background resolution, tagged with the request generation.
#[derive(Debug)]
pub struct ResolveOutcome {
    pub generation: u64,
    pub request: PlaybackRequest,
    pub result: Result<ResolvedStream, ResolveError>,
}

struct ResolveJob {
    generation: u64,
    task: JoinHandle<()>,
}

/// Runs the resolver, at most one job at a time.
pub struct ResolverClient {
    settings: ResolverSettings,
    current: Option<ResolveJob>,
}

impl ResolverClient {
    pub fn new(settings: ResolverSettings) -> Self {
        Self {
            settings,
            current: None,
        }
    }

    /// Starts resolving `request` in the background, killing any previous
    /// job. The outcome is posted on `outcomes`.
    pub fn begin(
        &mut self,
        request: PlaybackRequest,
        generation: u64,
        outcomes: UnboundedSender<ResolveOutcome>,
    ) {
        self.cancel();

        let settings = self.settings.clone();
        let task = tokio::spawn(async move {
            let result = resolve(&settings, &request).await;
            let _ = outcomes.send(ResolveOutcome {
                generation,
                request,
                result,
            });
        });
        self.current = Some(ResolveJob { generation, task });
    }

    /// Kills the running job, if any. Its outcome is never posted.
    pub fn cancel(&mut self) {
        if let Some(job) = self.current.take() {
            if !job.task.is_finished() {
                info!(generation = job.generation, "Killing superseded resolver run");
                job.task.abort();
            }
        }
    }
}

impl Drop for ResolverClient {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Full resolution: preferred run, then at most one reduced run.
pub async fn resolve(
    settings: &ResolverSettings,
    request: &PlaybackRequest,
) -> Result<ResolvedStream, ResolveError> {
    let cookies = settings.cookies_file.as_ref();
    info!(url = %request.normalized_url(), playlist = request.is_playlist(), "Resolving stream");

    let args = build_args(request, FormatMode::Preferred, cookies);
    let mut output = run_once(settings, &args).await?;

    if output.wants_fallback() {
        warn!(
            url = %request.normalized_url(),
            "Preferred format unavailable, retrying without format selector"
        );
        let args = build_args(request, FormatMode::Reduced, cookies);
        output = run_once(settings, &args).await?;
    }

    let stream = output.parse(request.normalized_url())?;
    debug!(
        primary = %stream.primary_url,
        additional = stream.additional_urls.len(),
        "Stream resolved"
    );
    Ok(stream)
}

async fn run_once(
    settings: &ResolverSettings,
    args: &[String],
) -> Result<ResolverOutput, ResolveError> {
    debug!(program = %settings.program.display(), ?args, "Running resolver");
    let mut process = ProcessHandle::start(&settings.program, args)?;
    let stdout = process.take_stdout();
    let stderr = process.take_stderr();

    let collected = tokio::time::timeout(settings.timeout, async {
        let (stdout, stderr) = tokio::try_join!(drain(stdout), drain(stderr))?;
        let exit = process.wait().await;
        Ok::<_, std::io::Error>((stdout, stderr, exit))
    })
    .await;

    match collected {
        Ok(Ok((stdout, stderr, exit))) => {
            debug!(code = ?exit.code, "Resolver finished");
            if !stderr.trim().is_empty() {
                debug!(stderr = %stderr.trim(), "Resolver diagnostics");
            }
            Ok(ResolverOutput { stdout, stderr })
        }
        Ok(Err(err)) => {
            process.kill();
            Err(err.into())
        }
        Err(_) => {
            warn!(timeout = ?settings.timeout, "Resolver timed out, killing it");
            process.kill();
            process.wait_for_exit(KILL_GRACE).await;
            Err(ResolveError::Timeout(settings.timeout))
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut buffer = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buffer).await?;
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
