#![forbid(unsafe_code)]

//! Drives the external downloader through an info-fetch phase and a download
//! phase, then post-processes the acquired files.
//!
//! One call owns one job from start to finish. The video download runs as a
//! child process whose stdout and stderr are read incrementally so progress
//! lines reach the [`ProgressSink`] while the transfer is still running; a
//! wall-clock timeout races the readers in the same `select!` loop. A failed
//! video download triggers exactly one audio-only fallback attempt before
//! the job is declared failed. Post-processing failures (audio extraction,
//! description, thumbnail, sidecar) never change a successful outcome.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::MediaConfig;
use crate::error::{PipelineError, Result};
use crate::extract::extract_audio;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::sanitize::{DEFAULT_MAX_FILENAME_LEN, sanitize_filename};
use crate::sidecar::{MetadataSidecar, write_sidecar};
use crate::storage::{REQUIRED_FREE_BYTES, ensure_writable_directory, has_free_space};

const INFO_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(1800);
const AUDIO_FALLBACK_TIMEOUT: Duration = Duration::from_secs(600);
const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(10);

/// Outputs smaller than this are treated as corrupt.
const MIN_PLAUSIBLE_OUTPUT_BYTES: u64 = 1024;

const TRANSCRIPT_EXTENSION: &str = ".srt";

/// Stderr markers worth highlighting in the logs. They never fail the job by
/// themselves; only the exit code does.
const FATAL_STDERR_MARKERS: &[&str] = &[
    "error:",
    "unable to download",
    "http error",
    "network error",
    "video unavailable",
    "private video",
    "age-restricted",
];

#[cfg(test)]
use std::sync::{Mutex, MutexGuard};

#[cfg(test)]
static YT_DLP_STUB: Mutex<Option<PathBuf>> = Mutex::new(None);
#[cfg(test)]
static STUB_USE_LOCK: Mutex<()> = Mutex::new(());

fn yt_dlp_command() -> Command {
    #[cfg(test)]
    {
        if let Some(path) = YT_DLP_STUB.lock().unwrap().clone() {
            return Command::new(path);
        }
    }
    Command::new("yt-dlp")
}

#[cfg(test)]
fn set_ytdlp_stub_path(path: PathBuf) -> YtDlpStubGuard {
    let guard = STUB_USE_LOCK.lock().unwrap();
    {
        let mut lock = YT_DLP_STUB.lock().unwrap();
        *lock = Some(path);
    }
    YtDlpStubGuard { lock: Some(guard) }
}

#[cfg(test)]
struct YtDlpStubGuard {
    lock: Option<MutexGuard<'static, ()>>,
}

#[cfg(test)]
impl Drop for YtDlpStubGuard {
    fn drop(&mut self) {
        *YT_DLP_STUB.lock().unwrap() = None;
        self.lock.take();
    }
}

/// One acquisition request. Owned exclusively by a single
/// [`download_media`] call and never persisted beyond its sidecar output.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub source_url: String,
    pub target_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    pub success: bool,
    pub message: String,
}

/// Subset of the downloader's `--dump-json` payload the pipeline reads.
#[derive(Debug, Deserialize)]
struct RemoteItemInfo {
    title: Option<String>,
    description: Option<String>,
    thumbnail: Option<String>,
}

/// Runs a full download job. Never returns an error: failures become a
/// `success = false` outcome whose message carries an actionable hint where
/// one applies.
pub async fn download_media(
    job: &DownloadJob,
    config: &MediaConfig,
    sink: &dyn ProgressSink,
) -> DownloadOutcome {
    match run_pipeline(job, config, sink).await {
        Ok(title) => DownloadOutcome {
            success: true,
            message: format!("Successfully downloaded: {title}"),
        },
        Err(err) => {
            eprintln!("Error downloading {}: {err}", job.source_url);
            DownloadOutcome {
                success: false,
                message: format!("Download failed: {}", annotate_error(&err.message)),
            }
        }
    }
}

async fn run_pipeline(
    job: &DownloadJob,
    config: &MediaConfig,
    sink: &dyn ProgressSink,
) -> Result<String> {
    if job.source_url.trim().is_empty() {
        return Err(PipelineError::validation("No URL provided"));
    }

    ensure_writable_directory(&job.target_dir)
        .map_err(|err| PipelineError::storage(format!("Directory validation failed: {err}")))?;

    if !has_free_space(&job.target_dir, REQUIRED_FREE_BYTES) {
        return Err(PipelineError::storage(
            "Insufficient disk space. At least 100MB free space required.",
        ));
    }

    println!("Starting download process for URL: {}", job.source_url);

    let info = fetch_remote_info(&job.source_url).await?;
    let title = info
        .title
        .clone()
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| "untitled".to_string());
    let base_name = sanitize_filename(&title, DEFAULT_MAX_FILENAME_LEN);
    println!("Downloading '{title}' as '{base_name}'");

    // Only a non-zero exit gets the fallback; spawn failures and timeouts
    // abort outright.
    let mut audio_only = false;
    if let VideoPhase::Failed { exit_message } =
        run_video_download(&job.source_url, &base_name, &job.target_dir, sink).await?
    {
        eprintln!("Video download failed, attempting audio-only download as fallback...");
        if let Err(audio_err) = run_audio_fallback(&job.source_url, &base_name, &job.target_dir).await
        {
            return Err(PipelineError::process(format!(
                "Both video and audio-only downloads failed. Video error: {exit_message}. Audio error: {}",
                audio_err.message
            )));
        }
        println!("Audio-only download successful!");
        audio_only = true;
    }

    println!("Download completed, processing files...");
    post_process(job, config, &info, &title, &base_name, audio_only).await?;

    println!("Download process completed successfully for: {title}");
    Ok(title)
}

/// Metadata-only query against the source URL. Failures here are fatal and
/// leave no partial output behind.
async fn fetch_remote_info(url: &str) -> Result<RemoteItemInfo> {
    let mut command = yt_dlp_command();
    command
        .arg("--dump-json")
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(INFO_TIMEOUT, command.output())
        .await
        .map_err(|_| {
            PipelineError::timeout(format!(
                "Timed out getting video info after {} seconds",
                INFO_TIMEOUT.as_secs()
            ))
        })?
        .map_err(spawn_error)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        let detail = if detail.is_empty() {
            "Unknown error getting video info"
        } else {
            detail
        };
        return Err(PipelineError::process(format!(
            "Error getting video info: {detail}"
        )));
    }

    serde_json::from_slice(&output.stdout).map_err(|err| {
        PipelineError::process(format!("Invalid JSON response from downloader: {err}"))
    })
}

/// Outcome of the video phase. A non-zero exit is not an `Err`: it is the
/// one condition that arms the audio-only fallback.
enum VideoPhase {
    Completed,
    Failed { exit_message: String },
}

/// Full-quality download with subtitle acquisition, resumable fetch, bounded
/// retries, and a resolution ceiling. Progress lines are parsed as they
/// arrive; the wall-clock deadline races the readers.
async fn run_video_download(
    url: &str,
    base_name: &str,
    target_dir: &Path,
    sink: &dyn ProgressSink,
) -> Result<VideoPhase> {
    let output_template = format!("{base_name}.%(ext)s");
    let mut command = yt_dlp_command();
    command
        .arg("--newline")
        .arg("--progress")
        .arg("--no-warnings")
        .arg("--write-auto-sub")
        .arg("--write-sub")
        .arg("--sub-lang")
        .arg("en")
        .arg("--convert-subs")
        .arg("srt")
        .arg("--no-overwrites")
        .arg("--continue")
        .arg("--retries")
        .arg("3")
        .arg("--fragment-retries")
        .arg("3")
        .arg("--format")
        .arg("best[height<=720]/best")
        .arg("-o")
        .arg(&output_template)
        .arg(url)
        .current_dir(target_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(spawn_error)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PipelineError::process("downloader stdout unavailable"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| PipelineError::process("downloader stderr unavailable"))?;

    let mut out_reader = BufReader::new(stdout).lines();
    let mut err_reader = BufReader::new(stderr).lines();
    let mut stderr_tail: Vec<String> = Vec::new();
    let mut stdout_done = false;
    let mut stderr_done = false;

    let deadline = tokio::time::sleep(DOWNLOAD_TIMEOUT);
    tokio::pin!(deadline);

    let status = loop {
        tokio::select! {
            _ = &mut deadline => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(PipelineError::timeout(format!(
                    "Download timeout - process exceeded {} seconds",
                    DOWNLOAD_TIMEOUT.as_secs()
                )));
            }
            res = out_reader.next_line(), if !stdout_done => match res {
                Ok(Some(line)) => observe_stdout_line(&line, sink),
                Ok(None) => stdout_done = true,
                Err(err) => {
                    eprintln!("Warning: error reading downloader stdout: {err}");
                    stdout_done = true;
                }
            },
            res = err_reader.next_line(), if !stderr_done => match res {
                Ok(Some(line)) => observe_stderr_line(&line, &mut stderr_tail),
                Ok(None) => stderr_done = true,
                Err(err) => {
                    eprintln!("Warning: error reading downloader stderr: {err}");
                    stderr_done = true;
                }
            },
            res = child.wait() => {
                break res.map_err(|err| {
                    PipelineError::process(format!("error waiting for downloader: {err}"))
                })?;
            }
        }
    };

    // The process exited; drain whatever is still buffered in the pipes.
    while let Ok(Some(line)) = out_reader.next_line().await {
        observe_stdout_line(&line, sink);
    }
    while let Ok(Some(line)) = err_reader.next_line().await {
        observe_stderr_line(&line, &mut stderr_tail);
    }

    if !status.success() {
        let detail = if stderr_tail.is_empty() {
            "Unknown download error".to_string()
        } else {
            stderr_tail.join("\n")
        };
        return Ok(VideoPhase::Failed {
            exit_message: format!(
                "Error downloading video (exit code {}): {detail}",
                status.code().unwrap_or(-1)
            ),
        });
    }

    Ok(VideoPhase::Completed)
}

fn observe_stdout_line(line: &str, sink: &dyn ProgressSink) {
    println!("{}", line.trim_end());
    if let Some(percent) = parse_progress_percent(line) {
        sink.publish(ProgressEvent { percent });
    } else if line.contains('%') {
        eprintln!("Warning: could not parse progress from line: {}", line.trim());
    }
}

fn observe_stderr_line(line: &str, tail: &mut Vec<String>) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    tail.push(trimmed.to_string());
    eprintln!("downloader stderr: {trimmed}");

    let lower = trimmed.to_lowercase();
    if FATAL_STDERR_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
    {
        eprintln!("Detected critical error in stderr: {trimmed}");
    }
}

/// Extracts the percentage from a progress line: the last whitespace-separated
/// token before the first `%`.
fn parse_progress_percent(line: &str) -> Option<f32> {
    let idx = line.find('%')?;
    line[..idx].split_whitespace().last()?.parse().ok()
}

/// Second chance after a failed video download: best-available audio pulled
/// straight to MP3, with its own shorter budget.
async fn run_audio_fallback(url: &str, base_name: &str, target_dir: &Path) -> Result<()> {
    let output_template = format!("{base_name}.%(ext)s");
    let mut command = yt_dlp_command();
    command
        .arg("--newline")
        .arg("--progress")
        .arg("--no-warnings")
        .arg("--format")
        .arg("bestaudio/best")
        .arg("--extract-audio")
        .arg("--audio-format")
        .arg("mp3")
        .arg("--audio-quality")
        .arg("192K")
        .arg("--retries")
        .arg("3")
        .arg("--fragment-retries")
        .arg("3")
        .arg("-o")
        .arg(&output_template)
        .arg(url)
        .current_dir(target_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(AUDIO_FALLBACK_TIMEOUT, command.output())
        .await
        .map_err(|_| {
            PipelineError::timeout(format!(
                "Audio-only download timeout - process exceeded {} seconds",
                AUDIO_FALLBACK_TIMEOUT.as_secs()
            ))
        })?
        .map_err(spawn_error)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        let detail = if detail.is_empty() {
            "Unknown audio download error"
        } else {
            detail
        };
        return Err(PipelineError::process(detail.to_string()));
    }

    Ok(())
}

/// Everything after the bytes are on disk. Only the "no output at all" check
/// is fatal; each remaining step degrades to a logged warning because the
/// primary artifact was already acquired.
async fn post_process(
    job: &DownloadJob,
    config: &MediaConfig,
    info: &RemoteItemInfo,
    title: &str,
    base_name: &str,
    audio_only: bool,
) -> Result<()> {
    let outputs = matching_outputs(&job.target_dir, base_name)
        .map_err(|err| PipelineError::storage(format!("Error accessing output directory: {err}")))?;
    if outputs.is_empty() {
        return Err(PipelineError::not_found(format!(
            "No files found with expected prefix '{base_name}' in {}",
            job.target_dir.display()
        )));
    }
    println!("Found {} files with matching prefix", outputs.len());

    if !audio_only {
        let downloaded_video = outputs.iter().find(|name| {
            Path::new(name)
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| config.is_video(ext))
        });

        if let Some(video_name) = downloaded_video {
            let video_path = job.target_dir.join(video_name);
            let audio_path = job.target_dir.join(format!("{base_name}.mp3"));
            if let Err(err) = ensure_audio_artifact(&video_path, &audio_path).await {
                eprintln!("Error extracting audio: {err}");
                eprintln!("Continuing without audio extraction...");
            }
        } else {
            eprintln!("Warning: no video file found after download");
        }
    }

    let description_path = job.target_dir.join(format!("{base_name}.txt"));
    if let Err(err) = fs::write(&description_path, info.description.as_deref().unwrap_or("")) {
        eprintln!("Warning: could not save description: {err}");
    }

    match info.thumbnail.as_deref().filter(|url| !url.is_empty()) {
        Some(thumbnail_url) => {
            let thumbnail_path = job.target_dir.join(format!("{base_name}.jpg"));
            if let Err(err) = fetch_thumbnail(thumbnail_url, &thumbnail_path).await {
                eprintln!("Warning: error downloading thumbnail: {err}");
            }
        }
        None => eprintln!("Warning: no thumbnail URL available"),
    }

    let has_transcript = detect_transcript(&job.target_dir, base_name);
    let sidecar = MetadataSidecar {
        download_date: epoch_seconds(),
        has_transcript,
        original_title: title.to_string(),
        sanitized_title: base_name.to_string(),
        source_url: job.source_url.clone(),
    };
    if let Err(err) = write_sidecar(&job.target_dir, base_name, &sidecar) {
        eprintln!("Warning: could not save metadata: {err}");
    }

    Ok(())
}

fn matching_outputs(dir: &Path, base_name: &str) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(base_name) {
            names.push(name);
        }
    }
    Ok(names)
}

/// Makes sure an MP3 companion exists for the downloaded video, skipping the
/// work when one is already present and rejecting implausibly small outputs.
async fn ensure_audio_artifact(video_path: &Path, audio_path: &Path) -> Result<()> {
    if audio_path.exists() {
        println!("MP3 file already exists: {}", audio_path.display());
        return Ok(());
    }

    let video_size = fs::metadata(video_path)
        .map_err(|err| PipelineError::io(format!("reading {}: {err}", video_path.display())))?
        .len();
    if video_size < MIN_PLAUSIBLE_OUTPUT_BYTES {
        return Err(PipelineError::extraction(format!(
            "video file appears to be corrupt (size: {video_size} bytes)"
        )));
    }

    extract_audio(video_path, audio_path).await?;

    let audio_size = fs::metadata(audio_path)
        .map_err(|_| {
            PipelineError::extraction("audio extraction completed but no MP3 file was created")
        })?
        .len();
    if audio_size < MIN_PLAUSIBLE_OUTPUT_BYTES {
        let _ = fs::remove_file(audio_path);
        return Err(PipelineError::extraction(
            "audio extraction produced corrupt file (too small)",
        ));
    }

    println!(
        "Audio extraction completed: {} ({:.2} MB)",
        audio_path.display(),
        audio_size as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

async fn fetch_thumbnail(url: &str, dest: &Path) -> Result<()> {
    let url = url.to_string();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let response = ureq::get(&url)
            .timeout(THUMBNAIL_TIMEOUT)
            .call()
            .map_err(|err| PipelineError::io(format!("thumbnail request failed: {err}")))?;
        let mut reader = response.into_reader();
        let mut file = fs::File::create(&dest)
            .map_err(|err| PipelineError::io(format!("creating {}: {err}", dest.display())))?;
        std::io::copy(&mut reader, &mut file)
            .map_err(|err| PipelineError::io(format!("writing {}: {err}", dest.display())))?;
        Ok(())
    })
    .await
    .map_err(|err| PipelineError::io(format!("thumbnail task failed: {err}")))?
}

fn detect_transcript(dir: &Path, base_name: &str) -> bool {
    matching_outputs(dir, base_name)
        .map(|names| {
            names
                .iter()
                .any(|name| name.ends_with(TRANSCRIPT_EXTENSION))
        })
        .unwrap_or(false)
}

/// Epoch seconds with sub-second precision, the format the sidecar stores.
fn epoch_seconds() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
}

/// Appends an actionable hint keyed by substring matching on the failure
/// text. Cosmetic only; the error taxonomy is untouched.
fn annotate_error(message: &str) -> String {
    let lower = message.to_lowercase();
    let hint = if lower.contains("disk space") {
        " Please free up some disk space and try again."
    } else if lower.contains("permission") {
        " Please check file permissions for the download directory."
    } else if lower.contains("directory") {
        " Please ensure the download directory is accessible."
    } else if lower.contains("command not found") {
        " Please ensure yt-dlp is installed and accessible."
    } else {
        ""
    };
    format!("{message}{hint}")
}

fn spawn_error(err: std::io::Error) -> PipelineError {
    if err.kind() == std::io::ErrorKind::NotFound {
        PipelineError::process("Command not found: yt-dlp. Please ensure it's installed and in PATH.")
    } else {
        PipelineError::process(format!("error running yt-dlp: {err}"))
    }
}
