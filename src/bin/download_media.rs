#![forbid(unsafe_code)]

//! Command-line helper that runs one download job to completion.
//!
//! Intended for cron jobs and other out-of-band callers that do not want to
//! go through the HTTP backend. Progress is reported through a JSON file
//! (`--progress-file`) that observers can poll; the exit code reflects the
//! job outcome.

use anyhow::{Result, bail};
use std::env;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tubeshelf_tools::config::{MediaConfig, RuntimeOverrides, resolve_runtime_paths};
use tubeshelf_tools::downloader::{DownloadJob, download_media};
use tubeshelf_tools::progress::{NullSink, ProgressFileWriter, ProgressSink};
use tubeshelf_tools::sanitize::normalize_username;
use tubeshelf_tools::security::ensure_not_root;

#[derive(Debug, Clone)]
struct DownloaderArgs {
    url: String,
    user: String,
    progress_file: Option<PathBuf>,
    media_root: PathBuf,
}

impl DownloaderArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut media_root_override: Option<PathBuf> = None;
        let mut url: Option<String> = None;
        let mut user: Option<String> = None;
        let mut progress_file: Option<PathBuf> = None;
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            if arg == "--" {
                for value in args {
                    Self::set_url(&mut url, value)?;
                }
                break;
            }

            if let Some(value) = arg.strip_prefix("--media-root=") {
                media_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--user=") {
                Self::set_user(&mut user, value.to_string())?;
                continue;
            }
            if let Some(value) = arg.strip_prefix("--progress-file=") {
                progress_file = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--media-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--media-root requires a value"))?;
                    media_root_override = Some(PathBuf::from(value));
                }
                "--user" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--user requires a value"))?;
                    Self::set_user(&mut user, value)?;
                }
                "--progress-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--progress-file requires a value"))?;
                    progress_file = Some(PathBuf::from(value));
                }
                _ if arg.starts_with('-') => {
                    bail!("unknown argument: {arg}");
                }
                _ => {
                    Self::set_url(&mut url, arg)?;
                }
            }
        }

        let Some(url) = url else {
            bail!(
                "Usage: download_media [--media-root <path>] [--progress-file <path>] --user <name> <url>"
            );
        };
        let Some(user) = user else {
            bail!("--user is required");
        };

        let runtime_paths = resolve_runtime_paths(RuntimeOverrides {
            media_root: media_root_override.clone(),
            ..RuntimeOverrides::default()
        })?;
        let media_root = media_root_override.unwrap_or(runtime_paths.media_root);

        Ok(Self {
            url,
            user,
            progress_file,
            media_root,
        })
    }

    fn set_url(target: &mut Option<String>, value: String) -> Result<()> {
        if target.is_some() {
            bail!("source URL specified multiple times");
        }
        *target = Some(value);
        Ok(())
    }

    fn set_user(target: &mut Option<String>, value: String) -> Result<()> {
        if target.is_some() {
            bail!("user specified multiple times");
        }
        *target = Some(value);
        Ok(())
    }
}

/// Runs `<name> --version` to fail loudly when yt-dlp is missing before any
/// work starts.
fn ensure_program_available(name: &str) -> Result<()> {
    let status = Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!("{} is installed but returned a failure status", name),
        Err(err) => bail!("{} is not installed or not in PATH: {}", name, err),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_not_root("download_media")?;

    let DownloaderArgs {
        url,
        user,
        progress_file,
        media_root,
    } = DownloaderArgs::parse()?;

    ensure_program_available("yt-dlp")?;

    let Some(user) = normalize_username(&user) else {
        bail!("invalid user name");
    };
    let target_dir = media_root.join(&user);

    println!("===================================");
    println!("Tubeshelf Media Downloader");
    println!("===================================");
    println!("URL: {url}");
    println!("User: {user}");
    println!("Target directory: {}", target_dir.display());
    println!();

    let sink: Box<dyn ProgressSink> = match progress_file {
        Some(path) => Box::new(ProgressFileWriter::new(path)),
        None => Box::new(NullSink),
    };

    let job = DownloadJob {
        source_url: url,
        target_dir,
    };
    let outcome = download_media(&job, &MediaConfig::default(), sink.as_ref()).await;

    println!();
    println!("{}", outcome.message);

    if !outcome.success {
        bail!("download failed");
    }

    Ok(())
}
