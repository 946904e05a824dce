#![forbid(unsafe_code)]

//! Axum backend serving per-user media libraries.
//!
//! Endpoints cover the whole delivery surface: triggering a download,
//! listing the catalog, seekable byte-range streaming, thumbnails,
//! descriptions, deletion, and progress polling. Each user's files live
//! under their own scope directory beneath the media root; every dynamic
//! path segment is checked against traversal before it touches the disk.

use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::{MimeGuess, mime::Mime};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tubeshelf_tools::catalog::{
    self, DEFAULT_AUDIO_THUMBNAIL, DEFAULT_VIDEO_THUMBNAIL, MediaKind, SortKey, SortOrder,
};
use tubeshelf_tools::config::{MediaConfig, RuntimeOverrides, resolve_runtime_paths};
use tubeshelf_tools::downloader::{DownloadJob, DownloadOutcome, download_media};
use tubeshelf_tools::progress::ProgressHub;
use tubeshelf_tools::sanitize::normalize_username;
use tubeshelf_tools::security::ensure_not_root;

/// Sidecar extensions removed together with a media file.
const SIDECAR_SIBLINGS: &[&str] = &["txt", "jpg", "meta", "srt"];

#[derive(Debug, Clone)]
struct BackendArgs {
    media_root: PathBuf,
    tubeshelf_port: u16,
    listen_host: IpAddr,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut media_root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--media-root=") {
                media_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--media-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--media-root requires a value"))?;
                    media_root_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let runtime_paths = resolve_runtime_paths(RuntimeOverrides {
            media_root: media_root_override.clone(),
            ..RuntimeOverrides::default()
        })?;
        let runtime_host = parse_host_arg(&runtime_paths.tubeshelf_host)?;
        let media_root = media_root_override.unwrap_or(runtime_paths.media_root);
        let tubeshelf_port = port_override.unwrap_or(runtime_paths.tubeshelf_port);
        let listen_host = host_override.unwrap_or(runtime_host);

        Ok(Self {
            media_root,
            tubeshelf_port,
            listen_host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBESHELF_HOST")
}

/// Shared state injected into every handler. All of it is cheap to clone;
/// the hub carries the only mutable piece (latest progress per user).
#[derive(Clone)]
struct AppState {
    media_root: Arc<PathBuf>,
    config: Arc<MediaConfig>,
    progress: Arc<ProgressHub>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
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

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let BackendArgs {
        media_root,
        tubeshelf_port,
        listen_host,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    // Environment variables still win over `.env` values at startup, which
    // keeps container deployments flag-free.
    let port = std::env::var("TUBESHELF_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(tubeshelf_port);

    let host = match std::env::var("TUBESHELF_HOST") {
        Ok(value) if !value.trim().is_empty() => parse_host_arg(value.trim())?,
        _ => listen_host,
    };

    std::fs::create_dir_all(&media_root)
        .with_context(|| format!("creating media root {}", media_root.display()))?;

    let state = AppState {
        media_root: Arc::new(media_root),
        config: Arc::new(MediaConfig::default()),
        progress: Arc::new(ProgressHub::new()),
    };

    let app = Router::new()
        .route("/api/download", post(start_download))
        .route("/api/media", get(list_media))
        .route("/api/stream/{*path}", get(stream_media))
        .route("/api/thumbnail/{*path}", get(serve_thumbnail))
        .route("/api/description/{file}", get(serve_description))
        .route("/api/delete", post(delete_files))
        .route("/api/progress/{user}", get(get_progress))
        .with_state(state);

    let addr = SocketAddr::new(host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("Media server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running media server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Graceful shutdown only; the process still dies if the handler fails.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    url: Option<String>,
    user: Option<String>,
}

#[derive(Deserialize, Default)]
struct ListQuery {
    user: Option<String>,
    sort: Option<String>,
    order: Option<String>,
}

#[derive(Deserialize, Default)]
struct UserQuery {
    user: Option<String>,
}

#[derive(Deserialize)]
struct DeleteRequest {
    user: Option<String>,
    files: Option<Vec<String>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    success: bool,
    message: String,
    deleted_files: Vec<String>,
    errors: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DescriptionResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressResponse {
    percent: f32,
}

/// Catalog entry as served over the API. The byte count collapses into its
/// display string here, at the presentation boundary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaEntry {
    id: String,
    name: String,
    path: String,
    kind: MediaKind,
    size: String,
    date_modified: f64,
    date_downloaded: f64,
    thumbnail: String,
}

/// Runs one download to completion and reports the outcome. Every failure
/// mode ends up as `success = false` with explanatory text; the HTTP status
/// stays 200 so the caller only has one shape to handle.
async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Json<DownloadOutcome> {
    let Some(url) = payload
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
    else {
        return Json(failure_outcome("No URL provided"));
    };
    let Some(user_raw) = payload.user.as_deref() else {
        return Json(failure_outcome("No user provided"));
    };
    let Some(user) = normalize_username(user_raw) else {
        return Json(failure_outcome("Invalid username"));
    };

    let job = DownloadJob {
        source_url: url.to_string(),
        target_dir: state.media_root.join(&user),
    };
    let sink = ProgressHub::sink_for(&state.progress, &user);
    let outcome = download_media(&job, &state.config, &sink).await;
    Json(outcome)
}

fn failure_outcome(message: &str) -> DownloadOutcome {
    DownloadOutcome {
        success: false,
        message: message.to_string(),
    }
}

async fn list_media(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<MediaEntry>>> {
    let scope_dir = resolve_scope_dir(&state, query.user.as_deref())?;
    let sort = SortKey::parse(query.sort.as_deref());
    let order = SortOrder::parse(query.order.as_deref());

    let items = catalog::list_media(&scope_dir, &state.config, sort, order)
        .map_err(|err| ApiError::internal(err.to_string()))?;

    let entries = items
        .into_iter()
        .map(|item| MediaEntry {
            id: item.id,
            name: item.name,
            path: item.path,
            kind: item.kind,
            size: catalog::format_size_mb(item.size_bytes),
            date_modified: item.modified_at,
            date_downloaded: item.downloaded_at,
            thumbnail: item.thumbnail,
        })
        .collect();

    Ok(Json(entries))
}

async fn stream_media(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    Query(query): Query<UserQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let scope_dir = resolve_scope_dir(&state, query.user.as_deref())?;
    let relative = safe_relative_path(&path)?;
    stream_file(scope_dir.join(relative), None, Some(&headers)).await
}

/// Serves a per-user thumbnail, falling back to the shared default images in
/// the media root for the two well-known names.
async fn serve_thumbnail(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Response> {
    let scope_dir = resolve_scope_dir(&state, query.user.as_deref())?;
    let relative = safe_relative_path(&path)?;

    let user_file = scope_dir.join(&relative);
    if user_file.is_file() {
        return stream_file(user_file, None, None).await;
    }

    if path == DEFAULT_AUDIO_THUMBNAIL || path == DEFAULT_VIDEO_THUMBNAIL {
        let default_file = state.media_root.join(&path);
        if default_file.is_file() {
            return stream_file(default_file, None, None).await;
        }
    }

    Err(ApiError::not_found("file not found"))
}

async fn serve_description(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<DescriptionResponse>> {
    let scope_dir = resolve_scope_dir(&state, query.user.as_deref())?;
    let relative = safe_relative_path(&file)?;

    let base = relative
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| ApiError::bad_request("invalid file name"))?;
    let description_path = scope_dir.join(format!("{base}.txt"));

    match tokio::fs::read_to_string(&description_path).await {
        Ok(description) => Ok(Json(DescriptionResponse {
            success: true,
            description: Some(description),
            message: None,
        })),
        Err(_) => Ok(Json(DescriptionResponse {
            success: false,
            description: None,
            message: Some("Description file not found".to_string()),
        })),
    }
}

/// Removes each requested media file together with its sidecar siblings,
/// reporting per-file detail instead of failing wholesale.
async fn delete_files(
    State(state): State<AppState>,
    Json(payload): Json<DeleteRequest>,
) -> ApiResult<Json<DeleteResponse>> {
    let files = payload.files.unwrap_or_default();
    if files.is_empty() {
        return Ok(Json(DeleteResponse {
            success: false,
            message: "No files selected".to_string(),
            deleted_files: Vec::new(),
            errors: Vec::new(),
        }));
    }
    let scope_dir = resolve_scope_dir(&state, payload.user.as_deref())?;

    let mut deleted_files = Vec::new();
    let mut errors = Vec::new();

    for file in files {
        let relative = match safe_relative_path(&file) {
            Ok(relative) => relative,
            Err(_) => {
                errors.push(format!("Error deleting {file}: invalid path"));
                continue;
            }
        };

        let media_path = scope_dir.join(&relative);
        if media_path.exists() {
            match std::fs::remove_file(&media_path) {
                Ok(()) => deleted_files.push(file.clone()),
                Err(err) => {
                    errors.push(format!("Error deleting {file}: {err}"));
                    continue;
                }
            }
        }

        if let Some(base) = relative.file_stem().and_then(|stem| stem.to_str()) {
            let parent = media_path.parent().unwrap_or(&scope_dir);
            for ext in SIDECAR_SIBLINGS {
                let sibling = parent.join(format!("{base}.{ext}"));
                if sibling.exists()
                    && let Err(err) = std::fs::remove_file(&sibling)
                {
                    errors.push(format!("Error deleting {}: {err}", sibling.display()));
                }
            }
        }
    }

    let message = if errors.is_empty() {
        format!("Successfully deleted {} files", deleted_files.len())
    } else {
        format!(
            "Deleted {} files with {} errors",
            deleted_files.len(),
            errors.len()
        )
    };

    Ok(Json(DeleteResponse {
        success: true,
        message,
        deleted_files,
        errors,
    }))
}

async fn get_progress(
    State(state): State<AppState>,
    AxumPath(user): AxumPath<String>,
) -> ApiResult<Json<ProgressResponse>> {
    let user = normalize_username(&user).ok_or_else(|| ApiError::bad_request("Invalid user"))?;
    let percent = state.progress.latest(&user).unwrap_or(0.0);
    Ok(Json(ProgressResponse { percent }))
}

/// Maps a raw `user` parameter onto that user's scope directory, creating it
/// on first use.
fn resolve_scope_dir(state: &AppState, user: Option<&str>) -> ApiResult<PathBuf> {
    let raw = user.ok_or_else(|| ApiError::bad_request("User not specified"))?;
    let normalized =
        normalize_username(raw).ok_or_else(|| ApiError::bad_request("Invalid user"))?;
    let dir = state.media_root.join(normalized);
    std::fs::create_dir_all(&dir).map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(dir)
}

/// Validates that a client-supplied relative path never escapes its scope
/// directory.
fn safe_relative_path(value: &str) -> ApiResult<PathBuf> {
    let candidate = Path::new(value);
    if value.is_empty()
        || candidate
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(candidate.to_path_buf())
}

/// Streams a file in full or as a byte-range slice. Range responses seek to
/// the start offset and bound the reader, so only the requested window ever
/// leaves the disk.
async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = metadata.len();

    let guessed = mime.or_else(|| MimeGuess::from_path(&path).first());
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes */{}", size).parse().unwrap(),
            );
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let body = Body::from_stream(stream);
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, size).parse().unwrap(),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, length.to_string().parse().unwrap());
            response
        }
    } else {
        let stream = ReaderStream::new(file);
        let body = Body::from_stream(stream);
        body.into_response()
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

/// Parses `bytes=<start>-<end>` with both bounds optional. Returns `None`
/// for anything malformed so the request degrades to a full-body response.
fn parse_range_header(value: &header::HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?;
    let value = value.trim();
    let mut parts = value.split('=');
    let unit = parts.next()?.trim();
    if unit != "bytes" {
        return None;
    }
    let range = parts.next()?.trim();
    if range.is_empty() {
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
    use axum::body::to_bytes;
    use serde_json::Value;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};
    use tubeshelf_tools::progress::{ProgressEvent, ProgressSink};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env_file(vars: &[(&str, &str)], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let mut contents = String::new();
        for (key, value) in vars {
            contents.push_str(&format!("{key}=\"{value}\"\n"));
        }
        fs::write(dir.path().join(".env"), contents).unwrap();
        let cwd = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        f();
        std::env::set_current_dir(cwd).unwrap();
    }

    fn parse_backend_args(env_values: &[(&str, &str)], extra: &[&str]) -> BackendArgs {
        let argv = extra
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>();
        let mut parsed = None;
        with_env_file(env_values, || {
            parsed = Some(BackendArgs::from_iter(argv.clone()).expect("parsed args"));
        });
        parsed.expect("args set")
    }

    struct BackendTestContext {
        _temp: TempDir,
        state: AppState,
    }

    impl BackendTestContext {
        fn new() -> Self {
            let temp = tempdir().unwrap();
            let state = AppState {
                media_root: Arc::new(temp.path().to_path_buf()),
                config: Arc::new(MediaConfig::default()),
                progress: Arc::new(ProgressHub::new()),
            };
            Self { _temp: temp, state }
        }

        fn scope(&self, user: &str) -> PathBuf {
            let dir = self.state.media_root.join(user);
            fs::create_dir_all(&dir).unwrap();
            dir
        }
    }

    fn user_query(user: &str) -> Query<UserQuery> {
        Query(UserQuery {
            user: Some(user.to_string()),
        })
    }

    fn range_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, value.parse().unwrap());
        headers
    }

    #[test]
    fn backend_args_default_media_root() {
        let args = parse_backend_args(
            &[
                ("MEDIA_ROOT", "/media/test"),
                ("TUBESHELF_PORT", "4242"),
                ("TUBESHELF_HOST", "127.0.0.1"),
            ],
            &[],
        );
        assert_eq!(args.media_root, PathBuf::from("/media/test"));
        assert_eq!(args.tubeshelf_port, 4242);
    }

    #[test]
    fn backend_args_override_media_root() {
        let args = parse_backend_args(
            &[("MEDIA_ROOT", "/media/test"), ("TUBESHELF_HOST", "127.0.0.1")],
            &["--media-root", "/custom/media"],
        );
        assert_eq!(args.media_root, PathBuf::from("/custom/media"));
    }

    #[test]
    fn backend_args_override_port_and_host() {
        let args = parse_backend_args(
            &[("MEDIA_ROOT", "/media/test"), ("TUBESHELF_HOST", "127.0.0.1")],
            &["--port", "9000", "--host", "0.0.0.0"],
        );
        assert_eq!(args.tubeshelf_port, 9000);
        assert_eq!(args.listen_host, "0.0.0.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn safe_relative_path_rejects_traversal() {
        assert!(safe_relative_path("clip.mp4").is_ok());
        assert!(safe_relative_path("season1/clip.mp4").is_ok());
        assert!(safe_relative_path("../secret.txt").is_err());
        assert!(safe_relative_path("/etc/passwd").is_err());
        assert!(safe_relative_path("").is_err());
    }

    #[test]
    fn range_header_parsing_covers_all_forms() {
        let size = 10;
        let value = |raw: &str| header::HeaderValue::from_str(raw).unwrap();
        assert_eq!(parse_range_header(&value("bytes=0-4"), size), Some((0, 4)));
        assert_eq!(parse_range_header(&value("bytes=5-"), size), Some((5, 9)));
        assert_eq!(parse_range_header(&value("bytes=-3"), size), Some((7, 9)));
        assert_eq!(parse_range_header(&value("bytes=-15"), size), Some((0, 9)));
        assert_eq!(parse_range_header(&value("bytes=4-2"), size), None);
        assert_eq!(parse_range_header(&value("items=0-4"), size), None);
        assert_eq!(parse_range_header(&value("bytes="), size), None);
    }

    #[tokio::test]
    async fn range_request_returns_exact_slice() {
        let ctx = BackendTestContext::new();
        let scope = ctx.scope("alice");
        fs::write(scope.join("clip.mp4"), b"0123456789").unwrap();

        let response = stream_media(
            State(ctx.state.clone()),
            AxumPath("clip.mp4".to_string()),
            user_query("alice"),
            range_headers("bytes=0-4"),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 0-4/10"
        );
        assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "5");
        assert_eq!(
            response.headers().get(header::ACCEPT_RANGES).unwrap(),
            "bytes"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"01234");
    }

    #[tokio::test]
    async fn missing_range_header_streams_whole_file() {
        let ctx = BackendTestContext::new();
        let scope = ctx.scope("alice");
        fs::write(scope.join("clip.mp4"), b"0123456789").unwrap();

        let response = stream_media(
            State(ctx.state.clone()),
            AxumPath("clip.mp4".to_string()),
            user_query("alice"),
            HeaderMap::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"0123456789");
    }

    #[tokio::test]
    async fn open_ended_range_reaches_file_end() {
        let ctx = BackendTestContext::new();
        let scope = ctx.scope("alice");
        fs::write(scope.join("clip.mp4"), b"0123456789").unwrap();

        let response = stream_media(
            State(ctx.state.clone()),
            AxumPath("clip.mp4".to_string()),
            user_query("alice"),
            range_headers("bytes=5-"),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"56789");
    }

    #[tokio::test]
    async fn out_of_bounds_range_is_unsatisfiable() {
        let ctx = BackendTestContext::new();
        let scope = ctx.scope("alice");
        fs::write(scope.join("clip.mp4"), b"0123456789").unwrap();

        let response = stream_media(
            State(ctx.state.clone()),
            AxumPath("clip.mp4".to_string()),
            user_query("alice"),
            range_headers("bytes=50-60"),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */10"
        );
    }

    #[tokio::test]
    async fn streaming_missing_file_is_not_found() {
        let ctx = BackendTestContext::new();
        ctx.scope("alice");
        let err = stream_media(
            State(ctx.state.clone()),
            AxumPath("ghost.mp4".to_string()),
            user_query("alice"),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn streaming_rejects_path_traversal() {
        let ctx = BackendTestContext::new();
        ctx.scope("alice");
        let err = stream_media(
            State(ctx.state.clone()),
            AxumPath("../alice/clip.mp4".to_string()),
            user_query("alice"),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn media_listing_formats_sizes_at_the_boundary() {
        let ctx = BackendTestContext::new();
        let scope = ctx.scope("alice");
        fs::write(scope.join("big.mp4"), vec![b'x'; 2 * 1024 * 1024]).unwrap();
        fs::write(scope.join("small.mp3"), vec![b'x'; 512]).unwrap();

        let Json(entries) = list_media(
            State(ctx.state.clone()),
            Query(ListQuery {
                user: Some("alice".into()),
                sort: Some("size".into()),
                order: Some("desc".into()),
            }),
        )
        .await
        .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "big.mp4");
        assert_eq!(entries[0].size, "2.00 MB");
        assert_eq!(entries[0].kind, MediaKind::Video);
        assert_eq!(entries[1].kind, MediaKind::Audio);
    }

    #[tokio::test]
    async fn media_listing_requires_user() {
        let ctx = BackendTestContext::new();
        let err = list_media(State(ctx.state.clone()), Query(ListQuery::default()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn description_roundtrip() {
        let ctx = BackendTestContext::new();
        let scope = ctx.scope("alice");
        fs::write(scope.join("clip.txt"), "the description").unwrap();

        let Json(found) = serve_description(
            State(ctx.state.clone()),
            AxumPath("clip.mp4".to_string()),
            user_query("alice"),
        )
        .await
        .unwrap();
        assert!(found.success);
        assert_eq!(found.description.as_deref(), Some("the description"));

        let Json(missing) = serve_description(
            State(ctx.state.clone()),
            AxumPath("ghost.mp4".to_string()),
            user_query("alice"),
        )
        .await
        .unwrap();
        assert!(!missing.success);
        assert!(missing.message.is_some());
    }

    #[tokio::test]
    async fn thumbnail_prefers_user_file_then_defaults() {
        let ctx = BackendTestContext::new();
        let scope = ctx.scope("alice");
        fs::write(scope.join("clip.jpg"), b"user-thumb").unwrap();
        fs::write(
            ctx.state.media_root.join(DEFAULT_AUDIO_THUMBNAIL),
            b"default-thumb",
        )
        .unwrap();

        let response = serve_thumbnail(
            State(ctx.state.clone()),
            AxumPath("clip.jpg".to_string()),
            user_query("alice"),
        )
        .await
        .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"user-thumb");

        let response = serve_thumbnail(
            State(ctx.state.clone()),
            AxumPath(DEFAULT_AUDIO_THUMBNAIL.to_string()),
            user_query("alice"),
        )
        .await
        .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"default-thumb");

        let err = serve_thumbnail(
            State(ctx.state.clone()),
            AxumPath("ghost.jpg".to_string()),
            user_query("alice"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deletion_removes_sidecar_siblings() {
        let ctx = BackendTestContext::new();
        let scope = ctx.scope("alice");
        for name in ["clip.mp4", "clip.txt", "clip.jpg", "clip.meta", "clip.srt"] {
            fs::write(scope.join(name), "x").unwrap();
        }
        fs::write(scope.join("keep.mp4"), "x").unwrap();

        let Json(response) = delete_files(
            State(ctx.state.clone()),
            Json(DeleteRequest {
                user: Some("alice".into()),
                files: Some(vec!["clip.mp4".into()]),
            }),
        )
        .await
        .unwrap();

        assert!(response.success);
        assert_eq!(response.deleted_files, vec!["clip.mp4".to_string()]);
        assert!(response.errors.is_empty());
        for name in ["clip.mp4", "clip.txt", "clip.jpg", "clip.meta", "clip.srt"] {
            assert!(!scope.join(name).exists(), "{name} should be gone");
        }
        assert!(scope.join("keep.mp4").exists());
    }

    #[tokio::test]
    async fn deletion_reports_invalid_paths() {
        let ctx = BackendTestContext::new();
        ctx.scope("alice");

        let Json(response) = delete_files(
            State(ctx.state.clone()),
            Json(DeleteRequest {
                user: Some("alice".into()),
                files: Some(vec!["../escape.mp4".into()]),
            }),
        )
        .await
        .unwrap();

        assert!(response.deleted_files.is_empty());
        assert_eq!(response.errors.len(), 1);
    }

    #[tokio::test]
    async fn deletion_with_no_files_is_rejected() {
        let ctx = BackendTestContext::new();
        let Json(response) = delete_files(
            State(ctx.state.clone()),
            Json(DeleteRequest {
                user: Some("alice".into()),
                files: None,
            }),
        )
        .await
        .unwrap();
        assert!(!response.success);
        assert_eq!(response.message, "No files selected");
    }

    #[tokio::test]
    async fn progress_endpoint_reflects_hub_state() {
        let ctx = BackendTestContext::new();
        let Json(initial) = get_progress(State(ctx.state.clone()), AxumPath("alice".to_string()))
            .await
            .unwrap();
        assert_eq!(initial.percent, 0.0);

        ProgressHub::sink_for(&ctx.state.progress, "alice").publish(ProgressEvent { percent: 55.5 });

        let Json(updated) = get_progress(State(ctx.state.clone()), AxumPath("Alice".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.percent, 55.5);
    }

    #[tokio::test]
    async fn download_request_validation() {
        let ctx = BackendTestContext::new();

        let Json(outcome) = start_download(
            State(ctx.state.clone()),
            Json(DownloadRequest {
                url: None,
                user: Some("alice".into()),
            }),
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "No URL provided");

        let Json(outcome) = start_download(
            State(ctx.state.clone()),
            Json(DownloadRequest {
                url: Some("https://example.test/v".into()),
                user: None,
            }),
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "No user provided");

        let Json(outcome) = start_download(
            State(ctx.state.clone()),
            Json(DownloadRequest {
                url: Some("https://example.test/v".into()),
                user: Some("###".into()),
            }),
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Invalid username");
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::not_found("missing").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "missing");
    }
}
