#![forbid(unsafe_code)]

//! Runtime configuration for the tubeshelf binaries.
//!
//! Values come from the process environment first and a local `.env` file
//! second, with explicit overrides (CLI flags) beating both. What used to be
//! module-level mutable state in older media servers — the media root and
//! the allowed extension sets — is an explicit value handed to each
//! component at construction.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::{BTreeSet, HashMap},
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_TUBESHELF_PORT: u16 = 8080;
pub const DEFAULT_TUBESHELF_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub media_root: PathBuf,
    pub tubeshelf_port: u16,
    pub tubeshelf_host: String,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub tubeshelf_port: Option<u16>,
    pub tubeshelf_host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_paths() -> Result<RuntimePaths> {
    resolve_runtime_paths(RuntimeOverrides::default())
}

pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_paths_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_paths(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimePaths> {
    build_runtime_paths_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_paths_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimePaths> {
    let media_root = overrides
        .media_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("MEDIA_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("MEDIA_ROOT not set"))?;
    let tubeshelf_port = overrides
        .tubeshelf_port
        .or_else(|| {
            lookup_value("TUBESHELF_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_TUBESHELF_PORT);
    let tubeshelf_host = overrides
        .tubeshelf_host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("TUBESHELF_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TUBESHELF_HOST.to_string());
    Ok(RuntimePaths {
        media_root: PathBuf::from(media_root),
        tubeshelf_port,
        tubeshelf_host,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Extension allow-lists shared by the orchestrator and the catalog.
/// Extensions are stored lowercase without the leading dot.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub audio_extensions: BTreeSet<String>,
    pub video_extensions: BTreeSet<String>,
    pub image_extensions: BTreeSet<String>,
}

impl MediaConfig {
    pub fn is_audio(&self, ext: &str) -> bool {
        self.audio_extensions.contains(&ext.to_ascii_lowercase())
    }

    pub fn is_video(&self, ext: &str) -> bool {
        self.video_extensions.contains(&ext.to_ascii_lowercase())
    }

    pub fn is_image(&self, ext: &str) -> bool {
        self.image_extensions.contains(&ext.to_ascii_lowercase())
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        fn set(items: &[&str]) -> BTreeSet<String> {
            items.iter().map(|item| item.to_string()).collect()
        }
        Self {
            audio_extensions: set(&["mp3", "wav", "ogg", "flac", "aac", "m4a"]),
            video_extensions: set(&["mp4", "webm", "avi", "mov", "mkv"]),
            image_extensions: set(&["jpg", "jpeg", "png", "gif", "webp"]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn runtime_from(contents: &str) -> RuntimePaths {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_paths(&vars, |_| None).unwrap()
    }

    #[test]
    fn load_runtime_paths_reads_port() {
        let runtime = runtime_from("MEDIA_ROOT=\"/media\"\nTUBESHELF_PORT=\"4242\"\n");
        assert_eq!(runtime.tubeshelf_port, 4242);
    }

    #[test]
    fn load_runtime_paths_defaults_missing_port_and_host() {
        let runtime = runtime_from("MEDIA_ROOT=\"/m\"\n");
        assert_eq!(runtime.tubeshelf_port, DEFAULT_TUBESHELF_PORT);
        assert_eq!(runtime.media_root, PathBuf::from("/m"));
        assert_eq!(runtime.tubeshelf_host, DEFAULT_TUBESHELF_HOST);
    }

    #[test]
    fn missing_media_root_is_an_error() {
        let cfg = make_config("TUBESHELF_PORT=\"4242\"\n");
        let vars = read_env_file(cfg.path()).unwrap();
        let err = build_runtime_paths(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("MEDIA_ROOT"));
    }

    #[test]
    fn build_runtime_paths_prefers_env_over_file() {
        let vars = read_env_file(make_config("MEDIA_ROOT=\"/file\"\n").path()).unwrap();
        let runtime = build_runtime_paths(&vars, |key| {
            if key == "MEDIA_ROOT" {
                Some("/env".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(runtime.media_root, PathBuf::from("/env"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export MEDIA_ROOT="/media"
            TUBESHELF_HOST =  "0.0.0.0"
            TUBESHELF_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("MEDIA_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("TUBESHELF_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("TUBESHELF_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn build_runtime_paths_override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("MEDIA_ROOT".to_string(), "/file-media".to_string());
        vars.insert("TUBESHELF_HOST".to_string(), "file-host".to_string());
        vars.insert("TUBESHELF_PORT".to_string(), "7000".to_string());

        let overrides = RuntimeOverrides {
            media_root: Some(PathBuf::from("/override-media")),
            tubeshelf_port: Some(9000),
            tubeshelf_host: Some("override-host".into()),
            env_path: None,
        };

        let runtime = build_runtime_paths_with_overrides(
            &vars,
            |key| {
                if key == "TUBESHELF_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(runtime.media_root, PathBuf::from("/override-media"));
        assert_eq!(runtime.tubeshelf_port, 9000);
        assert_eq!(runtime.tubeshelf_host, "override-host");
    }

    #[test]
    fn build_runtime_paths_ignores_blank_host() {
        let vars = read_env_file(make_config("MEDIA_ROOT=\"/m\"\n").path()).unwrap();
        let runtime = build_runtime_paths_with_overrides(
            &vars,
            |_| None,
            RuntimeOverrides {
                tubeshelf_host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(runtime.tubeshelf_host, DEFAULT_TUBESHELF_HOST);
    }

    #[test]
    fn build_runtime_paths_invalid_port_defaults() {
        let vars =
            read_env_file(make_config("MEDIA_ROOT=\"/m\"\nTUBESHELF_PORT=\"nope\"\n").path())
                .unwrap();
        let runtime = build_runtime_paths(&vars, |_| None).unwrap();
        assert_eq!(runtime.tubeshelf_port, DEFAULT_TUBESHELF_PORT);
    }

    #[test]
    fn media_config_matches_case_insensitively() {
        let cfg = MediaConfig::default();
        assert!(cfg.is_audio("MP3"));
        assert!(cfg.is_video("mkv"));
        assert!(cfg.is_image("JPEG"));
        assert!(!cfg.is_audio("mp4"));
        assert!(!cfg.is_video("txt"));
    }
}
