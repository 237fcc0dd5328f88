use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, info};

use crate::util::UTF8_BOM;

pub const DEFAULT_SETTINGS_FILE: &str = "appsettings.json";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppSettings {
    #[serde(default)]
    pub paths: PathSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PathSettings {
    pub input_root: Option<String>,
    pub output_root: Option<String>,
    pub codebook_path: Option<String>,
}

/// Settings paths with relative entries resolved against the settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub input_root: Option<PathBuf>,
    pub output_root: Option<PathBuf>,
    pub codebook_path: Option<PathBuf>,
}

/// An explicit path must exist; the default file is optional.
pub fn load_paths(explicit: Option<&Path>) -> Result<ResolvedPaths> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("settings file not found: {}", path.display());
            }
            path.to_path_buf()
        }
        None => {
            let fallback = PathBuf::from(DEFAULT_SETTINGS_FILE);
            if !fallback.exists() {
                debug!("no settings file; using command-line paths only");
                return Ok(ResolvedPaths::default());
            }
            fallback
        }
    };

    let raw =
        fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let settings: AppSettings = serde_json::from_slice(strip_bom(&raw))
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let base = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let resolved = ResolvedPaths {
        input_root: resolve_entry(&base, settings.paths.input_root.as_deref()),
        output_root: resolve_entry(&base, settings.paths.output_root.as_deref()),
        codebook_path: resolve_entry(&base, settings.paths.codebook_path.as_deref()),
    };

    info!(path = %path.display(), "loaded settings");
    Ok(resolved)
}

fn strip_bom(raw: &[u8]) -> &[u8] {
    raw.strip_prefix(UTF8_BOM).unwrap_or(raw)
}

fn resolve_entry(base: &Path, value: Option<&str>) -> Option<PathBuf> {
    let value = value.map(str::trim).filter(|value| !value.is_empty())?;
    let path = PathBuf::from(value);
    if path.is_absolute() {
        Some(path)
    } else {
        Some(base.join(path))
    }
}
