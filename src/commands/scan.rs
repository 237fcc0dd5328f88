use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use regex::Regex;
use tracing::{info, warn};

use crate::cli::{InputArgs, ScanArgs};
use crate::commands::inputs::resolve_input_root;
use crate::settings::load_paths;

/// Directory filters for the `<IC>/<yyyyMMdd>/<Lot>/` input layout.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub ic: Option<String>,
    pub lot: Option<String>,
    pub date: Option<NaiveDate>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl ScanFilter {
    pub fn from_args(args: &InputArgs) -> Self {
        Self {
            ic: args.ic.clone(),
            lot: args.lot.clone(),
            date: args.date,
            date_from: args.date_from,
            date_to: args.date_to,
        }
    }
}

pub fn run(args: ScanArgs) -> Result<()> {
    let paths = load_paths(args.input.settings.as_deref())?;
    let input_root = resolve_input_root(&args.input, &paths)?;
    let files = enumerate_csv_files(&input_root, &ScanFilter::from_args(&args.input))?;

    if files.is_empty() {
        warn!(root = %input_root.display(), "no csv files matched the given filters");
        return Ok(());
    }

    info!(root = %input_root.display(), count = files.len(), "scan completed");
    for file in &files {
        println!("{}", file.display());
    }
    Ok(())
}

/// Lists `*.csv` files below every selected lot directory, sorted per level.
///
/// A missing root yields an empty list; unreadable directories are skipped.
pub fn enumerate_csv_files(root: &Path, filter: &ScanFilter) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        warn!(root = %root.display(), "input root does not exist");
        return Ok(Vec::new());
    }

    let date_pattern = Regex::new(r"^\d{8}$").context("failed to compile date directory regex")?;
    let mut files = Vec::new();

    for ic_dir in select_dirs(root, filter.ic.as_deref()) {
        let date_dirs = match filter.date {
            Some(date) => exact_dir(&ic_dir, &date.format("%Y%m%d").to_string()),
            None => list_dirs(&ic_dir)
                .into_iter()
                .filter(|dir| date_dir_in_range(dir, &date_pattern, filter))
                .collect(),
        };

        for date_dir in date_dirs {
            for lot_dir in select_dirs(&date_dir, filter.lot.as_deref()) {
                collect_csv_recursive(&lot_dir, &mut files);
            }
        }
    }

    Ok(files)
}

fn select_dirs(parent: &Path, name: Option<&str>) -> Vec<PathBuf> {
    match name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => exact_dir(parent, name),
        None => list_dirs(parent),
    }
}

fn exact_dir(parent: &Path, name: &str) -> Vec<PathBuf> {
    let candidate = parent.join(name);
    if candidate.is_dir() {
        vec![candidate]
    } else {
        Vec::new()
    }
}

fn date_dir_in_range(dir: &Path, pattern: &Regex, filter: &ScanFilter) -> bool {
    let Some(name) = dir.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    if !pattern.is_match(name) {
        return false;
    }
    let Ok(date) = NaiveDate::parse_from_str(name, "%Y%m%d") else {
        return false;
    };

    filter.date_from.is_none_or(|from| date >= from) && filter.date_to.is_none_or(|to| date <= to)
}

fn list_entries(dir: &Path) -> Vec<fs::DirEntry> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "failed to list directory");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for entry in entries {
        match entry {
            Ok(entry) => out.push(entry),
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "failed to read directory entry");
            }
        }
    }
    out.sort_by_key(|entry| entry.file_name());
    out
}

fn list_dirs(dir: &Path) -> Vec<PathBuf> {
    list_entries(dir)
        .into_iter()
        .filter(|entry| entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect()
}

fn collect_csv_recursive(dir: &Path, files: &mut Vec<PathBuf>) {
    let mut subdirs = Vec::new();

    for entry in list_entries(dir) {
        let Ok(kind) = entry.file_type() else {
            continue;
        };
        let path = entry.path();
        if kind.is_dir() {
            subdirs.push(path);
            continue;
        }

        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if kind.is_file() && is_csv {
            files.push(path);
        }
    }

    for subdir in subdirs {
        collect_csv_recursive(&subdir, files);
    }
}
