use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{info, warn};

use crate::cli::TrendArgs;
use crate::codebook::{Codebook, code_pattern};
use crate::commands::inputs::{build_conditions, resolve_output_root, select_inputs};
use crate::conditions::ConditionSet;
use crate::model::InspectionRecord;
use crate::settings::load_paths;
use crate::source::RecordStream;
use crate::util::{
    UTF8_BOM, ensure_directory, escape_csv_cell, local_compact_stamp, sanitize_file_label,
};

pub fn run(args: TrendArgs) -> Result<()> {
    let paths = load_paths(args.input.settings.as_deref())?;
    let selection = select_inputs(&args.input, &args.files, &paths)?;
    let output_root = resolve_output_root(
        args.output_root.as_deref(),
        &paths,
        selection.input_root.as_deref(),
    );
    let conditions = build_conditions(&args.input, &args.conditions);
    conditions.validate()?;

    let mut selectors = split_trend_codes(&args.trend_codes);
    info!(codes = %selectors.join(", "), "trend codes");
    if let Some(codebook_path) = args.codebook.as_ref().or(paths.codebook_path.as_ref()) {
        let codebook = Codebook::load(codebook_path)?;
        if codebook.is_empty() {
            warn!(path = %codebook_path.display(), "codebook is empty; trend codes kept as given");
        }
        selectors = normalize_with_codebook(&selectors, &codebook)?;
    }

    let stream = RecordStream::new(selection.files);
    match write_daily_trend(stream, &conditions, &selectors, &output_root)? {
        Some(path) => info!(path = %path.display(), "trend report written"),
        None => info!("trend report skipped"),
    }
    Ok(())
}

/// Splits `--trend-codes` on `,` or `;`, dropping blanks.
pub fn split_trend_codes(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Best-effort mapping of selectors to `NN_Name` form.
///
/// `NN_Name` stays as is; a bare number becomes the codebook entry or `{n:02}_{sel}`;
/// a known name becomes its codebook entry; anything else is kept.
pub fn normalize_with_codebook(selectors: &[String], codebook: &Codebook) -> Result<Vec<String>> {
    let pattern = code_pattern()?;
    let mut normalized = Vec::with_capacity(selectors.len());

    for selector in selectors {
        let value = selector.trim();
        if pattern.is_match(value) {
            normalized.push(value.to_string());
            continue;
        }

        if !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit()) {
            let entry = value.parse::<u32>().ok().map(|code| {
                codebook
                    .by_code(code)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| format!("{code:02}_{value}"))
            });
            normalized.push(entry.unwrap_or_else(|| value.to_string()));
            continue;
        }

        match codebook.by_name(value) {
            Some(code) => normalized.push(code.to_string()),
            None => normalized.push(value.to_string()),
        }
    }

    Ok(normalized)
}

/// Trims selectors and drops case-insensitive duplicates, keeping first spellings.
pub fn normalize_selectors(selectors: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    selectors
        .iter()
        .map(|selector| selector.trim())
        .filter(|selector| !selector.is_empty())
        .filter(|selector| seen.insert(selector.to_lowercase()))
        .map(ToOwned::to_owned)
        .collect()
}

/// Index of the first selector equal to the raw code or its name part.
fn matching_selector(code_raw: &str, targets: &[String]) -> Option<usize> {
    let raw = code_raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(index) = targets
        .iter()
        .position(|target| target.eq_ignore_ascii_case(raw))
    {
        return Some(index);
    }

    let key = match raw.split_once('_') {
        Some((prefix, name)) if !prefix.is_empty() && !name.is_empty() => name,
        _ => raw,
    };
    targets
        .iter()
        .position(|target| target.to_lowercase() == key.to_lowercase())
}

fn trend_range_label(conditions: &ConditionSet) -> String {
    conditions.range_label().unwrap_or_else(|| "ALL".to_string())
}

/// Writes `exports/Trend_{IC}_{Lot}_{Range}_{stamp}.csv` with one row per day.
///
/// Returns `None` without reading the source when no selector survives
/// normalization.
pub fn write_daily_trend<I>(
    source: I,
    conditions: &ConditionSet,
    selectors: &[String],
    output_root: &Path,
) -> Result<Option<PathBuf>>
where
    I: IntoIterator<Item = InspectionRecord>,
{
    let targets = normalize_selectors(selectors);
    if targets.is_empty() {
        warn!("no trend codes given (--trend-codes); skipping trend report");
        return Ok(None);
    }

    let exports_dir = output_root.join("exports");
    ensure_directory(&exports_dir)?;
    let file_name = format!(
        "Trend_{}_{}_{}_{}.csv",
        sanitize_file_label(conditions.ic_filter().unwrap_or("IC")),
        sanitize_file_label(conditions.lot_filter().unwrap_or("ALL")),
        sanitize_file_label(&trend_range_label(conditions)),
        local_compact_stamp()
    );
    let path = exports_dir.join(file_name);

    let mut daily: BTreeMap<NaiveDate, Vec<u64>> = BTreeMap::new();
    let mut matched = 0u64;
    for record in source {
        if !conditions.matches(&record) {
            continue;
        }
        let Some(index) = matching_selector(&record.code_raw, &targets) else {
            continue;
        };
        let counts = daily
            .entry(record.timestamp.date())
            .or_insert_with(|| vec![0; targets.len()]);
        counts[index] += 1;
        matched += 1;
    }

    let file = File::create(&path)
        .with_context(|| format!("failed to create trend report: {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let header = std::iter::once("Date".to_string())
        .chain(targets.iter().map(|target| escape_csv_cell(target)))
        .collect::<Vec<String>>()
        .join(",");
    writer
        .write_all(UTF8_BOM)
        .and_then(|_| writeln!(writer, "{header}"))
        .with_context(|| format!("failed to write trend report: {}", path.display()))?;

    for (day, counts) in &daily {
        let row = std::iter::once(day.format("%Y-%m-%d").to_string())
            .chain(counts.iter().map(ToString::to_string))
            .collect::<Vec<String>>()
            .join(",");
        writeln!(writer, "{row}")
            .with_context(|| format!("failed to write trend report: {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush trend report: {}", path.display()))?;

    info!(
        path = %path.display(),
        days = daily.len(),
        matched,
        codes = targets.len(),
        "wrote daily trend"
    );
    Ok(Some(path))
}
