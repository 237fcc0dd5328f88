use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, warn};

use crate::model::DefectCode;

/// Defect codes loaded from a `NN_Name` per-line text file.
#[derive(Debug, Default)]
pub struct Codebook {
    by_code: HashMap<u32, DefectCode>,
    by_name: HashMap<String, DefectCode>,
}

pub fn code_pattern() -> Result<Regex> {
    Regex::new(r"^(\d+)_(.+)$").context("failed to compile defect code regex")
}

impl Codebook {
    /// A missing file yields an empty codebook.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "codebook not found");
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read codebook {}", path.display()))?;
        let codebook = Self::parse(&raw)?;
        info!(path = %path.display(), codes = codebook.len(), "loaded codebook");
        Ok(codebook)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let pattern = code_pattern()?;
        let mut codebook = Self::default();

        for (index, line) in raw.lines().enumerate() {
            let entry = line.trim().trim_start_matches('\u{feff}');
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }

            let parsed = pattern.captures(entry).and_then(|captures| {
                let code = captures.get(1)?.as_str().parse::<u32>().ok()?;
                let name = captures.get(2)?.as_str().trim().to_string();
                Some(DefectCode { code, name })
            });
            let Some(defect) = parsed else {
                warn!(line = index + 1, value = %entry, "invalid codebook line");
                continue;
            };

            codebook
                .by_name
                .insert(defect.name.to_lowercase(), defect.clone());
            codebook.by_code.insert(defect.code, defect);
        }

        Ok(codebook)
    }

    pub fn by_code(&self, code: u32) -> Option<&DefectCode> {
        self.by_code.get(&code)
    }

    pub fn by_name(&self, name: &str) -> Option<&DefectCode> {
        self.by_name.get(&name.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}
