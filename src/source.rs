use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, NaiveDateTime};
use tracing::{info, warn};

use crate::model::{Face, InspectionRecord};

const DELIMITER_CANDIDATES: [char; 4] = [',', '\t', ';', '|'];

const LOT_ALIASES: &[&str] = &["lotno", "lot", "lot_no", "lot number"];
const TIMESTAMP_ALIASES: &[&str] = &["timestamp", "time", "datetime", "ymd-hms"];
const EQUIPMENT_ALIASES: &[&str] = &["equipmentcode", "ic", "eq", "equipment"];
const LEDGER_ALIASES: &[&str] = &["ledgerno", "ledger", "ld"];
const FACE_ALIASES: &[&str] = &["face", "side", "surface"];
const X_ALIASES: &[&str] = &["x", "posx"];
const Y_ALIASES: &[&str] = &["y", "posy"];
const SEVERITY_ALIASES: &[&str] = &["severity", "sev", "rank"];
const CODE_ALIASES: &[&str] = &["coderaw", "code", "defect", "ngcode"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y%m%d-%H%M%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y-%m-%d %H:%M",
];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

#[derive(Debug, Clone)]
struct ColumnMap {
    lot: Option<usize>,
    timestamp: usize,
    equipment: Option<usize>,
    ledger: Option<usize>,
    face: Option<usize>,
    x: usize,
    y: usize,
    severity: usize,
    code: Option<usize>,
    metrics: Vec<(usize, String)>,
}

impl ColumnMap {
    fn from_header(header: &[String]) -> Result<Self> {
        let find = |aliases: &[&str]| {
            header
                .iter()
                .position(|name| aliases.contains(&name.trim().to_lowercase().as_str()))
        };
        let require = |aliases: &[&str], label: &str| {
            find(aliases).with_context(|| format!("missing required column: {label}"))
        };

        let mut map = Self {
            lot: find(LOT_ALIASES),
            timestamp: require(TIMESTAMP_ALIASES, "Timestamp")?,
            equipment: find(EQUIPMENT_ALIASES),
            ledger: find(LEDGER_ALIASES),
            face: find(FACE_ALIASES),
            x: require(X_ALIASES, "X")?,
            y: require(Y_ALIASES, "Y")?,
            severity: require(SEVERITY_ALIASES, "Severity")?,
            code: find(CODE_ALIASES),
            metrics: Vec::new(),
        };

        let mapped = [
            map.lot,
            Some(map.timestamp),
            map.equipment,
            map.ledger,
            map.face,
            Some(map.x),
            Some(map.y),
            Some(map.severity),
            map.code,
        ];
        map.metrics = header
            .iter()
            .enumerate()
            .filter(|(index, name)| !mapped.contains(&Some(*index)) && !name.trim().is_empty())
            .map(|(index, name)| (index, name.trim().to_string()))
            .collect();

        Ok(map)
    }
}

/// Streams well-formed records out of one vendor CSV file.
///
/// Rows that fail to parse are logged and skipped; the count is kept for the
/// caller's run summary.
pub struct CsvRecordReader {
    path: PathBuf,
    reader: BufReader<File>,
    delimiter: char,
    columns: ColumnMap,
    line_no: usize,
    emitted: u64,
    skipped: u64,
    finished: bool,
}

impl CsvRecordReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut line_no = 0usize;
        let Some(header_line) = read_logical_line(&mut reader, &mut line_no)
            .with_context(|| format!("failed to read header of {}", path.display()))?
        else {
            bail!("empty csv file: {}", path.display());
        };
        let header_line = header_line.trim_start_matches('\u{feff}').to_string();

        let delimiter = detect_delimiter(&header_line);
        let header = split_fields(&header_line, delimiter);
        let columns = ColumnMap::from_header(&header)
            .with_context(|| format!("unsupported csv header in {}", path.display()))?;

        info!(
            path = %path.display(),
            delimiter = %delimiter.escape_default(),
            columns = header.len(),
            "reading csv"
        );

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            delimiter,
            columns,
            line_no,
            emitted: 0,
            skipped: 0,
            finished: false,
        })
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.skipped > 0 {
            warn!(path = %self.path.display(), skipped = self.skipped, "skipped unparsable rows");
        }
        info!(path = %self.path.display(), records = self.emitted, "finished csv");
    }
}

impl Iterator for CsvRecordReader {
    type Item = InspectionRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let line = match read_logical_line(&mut self.reader, &mut self.line_no) {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.finish();
                    return None;
                }
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        line = self.line_no,
                        error = %err,
                        "aborting csv read"
                    );
                    self.finish();
                    return None;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let fields = split_fields(&line, self.delimiter);
            match parse_record(&fields, &self.columns) {
                Ok(record) => {
                    self.emitted += 1;
                    return Some(record);
                }
                Err(err) => {
                    self.skipped += 1;
                    warn!(
                        path = %self.path.display(),
                        line = self.line_no,
                        error = %err,
                        "skipping row"
                    );
                }
            }
        }
    }
}

/// Concatenates the records of several files, opening each lazily.
///
/// Files that cannot be opened or whose header is unusable are skipped with a
/// warning.
pub struct RecordStream {
    pending: VecDeque<PathBuf>,
    current: Option<CsvRecordReader>,
    skipped_rows: u64,
    rejected_files: Vec<PathBuf>,
}

impl RecordStream {
    pub fn new(files: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            pending: files.into_iter().collect(),
            current: None,
            skipped_rows: 0,
            rejected_files: Vec::new(),
        }
    }

    pub fn skipped_rows(&self) -> u64 {
        self.skipped_rows + self.current.as_ref().map(CsvRecordReader::skipped).unwrap_or(0)
    }

    pub fn rejected_files(&self) -> &[PathBuf] {
        &self.rejected_files
    }
}

impl Iterator for RecordStream {
    type Item = InspectionRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                if let Some(record) = reader.next() {
                    return Some(record);
                }
                self.skipped_rows += reader.skipped();
                self.current = None;
            }

            let path = self.pending.pop_front()?;
            match CsvRecordReader::open(&path) {
                Ok(reader) => self.current = Some(reader),
                Err(err) => {
                    warn!(path = %path.display(), error = %format!("{err:#}"), "skipping csv file");
                    self.rejected_files.push(path);
                }
            }
        }
    }
}

/// Reads one physical line, extended while a quoted field is still open.
fn read_logical_line(reader: &mut impl BufRead, line_no: &mut usize) -> Result<Option<String>> {
    let mut logical = String::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            if logical.is_empty() {
                return Ok(None);
            }
            let trimmed = logical.trim_end_matches(['\r', '\n']).len();
            logical.truncate(trimmed);
            return Ok(Some(logical));
        }
        *line_no += 1;

        let text = String::from_utf8_lossy(&buf);
        logical.push_str(&text);

        if logical.chars().filter(|ch| *ch == '"').count() % 2 == 0 {
            let trimmed = logical.trim_end_matches(['\r', '\n']).len();
            logical.truncate(trimmed);
            return Ok(Some(logical));
        }
    }
}

/// The candidate occurring most often in the header wins; ties keep the earlier candidate.
pub fn detect_delimiter(header_line: &str) -> char {
    let mut best = (',', 0usize);
    for candidate in DELIMITER_CANDIDATES {
        let count = header_line.matches(candidate).count();
        if count > best.1 {
            best = (candidate, count);
        }
    }
    best.0
}

pub fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(ch);
            }
        } else if ch == '"' {
            in_quotes = true;
        } else if ch == delimiter {
            fields.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(ch);
        }
    }
    fields.push(current.trim().to_string());

    fields
}

fn parse_record(fields: &[String], columns: &ColumnMap) -> Result<InspectionRecord> {
    let timestamp = parse_timestamp(required_field(fields, columns.timestamp, "timestamp")?)?;
    let x = parse_coordinate(required_field(fields, columns.x, "x")?, "x")?;
    let y = parse_coordinate(required_field(fields, columns.y, "y")?, "y")?;
    let severity_raw = required_field(fields, columns.severity, "severity")?;
    let severity = severity_raw
        .parse::<u32>()
        .with_context(|| format!("invalid severity: {severity_raw}"))?;

    let mut metrics = BTreeMap::new();
    for (index, name) in &columns.metrics {
        if let Some(value) = fields.get(*index)
            && let Ok(parsed) = value.parse::<f64>()
        {
            metrics.insert(name.clone(), parsed);
        }
    }

    Ok(InspectionRecord {
        lot_no: optional_field(fields, columns.lot),
        timestamp,
        equipment_code: optional_field(fields, columns.equipment),
        ledger_no: optional_field(fields, columns.ledger),
        face: Face::parse_label(&optional_field(fields, columns.face)),
        x,
        y,
        severity,
        code_raw: optional_field(fields, columns.code),
        metrics,
    })
}

fn optional_field(fields: &[String], index: Option<usize>) -> String {
    index
        .and_then(|index| fields.get(index))
        .cloned()
        .unwrap_or_default()
}

fn required_field<'a>(fields: &'a [String], index: usize, label: &str) -> Result<&'a str> {
    fields
        .get(index)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .with_context(|| format!("missing {label}"))
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    let trimmed = value.trim();
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format)
            && let Some(midnight) = date.and_hms_opt(0, 0, 0)
        {
            return Ok(midnight);
        }
    }
    bail!("invalid timestamp: '{trimmed}'")
}

fn parse_coordinate(value: &str, label: &str) -> Result<f64> {
    let parsed = value
        .parse::<f64>()
        .with_context(|| format!("invalid {label}: {value}"))?;
    if !parsed.is_finite() {
        bail!("non-finite {label}: {value}");
    }
    Ok(parsed)
}
