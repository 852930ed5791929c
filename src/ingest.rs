/// Transcript scanning: correlate tool invocations with their results and
/// collect the per-file session fragment.
///
/// Each file is scanned independently with its own correlation map. An
/// invocation still unmatched at end of file is dropped without an event.
use crate::discovery;
use crate::record::{ContentBlock, RawRecord, RecordKind};
use crate::session::SessionFragment;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Durations outside `(0, MAX_DURATION_MS]` are treated as clock skew.
pub const MAX_DURATION_MS: i64 = 600_000;

static GIT_COMMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bgit\s+commit\b").unwrap());
static GH_PR_CREATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bgh\s+pr\s+create\b").unwrap());

type ParamExtractor = fn(&Map<String, Value>) -> Option<Value>;

/// Tools whose input is surfaced as structured parameters.
static PARAM_EXTRACTORS: &[(&str, ParamExtractor)] = &[
    ("Bash", bash_parameters as ParamExtractor),
    ("Skill", skill_parameters as ParamExtractor),
];

fn bash_parameters(input: &Map<String, Value>) -> Option<Value> {
    let cmd = input.get("command")?.as_str()?;
    Some(json!({ "bash_command": cmd }))
}

fn skill_parameters(input: &Map<String, Value>) -> Option<Value> {
    let skill = input.get("skill")?.as_str()?;
    Some(json!({ "skill_name": skill }))
}

/// Structured parameters for a tool invocation, if the tool has an extractor.
pub fn tool_parameters(tool_name: &str, input: &Value) -> Option<Value> {
    let input = input.as_object()?;
    PARAM_EXTRACTORS
        .iter()
        .find(|(name, _)| *name == tool_name)
        .and_then(|(_, extract)| extract(input))
}

/// Milliseconds between invocation and result, or `None` when not in
/// `(0, MAX_DURATION_MS]`.
pub fn bounded_duration_ms(issued: DateTime<Utc>, resolved: DateTime<Utc>) -> Option<u64> {
    let ms = (resolved - issued).num_milliseconds();
    if ms <= 0 || ms > MAX_DURATION_MS {
        None
    } else {
        Some(ms as u64)
    }
}

/// One tool invocation matched with its result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolEvent {
    /// The result's timestamp.
    pub timestamp: DateTime<Utc>,
    pub project: String,
    pub session_id: String,
    pub tool_name: String,
    pub success: bool,
    pub duration_ms: Option<u64>,
    pub tool_parameters: Option<Value>,
}

impl ToolEvent {
    pub fn timestamp_ns(&self) -> i64 {
        self.timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_micros().saturating_mul(1000))
    }
}

/// Everything one transcript file contributes.
#[derive(Debug, Default)]
pub struct FileScan {
    pub events: Vec<ToolEvent>,
    pub fragment: SessionFragment,
}

#[derive(Debug)]
struct PendingInvocation {
    name: String,
    input: Value,
    issued_at: DateTime<Utc>,
}

/// Per-file scanner state. Created empty for each file, consumed at the end.
struct FileScanner {
    project: String,
    file_session_id: String,
    pending: HashMap<String, PendingInvocation>,
    pending_commits: HashSet<String>,
    pending_prs: HashSet<String>,
    events: Vec<ToolEvent>,
    fragment: SessionFragment,
}

impl FileScanner {
    fn new(project: &str, file_session_id: &str) -> Self {
        Self {
            project: project.to_string(),
            file_session_id: file_session_id.to_string(),
            pending: HashMap::new(),
            pending_commits: HashSet::new(),
            pending_prs: HashSet::new(),
            events: Vec::new(),
            fragment: SessionFragment {
                project: project.to_string(),
                ..SessionFragment::default()
            },
        }
    }

    fn observe(&mut self, record: RawRecord) {
        if self.fragment.session_id.is_none() {
            self.fragment.session_id = record.session_id.clone();
        }
        self.fragment.timestamps.push(record.timestamp);

        match record.kind {
            RecordKind::Assistant => self.observe_assistant(&record),
            RecordKind::User => self.observe_user(&record),
            RecordKind::Other => {}
        }
    }

    fn observe_assistant(&mut self, record: &RawRecord) {
        for block in &record.blocks {
            let ContentBlock::ToolUse { id, name, input } = block else {
                continue;
            };
            self.track_changes(id.as_deref(), name, input);
            let Some(id) = id else {
                continue;
            };
            self.pending.insert(
                id.clone(),
                PendingInvocation {
                    name: name.clone(),
                    input: input.clone(),
                    issued_at: record.timestamp,
                },
            );
        }

        if let Some(usage) = &record.usage {
            let model = record.model.as_deref().unwrap_or("unknown");
            self.fragment.tokens.record(model, usage);
        }
    }

    /// Lines of code from Edit/Write, and commit/PR attempts from Bash. Commit
    /// and PR attempts need an id to be confirmed by their result.
    fn track_changes(&mut self, id: Option<&str>, name: &str, input: &Value) {
        let Some(input) = input.as_object() else {
            return;
        };
        match name {
            "Edit" => {
                self.fragment.lines_removed += line_count(input.get("old_string"));
                self.fragment.lines_added += line_count(input.get("new_string"));
            }
            "Write" => {
                self.fragment.lines_added += line_count(input.get("content"));
            }
            "Bash" => {
                let (Some(id), Some(cmd)) = (id, input.get("command").and_then(Value::as_str))
                else {
                    return;
                };
                if GIT_COMMIT_RE.is_match(cmd) {
                    self.pending_commits.insert(id.to_string());
                } else if GH_PR_CREATE_RE.is_match(cmd) {
                    self.pending_prs.insert(id.to_string());
                }
            }
            _ => {}
        }
    }

    fn observe_user(&mut self, record: &RawRecord) {
        for block in &record.blocks {
            let ContentBlock::ToolResult {
                tool_use_id,
                is_error,
            } = block
            else {
                continue;
            };

            if *is_error {
                self.pending_commits.remove(tool_use_id);
                self.pending_prs.remove(tool_use_id);
            } else if self.pending_commits.remove(tool_use_id) {
                self.fragment.commits += 1;
            } else if self.pending_prs.remove(tool_use_id) {
                self.fragment.pull_requests += 1;
            }

            let Some(pending) = self.pending.remove(tool_use_id) else {
                continue;
            };
            self.events.push(ToolEvent {
                timestamp: record.timestamp,
                project: self.project.clone(),
                session_id: self.file_session_id.clone(),
                tool_parameters: tool_parameters(&pending.name, &pending.input),
                duration_ms: bounded_duration_ms(pending.issued_at, record.timestamp),
                tool_name: pending.name,
                success: !is_error,
            });
        }
    }

    fn finish(self) -> FileScan {
        if !self.pending.is_empty() {
            tracing::trace!(
                unmatched = self.pending.len(),
                session = %self.file_session_id,
                "dropping unmatched tool invocations"
            );
        }
        FileScan {
            events: self.events,
            fragment: self.fragment,
        }
    }
}

/// "Newline count + 1" for a non-empty string, zero otherwise.
fn line_count(v: Option<&Value>) -> u64 {
    match v.and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.matches('\n').count() as u64 + 1,
        _ => 0,
    }
}

/// Scan a transcript from any line source. Malformed lines are skipped; a
/// read error (including invalid UTF-8) aborts the whole scan.
pub fn scan_reader<R: BufRead>(
    reader: R,
    project: &str,
    file_session_id: &str,
) -> std::io::Result<FileScan> {
    let mut scanner = FileScanner::new(project, file_session_id);
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(record) = RawRecord::parse_line(line) {
            scanner.observe(record);
        }
    }
    Ok(scanner.finish())
}

/// Failure to read one transcript file.
#[derive(Debug)]
pub enum ScanError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Open { path, source } => {
                write!(f, "cannot open {}: {}", path.display(), source)
            }
            ScanError::Read { path, source } => {
                write!(f, "cannot read {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::Open { source, .. } | ScanError::Read { source, .. } => Some(source),
        }
    }
}

fn try_scan_file(root: &Path, path: &Path) -> Result<FileScan, ScanError> {
    let project = discovery::project_name(root, path);
    let session_id = discovery::file_session_id(path);

    let file = std::fs::File::open(path).map_err(|source| ScanError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    scan_reader(std::io::BufReader::new(file), &project, &session_id).map_err(|source| {
        ScanError::Read {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Scan one transcript file. I/O or decoding failure is logged and the file
/// contributes nothing.
pub fn scan_file(root: &Path, path: &Path) -> Option<FileScan> {
    match try_scan_file(root, path) {
        Ok(scan) => Some(scan),
        Err(e) => {
            tracing::warn!(error = %e, "skipping transcript");
            None
        }
    }
}

/// Scan every file in order, logging progress every 100 files.
pub fn scan_all(root: &Path, files: &[PathBuf]) -> Vec<FileScan> {
    let mut scans = Vec::with_capacity(files.len());
    for (i, path) in files.iter().enumerate() {
        if (i + 1) % 100 == 0 {
            tracing::info!(done = i + 1, total = files.len(), "parsing transcripts");
        }
        if let Some(scan) = scan_file(root, path) {
            scans.push(scan);
        }
    }
    scans
}
