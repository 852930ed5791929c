/// The two backfill runs: tool events to Loki, sessions to an OpenMetrics file.
use crate::config::{LokiSettings, MetricsSettings, SourceSettings};
use crate::discovery;
use crate::ingest::{self, FileScan, ToolEvent};
use crate::loki::{HttpTransport, LokiPusher, PushError, PushOutcome};
use crate::openmetrics;
use crate::session::{self, Session};
use crate::summary;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Failure to deliver the exposition text.
#[derive(Debug)]
pub enum OutputError {
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Stdout(std::io::Error),
}

impl std::fmt::Display for OutputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputError::CreateDir { path, source } => {
                write!(f, "failed to create {}: {}", path.display(), source)
            }
            OutputError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            OutputError::Rename { from, to, source } => write!(
                f,
                "failed to rename {} to {}: {}",
                from.display(),
                to.display(),
                source
            ),
            OutputError::Stdout(e) => write!(f, "failed to write to stdout: {e}"),
        }
    }
}

impl std::error::Error for OutputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OutputError::CreateDir { source, .. }
            | OutputError::Write { source, .. }
            | OutputError::Rename { source, .. } => Some(source),
            OutputError::Stdout(e) => Some(e),
        }
    }
}

fn scan_tree(source: &SourceSettings) -> Vec<FileScan> {
    let files = discovery::find_jsonl_files(&source.projects_dir);
    tracing::info!(
        files = files.len(),
        root = %source.projects_dir.display(),
        "found transcripts"
    );
    ingest::scan_all(&source.projects_dir, &files)
}

/// Every correlated tool event under the root, minus those at or after the
/// cutoff.
pub fn collect_events(source: &SourceSettings) -> Vec<ToolEvent> {
    let mut events: Vec<ToolEvent> = scan_tree(source)
        .into_iter()
        .flat_map(|scan| scan.events)
        .collect();
    tracing::info!(events = events.len(), "extracted tool events");

    if let Some(cutoff) = source.before {
        let before = events.len();
        events.retain(|ev| ev.timestamp < cutoff);
        tracing::info!(
            kept = events.len(),
            dropped = before - events.len(),
            %cutoff,
            "filtered events by date"
        );
    }
    events
}

/// Merged sessions under the root, minus those starting at or after the
/// cutoff.
pub fn collect_sessions(source: &SourceSettings) -> Vec<Session> {
    let fragments: Vec<_> = scan_tree(source)
        .into_iter()
        .map(|scan| scan.fragment)
        .filter(|f| !f.tokens.is_empty())
        .collect();
    tracing::info!(files = fragments.len(), "parsed files with usage data");

    let mut sessions = session::merge_fragments(fragments);
    tracing::info!(sessions = sessions.len(), "merged into unique sessions");

    if let Some(cutoff) = source.before {
        session::retain_before(&mut sessions, cutoff);
        tracing::info!(kept = sessions.len(), %cutoff, "filtered sessions by date");
    }
    sessions
}

/// Scan, summarize and push tool events. Batch failures are counted in the
/// outcome; only a transport that cannot be built is an error.
pub async fn run_loki(
    source: &SourceSettings,
    loki: &LokiSettings,
    dry_run: bool,
) -> Result<PushOutcome, PushError> {
    let events = collect_events(source);
    eprint!("{}", summary::tool_events(&events));

    if events.is_empty() {
        return Ok(PushOutcome::default());
    }
    if dry_run {
        eprintln!("Dry run: no data pushed to Loki.");
        return Ok(PushOutcome::default());
    }

    tracing::info!(
        events = events.len(),
        url = %loki.url,
        batch_size = loki.batch_size,
        "pushing to Loki"
    );
    let transport = HttpTransport::new(&loki.url, loki.timeout)?;
    let pusher = LokiPusher::new(transport, loki.batch_size, loki.max_attempts);
    let outcome = pusher.push_all(&events).await;
    eprintln!(
        "Pushed {} events ({} errors)",
        summary::group_thousands(outcome.pushed as u64),
        outcome.failed_batches
    );
    Ok(outcome)
}

/// Scan, summarize and render sessions as OpenMetrics text.
pub fn run_metrics(
    source: &SourceSettings,
    metrics: &MetricsSettings,
    dry_run: bool,
) -> Result<(), OutputError> {
    let sessions = collect_sessions(source);
    eprint!("{}", summary::sessions(&sessions));

    if sessions.is_empty() {
        return Ok(());
    }
    if dry_run {
        eprintln!("Dry run: no output generated.");
        return Ok(());
    }

    let text = openmetrics::render(&sessions, metrics.step_secs);
    match &metrics.output {
        Some(path) => {
            write_output(path, &text)?;
            eprintln!("Wrote {} bytes to {}", text.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(text.as_bytes())
                .and_then(|()| stdout.flush())
                .map_err(OutputError::Stdout)?;
        }
    }
    Ok(())
}

/// Write via a temp file in the target directory, then rename into place.
fn write_output(path: &Path, text: &str) -> Result<(), OutputError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|source| OutputError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let tmp_path = dir.join(format!(".openmetrics.tmp.{}", std::process::id()));
    std::fs::write(&tmp_path, text.as_bytes()).map_err(|source| OutputError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| OutputError::Rename {
        from: tmp_path,
        to: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_before;
    use crate::session::TokenKind;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    const SESSION_LINES: &str = concat!(
        r#"{"type":"assistant","timestamp":"2025-06-01T12:00:00Z","sessionId":"sess-1","message":{"model":"claude-sonnet-4","usage":{"input_tokens":1000,"output_tokens":200},"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"git commit -m x"}}]}}"#,
        "\n",
        r#"{"type":"user","timestamp":"2025-06-01T12:00:02Z","sessionId":"sess-1","message":{"content":[{"type":"tool_result","tool_use_id":"t1"}]}}"#,
        "\n",
        r#"{"type":"assistant","timestamp":"2025-06-01T12:02:00Z","sessionId":"sess-1","message":{"model":"claude-sonnet-4","usage":{"output_tokens":50},"content":[{"type":"tool_use","id":"t2","name":"Read","input":{"file_path":"a.rs"}}]}}"#,
        "\n",
        r#"{"type":"user","timestamp":"2025-06-01T12:02:01Z","sessionId":"sess-1","message":{"content":[{"type":"tool_result","tool_use_id":"t2","is_error":true}]}}"#,
        "\n",
    );

    const LATE_LINES: &str = concat!(
        r#"{"type":"assistant","timestamp":"2025-07-01T09:00:00Z","sessionId":"sess-2","message":{"model":"claude-opus-4-1","usage":{"input_tokens":10},"content":[{"type":"tool_use","id":"u1","name":"Grep","input":{}}]}}"#,
        "\n",
        r#"{"type":"user","timestamp":"2025-07-01T09:00:01Z","sessionId":"sess-2","message":{"content":[{"type":"tool_result","tool_use_id":"u1"}]}}"#,
        "\n",
    );

    const SUBAGENT_LINES: &str = concat!(
        r#"{"type":"assistant","timestamp":"2025-06-01T12:01:00Z","sessionId":"sess-1","message":{"model":"claude-sonnet-4","usage":{"input_tokens":500},"content":[]}}"#,
        "\n",
        r#"{"type":"assistant","timestamp":"2025-06-01T12:05:00Z","sessionId":"sess-1","message":{"model":"claude-sonnet-4","content":[{"type":"tool_use","name":"Write","input":{"content":"a\nb\nc"}}]}}"#,
        "\n",
    );

    async fn record_push(
        State(received): State<Arc<Mutex<Vec<Value>>>>,
        Json(body): Json<Value>,
    ) -> StatusCode {
        received.lock().unwrap().push(body);
        StatusCode::NO_CONTENT
    }

    fn fixture_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let alpha = dir.path().join("alpha");
        std::fs::create_dir_all(&alpha).unwrap();
        std::fs::write(alpha.join("sess-1.jsonl"), SESSION_LINES).unwrap();
        let subagents = alpha.join("sess-1/subagents");
        std::fs::create_dir_all(&subagents).unwrap();
        std::fs::write(subagents.join("agent-1.jsonl"), SUBAGENT_LINES).unwrap();
        let beta = dir.path().join("beta");
        std::fs::create_dir_all(&beta).unwrap();
        std::fs::write(beta.join("sess-2.jsonl"), LATE_LINES).unwrap();
        dir
    }

    fn source(dir: &TempDir, before: Option<&str>) -> SourceSettings {
        SourceSettings {
            projects_dir: dir.path().to_path_buf(),
            before: before.map(|b| parse_before(b).unwrap()),
        }
    }

    #[test]
    fn collects_events_across_projects() {
        let dir = fixture_tree();
        let events = collect_events(&source(&dir, None));
        assert_eq!(events.len(), 3);
        let mut projects: Vec<_> = events.iter().map(|e| e.project.as_str()).collect();
        projects.sort();
        projects.dedup();
        assert_eq!(projects, vec!["alpha", "beta"]);
    }

    #[test]
    fn before_cutoff_filters_events_and_sessions() {
        let dir = fixture_tree();
        let src = source(&dir, Some("2025-06-15"));
        let events = collect_events(&src);
        assert!(events.iter().all(|e| e.project == "alpha"));
        assert_eq!(events.len(), 2);

        let sessions = collect_sessions(&src);
        let ids: Vec<_> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["sess-1"]);
        assert_eq!(sessions[0].commits, 1);
    }

    #[test]
    fn subagent_transcript_folds_into_parent_session() {
        let dir = fixture_tree();
        let sessions = collect_sessions(&source(&dir, None));
        let ids: Vec<_> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["sess-1", "sess-2"]);

        let s = &sessions[0];
        assert_eq!(s.project, "alpha");
        assert_eq!(s.tokens.total(TokenKind::Input), 1500);
        assert_eq!(s.lines_added, 3);
        assert_eq!(s.commits, 1);
        assert_eq!(s.active_seconds(), 300.0);
    }

    #[test]
    fn metrics_run_writes_exposition_file() {
        let dir = fixture_tree();
        let out_dir = TempDir::new().unwrap();
        let output = out_dir.path().join("nested/backfill.om");
        let settings = MetricsSettings {
            output: Some(output.clone()),
            step_secs: 60,
        };

        run_metrics(&source(&dir, None), &settings, false).unwrap();

        let text = std::fs::read_to_string(&output).unwrap();
        assert!(text.ends_with("# EOF\n"));
        assert!(text.contains("session_id=\"sess-1\""));
        assert!(text.contains("session_id=\"sess-2\""));
        assert!(text.contains(
            "claude_code_commit_count_total{session_id=\"sess-1\",project=\"alpha\"}"
        ));
        let leftovers: Vec<_> = std::fs::read_dir(output.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".openmetrics.tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn metrics_dry_run_writes_nothing() {
        let dir = fixture_tree();
        let out_dir = TempDir::new().unwrap();
        let output = out_dir.path().join("backfill.om");
        let settings = MetricsSettings {
            output: Some(output.clone()),
            step_secs: 60,
        };
        run_metrics(&source(&dir, None), &settings, true).unwrap();
        assert!(!output.exists());
    }

    #[test]
    fn metrics_output_into_a_file_path_fails() {
        let dir = fixture_tree();
        let blocker = TempDir::new().unwrap();
        let file = blocker.path().join("plain");
        std::fs::write(&file, "x").unwrap();
        let settings = MetricsSettings {
            output: Some(file.join("out.om")),
            step_secs: 60,
        };
        let err = run_metrics(&source(&dir, None), &settings, false).unwrap_err();
        assert!(matches!(err, OutputError::CreateDir { .. }));
    }

    #[tokio::test]
    async fn loki_dry_run_pushes_nothing() {
        let dir = fixture_tree();
        let settings = LokiSettings {
            url: "http://127.0.0.1:9".to_string(),
            batch_size: 100,
            max_attempts: 1,
            timeout: Duration::from_secs(1),
        };
        let outcome = run_loki(&source(&dir, None), &settings, true).await.unwrap();
        assert_eq!(outcome, PushOutcome::default());
    }

    #[tokio::test]
    async fn loki_run_pushes_every_event() {
        let dir = fixture_tree();
        let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/loki/api/v1/push", post(record_push))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let settings = LokiSettings {
            url: format!("http://{addr}"),
            batch_size: 100,
            max_attempts: 5,
            timeout: Duration::from_secs(5),
        };
        let outcome = run_loki(&source(&dir, None), &settings, false).await.unwrap();
        assert_eq!(outcome.pushed, 3);
        assert_eq!(outcome.failed_batches, 0);

        let bodies = received.lock().unwrap();
        assert_eq!(bodies.len(), 2);
        let entries: usize = bodies
            .iter()
            .flat_map(|b| b["streams"].as_array().unwrap().iter())
            .map(|s| s["values"].as_array().unwrap().len())
            .sum();
        assert_eq!(entries, 3);
    }
}
