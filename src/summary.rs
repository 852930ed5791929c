/// Human-readable run summaries, printed to stderr before pushing or writing.
use crate::ingest::ToolEvent;
use crate::session::{Session, TokenKind};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write;

const RULE_WIDTH: usize = 60;
const TOP_TOOLS: usize = 15;
const TOP_PROJECTS: usize = 10;

/// `1234567` -> `1,234,567`.
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Money with two decimals and grouped dollars.
fn format_usd(v: f64) -> String {
    let cents = (v.max(0.0) * 100.0).round() as u64;
    format!("${}.{:02}", group_thousands(cents / 100), cents % 100)
}

/// One `  Label:          value` line.
fn row(out: &mut String, label: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "  {label:<17}{value}");
}

fn date(dt: Option<DateTime<Utc>>) -> String {
    dt.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "?".to_string())
}

/// Sort `(name, weight)` pairs by weight descending, then name, and keep `limit`.
fn ranked<K, V>(map: &BTreeMap<K, V>, limit: usize) -> Vec<(K, V)>
where
    K: Ord + Clone,
    V: PartialOrd + Copy,
{
    let mut items: Vec<(K, V)> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
    items.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    items.truncate(limit);
    items
}

/// Summary of the tool events selected for a Loki push.
pub fn tool_events(events: &[ToolEvent]) -> String {
    if events.is_empty() {
        return "No tool events found.\n".to_string();
    }

    let mut projects: BTreeMap<&str, u64> = BTreeMap::new();
    let mut tools: BTreeMap<&str, u64> = BTreeMap::new();
    let mut successes = 0u64;
    let mut durations = Vec::new();
    for ev in events {
        *projects.entry(ev.project.as_str()).or_default() += 1;
        *tools.entry(ev.tool_name.as_str()).or_default() += 1;
        if ev.success {
            successes += 1;
        }
        durations.extend(ev.duration_ms);
    }
    let errors = events.len() as u64 - successes;
    let avg_ms = if durations.is_empty() {
        0
    } else {
        (durations.iter().sum::<u64>() as f64 / durations.len() as f64).round() as u64
    };
    let first = events.iter().map(|e| e.timestamp).min();
    let last = events.iter().map(|e| e.timestamp).max();

    let mut out = String::new();
    let _ = writeln!(out, "\n{}", "=".repeat(RULE_WIDTH));
    row(&mut out, "Total events:", group_thousands(events.len() as u64));
    row(&mut out, "Projects:", projects.len());
    row(&mut out, "Date range:", format!("{} to {}", date(first), date(last)));
    row(&mut out, "Success:", group_thousands(successes));
    row(&mut out, "Errors:", group_thousands(errors));
    row(&mut out, "Avg duration:", format!("{} ms", group_thousands(avg_ms)));
    let _ = writeln!(out, "\n  By tool (top {TOP_TOOLS}):");
    for (tool, count) in ranked(&tools, TOP_TOOLS) {
        let _ = writeln!(out, "    {tool}: {}", group_thousands(count));
    }
    let _ = writeln!(out, "\n  By project:");
    for (project, count) in ranked(&projects, TOP_PROJECTS) {
        let _ = writeln!(out, "    {project}: {}", group_thousands(count));
    }
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
    out
}

/// Summary of merged sessions selected for the OpenMetrics export.
pub fn sessions(sessions: &[Session]) -> String {
    if sessions.is_empty() {
        return "No sessions with usage data found.\n".to_string();
    }

    let token_total =
        |kind: TokenKind| -> u64 { sessions.iter().map(|s| s.tokens.total(kind)).sum() };
    let total_cost: f64 = sessions.iter().map(Session::total_cost).sum();
    let active_secs: f64 = sessions.iter().map(Session::active_seconds).sum();
    let first = sessions.iter().filter_map(|s| s.start).min();
    let last = sessions.iter().filter_map(|s| s.end).max();

    let mut model_tokens: BTreeMap<&str, u64> = BTreeMap::new();
    let mut model_cost: BTreeMap<&str, f64> = BTreeMap::new();
    let mut project_sessions: BTreeMap<&str, u64> = BTreeMap::new();
    let mut project_cost: BTreeMap<&str, f64> = BTreeMap::new();
    for s in sessions {
        for (model, counts) in s.tokens.models() {
            *model_tokens.entry(model).or_default() += counts.values().sum::<u64>();
        }
        for (model, cost) in &s.cost_by_model {
            *model_cost.entry(model.as_str()).or_default() += cost;
        }
        *project_sessions.entry(s.project.as_str()).or_default() += 1;
        *project_cost.entry(s.project.as_str()).or_default() += s.total_cost();
    }

    let mut out = String::new();
    let _ = writeln!(out, "\n{}", "=".repeat(RULE_WIDTH));
    row(&mut out, "Sessions:", sessions.len());
    row(&mut out, "Date range:", format!("{} to {}", date(first), date(last)));
    for (label, kind) in [
        ("Input tokens:", TokenKind::Input),
        ("Output tokens:", TokenKind::Output),
        ("Cache read:", TokenKind::CacheRead),
        ("Cache creation:", TokenKind::CacheCreation),
    ] {
        row(&mut out, label, group_thousands(token_total(kind)));
    }
    row(&mut out, "Total cost:", format_usd(total_cost));
    row(&mut out, "Active time:", format!("{:.1} hours", active_secs / 3600.0));
    let lines_added: u64 = sessions.iter().map(|s| s.lines_added).sum();
    row(&mut out, "Lines added:", group_thousands(lines_added));
    let lines_removed: u64 = sessions.iter().map(|s| s.lines_removed).sum();
    row(&mut out, "Lines removed:", group_thousands(lines_removed));
    let commits: u64 = sessions.iter().map(|s| s.commits).sum();
    row(&mut out, "Commits:", group_thousands(commits));
    let pull_requests: u64 = sessions.iter().map(|s| s.pull_requests).sum();
    row(&mut out, "Pull requests:", group_thousands(pull_requests));

    let _ = writeln!(out, "\n  By model:");
    let model_rank: BTreeMap<&str, f64> = model_tokens
        .keys()
        .map(|&m| (m, model_cost.get(m).copied().unwrap_or(0.0)))
        .collect();
    for (model, cost) in ranked(&model_rank, usize::MAX) {
        let tokens = model_tokens.get(model).copied().unwrap_or(0);
        let (tokens, cost) = (group_thousands(tokens), format_usd(cost));
        let _ = writeln!(out, "    {model}: {tokens} tokens, {cost}");
    }
    let _ = writeln!(out, "\n  By project (top {TOP_PROJECTS}):");
    for (project, cost) in ranked(&project_cost, TOP_PROJECTS) {
        let count = project_sessions.get(project).copied().unwrap_or(0);
        let cost = format_usd(cost);
        let _ = writeln!(out, "    {project}: {count} sessions, {cost}");
    }
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Usage;
    use crate::session::{merge_fragments, SessionFragment, TokenTally};
    use chrono::TimeZone;

    fn event(
        project: &str,
        tool: &str,
        success: bool,
        duration_ms: Option<u64>,
        day: u32,
    ) -> ToolEvent {
        ToolEvent {
            timestamp: Utc.with_ymd_and_hms(2025, 6, day, 12, 0, 0).unwrap(),
            project: project.to_string(),
            session_id: "s1".to_string(),
            tool_name: tool.to_string(),
            success,
            duration_ms,
            tool_parameters: None,
        }
    }

    fn fragment(sid: &str, project: &str, model: &str, input: u64, day: u32) -> SessionFragment {
        let mut tokens = TokenTally::default();
        tokens.record(
            model,
            &Usage {
                input_tokens: input,
                ..Usage::default()
            },
        );
        SessionFragment {
            session_id: Some(sid.to_string()),
            project: project.to_string(),
            tokens,
            timestamps: vec![
                Utc.with_ymd_and_hms(2025, 6, day, 10, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 6, day, 11, 30, 0).unwrap(),
            ],
            ..SessionFragment::default()
        }
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }

    #[test]
    fn usd_formatting() {
        assert_eq!(format_usd(0.0525), "$0.05");
        assert_eq!(format_usd(1234.5), "$1,234.50");
    }

    #[test]
    fn empty_runs_have_fixed_messages() {
        assert_eq!(tool_events(&[]), "No tool events found.\n");
        assert_eq!(sessions(&[]), "No sessions with usage data found.\n");
    }

    #[test]
    fn tool_event_summary_counts() {
        let events = vec![
            event("alpha", "Bash", true, Some(100), 1),
            event("alpha", "Bash", false, Some(300), 2),
            event("beta", "Read", true, None, 3),
        ];
        let text = tool_events(&events);
        assert!(text.contains("Total events:    3\n"));
        assert!(text.contains("Projects:        2\n"));
        assert!(text.contains("Date range:      2025-06-01 to 2025-06-03\n"));
        assert!(text.contains("Success:         2\n"));
        assert!(text.contains("Errors:          1\n"));
        assert!(text.contains("Avg duration:    200 ms\n"));
        let bash = text.find("    Bash: 2").unwrap();
        let read = text.find("    Read: 1").unwrap();
        assert!(bash < read);
        assert!(text.contains("    alpha: 2\n"));
    }

    #[test]
    fn session_summary_ranks_models_by_cost() {
        let merged = merge_fragments(vec![
            fragment("s1", "alpha", "claude-sonnet-4", 1_000_000, 1),
            fragment("s2", "beta", "claude-opus-4-1", 1_000_000, 2),
        ]);
        let text = sessions(&merged);
        assert!(text.contains("Sessions:        2\n"));
        assert!(text.contains("Date range:      2025-06-01 to 2025-06-02\n"));
        assert!(text.contains("Input tokens:    2,000,000\n"));
        assert!(text.contains("Total cost:      $18.00\n"));
        assert!(text.contains("Active time:     3.0 hours\n"));
        let opus = text.find("claude-opus-4-1: 1,000,000 tokens, $15.00").unwrap();
        let sonnet = text.find("claude-sonnet-4: 1,000,000 tokens, $3.00").unwrap();
        assert!(opus < sonnet);
        assert!(text.contains("    beta: 1 sessions, $15.00\n"));
    }
}
