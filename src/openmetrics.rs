/// OpenMetrics exposition for backfilling sessions into a metrics store.
///
/// Every session becomes a set of counter series spanning `[start, end]`.
/// Sample values are pre-compensated for the forward extrapolation that
/// `increase()`/`rate()` apply to a counter starting at zero: with `n`
/// intervals the engine scales the observed delta by `(2n+1)/(2n)`, so sample
/// `i` carries `V * 2i / (2n+1)` and the read-back increase is exactly `V`.
use crate::session::{Session, TokenKind};
use chrono::{DateTime, Utc};
use std::fmt::Write;

pub const TOKEN_USAGE: &str = "claude_code_token_usage_tokens_total";
pub const COST_USAGE: &str = "claude_code_cost_usage_USD_total";
pub const SESSION_COUNT: &str = "claude_code_session_count_total";
pub const ACTIVE_TIME: &str = "claude_code_active_time_seconds_total";
pub const LINES_OF_CODE: &str = "claude_code_lines_of_code_count_total";
pub const COMMIT_COUNT: &str = "claude_code_commit_count_total";
pub const PULL_REQUEST_COUNT: &str = "claude_code_pull_request_count_total";

/// Family name and HELP text, in exposition order.
const FAMILIES: [(&str, &str); 7] = [
    (TOKEN_USAGE, "Cumulative token usage by type."),
    (COST_USAGE, "Cumulative cost in USD."),
    (SESSION_COUNT, "Session count marker."),
    (ACTIVE_TIME, "Estimated active session time."),
    (LINES_OF_CODE, "Lines of code added or removed."),
    (COMMIT_COUNT, "Number of git commits."),
    (PULL_REQUEST_COUNT, "Number of pull requests created."),
];

/// One exposition line: `name{labels} value timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: &'static str,
    pub labels: Vec<(&'static str, String)>,
    pub value: f64,
    /// Unix seconds.
    pub timestamp: f64,
}

impl MetricSample {
    fn write_line(&self, out: &mut String) {
        let labels = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
            .collect::<Vec<_>>()
            .join(",");
        let _ = writeln!(
            out,
            "{}{{{}}} {} {:.3}",
            self.name,
            labels,
            format_value(self.value),
            self.timestamp
        );
    }
}

/// Integral values render without a decimal point, others with 6 digits.
pub fn format_value(v: f64) -> String {
    if v.is_finite() && v == v.trunc() {
        format!("{v:.0}")
    } else {
        format!("{v:.6}")
    }
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn unix_seconds(dt: DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9
}

fn round_to(v: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (v * scale).round() / scale
}

/// Number of intervals for a series of `duration` seconds.
pub fn interval_count(duration: f64, step: f64) -> u64 {
    if duration >= step {
        ((duration / step).floor() as u64).max(1)
    } else {
        1
    }
}

/// Build the `n + 1` compensated samples of a counter that reaches `total`
/// over `[start, end]`.
///
/// When `start == end` every sample lands on the same timestamp with
/// different values. promtool's block importer rejects such duplicates, so an
/// instantaneous session fails to import those series.
pub fn counter_series(
    name: &'static str,
    labels: Vec<(&'static str, String)>,
    total: f64,
    start: f64,
    end: f64,
    step: f64,
) -> Vec<MetricSample> {
    let duration = end - start;
    let n = interval_count(duration, step);
    (0..=n)
        .map(|i| {
            let fraction = (2 * i) as f64 / (2 * n + 1) as f64;
            MetricSample {
                name,
                labels: labels.clone(),
                value: total * fraction,
                timestamp: start + duration * i as f64 / n as f64,
            }
        })
        .collect()
}

/// Per-family sample lists for one session, in family order.
fn session_series(s: &Session, step: f64) -> [Vec<MetricSample>; 7] {
    let mut out: [Vec<MetricSample>; 7] = Default::default();
    let (Some(start), Some(end)) = (s.start, s.end) else {
        return out;
    };
    let (start, end) = (unix_seconds(start), unix_seconds(end));
    let sid = || ("session_id", s.session_id.clone());
    let project = || ("project", s.project.clone());

    for (model, _) in s.tokens.models() {
        for kind in TokenKind::ALL {
            let count = s.tokens.get(model, kind);
            if count == 0 {
                continue;
            }
            let labels = vec![
                sid(),
                ("model", model.to_string()),
                project(),
                ("type", kind.label().to_string()),
            ];
            out[0].extend(counter_series(
                TOKEN_USAGE,
                labels,
                count as f64,
                start,
                end,
                step,
            ));
        }
    }

    for (model, &cost) in &s.cost_by_model {
        let cost = round_to(cost, 6);
        if cost == 0.0 {
            continue;
        }
        let labels = vec![sid(), ("model", model.clone()), project()];
        out[1].extend(counter_series(COST_USAGE, labels, cost, start, end, step));
    }

    out[2] = counter_series(SESSION_COUNT, vec![sid(), project()], 1.0, start, end, step);

    let active = round_to(s.active_seconds(), 1);
    if active > 0.0 {
        out[3] = counter_series(ACTIVE_TIME, vec![sid(), project()], active, start, end, step);
    }

    for (loc_type, lines) in [("added", s.lines_added), ("removed", s.lines_removed)] {
        if lines == 0 {
            continue;
        }
        let labels = vec![sid(), project(), ("type", loc_type.to_string())];
        out[4].extend(counter_series(
            LINES_OF_CODE,
            labels,
            lines as f64,
            start,
            end,
            step,
        ));
    }

    if s.commits > 0 {
        out[5] = counter_series(
            COMMIT_COUNT,
            vec![sid(), project()],
            s.commits as f64,
            start,
            end,
            step,
        );
    }

    if s.pull_requests > 0 {
        out[6] = counter_series(
            PULL_REQUEST_COUNT,
            vec![sid(), project()],
            s.pull_requests as f64,
            start,
            end,
            step,
        );
    }

    out
}

/// Render sessions as OpenMetrics text terminated by `# EOF`.
pub fn render(sessions: &[Session], step_secs: u64) -> String {
    let step = step_secs as f64;
    let per_session: Vec<_> = sessions.iter().map(|s| session_series(s, step)).collect();

    let mut out = String::new();
    for (idx, (name, help)) in FAMILIES.iter().enumerate() {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} counter");
        for series in &per_session {
            for sample in &series[idx] {
                sample.write_line(&mut out);
            }
        }
    }
    out.push_str("# EOF\n");
    out
}
