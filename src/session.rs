/// Per-file session fragments and their merge into canonical sessions.
///
/// A session may be spread over a main transcript and any number of subagent
/// transcripts. Every fragment carrying the same session id folds additively
/// into one `Session`; `start`/`end` are taken over the merged timestamps.
use crate::pricing;
use crate::record::Usage;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Token categories, labelled as they appear in the `type` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenKind {
    Input,
    Output,
    CacheRead,
    CacheCreation,
}

impl TokenKind {
    pub const ALL: [TokenKind; 4] = [
        TokenKind::Input,
        TokenKind::Output,
        TokenKind::CacheRead,
        TokenKind::CacheCreation,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TokenKind::Input => "input",
            TokenKind::Output => "output",
            TokenKind::CacheRead => "cacheRead",
            TokenKind::CacheCreation => "cacheCreation",
        }
    }
}

/// Two-level token tally: model -> category -> count.
///
/// Lookups of absent models or categories read as zero. Recording usage for a
/// model creates its entry even when every count is zero, so a session that
/// saw usage at all is distinguishable from one that never did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenTally {
    by_model: BTreeMap<String, BTreeMap<TokenKind, u64>>,
}

impl TokenTally {
    pub fn add(&mut self, model: &str, kind: TokenKind, count: u64) {
        *self
            .by_model
            .entry(model.to_string())
            .or_default()
            .entry(kind)
            .or_insert(0) += count;
    }

    /// Record one assistant message's usage.
    pub fn record(&mut self, model: &str, usage: &Usage) {
        self.add(model, TokenKind::Input, usage.input_tokens);
        self.add(model, TokenKind::Output, usage.output_tokens);
        self.add(model, TokenKind::CacheRead, usage.cache_read_input_tokens);
        self.add(model, TokenKind::CacheCreation, usage.cache_creation_input_tokens);
    }

    pub fn get(&self, model: &str, kind: TokenKind) -> u64 {
        self.by_model
            .get(model)
            .and_then(|counts| counts.get(&kind))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of one category across all models.
    pub fn total(&self, kind: TokenKind) -> u64 {
        self.by_model
            .values()
            .filter_map(|counts| counts.get(&kind))
            .sum()
    }

    pub fn merge(&mut self, other: &TokenTally) {
        for (model, counts) in &other.by_model {
            for (&kind, &count) in counts {
                self.add(model, kind, count);
            }
        }
    }

    pub fn models(&self) -> impl Iterator<Item = (&str, &BTreeMap<TokenKind, u64>)> {
        self.by_model.iter().map(|(m, c)| (m.as_str(), c))
    }

    pub fn is_empty(&self) -> bool {
        self.by_model.is_empty()
    }
}

/// Partial session state extracted from one transcript file.
#[derive(Debug, Clone, Default)]
pub struct SessionFragment {
    pub session_id: Option<String>,
    pub project: String,
    pub tokens: TokenTally,
    pub timestamps: Vec<DateTime<Utc>>,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub commits: u64,
    pub pull_requests: u64,
}

/// A canonical session after every fragment has been folded in.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub project: String,
    pub tokens: TokenTally,
    pub cost_by_model: BTreeMap<String, f64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub commits: u64,
    pub pull_requests: u64,
}

impl Session {
    /// `end - start` in seconds, zero when either bound is missing.
    pub fn active_seconds(&self) -> f64 {
        match (self.start, self.end) {
            (Some(start), Some(end)) => {
                (end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
            }
            _ => 0.0,
        }
    }

    pub fn total_cost(&self) -> f64 {
        self.cost_by_model.values().sum()
    }
}

struct Accumulator {
    project: String,
    tokens: TokenTally,
    timestamps: Vec<DateTime<Utc>>,
    lines_added: u64,
    lines_removed: u64,
    commits: u64,
    pull_requests: u64,
}

/// Fold fragments into sessions keyed by session id, ordered by id.
///
/// Fragments without a session id or without any token usage are dropped:
/// they can be neither merged nor priced.
pub fn merge_fragments<I>(fragments: I) -> Vec<Session>
where
    I: IntoIterator<Item = SessionFragment>,
{
    let mut merged: BTreeMap<String, Accumulator> = BTreeMap::new();

    for fragment in fragments {
        let Some(session_id) = fragment.session_id else {
            continue;
        };
        if fragment.tokens.is_empty() {
            continue;
        }
        let acc = merged.entry(session_id).or_insert_with(|| Accumulator {
            project: fragment.project.clone(),
            tokens: TokenTally::default(),
            timestamps: Vec::new(),
            lines_added: 0,
            lines_removed: 0,
            commits: 0,
            pull_requests: 0,
        });
        acc.tokens.merge(&fragment.tokens);
        acc.timestamps.extend(fragment.timestamps);
        acc.lines_added += fragment.lines_added;
        acc.lines_removed += fragment.lines_removed;
        acc.commits += fragment.commits;
        acc.pull_requests += fragment.pull_requests;
    }

    merged
        .into_iter()
        .map(|(session_id, acc)| Session {
            cost_by_model: pricing::cost_by_model(&acc.tokens),
            start: acc.timestamps.iter().min().copied(),
            end: acc.timestamps.iter().max().copied(),
            session_id,
            project: acc.project,
            tokens: acc.tokens,
            lines_added: acc.lines_added,
            lines_removed: acc.lines_removed,
            commits: acc.commits,
            pull_requests: acc.pull_requests,
        })
        .collect()
}

/// Drop sessions that start at or after `cutoff`.
pub fn retain_before(sessions: &mut Vec<Session>, cutoff: DateTime<Utc>) {
    sessions.retain(|s| s.start.is_some_and(|start| start < cutoff));
}
