use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from backfill.toml.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub source: SourceConfig,
    pub loki: LokiConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub projects_dir: PathBuf,
    /// Exclusive upper bound, `YYYY-MM-DD` (UTC midnight).
    pub before: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LokiConfig {
    pub url: String,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Exposition output path; stdout when absent.
    pub output: Option<PathBuf>,
    pub step_secs: u64,
}

// --- Default implementations ---

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            projects_dir: PathBuf::from("~/.claude/projects"),
            before: None,
        }
    }
}

impl Default for LokiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3100".to_string(),
            batch_size: 100,
            max_attempts: 5,
            timeout_secs: 30,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            output: None,
            step_secs: 60,
        }
    }
}

/// Validated source settings shared by both pipelines.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub projects_dir: PathBuf,
    pub before: Option<DateTime<Utc>>,
}

/// Validated push settings.
#[derive(Debug, Clone)]
pub struct LokiSettings {
    pub url: String,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub timeout: Duration,
}

/// Validated exposition settings.
#[derive(Debug, Clone)]
pub struct MetricsSettings {
    pub output: Option<PathBuf>,
    pub step_secs: u64,
}

/// Configuration failures. All of these abort the run before any file is read.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    NotADirectory {
        path: PathBuf,
    },
    InvalidDate {
        value: String,
    },
    InvalidBatchSize,
    InvalidStep,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::NotADirectory { path } => {
                write!(f, "{} is not a directory", path.display())
            }
            ConfigError::InvalidDate { value } => {
                write!(f, "invalid date format '{value}', use YYYY-MM-DD")
            }
            ConfigError::InvalidBatchSize => write!(f, "batch size must be at least 1"),
            ConfigError::InvalidStep => write!(f, "metrics step must be at least 1 second"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Load config from `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<BackfillConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(BackfillConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Parse a `YYYY-MM-DD` date into the UTC midnight that starts it.
pub fn parse_before(value: &str) -> Result<DateTime<Utc>, ConfigError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| ConfigError::InvalidDate {
            value: value.to_string(),
        })
}

/// Expand a leading `~` using `$HOME`.
fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

impl SourceConfig {
    pub fn resolve(&self) -> Result<SourceSettings, ConfigError> {
        let before = self.before.as_deref().map(parse_before).transpose()?;
        let projects_dir = expand_home(&self.projects_dir);
        if !projects_dir.is_dir() {
            return Err(ConfigError::NotADirectory { path: projects_dir });
        }
        Ok(SourceSettings {
            projects_dir,
            before,
        })
    }
}

impl LokiConfig {
    pub fn resolve(&self) -> Result<LokiSettings, ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        Ok(LokiSettings {
            url: self.url.trim_end_matches('/').to_string(),
            batch_size: self.batch_size,
            max_attempts: self.max_attempts.max(1),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
        })
    }
}

impl MetricsConfig {
    pub fn resolve(&self) -> Result<MetricsSettings, ConfigError> {
        if self.step_secs == 0 {
            return Err(ConfigError::InvalidStep);
        }
        Ok(MetricsSettings {
            output: self.output.clone(),
            step_secs: self.step_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load_config(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.loki.url, "http://localhost:3100");
        assert_eq!(cfg.loki.batch_size, 100);
        assert_eq!(cfg.loki.max_attempts, 5);
        assert!(cfg.metrics.output.is_none());
        assert_eq!(cfg.metrics.step_secs, 60);
        assert!(cfg.source.before.is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backfill.toml");
        std::fs::write(
            &path,
            "[loki]\nbatch_size = 25\n\n[metrics]\nstep_secs = 30\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.loki.batch_size, 25);
        assert_eq!(cfg.loki.url, "http://localhost:3100");
        assert_eq!(cfg.metrics.step_secs, 30);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backfill.toml");
        std::fs::write(&path, "[loki\nbatch_size = ").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn before_parses_to_utc_midnight() {
        let dt = parse_before("2025-06-01").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-06-01T00:00:00+00:00");
    }

    #[test]
    fn before_rejects_bad_format() {
        assert!(matches!(
            parse_before("06/01/2025"),
            Err(ConfigError::InvalidDate { .. })
        ));
        assert!(parse_before("2025-13-01").is_err());
    }

    #[test]
    fn source_resolve_requires_directory() {
        let dir = tempdir().unwrap();
        let ok = SourceConfig {
            projects_dir: dir.path().to_path_buf(),
            before: Some("2025-01-02".to_string()),
        }
        .resolve()
        .unwrap();
        assert!(ok.before.is_some());

        let missing = SourceConfig {
            projects_dir: dir.path().join("missing"),
            before: None,
        };
        assert!(matches!(
            missing.resolve(),
            Err(ConfigError::NotADirectory { .. })
        ));
    }

    #[test]
    fn source_resolve_rejects_bad_date_before_touching_disk() {
        let cfg = SourceConfig {
            projects_dir: PathBuf::from("/definitely/not/here"),
            before: Some("yesterday".to_string()),
        };
        assert!(matches!(
            cfg.resolve(),
            Err(ConfigError::InvalidDate { .. })
        ));
    }

    #[test]
    fn loki_resolve_validates_batch_size() {
        let cfg = LokiConfig {
            batch_size: 0,
            ..LokiConfig::default()
        };
        assert!(matches!(cfg.resolve(), Err(ConfigError::InvalidBatchSize)));

        let cfg = LokiConfig {
            url: "http://loki:3100/".to_string(),
            ..LokiConfig::default()
        };
        assert_eq!(cfg.resolve().unwrap().url, "http://loki:3100");
    }

    #[test]
    fn metrics_resolve_validates_step() {
        let cfg = MetricsConfig {
            output: None,
            step_secs: 0,
        };
        assert!(matches!(cfg.resolve(), Err(ConfigError::InvalidStep)));
    }
}
