use crate::exit::CrashDetection;
use crate::retry::{DEFAULT_RETRY_DELAY_MS, DEFAULT_RETRY_LIMIT};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from respawn.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RespawnConfig {
    pub process: ProcessConfig,
    pub retry: RetryConfig,
    pub deadline: DeadlineConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Overrides on top of the inherited environment. `None` = inherit as-is.
    pub env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub limit: u32,
    pub base_delay_ms: u64,
    pub crash_detection: CrashDetection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    /// Wall-clock budget across all launches; 0 disables the deadline.
    pub timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RETRY_LIMIT,
            base_delay_ms: DEFAULT_RETRY_DELAY_MS,
            crash_detection: CrashDetection::default(),
        }
    }
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self { timeout_secs: 100 }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// An environment assignment was not of the form `KEY=VALUE`.
    InvalidEnv { assignment: String },
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
            ConfigError::InvalidEnv { assignment } => {
                write!(f, "invalid environment assignment {assignment:?}, expected KEY=VALUE")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidEnv { .. } => None,
        }
    }
}

impl RespawnConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Merge `KEY=VALUE` assignments into the environment overrides.
    ///
    /// Later assignments win over earlier ones and over the file.
    pub fn apply_env_assignments<'a, I>(&mut self, assignments: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for assignment in assignments {
            let (key, value) = parse_env_assignment(assignment)?;
            self.process
                .env
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
        }
        Ok(())
    }
}

/// Split `KEY=VALUE`; the value may itself contain `=`.
pub fn parse_env_assignment(assignment: &str) -> Result<(&str, &str), ConfigError> {
    match assignment.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(ConfigError::InvalidEnv {
            assignment: assignment.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let cfg = RespawnConfig::default();
        assert!(cfg.process.command.is_empty());
        assert!(cfg.process.env.is_none());
        assert_eq!(cfg.retry.limit, 3);
        assert_eq!(cfg.retry.base_delay_ms, 10);
        assert_eq!(cfg.retry.crash_detection, CrashDetection::CoreDump);
        assert_eq!(cfg.deadline.timeout_secs, 100);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = RespawnConfig::load(&dir.path().join("respawn.toml")).unwrap();
        assert_eq!(cfg.retry.limit, 3);
    }

    #[test]
    fn test_load_full_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("respawn.toml");
        std::fs::write(
            &path,
            r#"
[process]
command = "ls"
args = ["-alh"]
env = { TEST_ENV = "VALUE" }

[retry]
limit = 5
base_delay_ms = 250
crash_detection = "fault-signal"

[deadline]
timeout_secs = 0
"#,
        )
        .unwrap();

        let cfg = RespawnConfig::load(&path).unwrap();
        assert_eq!(cfg.process.command, "ls");
        assert_eq!(cfg.process.args, vec!["-alh"]);
        assert_eq!(
            cfg.process.env.as_ref().and_then(|e| e.get("TEST_ENV")).map(String::as_str),
            Some("VALUE")
        );
        assert_eq!(cfg.retry.limit, 5);
        assert_eq!(cfg.retry.base_delay_ms, 250);
        assert_eq!(cfg.retry.crash_detection, CrashDetection::FaultSignal);
        assert_eq!(cfg.deadline.timeout_secs, 0);
    }

    #[test]
    fn test_partial_config_keeps_section_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("respawn.toml");
        std::fs::write(&path, "[retry]\nlimit = 1\n").unwrap();

        let cfg = RespawnConfig::load(&path).unwrap();
        assert_eq!(cfg.retry.limit, 1);
        assert_eq!(cfg.retry.base_delay_ms, 10);
        assert_eq!(cfg.deadline.timeout_secs, 100);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("respawn.toml");
        std::fs::write(&path, "[retry]\nlimit = \"many\"\n").unwrap();

        let err = RespawnConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_parse_env_assignment() {
        assert_eq!(parse_env_assignment("A=1").unwrap(), ("A", "1"));
        assert_eq!(parse_env_assignment("A=").unwrap(), ("A", ""));
        assert_eq!(parse_env_assignment("A=b=c").unwrap(), ("A", "b=c"));
        assert!(parse_env_assignment("NOEQUALS").is_err());
        assert!(parse_env_assignment("=value").is_err());
    }

    #[test]
    fn test_env_assignments_override_file() {
        let mut cfg = RespawnConfig::default();
        cfg.process.env = Some(BTreeMap::from([("A".to_string(), "file".to_string())]));
        cfg.apply_env_assignments(["A=cli", "B=2"]).unwrap();
        let env = cfg.process.env.unwrap();
        assert_eq!(env.get("A").map(String::as_str), Some("cli"));
        assert_eq!(env.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_no_env_assignments_keeps_inherit() {
        let mut cfg = RespawnConfig::default();
        cfg.apply_env_assignments(std::iter::empty()).unwrap();
        assert!(cfg.process.env.is_none());
    }
}
