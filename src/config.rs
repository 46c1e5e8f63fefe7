use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from cards.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub storage: StorageConfig,
    pub recap: RecapConfig,
    pub transcripts: TranscriptsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecapConfig {
    pub enabled: bool,
    pub model: String,
    /// Minimum card age before new transcript lines force a regeneration.
    pub staleness_minutes: u64,
    /// Age after which a regeneration lock is considered abandoned.
    pub lock_timeout_secs: u64,
    pub generation_timeout_secs: u64,
    /// Input budget in tokens, estimated at four characters per token.
    pub max_transcript_tokens: usize,
    pub max_output_tokens: u32,
    /// Generator command; `{model}` and `{max_tokens}` in `args` are substituted.
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscriptsConfig {
    /// File-name pattern for sub-agent transcripts inside the agents directory.
    pub agent_glob: String,
}

// --- Default implementations ---

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("cards.db"),
        }
    }
}

impl Default for RecapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "claude-haiku-4-5".to_string(),
            staleness_minutes: 10,
            lock_timeout_secs: 60,
            generation_timeout_secs: 30,
            max_transcript_tokens: 50_000,
            max_output_tokens: 1000,
            command: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "--model".to_string(),
                "{model}".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
        }
    }
}

impl Default for TranscriptsConfig {
    fn default() -> Self {
        Self {
            agent_glob: "agent-*.jsonl".to_string(),
        }
    }
}

/// One year.
pub const MAX_STALENESS_MINUTES: u64 = 525_600;
/// One day.
pub const MAX_LOCK_TIMEOUT_SECS: u64 = 86_400;

impl RecapConfig {
    /// Clamped to [`MAX_STALENESS_MINUTES`].
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.staleness_minutes.min(MAX_STALENESS_MINUTES) as i64)
    }

    /// Clamped to [`MAX_LOCK_TIMEOUT_SECS`].
    pub fn lock_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_timeout_secs.min(MAX_LOCK_TIMEOUT_SECS) as i64)
    }

    fn validate(&self) -> Result<(), String> {
        if self.staleness_minutes > MAX_STALENESS_MINUTES {
            return Err(format!(
                "recap.staleness_minutes = {} exceeds {MAX_STALENESS_MINUTES}",
                self.staleness_minutes
            ));
        }
        if self.lock_timeout_secs > MAX_LOCK_TIMEOUT_SECS {
            return Err(format!(
                "recap.lock_timeout_secs = {} exceeds {MAX_LOCK_TIMEOUT_SECS}",
                self.lock_timeout_secs
            ));
        }
        Ok(())
    }

    pub fn generation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.generation_timeout_secs)
    }

    /// Character cap for the whole generator input.
    pub fn max_content_chars(&self) -> usize {
        self.max_transcript_tokens.saturating_mul(4)
    }
}

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
    /// Parsed, but a value is out of range.
    Invalid { path: PathBuf, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { path, message } => {
                write!(f, "invalid config {}: {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl Config {
    /// Load config from `path`. A missing file yields defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config
            .recap
            .validate()
            .map_err(|message| ConfigError::Invalid {
                path: path.to_path_buf(),
                message,
            })?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(&dir.path().join("cards.toml")).unwrap();
        assert_eq!(cfg.storage.db_path, PathBuf::from("cards.db"));
        assert!(cfg.recap.enabled);
        assert_eq!(cfg.recap.model, "claude-haiku-4-5");
        assert_eq!(cfg.recap.staleness_window(), chrono::Duration::minutes(10));
        assert_eq!(cfg.recap.lock_timeout(), chrono::Duration::seconds(60));
        assert_eq!(cfg.recap.generation_timeout().as_secs(), 30);
        assert_eq!(cfg.recap.max_content_chars(), 200_000);
        assert_eq!(cfg.transcripts.agent_glob, "agent-*.jsonl");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cards.toml");
        std::fs::write(
            &path,
            "[recap]\nmodel = \"claude-sonnet-4-5\"\nstaleness_minutes = 3\n\n[storage]\ndb_path = \"/tmp/x.db\"\n",
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.recap.model, "claude-sonnet-4-5");
        assert_eq!(cfg.recap.staleness_minutes, 3);
        assert_eq!(cfg.recap.lock_timeout_secs, 60);
        assert_eq!(cfg.recap.command, "claude");
        assert_eq!(cfg.storage.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.transcripts.agent_glob, "agent-*.jsonl");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cards.toml");
        std::fs::write(&path, "[recap\nenabled = ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("cards.toml"));
    }

    #[test]
    fn out_of_range_durations_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cards.toml");
        std::fs::write(&path, "[recap]\nstaleness_minutes = 1000000000000000\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("staleness_minutes"));

        std::fs::write(&path, "[recap]\nlock_timeout_secs = 9223372036854775807\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("lock_timeout_secs"));

        std::fs::write(&path, "[recap]\nlock_timeout_secs = 86400\n").unwrap();
        assert!(Config::load(&path).is_ok());
    }

    #[test]
    fn huge_durations_clamp_instead_of_panicking() {
        let cfg: Config = toml::from_str(
            "[recap]\nstaleness_minutes = 1000000000000000\nlock_timeout_secs = 9223372036854775807\n",
        )
        .unwrap();
        assert_eq!(
            cfg.recap.staleness_window(),
            chrono::Duration::minutes(MAX_STALENESS_MINUTES as i64)
        );
        assert_eq!(
            cfg.recap.lock_timeout(),
            chrono::Duration::seconds(MAX_LOCK_TIMEOUT_SECS as i64)
        );
    }

    #[test]
    fn wrong_type_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cards.toml");
        std::fs::write(&path, "[recap]\nlock_timeout_secs = \"soon\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
