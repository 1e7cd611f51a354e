//! Worker configuration.
//!
//! Read from `$CHILDLINK_CONFIG` or `~/.childlink/config.toml`:
//!
//! ```toml
//! [runner]
//! exit_on_error = true
//! controller_thread_name = "controller_thread"
//!
//! [logging]
//! filter = "childlink_runner=debug,info"
//! file = "/var/log/childlink/worker.log"
//! ```
//!
//! Raw TOML structs stay private; [`ChildConfig`] is the resolved form.
//! Environment overrides apply on top of the file.

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const CONFIG_PATH_ENV: &str = "CHILDLINK_CONFIG";
pub const EXIT_ON_ERROR_ENV: &str = "CHILDLINK_EXIT_ON_ERROR";

const DEFAULT_THREAD_NAME: &str = "controller_thread";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerConfigError {
    #[error("controller_thread_name must not be empty")]
    EmptyThreadName,
    #[error("controller_thread_name must not contain NUL bytes")]
    NulInThreadName,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    runner: Option<RunnerConfig>,
    logging: Option<LoggingConfig>,
}

#[derive(Deserialize)]
struct RawRunnerConfig {
    #[serde(default = "default_true")]
    exit_on_error: bool,
    controller_thread_name: Option<String>,
}

const fn default_true() -> bool {
    true
}

/// Runner-connection settings.
///
/// Invariant: the thread name is non-empty and usable as an OS thread name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawRunnerConfig")]
pub struct RunnerConfig {
    exit_on_error: bool,
    controller_thread_name: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            exit_on_error: true,
            controller_thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl TryFrom<RawRunnerConfig> for RunnerConfig {
    type Error = RunnerConfigError;

    fn try_from(raw: RawRunnerConfig) -> Result<Self, Self::Error> {
        let controller_thread_name = match raw.controller_thread_name {
            None => DEFAULT_THREAD_NAME.to_string(),
            Some(name) if name.trim().is_empty() => {
                return Err(RunnerConfigError::EmptyThreadName);
            }
            Some(name) if name.contains('\0') => {
                return Err(RunnerConfigError::NulInThreadName);
            }
            Some(name) => name,
        };
        Ok(Self {
            exit_on_error: raw.exit_on_error,
            controller_thread_name,
        })
    }
}

impl RunnerConfig {
    /// Whether losing the runner after the handshake terminates the worker.
    #[must_use]
    pub fn exit_on_error(&self) -> bool {
        self.exit_on_error
    }

    #[must_use]
    pub fn controller_thread_name(&self) -> &str {
        &self.controller_thread_name
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
    /// Append logs here instead of stderr.
    pub file: Option<PathBuf>,
}

/// Resolved worker configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildConfig {
    runner: RunnerConfig,
    logging: LoggingConfig,
}

impl ChildConfig {
    /// Load the config file, if there is one.
    ///
    /// A missing file is `Ok(None)`; an unreadable or malformed one is an
    /// error.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Self::parse(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let raw: RawConfig = toml::from_str(content)?;
        Ok(Self {
            runner: raw.runner.unwrap_or_default(),
            logging: raw.logging.unwrap_or_default(),
        })
    }

    /// Settle on the effective config from a [`ChildConfig::load`] outcome:
    /// the file if it loaded, defaults otherwise, then overrides from
    /// `lookup`. Load failures are logged, not fatal.
    #[must_use]
    pub fn resolve_from(
        loaded: Result<Option<Self>, ConfigError>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let config = match loaded {
            Ok(config) => config.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(path = %e.path().display(), "Ignoring config: {e}");
                Self::default()
            }
        };
        config.with_overrides(lookup)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(EXIT_ON_ERROR_ENV) {
            match parse_flag(&raw) {
                Some(value) => self.runner.exit_on_error = value,
                None => tracing::warn!(
                    env_var = EXIT_ON_ERROR_ENV,
                    value = %raw,
                    "Unrecognized boolean; keeping configured value"
                ),
            }
        }
        self
    }

    #[must_use]
    pub fn runner(&self) -> &RunnerConfig {
        &self.runner
    }

    #[must_use]
    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".childlink").join("config.toml"))
}
