//! Configuration for tether routers and the process-wide tracing subscriber.

use std::path::Path;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tether_proto::MAX_MESSAGE_BYTES;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Overrides [`RouterConfig::max_message_len`] (bytes).
pub const TETHER_MAX_MESSAGE_SIZE_ENV_VAR: &str = "TETHER_MAX_MESSAGE_SIZE";
/// Overrides [`RouterConfig::testing_mode`] (`1`/`true`/`0`/`false`).
pub const TETHER_TESTING_MODE_ENV_VAR: &str = "TETHER_TESTING_MODE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterConfig {
    /// Largest accepted incoming message, header included. Clamped to
    /// [`tether_proto::MAX_MESSAGE_BYTES`].
    pub max_message_len: usize,

    /// Messages held for an endpoint that exists but has no client attached yet.
    pub max_pending_messages_per_endpoint: usize,

    /// Keep the pipe open after an invalid message instead of closing it.
    ///
    /// Only meant for fuzzers and validation tests.
    pub testing_mode: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_message_len: MAX_MESSAGE_BYTES,
            max_pending_messages_per_endpoint: 1024,
            testing_mode: false,
        }
    }
}

impl RouterConfig {
    pub fn for_testing() -> Self {
        Self {
            testing_mode: true,
            ..Self::default()
        }
    }

    pub fn effective_max_message_len(&self) -> usize {
        self.max_message_len.clamp(1, MAX_MESSAGE_BYTES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    pub level: String,

    /// Emit logs in JSON format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return "info".to_owned();
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    /// The effective filter: the configured directives, with `RUST_LOG` merged on top.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let config_directives = Self::normalize_level_directives(&self.level);
        let fallback = || {
            tracing_subscriber::EnvFilter::try_new(&config_directives).unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::default()
                    .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
            })
        };

        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        match env_directives {
            Some(env_directives) => {
                tracing_subscriber::EnvFilter::try_new(format!("{config_directives},{env_directives}"))
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(&env_directives))
                    .unwrap_or_else(|_| fallback())
            }
            None => fallback(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TetherConfig {
    pub router: RouterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
}

impl TetherConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Applies `TETHER_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies `TETHER_*` overrides using `lookup` in place of the process environment.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(TETHER_MAX_MESSAGE_SIZE_ENV_VAR) {
            let parsed = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|len| *len > 0)
                .ok_or_else(|| ConfigError::InvalidEnv {
                    key: TETHER_MAX_MESSAGE_SIZE_ENV_VAR,
                    value: value.clone(),
                })?;
            self.router.max_message_len = parsed.min(MAX_MESSAGE_BYTES);
        }
        if let Some(value) = lookup(TETHER_TESTING_MODE_ENV_VAR) {
            self.router.testing_mode = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: TETHER_TESTING_MODE_ENV_VAR,
                        value,
                    })
                }
            };
        }
        Ok(())
    }
}

static TRACING_INIT: Once = Once::new();

/// Installs the global tracing subscriber.
///
/// Safe to call multiple times; only the first call installs a subscriber, and an already
/// installed global subscriber (e.g. from a test harness) is left alone.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();
        let layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed()
        };

        if tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .is_ok()
        {
            tracing::debug!(target: "tether.config", json = config.json, "tracing initialized");
        }
    });
}
