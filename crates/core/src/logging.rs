//! # Structured Logging
//!
//! tracing subscriber setup for the migrator. Output goes to stderr so that
//! command results printed on stdout stay machine-readable.

use crate::config::{ConfigError, LogFormat, LogSettings};
use serde_json::{json, Value};
use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration for the migrator
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn")
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Include file and line number information
    pub include_location: bool,
    /// Custom fields logged once at startup
    pub global_fields: serde_json::Map<String, Value>,
    /// Environment filter (supports directives like "migrator=debug,sqlx=warn")
    pub env_filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_location: false,
            global_fields: serde_json::Map::new(),
            env_filter: None,
        }
    }
}

impl LoggingConfig {
    /// Build from the resolved `logging` section of the configuration
    pub fn from_settings(settings: &LogSettings) -> Self {
        let level = settings.level.to_lowercase();
        Self {
            // sqlx logs every statement at info; keep it quieter than the tool
            env_filter: Some(format!("{level},sqlx=warn")),
            level,
            format: settings.format,
            ..Self::default()
        }
    }

    /// Machine-readable logging for CI pipelines and deploy jobs
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            include_location: false,
            global_fields: {
                let mut fields = serde_json::Map::new();
                fields.insert("env".to_string(), json!("production"));
                fields
            },
            env_filter: Some("migrator=info,sqlx=warn".to_string()),
        }
    }

    /// Verbose logging while writing migrations locally
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            format: LogFormat::Pretty,
            include_location: true,
            global_fields: {
                let mut fields = serde_json::Map::new();
                fields.insert("env".to_string(), json!("development"));
                fields
            },
            env_filter: Some("migrator=debug,sqlx=info".to_string()),
        }
    }

    /// Minimal output for test runs
    pub fn test() -> Self {
        Self {
            level: "error".to_string(),
            format: LogFormat::Plain,
            include_location: false,
            global_fields: serde_json::Map::new(),
            env_filter: Some("migrator=error".to_string()),
        }
    }

    /// Add a field logged with the initialization message
    pub fn with_global_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.global_fields.insert(key.into(), value.into());
        self
    }

    /// Set environment filter
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }
}

/// Initialize structured logging. `RUST_LOG` takes precedence over the configured filter.
pub fn init_logging(config: LoggingConfig) -> Result<(), ConfigError> {
    let env_filter = config.env_filter.as_deref().unwrap_or(&config.level);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(env_filter))
        .map_err(|e| ConfigError::Logging {
            message: format!("invalid filter '{}': {}", env_filter, e),
        })?;

    let layer = Layer::new()
        .with_writer(io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(layer.pretty())
            .try_init(),
        LogFormat::Plain => tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init(),
    };

    installed.map_err(|e| ConfigError::Logging {
        message: e.to_string(),
    })?;

    if config.global_fields.is_empty() {
        tracing::debug!(
            target: "migrator::logging",
            "Structured logging initialized (level: {}, format: {:?})",
            config.level,
            config.format
        );
    } else {
        let mut init_msg = json!({
            "message": "Structured logging initialized",
            "level": config.level,
            "format": format!("{:?}", config.format),
        });
        for (key, value) in config.global_fields {
            init_msg[key] = value;
        }
        tracing::debug!(target: "migrator::logging", "{}", init_msg);
    }

    Ok(())
}
