//! Typed configuration surface for both binaries. Mirrors the teacher's
//! `env_required`/`env_parse_or` helpers and `ConfigError` taxonomy, but reads
//! through `clap` so every setting is also a CLI flag (`#[arg(env = "...")]`).
//!
//! Coordinator and agent each validate in one place, before anything else
//! runs — a config that fails `validate()` never reaches the bus or HTTP
//! server.

use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::duration::parse_duration_string;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("invalid duration for {field}: {message}")]
    InvalidDuration { field: String, message: String },
}

/// `armonite-coordinator` CLI/env surface. Flags double as env vars so the
/// same binary can be configured purely via environment in a container.
#[derive(Debug, Clone, Parser)]
#[command(name = "armonite-coordinator", about = "Distributed load test coordinator")]
pub struct CoordinatorArgs {
    /// Message-bus host the coordinator's NATS connection binds/dials.
    #[arg(long, env = "ARMONITE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Message-bus port (NATS).
    #[arg(long, env = "ARMONITE_PORT", default_value_t = 4222)]
    pub port: u16,

    /// Control API HTTP port.
    #[arg(long, env = "ARMONITE_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Serve the bundled browser UI alongside the Control API.
    #[arg(long, env = "ARMONITE_ENABLE_UI", default_value_t = false)]
    pub enable_ui: bool,

    /// Persistence DSN, e.g. `sqlite://armonite.db` or `sqlite::memory:`.
    #[arg(long, env = "ARMONITE_DSN", default_value = "sqlite://armonite.db")]
    pub dsn: String,

    #[arg(long, env = "ARMONITE_DB_MAX_OPEN", default_value_t = 10)]
    pub db_max_open: u32,

    /// `debug|info|warn|error|fatal` (fatal maps to tracing's `error`).
    #[arg(long, env = "ARMONITE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// `text|json`.
    #[arg(long, env = "ARMONITE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Runs the coordinator and an agent in one process against an
    /// in-memory bus/persistence, for local iteration without NATS/SQLite.
    #[arg(long, env = "ARMONITE_DEV", default_value_t = false)]
    pub dev: bool,
}

impl CoordinatorArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "host".into(),
                message: "must not be empty".into(),
            });
        }
        match self.log_level.as_str() {
            "debug" | "info" | "warn" | "error" | "fatal" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "log_level".into(),
                    message: format!("unknown level '{other}'"),
                })
            }
        }
        match self.log_format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "log_format".into(),
                    message: format!("unknown format '{other}'"),
                })
            }
        }
        Ok(())
    }

    pub fn bus_url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }
}

/// `armonite-agent` CLI/env surface, matching section 6's enumerated agent
/// CLI flags exactly.
#[derive(Debug, Clone, Parser)]
#[command(name = "armonite-agent", about = "Distributed load test agent")]
pub struct AgentArgs {
    #[arg(long = "master-host", env = "ARMONITE_MASTER_HOST", default_value = "127.0.0.1")]
    pub master_host: String,

    #[arg(long = "master-port", env = "ARMONITE_MASTER_PORT", default_value_t = 4222)]
    pub master_port: u16,

    #[arg(long, env = "ARMONITE_AGENT_CONCURRENCY", default_value_t = 10)]
    pub concurrency: u32,

    #[arg(long, env = "ARMONITE_AGENT_REGION", default_value = "default")]
    pub region: String,

    /// Agent id; generated if omitted.
    #[arg(long, env = "ARMONITE_AGENT_ID")]
    pub id: Option<String>,

    /// Applies the dev-mode ceiling (concurrency<=100, rate_limit=1000/s,
    /// think_time=200ms defaults) before a run starts.
    #[arg(long, env = "ARMONITE_AGENT_DEV", default_value_t = false)]
    pub dev: bool,

    /// Requests/sec cap; 0 disables rate limiting.
    #[arg(long = "rate-limit", env = "ARMONITE_AGENT_RATE_LIMIT", default_value_t = 0)]
    pub rate_limit: u32,

    #[arg(long = "default-think-time", env = "ARMONITE_AGENT_THINK_TIME", default_value = "0s")]
    pub default_think_time: String,

    #[arg(long = "keep-alive", env = "ARMONITE_AGENT_KEEP_ALIVE", default_value_t = true)]
    pub keep_alive: bool,

    #[arg(long, env = "ARMONITE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "ARMONITE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

impl AgentArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "concurrency".into(),
                message: "must be positive".into(),
            });
        }
        parse_duration_string(&self.default_think_time).map_err(|message| ConfigError::InvalidDuration {
            field: "default_think_time".into(),
            message,
        })?;
        Ok(())
    }

    pub fn bus_url(&self) -> String {
        format!("nats://{}:{}", self.master_host, self.master_port)
    }

    pub fn think_time(&self) -> Duration {
        parse_duration_string(&self.default_think_time).unwrap_or(Duration::ZERO)
    }

    pub fn agent_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}
