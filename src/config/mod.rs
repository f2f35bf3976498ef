use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub hub: HubConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

/// Session hub and connection agent tuning
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Depth of the hub control-loop request queue.
    pub command_buffer: usize,
    /// Depth of each agent's outbound queue. A full queue tears the agent down.
    pub outbound_buffer: usize,
    /// Interval between liveness probes on an idle connection.
    pub ping_interval_ms: u64,
    /// Read deadline, refreshed on every probe response.
    pub pong_wait_ms: u64,
    /// Deadline for a single outbound write.
    pub write_wait_ms: u64,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl HubConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_buffer: 1024,
            outbound_buffer: 256,
            ping_interval_ms: 54_000,
            pong_wait_ms: 60_000,
            write_wait_ms: 10_000,
            max_message_size: 8192,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7400".to_string(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/consensus.db".to_string()),
            ),
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let server = ServerConfig {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| ServerConfig::default().bind_addr),
        };

        let defaults = HubConfig::default();
        let hub = HubConfig {
            command_buffer: parse_env("HUB_COMMAND_BUFFER", defaults.command_buffer),
            outbound_buffer: parse_env("HUB_OUTBOUND_BUFFER", defaults.outbound_buffer),
            ping_interval_ms: parse_env("HUB_PING_INTERVAL_MS", defaults.ping_interval_ms),
            pong_wait_ms: parse_env("HUB_PONG_WAIT_MS", defaults.pong_wait_ms),
            write_wait_ms: parse_env("HUB_WRITE_WAIT_MS", defaults.write_wait_ms),
            max_message_size: parse_env("HUB_MAX_MESSAGE_SIZE", defaults.max_message_size),
        };
        hub.validate()?;

        Ok(Config {
            database,
            logging,
            server,
            hub,
        })
    }
}

impl HubConfig {
    /// Reject settings that would make liveness detection or delivery impossible.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.command_buffer == 0 || self.outbound_buffer == 0 {
            return Err(AppError::Config {
                message: "hub buffers must be non-zero".to_string(),
            });
        }
        if self.ping_interval_ms >= self.pong_wait_ms {
            return Err(AppError::Config {
                message: format!(
                    "HUB_PING_INTERVAL_MS ({}) must be shorter than HUB_PONG_WAIT_MS ({})",
                    self.ping_interval_ms, self.pong_wait_ms
                ),
            });
        }
        if self.max_message_size == 0 {
            return Err(AppError::Config {
                message: "HUB_MAX_MESSAGE_SIZE must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_defaults_are_valid() {
        let hub = HubConfig::default();
        assert!(hub.validate().is_ok());
        assert!(hub.ping_interval() < hub.pong_wait());
    }

    #[test]
    fn test_ping_interval_must_be_shorter_than_pong_wait() {
        let hub = HubConfig {
            ping_interval_ms: 60_000,
            pong_wait_ms: 60_000,
            ..HubConfig::default()
        };
        let err = hub.validate().unwrap_err();
        assert!(err.to_string().contains("HUB_PING_INTERVAL_MS"));
    }

    #[test]
    fn test_zero_outbound_buffer_rejected() {
        let hub = HubConfig {
            outbound_buffer: 0,
            ..HubConfig::default()
        };
        assert!(hub.validate().is_err());
    }
}
