//! Process configuration
//!
//! Everything is environment-driven. Only `DATABASE_URL` is required; the
//! rest has defaults suited to a single-site deployment. Values are read once
//! at startup and handed to the subsystems as their own config structs.

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::relay::RelayConfig;
use crate::source::DecoderConfig;
use crate::watch::{WatchConfig, WatchStrategy};

/// A configuration value was missing or unparseable
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Fully resolved process configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the relay server binds to
    pub bind_addr: SocketAddr,

    /// Postgres connection string
    pub database_url: String,

    /// Connection cap for the shared pool
    pub db_max_connections: u32,

    /// Decode subprocess settings
    pub decoder: DecoderConfig,

    /// Stream fan-out settings
    pub relay: RelayConfig,

    /// Change-detection settings
    pub watch: WatchConfig,

    /// Which change-detection strategy to run
    pub strategy: WatchStrategy,
}

impl AppConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let decoder = DecoderConfig::default()
            .binary(env.string("FLOORCAST_FFMPEG", "ffmpeg"))
            .frame_rate(env.parse("FLOORCAST_FRAME_RATE", 15u32)?)
            .video_bitrate(env.string("FLOORCAST_BITRATE", "800k"))
            .connect_timeout(env.millis("FLOORCAST_RTSP_TIMEOUT_MS", 5_000)?);

        let relay = RelayConfig::default()
            .broadcast_capacity(env.parse("FLOORCAST_BROADCAST_CAPACITY", 16usize)?)
            .max_frame_size(env.parse(
                "FLOORCAST_MAX_FRAME_BYTES",
                crate::demux::DEFAULT_MAX_FRAME_SIZE,
            )?);

        let watch = WatchConfig::default()
            .schema(env.string("FLOORCAST_WATCH_SCHEMA", "public"))
            .table(env.string("FLOORCAST_WATCH_TABLE", "production_data"))
            .cursor_column(env.string("FLOORCAST_CURSOR_COLUMN", "updated_at"))
            .poll_interval(env.millis("FLOORCAST_POLL_INTERVAL_MS", 1_000)?)
            .retry_backoff(env.millis("FLOORCAST_RETRY_BACKOFF_MS", 5_000)?);

        Ok(Self {
            bind_addr: env.parse(
                "FLOORCAST_BIND",
                SocketAddr::from(([0, 0, 0, 0], 8080)),
            )?,
            database_url: env.required("DATABASE_URL")?,
            db_max_connections: env.parse("FLOORCAST_DB_MAX_CONNECTIONS", 5u32)?,
            decoder,
            relay,
            watch,
            strategy: env.parse("FLOORCAST_WATCH_STRATEGY", WatchStrategy::Listen)?,
        })
    }
}

/// Typed access over a variable lookup
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.raw(name).ok_or(ConfigError::Missing(name))
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.raw(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(name) {
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                value,
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn millis(&self, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_millis(self.parse(name, default)?))
    }
}
