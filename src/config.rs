//! Process configuration read from the environment

use crate::proxy_config::{ProxyConfig, DEFAULT_UPSTREAM_BASE_URL, DEFAULT_UPSTREAM_MODEL};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_STREAM_CHUNK_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_address: SocketAddr,
    pub upstream: ProxyConfig,
    pub jwt_secret: String,
    /// Timeout for opening the upstream request
    pub request_timeout: Duration,
    /// Maximum wait between two upstream chunks
    pub stream_chunk_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_address = parse_or(
            "BIND_ADDRESS",
            lookup("BIND_ADDRESS"),
            DEFAULT_BIND_ADDRESS,
        )?;

        let api_key = lookup("OPENROUTER_API_KEY")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("OPENROUTER_API_KEY"))?;
        let jwt_secret = lookup("JWT_SECRET")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let upstream = ProxyConfig::new(
            lookup("UPSTREAM_BASE_URL").unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string()),
            Some(api_key),
            lookup("UPSTREAM_MODEL").unwrap_or_else(|| DEFAULT_UPSTREAM_MODEL.to_string()),
        );

        let request_timeout: u64 = parse_or(
            "UPSTREAM_REQUEST_TIMEOUT_SECS",
            lookup("UPSTREAM_REQUEST_TIMEOUT_SECS"),
            &DEFAULT_REQUEST_TIMEOUT_SECS.to_string(),
        )?;
        let stream_chunk_timeout: u64 = parse_or(
            "STREAM_CHUNK_TIMEOUT_SECS",
            lookup("STREAM_CHUNK_TIMEOUT_SECS"),
            &DEFAULT_STREAM_CHUNK_TIMEOUT_SECS.to_string(),
        )?;

        Ok(AppConfig {
            bind_address,
            upstream,
            jwt_secret,
            request_timeout: Duration::from_secs(request_timeout),
            stream_chunk_timeout: Duration::from_secs(stream_chunk_timeout),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: &str,
) -> Result<T, ConfigError> {
    let raw = value.unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value: raw })
}
