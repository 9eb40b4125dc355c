use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_addr: String,
    pub ollama_url: String,
    pub ollama_model: String,
    pub ollama_timeout: Duration,
    pub max_tokens: u32,
    pub max_history_size: usize,
    pub rate_limit: u32,
    pub max_request_bytes: Option<usize>,
    pub shutdown_grace: Duration,
    /// Bound on handling a whole request. Defaults to `ollama_timeout` plus
    /// [`REQUEST_TIMEOUT_MARGIN`] so an upstream timeout still answers first.
    pub request_timeout: Duration,
    pub template_dir: PathBuf,
    pub static_dir: PathBuf,
}

pub const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:8080".to_string(),
            ollama_url: "http://localhost:11434/api/generate".to_string(),
            ollama_model: "qwen3".to_string(),
            ollama_timeout: Duration::from_secs(30),
            max_tokens: 10,
            max_history_size: 1000,
            rate_limit: 10,
            max_request_bytes: None,
            shutdown_grace: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30) + REQUEST_TIMEOUT_MARGIN,
            template_dir: PathBuf::from("templates"),
            static_dir: PathBuf::from("static"),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let server_addr = parse_string_env("SERVER_ADDR")?.unwrap_or(defaults.server_addr);
        let ollama_url = parse_string_env("OLLAMA_URL")?.unwrap_or(defaults.ollama_url);
        let ollama_model = parse_string_env("OLLAMA_MODEL")?.unwrap_or(defaults.ollama_model);
        let ollama_timeout =
            parse_duration_env("OLLAMA_TIMEOUT")?.unwrap_or(defaults.ollama_timeout);
        let max_tokens = parse_optional_u64("MAX_TOKENS")?
            .map(|v| u32::try_from(v).map_err(|_| anyhow!("MAX_TOKENS is out of range")))
            .transpose()?
            .unwrap_or(defaults.max_tokens);
        let max_history_size = parse_positive_env("MAX_HISTORY_SIZE")?
            .map(|v| v as usize)
            .unwrap_or(defaults.max_history_size);
        let rate_limit = parse_positive_env("RATE_LIMIT")?
            .map(|v| u32::try_from(v).map_err(|_| anyhow!("RATE_LIMIT is out of range")))
            .transpose()?
            .unwrap_or(defaults.rate_limit);
        let max_request_bytes = parse_optional_u64("MAX_REQUEST_BYTES")?.map(|v| v as usize);
        let shutdown_grace =
            parse_duration_env("SHUTDOWN_GRACE")?.unwrap_or(defaults.shutdown_grace);
        let request_timeout = parse_duration_env("REQUEST_TIMEOUT")?
            .unwrap_or(ollama_timeout + REQUEST_TIMEOUT_MARGIN);
        if request_timeout <= ollama_timeout {
            return Err(anyhow!(
                "REQUEST_TIMEOUT ({:?}) must be longer than OLLAMA_TIMEOUT ({:?})",
                request_timeout,
                ollama_timeout
            ));
        }
        let template_dir = parse_string_env("TEMPLATE_DIR")?
            .map(PathBuf::from)
            .unwrap_or(defaults.template_dir);
        let static_dir = parse_string_env("STATIC_DIR")?
            .map(PathBuf::from)
            .unwrap_or(defaults.static_dir);

        Ok(Self {
            server_addr,
            ollama_url,
            ollama_model,
            ollama_timeout,
            max_tokens,
            max_history_size,
            rate_limit,
            max_request_bytes,
            shutdown_grace,
            request_timeout,
            template_dir,
            static_dir,
        })
    }
}

fn parse_string_env(var: &str) -> Result<Option<String>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(Some(value.trim().to_string())),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("{} is not valid unicode: {}", var, err)),
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match parse_string_env(var)? {
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", var)),
        None => Ok(None),
    }
}

fn parse_positive_env(var: &str) -> Result<Option<u64>> {
    match parse_optional_u64(var)? {
        Some(0) => Err(anyhow!("{} must be greater than zero", var)),
        other => Ok(other),
    }
}

fn parse_duration_env(var: &str) -> Result<Option<Duration>> {
    match parse_string_env(var)? {
        Some(value) => parse_duration(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a duration such as 500ms, 30s or 2m", var)),
        None => Ok(None),
    }
}

/// Parses `500ms`, `30s`, `2m`, `1h` or a bare number of seconds.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "" | "s" => Some(Duration::from_secs(amount)),
        "ms" => Some(Duration::from_millis(amount)),
        "m" => Some(Duration::from_secs(amount.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(amount.checked_mul(3600)?)),
        _ => None,
    }
}
