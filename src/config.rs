use axum::http::HeaderValue;
use std::env;
use std::str::FromStr;

use crate::error::ConfigError;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_SUPPORTED_MODELS: &[&str] = &["gpt-4o-mini", "gpt-4o", "o1", "o3-mini", "o1-mini"];

/// The models the relay accepts, and the one used when a request names none.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub default_model: String,
    pub supported: Vec<String>,
}

impl ModelCatalog {
    pub fn new(default_model: impl Into<String>, supported: Vec<String>) -> Result<Self, ConfigError> {
        let default_model = default_model.into();
        if supported.is_empty() {
            return Err(ConfigError::Invalid {
                name: "SUPPORTED_MODELS",
                value: String::new(),
                reason: "at least one model is required".to_string(),
            });
        }
        if !supported.iter().any(|m| m == &default_model) {
            return Err(ConfigError::Invalid {
                name: "DEFAULT_MODEL",
                value: default_model,
                reason: "must be listed in SUPPORTED_MODELS".to_string(),
            });
        }
        Ok(Self {
            default_model,
            supported,
        })
    }

    pub fn supports(&self, model: &str) -> bool {
        self.supported.iter().any(|m| m == model)
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            supported: DEFAULT_SUPPORTED_MODELS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// Settings the HTTP layer and relay controller need at request time.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub catalog: ModelCatalog,
    pub cors_origin: HeaderValue,
    pub frame_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub upstream: UpstreamConfig,
    pub settings: RelaySettings,
}

impl RelayConfig {
    /// Reads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = lookup("OPENAI_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;
        let base_url = lookup("OPENAI_BASE_URL")
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        let host = lookup("RELAY_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = parse_or(&lookup, "RELAY_PORT", 3000)?;

        let supported: Vec<String> = match lookup("SUPPORTED_MODELS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_SUPPORTED_MODELS.iter().map(|m| m.to_string()).collect(),
        };
        let default_model = lookup("DEFAULT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let catalog = ModelCatalog::new(default_model, supported)?;

        let origin = lookup("CORS_ORIGIN").unwrap_or_else(|| "http://localhost:5173".to_string());
        let cors_origin = HeaderValue::from_str(&origin).map_err(|e| ConfigError::Invalid {
            name: "CORS_ORIGIN",
            value: origin.clone(),
            reason: e.to_string(),
        })?;

        let connect_timeout_seconds = parse_or(&lookup, "CONNECT_TIMEOUT_SECONDS", 10)?;
        let frame_buffer: usize = parse_or(&lookup, "FRAME_BUFFER", 1)?;
        if frame_buffer == 0 {
            return Err(ConfigError::Invalid {
                name: "FRAME_BUFFER",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            bind_addr: format!("{}:{}", host, port),
            upstream: UpstreamConfig {
                base_url,
                api_key,
                connect_timeout_seconds,
            },
            settings: RelaySettings {
                catalog,
                cors_origin,
                frame_buffer,
            },
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
