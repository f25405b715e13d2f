//! Runtime settings, read from the process environment (and `.env` via dotenv).

use crate::error::{AgentError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Missing key is a valid configuration: naming falls back to the sanitizer
    /// and natural-language queries are refused.
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub model: String,
    pub temperature: f32,
    pub llm_timeout: Duration,

    pub database_path: PathBuf,
    pub metadata_database_path: PathBuf,

    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
    pub seed_mock_data: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.0,
            llm_timeout: Duration::from_secs(30),
            database_path: PathBuf::from("./data/sql_agent.db"),
            metadata_database_path: PathBuf::from("./data/metadata.db"),
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: 100 * 1024 * 1024,
            seed_mock_data: true,
        }
    }
}

impl Settings {
    /// Load settings from the environment. Call `dotenv::dotenv().ok()` first
    /// if a `.env` file should be honoured.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.openai_base_url),
            model: get("LLM_MODEL").unwrap_or(defaults.model),
            temperature: parse_or("LLM_TEMPERATURE", get("LLM_TEMPERATURE"), defaults.temperature)?,
            llm_timeout: Duration::from_secs(parse_or(
                "LLM_TIMEOUT_SECS",
                get("LLM_TIMEOUT_SECS"),
                defaults.llm_timeout.as_secs(),
            )?),
            database_path: get("DATABASE_PATH").map(PathBuf::from).unwrap_or(defaults.database_path),
            metadata_database_path: get("METADATA_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.metadata_database_path),
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or("PORT", get("PORT"), defaults.port)?,
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", get("MAX_UPLOAD_BYTES"), defaults.max_upload_bytes)?,
            seed_mock_data: match get("SEED_MOCK_DATA") {
                Some(raw) => parse_bool("SEED_MOCK_DATA", &raw)?,
                None => defaults.seed_mock_data,
            },
        })
    }

    pub fn llm_configured(&self) -> bool {
        self.openai_api_key.is_some()
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| AgentError::Config(format!("{} has an invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AgentError::Config(format!("{} has an invalid value '{}'", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert!(settings.openai_api_key.is_none());
        assert!(!settings.llm_configured());
        assert_eq!(settings.port, 8000);
        assert!(settings.seed_mock_data);
        assert_eq!(settings.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_overrides_and_blank_key() {
        let settings = Settings::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "   "),
            ("OPENAI_BASE_URL", "http://localhost:9000/v1/"),
            ("PORT", "9100"),
            ("SEED_MOCK_DATA", "no"),
            ("LLM_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert!(settings.openai_api_key.is_none());
        assert_eq!(settings.openai_base_url, "http://localhost:9000/v1");
        assert_eq!(settings.port, 9100);
        assert!(!settings.seed_mock_data);
        assert_eq!(settings.llm_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = Settings::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
