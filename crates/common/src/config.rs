use crate::{Error, Result};

/// Process-level configuration loaded from environment variables at startup.
///
/// Engine thresholds live in a separate TOML file whose path is configured here.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,

    // Engine thresholds file
    pub engine_config_path: String,

    // API
    pub api_token: String,
    pub api_port: u16,
}

impl Config {
    /// Load configuration from environment variables. Loads `.env` if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let api_port = match optional_env("API_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("API_PORT must be a port number, got '{raw}'")))?,
            None => 8080,
        };

        Ok(Config {
            database_url: required_env("DATABASE_URL")?,
            engine_config_path: optional_env("ENGINE_CONFIG_PATH")
                .unwrap_or_else(|| "config/engine.toml".to_string()),
            api_token: required_env("API_TOKEN")?,
            api_port,
        })
    }
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| {
        Error::Config(format!(
            "Required environment variable '{key}' is not set. Check your .env file."
        ))
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
