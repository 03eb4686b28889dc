use crate::error::{Error, Result};
use dotenvy::dotenv;
use std::env;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub store_backend: StoreBackend,
    /// JSON array of exams loaded into the in-memory catalog at startup.
    pub seed_exams_file: Option<String>,
    pub jwt_secret: String,
    pub url_signing_secret: String,
    pub openai_api_key: String,
    pub public_rps: u32,
    pub review_rps: u32,
    pub cors_origins: Vec<String>,
    pub uploads_dir: String,
    pub public_base_url: String,
    pub signed_url_ttl_secs: u64,
    pub classifier_models: Vec<String>,
    pub classifier_timeout_secs: u64,
    pub identity_max_attempts: u32,
    pub identity_session_ceiling_secs: i64,
    pub event_grace_secs: i64,
    pub correlation_window_secs: i64,
    pub allow_timer_reset: bool,
    pub timeout_sweep_secs: u64,
    pub timeout_grace_secs: i64,
    pub log_json: bool,
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let store_backend = match env::var("STORE").unwrap_or_default().as_str() {
            "memory" => StoreBackend::Memory,
            "" | "postgres" => StoreBackend::Postgres,
            other => return Err(Error::Config(format!("Unknown STORE backend: {}", other))),
        };
        let database_url = match store_backend {
            StoreBackend::Postgres => get_env("DATABASE_URL")?,
            StoreBackend::Memory => env::var("DATABASE_URL").unwrap_or_default(),
        };

        let classifier_models: Vec<String> = get_env_or("CLASSIFIER_MODELS", "gpt-4o,gpt-4o-mini")
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if classifier_models.is_empty() {
            return Err(Error::Config("CLASSIFIER_MODELS must name at least one model".to_string()));
        }

        Ok(Self {
            server_address: get_env("SERVER_ADDRESS")?,
            database_url,
            db_max_connections: get_env_parse_or("DB_MAX_CONNECTIONS", 50)?,
            store_backend,
            seed_exams_file: env::var("SEED_EXAMS_FILE").ok().filter(|p| !p.trim().is_empty()),
            jwt_secret: get_env("JWT_SECRET")?,
            url_signing_secret: get_env("URL_SIGNING_SECRET")?,
            openai_api_key: get_env("OPENAI_API_KEY")?,
            public_rps: get_env_parse_or("PUBLIC_RPS", 50)?,
            review_rps: get_env_parse_or("REVIEW_RPS", 20)?,
            cors_origins: get_env_or("CORS_ORIGINS", "")
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            uploads_dir: get_env_or("UPLOADS_DIR", "uploads"),
            public_base_url: base_url(&get_env_or("PUBLIC_BASE_URL", "http://localhost:8080"))?,
            signed_url_ttl_secs: get_env_parse_or("SIGNED_URL_TTL_SECS", 3600)?,
            classifier_models,
            classifier_timeout_secs: get_env_parse_or("CLASSIFIER_TIMEOUT_SECS", 20)?,
            identity_max_attempts: get_env_parse_or("IDENTITY_MAX_ATTEMPTS", 3)?,
            identity_session_ceiling_secs: get_env_parse_or("IDENTITY_SESSION_CEILING_SECS", 600)?,
            event_grace_secs: get_env_parse_or("EVENT_GRACE_SECS", 15)?,
            correlation_window_secs: get_env_parse_or("CORRELATION_WINDOW_SECS", 30)?,
            allow_timer_reset: get_env_parse_or("ALLOW_TIMER_RESET", true)?,
            timeout_sweep_secs: get_env_parse_or("TIMEOUT_SWEEP_SECS", 60)?,
            timeout_grace_secs: get_env_parse_or("TIMEOUT_GRACE_SECS", 30)?,
            log_json: get_env_or("LOG_FORMAT", "").eq_ignore_ascii_case("json"),
        })
    }

    /// Runtime knobs handed to the services; keeps them independent of the global config.
    pub fn policy(&self) -> RuntimePolicy {
        RuntimePolicy {
            event_grace_secs: self.event_grace_secs,
            correlation_window_secs: self.correlation_window_secs,
            allow_timer_reset: self.allow_timer_reset,
            timeout_grace_secs: self.timeout_grace_secs,
            identity_max_attempts: self.identity_max_attempts.max(1),
            identity_session_ceiling_secs: self.identity_session_ceiling_secs,
            classifier_timeout: Duration::from_secs(self.classifier_timeout_secs.max(1)),
            signed_url_ttl: Duration::from_secs(self.signed_url_ttl_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimePolicy {
    pub event_grace_secs: i64,
    pub correlation_window_secs: i64,
    pub allow_timer_reset: bool,
    pub timeout_grace_secs: i64,
    pub identity_max_attempts: u32,
    pub identity_session_ceiling_secs: i64,
    pub classifier_timeout: Duration,
    pub signed_url_ttl: Duration,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            event_grace_secs: 15,
            correlation_window_secs: 30,
            allow_timer_reset: true,
            timeout_grace_secs: 30,
            identity_max_attempts: 3,
            identity_session_ceiling_secs: 600,
            classifier_timeout: Duration::from_secs(20),
            signed_url_ttl: Duration::from_secs(3600),
        }
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

/// Absolute http(s) origin used when building evidence links.
fn base_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| Error::Config(format!("PUBLIC_BASE_URL is not a valid URL: {}", e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::Config("PUBLIC_BASE_URL must use http or https".to_string()));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

fn get_env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn get_env_parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> &'static Config {
    CONFIG
        .get()
        .expect("Configuration has not been initialized")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_requires_http_origin() {
        assert_eq!(base_url("https://exams.example.org/").unwrap(), "https://exams.example.org");
        assert!(base_url("ftp://exams.example.org").is_err());
        assert!(base_url("not a url").is_err());
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let policy = RuntimePolicy::default();
        assert_eq!(policy.event_grace_secs, 15);
        assert_eq!(policy.identity_max_attempts, 3);
        assert!(policy.allow_timer_reset);
    }
}
