#![allow(dead_code)]

use std::env;

/// Supported backing store dialects (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    fn from_database_url(url: &str) -> Self {
        if url.starts_with("sqlite:") || url.starts_with("sqlite://") {
            Dialect::Sqlite
        } else {
            Dialect::Postgres
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// One of the dialect capability flags the migrator and stats queries
    /// consult (spec §4.2): only Postgres has a native `PERCENTILE_CONT`.
    pub fn supports_percentile(self) -> bool {
        matches!(self, Dialect::Postgres)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Exponential,
    Fixed,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub trusted_hosts: Vec<String>,
    pub docs_enabled: bool,
    pub dev_auth_overrides_enabled: bool,

    pub database_url: String,
    pub dialect: Dialect,
    pub db_pool_max_connections: u32,

    pub jwt_secret: Option<String>,
    pub max_file_size_bytes: u64,

    pub webhook_worker_count: usize,
    pub webhook_attempt_timeout_ms: u64,
    pub webhook_default_max_attempts: u32,
    pub webhook_backoff_base_ms: u64,
    pub webhook_backoff_max_ms: u64,

    pub workflow_sweep_interval_ms: u64,

    pub rate_limit_enabled: bool,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url = env_or("DATABASE_URL", "sqlite://rocket.db");
        let dialect = env_opt("DB_DIALECT")
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "postgres" | "postgresql" => Dialect::Postgres,
                _ => Dialect::Sqlite,
            })
            .unwrap_or_else(|| Dialect::from_database_url(&database_url));

        Self {
            app_name: env_or("APP_NAME", "Rocket"),
            environment: env_or("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_or("API_PREFIX", "/api")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            trusted_hosts: parse_csv(&env_or("TRUSTED_HOSTS", "localhost,127.0.0.1")),
            docs_enabled: env_parse_bool_or("DOCS_ENABLED", true),
            dev_auth_overrides_enabled: env_parse_bool_or("DEV_AUTH_OVERRIDES_ENABLED", false),

            database_url,
            dialect,
            db_pool_max_connections: env_parse_or("DB_POOL_MAX_CONNECTIONS", 10),

            jwt_secret: env_opt("JWT_SECRET"),
            max_file_size_bytes: env_parse_or("MAX_FILE_SIZE", 10 * 1024 * 1024),

            webhook_worker_count: env_parse_or("WEBHOOK_WORKER_COUNT", 4),
            webhook_attempt_timeout_ms: env_parse_or("WEBHOOK_ATTEMPT_TIMEOUT_MS", 10_000),
            webhook_default_max_attempts: env_parse_or("WEBHOOK_DEFAULT_MAX_ATTEMPTS", 5),
            webhook_backoff_base_ms: env_parse_or("WEBHOOK_BACKOFF_BASE_MS", 1_000),
            webhook_backoff_max_ms: env_parse_or("WEBHOOK_BACKOFF_MAX_MS", 300_000),

            workflow_sweep_interval_ms: env_parse_or("WORKFLOW_SWEEP_INTERVAL_MS", 30_000),

            rate_limit_enabled: env_parse_bool_or("RATE_LIMIT_ENABLED", true),
            rate_limit_per_second: env_parse_or("RATE_LIMIT_PER_SECOND", 20),
            rate_limit_burst_size: env_parse_or("RATE_LIMIT_BURST_SIZE", 40),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    pub fn docs_enabled_runtime(&self) -> bool {
        if self.is_production() {
            return false;
        }
        self.docs_enabled
    }

    pub fn auth_dev_overrides_enabled(&self) -> bool {
        if self.is_production() {
            return false;
        }
        self.dev_auth_overrides_enabled
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref().map(str::to_ascii_lowercase) {
        Some(value) if value == "1" || value == "true" || value == "yes" || value == "on" => true,
        Some(value) if value == "0" || value == "false" || value == "no" || value == "off" => {
            false
        }
        _ => default,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn normalize_prefix(raw: &str) -> String {
    let mut prefix = raw.trim().to_string();
    if prefix.is_empty() {
        return "/api".to_string();
    }
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.ends_with('/') && prefix.len() > 1 {
        prefix.pop();
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_prefix() {
        assert_eq!(normalize_prefix("api"), "/api");
        assert_eq!(normalize_prefix("/api/"), "/api");
        assert_eq!(normalize_prefix(""), "/api");
    }

    #[test]
    fn infers_dialect_from_url_scheme() {
        assert_eq!(Dialect::from_database_url("sqlite://rocket.db"), Dialect::Sqlite);
        assert_eq!(
            Dialect::from_database_url("postgres://user@localhost/db"),
            Dialect::Postgres
        );
    }
}
