// Configuration for the collector and analysis servers
//
// Everything is loaded from environment variables with built-in defaults,
// matching the deployment model of the wider system (the ingestion client
// carries its own config in `client::ClientConfig`).

use std::env;
use std::net::{IpAddr, SocketAddr};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn env_or(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// PostgreSQL connection and pool settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Connections established up-front at startup
    pub pool_min_size: usize,
    /// Hard cap on pooled connections
    pub pool_max_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "logs_db".to_string(),
            user: "postgres".to_string(),
            password: "password".to_string(),
            pool_min_size: 5,
            pool_max_size: 10,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("DATABASE_HOST", &defaults.host),
            port: env_parse("DATABASE_PORT", defaults.port),
            dbname: env_or("DATABASE_NAME", &defaults.dbname),
            user: env_or("DATABASE_USER", &defaults.user),
            password: env_or("DATABASE_PASSWORD", &defaults.password),
            pool_min_size: env_parse("DB_POOL_MIN_SIZE", defaults.pool_min_size),
            pool_max_size: env_parse("DB_POOL_MAX_SIZE", defaults.pool_max_size),
        }
    }
}

/// Which hosted model backs the analysis workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Anthropic,
    OpenAi,
}

/// LLM provider selection and credentials
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub anthropic_model: String,
    pub openai_model: String,
    pub anthropic_api_key: String,
    pub openai_api_key: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            anthropic_model: "claude-sonnet-4-5-20250929".to_string(),
            openai_model: "gpt-4".to_string(),
            anthropic_api_key: String::new(),
            openai_api_key: String::new(),
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let provider = match env_or("LLM_PROVIDER", "anthropic").to_ascii_lowercase().as_str() {
            "openai" => LlmProvider::OpenAi,
            _ => LlmProvider::Anthropic,
        };
        Self {
            provider,
            anthropic_model: env_or("LLM_MODEL_ANTHROPIC", &defaults.anthropic_model),
            openai_model: env_or("LLM_MODEL_OPENAI", &defaults.openai_model),
            anthropic_api_key: env_or("ANTHROPIC_API_KEY", ""),
            openai_api_key: env_or("OPENAI_API_KEY", ""),
        }
    }
}

/// Result-cache tuning
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            max_size: 100,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ttl_seconds: env_parse("CACHE_TTL_SECONDS", defaults.ttl_seconds),
            max_size: env_parse("CACHE_MAX_SIZE", defaults.max_size),
        }
    }
}

/// Collector server configuration
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub bind_addr: SocketAddr,
    pub database: DatabaseConfig,
    /// When set, the collector invalidates the analysis result cache after
    /// each successful bulk insert (best-effort).
    pub analysis_url: Option<String>,
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: bind_addr_from_env(8000),
            database: DatabaseConfig::from_env(),
            analysis_url: env::var("ANALYSIS_SERVER_URL")
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| v.trim_end_matches('/').to_string()),
        }
    }
}

/// Analysis server configuration
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub bind_addr: SocketAddr,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub cache: CacheConfig,
}

impl AnalysisConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: bind_addr_from_env(8001),
            database: DatabaseConfig::from_env(),
            llm: LlmConfig::from_env(),
            cache: CacheConfig::from_env(),
        }
    }
}

fn bind_addr_from_env(default_port: u16) -> SocketAddr {
    let host = env_or("SERVER_HOST", "0.0.0.0");
    let port = env_parse("SERVER_PORT", default_port);
    let ip: IpAddr = host.parse().unwrap_or_else(|_| "0.0.0.0".parse().unwrap());
    SocketAddr::new(ip, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_defaults_match_deployment_model() {
        let db = DatabaseConfig::default();
        assert_eq!(db.port, 5432);
        assert_eq!(db.dbname, "logs_db");
        assert_eq!(db.pool_min_size, 5);
        assert_eq!(db.pool_max_size, 10);
    }

    #[test]
    fn cache_defaults() {
        let cache = CacheConfig::default();
        assert_eq!(cache.ttl_seconds, 300);
        assert_eq!(cache.max_size, 100);
    }
}
