//! Runtime configuration, read once from the environment at startup.
use std::{net::SocketAddr, time::Duration};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode { Memory, Postgres }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode { Mock, Http }

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub store: StoreMode,
    pub database_url: Option<String>,
    pub agent: AgentMode,
    pub agent_url: String,
    pub agent_timeout: Duration,
    /// Deadline for fetching patch content from a URL.
    pub patch_fetch_timeout: Duration,
    /// Largest patch body accepted from a URL.
    pub patch_max_bytes: usize,
    /// Platform domain appended to site subdomains.
    pub domain: String,
    /// Gates `update_config`. Off unless explicitly enabled.
    pub site_config_updates: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            store: StoreMode::Memory,
            database_url: None,
            agent: AgentMode::Mock,
            agent_url: "http://localhost:25052".into(),
            agent_timeout: Duration::from_secs(10),
            patch_fetch_timeout: Duration::from_secs(10),
            patch_max_bytes: 1024 * 1024,
            domain: "example.com".into(),
            site_config_updates: false,
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok()).filter(|v| *v > 0).map(Duration::from_secs)
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let listen_addr = match std::env::var("CP_LISTEN_ADDR") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| { warn!(value=%raw, error=%e, "config.invalid_listen_addr"); defaults.listen_addr }),
            Err(_) => defaults.listen_addr,
        };
        let store = match std::env::var("CP_STORE").unwrap_or_default().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => StoreMode::Postgres,
            "" | "memory" => StoreMode::Memory,
            other => { warn!(value=%other, "config.unknown_store_mode"); StoreMode::Memory }
        };
        let agent = match std::env::var("CP_AGENT_MODE").unwrap_or_default().to_ascii_lowercase().as_str() {
            "http" => AgentMode::Http,
            "" | "mock" => AgentMode::Mock,
            other => { warn!(value=%other, "config.unknown_agent_mode"); AgentMode::Mock }
        };
        let cfg = Self {
            listen_addr,
            store,
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            agent,
            agent_url: std::env::var("CP_AGENT_URL").unwrap_or(defaults.agent_url),
            agent_timeout: env_secs("CP_AGENT_TIMEOUT_SECS").unwrap_or(defaults.agent_timeout),
            patch_fetch_timeout: env_secs("CP_PATCH_FETCH_TIMEOUT_SECS").unwrap_or(defaults.patch_fetch_timeout),
            patch_max_bytes: std::env::var("CP_PATCH_MAX_BYTES").ok().and_then(|v| v.parse::<usize>().ok()).filter(|v| *v > 0)
                .unwrap_or(defaults.patch_max_bytes),
            domain: std::env::var("CP_DOMAIN").ok().filter(|v| !v.is_empty()).unwrap_or(defaults.domain),
            site_config_updates: env_flag("CP_SITE_CONFIG_UPDATES").unwrap_or(false),
        };
        debug!(?cfg, "config.loaded");
        cfg
    }
}
