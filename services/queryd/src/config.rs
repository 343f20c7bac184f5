use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Server configuration sourced from environment variables, with an optional
// YAML override file named by SPIRE_CONFIG.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Public (unauthenticated) query endpoint.
    pub public_bind: SocketAddr,
    // Optional authenticated endpoint; requires server_key.
    pub secure_bind: Option<SocketAddr>,
    // Opaque server key for the secure endpoint.
    pub server_key: Option<String>,
    // Client public-key allow-list; empty accepts any presented key.
    pub client_keys: Vec<String>,
    // Soft lifetime of an address subscription.
    pub subscription_ttl_secs: u64,
    // Soft bound on subscriptions per endpoint.
    pub subscription_limit: usize,
    // Query worker pool size.
    pub worker_threads: usize,
    // Per-query handler deadline.
    pub query_timeout_ms: u64,
    // Wait for in-flight handlers on stop.
    pub shutdown_grace_ms: u64,
    // Max accepted frame size on the transport.
    pub max_frame_bytes: usize,
}

const DEFAULT_PUBLIC_BIND: &str = "127.0.0.1:9091";
const DEFAULT_SUBSCRIPTION_TTL_SECS: u64 = 600;
const DEFAULT_SUBSCRIPTION_LIMIT: usize = 100_000;
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;
const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct ServerConfigOverride {
    public_bind: Option<String>,
    secure_bind: Option<String>,
    server_key: Option<String>,
    client_keys: Option<Vec<String>>,
    subscription_ttl_secs: Option<u64>,
    subscription_limit: Option<usize>,
    worker_threads: Option<usize>,
    query_timeout_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_bind: DEFAULT_PUBLIC_BIND.parse().expect("default bind"),
            secure_bind: None,
            server_key: None,
            client_keys: Vec::new(),
            subscription_ttl_secs: DEFAULT_SUBSCRIPTION_TTL_SECS,
            subscription_limit: DEFAULT_SUBSCRIPTION_LIMIT,
            worker_threads: default_worker_threads(),
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
}

impl ServerConfig {
    pub fn subscription_ttl(&self) -> Duration {
        Duration::from_secs(self.subscription_ttl_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("SPIRE_PUBLIC_BIND") {
            config.public_bind = value.parse().context("parse SPIRE_PUBLIC_BIND")?;
        }
        if let Ok(value) = std::env::var("SPIRE_SECURE_BIND") {
            config.secure_bind = Some(value.parse().context("parse SPIRE_SECURE_BIND")?);
        }
        config.server_key = std::env::var("SPIRE_SERVER_KEY").ok();
        if let Ok(value) = std::env::var("SPIRE_CLIENT_KEYS") {
            config.client_keys = value
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = parse_env::<u64>("SPIRE_SUBSCRIPTION_TTL_SECS") {
            config.subscription_ttl_secs = value;
        }
        if let Some(value) = parse_env::<usize>("SPIRE_SUBSCRIPTION_LIMIT") {
            config.subscription_limit = value;
        }
        if let Some(value) = parse_env::<usize>("SPIRE_WORKER_THREADS") {
            config.worker_threads = value;
        }
        if let Some(value) = parse_env::<u64>("SPIRE_QUERY_TIMEOUT_MS") {
            config.query_timeout_ms = value;
        }
        if let Some(value) = parse_env::<u64>("SPIRE_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace_ms = value;
        }
        if let Some(value) = parse_env::<usize>("SPIRE_MAX_FRAME_BYTES") {
            config.max_frame_bytes = value;
        }
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let Some(path) = std::env::var("SPIRE_CONFIG").ok() else {
            return Ok(config);
        };
        // A named config file that cannot be read is a startup failure.
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read SPIRE_CONFIG: {path}"))?;
        let overrides: ServerConfigOverride =
            serde_yaml::from_str(&contents).context("parse config yaml")?;
        if let Some(value) = overrides.public_bind {
            config.public_bind = value.parse().context("parse public_bind")?;
        }
        if let Some(value) = overrides.secure_bind {
            config.secure_bind = Some(value.parse().context("parse secure_bind")?);
        }
        if let Some(value) = overrides.server_key {
            config.server_key = Some(value);
        }
        if let Some(value) = overrides.client_keys {
            config.client_keys = value;
        }
        if let Some(value) = overrides.subscription_ttl_secs {
            config.subscription_ttl_secs = value;
        }
        if let Some(value) = overrides.subscription_limit {
            config.subscription_limit = value;
        }
        if let Some(value) = overrides.worker_threads {
            config.worker_threads = value;
        }
        if let Some(value) = overrides.query_timeout_ms {
            config.query_timeout_ms = value;
        }
        if let Some(value) = overrides.shutdown_grace_ms {
            config.shutdown_grace_ms = value;
        }
        if let Some(value) = overrides.max_frame_bytes {
            config.max_frame_bytes = value;
        }
        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.subscription_ttl(), Duration::from_secs(600));
        assert_eq!(config.subscription_limit, 100_000);
        assert!(config.worker_threads >= 1);
        assert!(config.secure_bind.is_none());
    }

    #[test]
    fn yaml_overrides_parse() {
        let overrides: ServerConfigOverride = serde_yaml::from_str(
            "public_bind: \"0.0.0.0:9091\"\nsubscription_ttl_secs: 60\nclient_keys:\n  - alice\n",
        )
        .expect("yaml");
        assert_eq!(overrides.public_bind.as_deref(), Some("0.0.0.0:9091"));
        assert_eq!(overrides.subscription_ttl_secs, Some(60));
        assert_eq!(overrides.client_keys, Some(vec!["alice".to_string()]));
    }
}
