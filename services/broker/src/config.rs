use anyhow::{Context, Result};
use courier_broker::{AuthConfig, Broker};
use courier_common::{DEFAULT_MAX_PAYLOAD, DEFAULT_MAX_PENDING, LimitsConfig};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // Client protocol listener bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Time a new connection has to send CONNECT.
    pub auth_timeout_ms: u64,
    // Payload and per-subscription queue limits.
    pub limits: LimitsConfig,
    // Token, users, accounts and permission sets.
    pub auth: AuthConfig,
}

const DEFAULT_BIND: &str = "0.0.0.0:4222";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8222";
const DEFAULT_AUTH_TIMEOUT_MS: u64 = 2000;

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 4222)),
            metrics_bind: SocketAddr::from(([0, 0, 0, 0], 8222)),
            auth_timeout_ms: DEFAULT_AUTH_TIMEOUT_MS,
            limits: LimitsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    listen: Option<String>,
    metrics_listen: Option<String>,
    auth_timeout_ms: Option<u64>,
    max_payload: Option<usize>,
    max_pending: Option<usize>,
    #[serde(flatten)]
    auth: AuthConfig,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind = std::env::var("COURIER_BIND")
            .unwrap_or_else(|_| DEFAULT_BIND.to_string())
            .parse()
            .with_context(|| "parse COURIER_BIND")?;
        let metrics_bind = std::env::var("COURIER_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse COURIER_METRICS_BIND")?;
        let auth_timeout_ms = std::env::var("COURIER_AUTH_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_AUTH_TIMEOUT_MS);
        let max_payload = std::env::var("COURIER_MAX_PAYLOAD")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_PAYLOAD);
        let max_pending = std::env::var("COURIER_MAX_PENDING")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_PENDING);
        let auth = match std::env::var("COURIER_AUTH_TOKEN") {
            Ok(token) if !token.is_empty() => AuthConfig::with_token(token),
            _ => AuthConfig::default(),
        };
        Ok(Self {
            bind,
            metrics_bind,
            auth_timeout_ms,
            limits: LimitsConfig {
                max_payload,
                max_pending,
            },
            auth,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("COURIER_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read COURIER_CONFIG: {path}"))?;
            let override_cfg: BrokerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            if let Some(value) = override_cfg.listen {
                config.bind = value.parse().with_context(|| "parse listen")?;
            }
            if let Some(value) = override_cfg.metrics_listen {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_listen")?;
            }
            if let Some(value) = override_cfg.auth_timeout_ms
                && value > 0
            {
                config.auth_timeout_ms = value;
            }
            if let Some(value) = override_cfg.max_payload {
                config.limits.max_payload = value;
            }
            if let Some(value) = override_cfg.max_pending {
                config.limits.max_pending = value;
            }
            let auth = override_cfg.auth;
            if auth.token.is_some() {
                config.auth.token = auth.token;
            }
            if !auth.users.is_empty() {
                config.auth.users = auth.users;
            }
            if !auth.accounts.is_empty() {
                config.auth.accounts = auth.accounts;
            }
            if !auth.permission_sets.is_empty() {
                config.auth.permission_sets = auth.permission_sets;
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limits.validate().context("invalid limits")?;
        self.auth.validate().context("invalid authorization config")?;
        Ok(())
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Build the broker core described by this config.
    pub fn build_broker(&self) -> Result<Broker> {
        let broker = Broker::new(self.auth.clone())
            .context("build broker")?
            .with_limits(self.limits)
            .context("apply limits")?;
        Ok(broker)
    }
}
