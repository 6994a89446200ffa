// Client-side connect options: defaults, env overrides, then an optional YAML file.
use anyhow::{Context, Result, bail};
use courier_broker::Credentials;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    // Free-form label used in logs.
    pub name: Option<String>,
    pub credentials: Credentials,
    pub request_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            name: None,
            credentials: Credentials::Anonymous,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct ConnectOptionsOverride {
    name: Option<String>,
    request_timeout_ms: Option<u64>,
    token: Option<String>,
    user: Option<String>,
    password: Option<String>,
}

impl ConnectOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.credentials = Credentials::token(token);
        self
    }

    pub fn with_user_password(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Credentials::user_password(user, password);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut options = Self::from_env()?;
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("COURIER_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ConnectOptionsOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut options)?;
        }
        Ok(options)
    }

    fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Ok(name) = std::env::var("COURIER_CLIENT_NAME") {
            options.name = Some(name);
        }
        if let Some(value) = read_u64_env("COURIER_REQUEST_TIMEOUT_MS") {
            options.request_timeout = Duration::from_millis(value);
        }
        options.credentials = credentials_from(
            std::env::var("COURIER_AUTH_TOKEN").ok(),
            std::env::var("COURIER_USER").ok(),
            std::env::var("COURIER_PASSWORD").ok(),
        )?
        .unwrap_or(options.credentials);
        Ok(options)
    }
}

impl ConnectOptionsOverride {
    fn apply(self, options: &mut ConnectOptions) -> Result<()> {
        if let Some(name) = self.name {
            options.name = Some(name);
        }
        if let Some(value) = self.request_timeout_ms
            && value > 0
        {
            options.request_timeout = Duration::from_millis(value);
        }
        if let Some(credentials) = credentials_from(self.token, self.user, self.password)? {
            options.credentials = credentials;
        }
        Ok(())
    }
}

fn credentials_from(
    token: Option<String>,
    user: Option<String>,
    password: Option<String>,
) -> Result<Option<Credentials>> {
    match (token, user, password) {
        (Some(_), Some(_), _) => bail!("token and user cannot both be set"),
        (Some(token), None, _) => Ok(Some(Credentials::Token(token))),
        (None, Some(user), password) => Ok(Some(Credentials::UserPassword {
            user,
            password: password.unwrap_or_default(),
        })),
        (None, None, Some(_)) => bail!("password set without user"),
        (None, None, None) => Ok(None),
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}
