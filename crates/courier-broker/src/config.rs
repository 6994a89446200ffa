//! Typed authorization configuration.
//!
//! Mirrors the options a broker operator writes in a config file: a shared
//! `token`, a top-level `users` table, per-account user tables under
//! `accounts`, and reusable `permission_sets` referenced as `"$NAME"`.
//!
//! ```
//! use courier_broker::AuthConfig;
//!
//! let config: AuthConfig = serde_yaml::from_str(r#"
//! permission_sets:
//!   ADMIN: { publish: ">", subscribe: ">" }
//! users:
//!   - { user: admin, password: aa, permissions: "$ADMIN" }
//!   - { user: client_a, password: ca, permissions: { publish: ["server.server_a.>"], subscribe: "_INBOX.>" } }
//! "#).expect("yaml");
//! assert_eq!(config.users.len(), 2);
//! assert!(!config.is_open());
//! ```
use courier_authz::{Permissions, PermissionsConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{BrokerError, Result};

/// Name of the account that holds token principals, top-level users, and
/// anonymous connections.
pub const GLOBAL_ACCOUNT: &str = "$G";

const PERMISSION_SET_PREFIX: char = '$';

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accounts: BTreeMap<String, AccountConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub permission_sets: BTreeMap<String, PermissionsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub user: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<UserPermissions>,
}

/// Inline permissions or a `"$NAME"` reference into `permission_sets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserPermissions {
    Named(String),
    Inline(PermissionsConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl AuthConfig {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn with_users(users: Vec<UserConfig>) -> Self {
        Self {
            users,
            ..Self::default()
        }
    }

    /// No token and no users anywhere: every connection is accepted.
    pub fn is_open(&self) -> bool {
        self.token.is_none()
            && self.users.is_empty()
            && self.accounts.values().all(|account| account.users.is_empty())
    }

    /// Account names declared by the config, plus the global account.
    pub fn account_names(&self) -> Vec<&str> {
        let mut names = vec![GLOBAL_ACCOUNT];
        names.extend(self.accounts.keys().map(String::as_str));
        names
    }

    /// Resolve the permissions attached to a user entry.
    ///
    /// # Errors
    /// - [`BrokerError::Config`] for unknown `$NAME` references or a named
    ///   reference missing its `$` prefix.
    /// - [`BrokerError::Authz`] for malformed patterns.
    pub fn resolve_permissions(&self, user: &UserConfig) -> Result<Permissions> {
        match &user.permissions {
            None => Ok(Permissions::allow_all()),
            Some(UserPermissions::Inline(config)) => Ok(config.build()?),
            Some(UserPermissions::Named(reference)) => {
                let name = reference.strip_prefix(PERMISSION_SET_PREFIX).ok_or_else(|| {
                    BrokerError::Config(format!(
                        "user {} permission set reference {reference:?} must start with {PERMISSION_SET_PREFIX}",
                        user.user
                    ))
                })?;
                let set = self.permission_sets.get(name).ok_or_else(|| {
                    BrokerError::Config(format!(
                        "user {} references unknown permission set {reference}",
                        user.user
                    ))
                })?;
                Ok(set.build()?)
            }
        }
    }

    /// Structural checks that do not depend on runtime state.
    pub fn validate(&self) -> Result<()> {
        let has_users = !self.users.is_empty()
            || self.accounts.values().any(|account| !account.users.is_empty());
        if self.token.is_some() && has_users {
            return Err(BrokerError::Config(
                "token and users cannot both be configured".to_string(),
            ));
        }
        if let Some(token) = &self.token
            && token.is_empty()
        {
            return Err(BrokerError::Config("token must not be empty".to_string()));
        }
        if self.accounts.contains_key(GLOBAL_ACCOUNT) {
            return Err(BrokerError::Config(format!(
                "account name {GLOBAL_ACCOUNT} is reserved"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for (_, user) in self.all_users() {
            if user.user.is_empty() {
                return Err(BrokerError::Config("user name must not be empty".to_string()));
            }
            if !seen.insert(user.user.as_str()) {
                return Err(BrokerError::Config(format!(
                    "duplicate user {}",
                    user.user
                )));
            }
            self.resolve_permissions(user)?;
        }
        Ok(())
    }

    /// Every configured user paired with the account it belongs to.
    pub fn all_users(&self) -> impl Iterator<Item = (&str, &UserConfig)> {
        self.users
            .iter()
            .map(|user| (GLOBAL_ACCOUNT, user))
            .chain(self.accounts.iter().flat_map(|(name, account)| {
                account.users.iter().map(move |user| (name.as_str(), user))
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_authz::Action;

    fn user(name: &str, permissions: Option<UserPermissions>) -> UserConfig {
        UserConfig {
            user: name.to_string(),
            password: "pw".to_string(),
            permissions,
        }
    }

    #[test]
    fn empty_config_is_open() {
        let config = AuthConfig::default();
        assert!(config.is_open());
        assert!(config.validate().is_ok());
        assert_eq!(config.account_names(), vec![GLOBAL_ACCOUNT]);
    }

    #[test]
    fn token_and_users_conflict() {
        let mut config = AuthConfig::with_token("s3cr3t");
        config.users.push(user("a", None));
        assert!(matches!(config.validate(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn duplicate_users_across_accounts_rejected() {
        let mut config = AuthConfig::with_users(vec![user("a", None)]);
        config.accounts.insert(
            "A".to_string(),
            AccountConfig {
                users: vec![user("a", None)],
            },
        );
        let err = config.validate().expect_err("duplicate");
        assert_eq!(err.to_string(), "invalid config: duplicate user a");
    }

    #[test]
    fn reserved_account_name_rejected() {
        let mut config = AuthConfig::default();
        config
            .accounts
            .insert(GLOBAL_ACCOUNT.to_string(), AccountConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn named_permission_sets_resolve() {
        let config: AuthConfig = serde_yaml::from_str(
            r#"
permission_sets:
  SERVER_A: { subscribe: ["server.server_a.>"], publish: "_INBOX.>" }
users:
  - { user: server_a, password: sa, permissions: "$SERVER_A" }
  - { user: ghost, password: gg, permissions: "$MISSING" }
"#,
        )
        .expect("yaml");
        let permissions = config.resolve_permissions(&config.users[0]).expect("set");
        assert!(permissions.allows(Action::Subscribe, "server.server_a.>"));
        assert!(!permissions.allows(Action::Publish, "server.server_a.ping"));
        assert!(matches!(
            config.resolve_permissions(&config.users[1]),
            Err(BrokerError::Config(_))
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn permission_set_reference_needs_prefix() {
        let config: AuthConfig = serde_yaml::from_str(
            r#"
permission_sets:
  ADMIN: { publish: ">", subscribe: ">" }
users:
  - { user: admin, password: pw, permissions: "ADMIN" }
"#,
        )
        .expect("yaml");
        let err = config
            .resolve_permissions(&config.users[0])
            .expect_err("bare name");
        assert!(err.to_string().contains("must start with $"), "{err}");
        assert!(config.validate().is_err());
    }

    #[test]
    fn user_without_permissions_gets_allow_all() {
        let config = AuthConfig::with_users(vec![user("a", None)]);
        let permissions = config.resolve_permissions(&config.users[0]).expect("perms");
        assert!(permissions.allows(Action::Publish, "any.subject"));
        assert!(permissions.allows(Action::Subscribe, ">"));
    }

    #[test]
    fn accounts_parse_from_yaml() {
        let config: AuthConfig = serde_yaml::from_str(
            r#"
accounts:
  UCSIDUCServer1:
    users:
      - user: UCSIDUCServer1
        password: server1
        permissions:
          subscribe: ["ucserver.*", "_INBOX.>"]
          publish: ["client.>", "_INBOX.>"]
  UCSIDUCServer2:
    users: []
"#,
        )
        .expect("yaml");
        assert!(config.validate().is_ok());
        assert!(!config.is_open());
        assert_eq!(
            config.account_names(),
            vec![GLOBAL_ACCOUNT, "UCSIDUCServer1", "UCSIDUCServer2"]
        );
        let (account, user) = config.all_users().next().expect("user");
        assert_eq!(account, "UCSIDUCServer1");
        assert_eq!(user.user, "UCSIDUCServer1");
    }
}
