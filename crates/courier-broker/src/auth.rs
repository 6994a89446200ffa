// Credential checks that turn a connect attempt into a principal.
use ahash::RandomState;
use courier_authz::Permissions;
use hashbrown::HashMap;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::config::{AuthConfig, GLOBAL_ACCOUNT};
use crate::{BrokerError, Result};

const ANONYMOUS_PRINCIPAL: &str = "anonymous";
const TOKEN_PRINCIPAL: &str = "token";

/// Credentials presented by a connecting client.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credentials {
    #[default]
    Anonymous,
    Token(String),
    UserPassword {
        user: String,
        password: String,
    },
}

impl Credentials {
    pub fn token(token: impl Into<String>) -> Self {
        Self::Token(token.into())
    }

    pub fn user_password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::UserPassword {
            user: user.into(),
            password: password.into(),
        }
    }
}

// Secrets never reach logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Token(_) => f.write_str("Token([REDACTED])"),
            Credentials::UserPassword { user, .. } => f
                .debug_struct("UserPassword")
                .field("user", user)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Authenticated identity bound to one connection.
#[derive(Debug, Clone)]
pub struct Principal {
    id: Arc<str>,
    account: Arc<str>,
    permissions: Arc<Permissions>,
}

impl Principal {
    pub fn new(
        id: impl Into<Arc<str>>,
        account: impl Into<Arc<str>>,
        permissions: Arc<Permissions>,
    ) -> Self {
        Self {
            id: id.into(),
            account: account.into(),
            permissions,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }
}

#[derive(Debug)]
struct UserEntry {
    password: String,
    account: Arc<str>,
    permissions: Arc<Permissions>,
}

#[derive(Debug)]
enum AuthMode {
    Open,
    Token(String),
    Users(HashMap<String, UserEntry, RandomState>),
}

/// Checks credentials against the configured token or user tables.
#[derive(Debug)]
pub(crate) struct Authenticator {
    mode: AuthMode,
    allow_all: Arc<Permissions>,
}

impl Authenticator {
    pub(crate) fn open() -> Self {
        Self {
            mode: AuthMode::Open,
            allow_all: Arc::new(Permissions::allow_all()),
        }
    }

    pub(crate) fn from_config(config: &AuthConfig) -> Result<Self> {
        config.validate()?;
        let allow_all = Arc::new(Permissions::allow_all());
        let mode = if let Some(token) = &config.token {
            AuthMode::Token(token.clone())
        } else if config.is_open() {
            AuthMode::Open
        } else {
            let mut users = HashMap::with_hasher(RandomState::new());
            for (account, user) in config.all_users() {
                let permissions = config.resolve_permissions(user)?;
                users.insert(
                    user.user.clone(),
                    UserEntry {
                        password: user.password.clone(),
                        account: Arc::from(account),
                        permissions: Arc::new(permissions),
                    },
                );
            }
            AuthMode::Users(users)
        };
        Ok(Self { mode, allow_all })
    }

    pub(crate) fn auth_required(&self) -> bool {
        !matches!(self.mode, AuthMode::Open)
    }

    /// Resolve credentials to a principal.
    ///
    /// Every failure maps to [`BrokerError::AuthorizationViolation`] so callers
    /// cannot tell an unknown user from a wrong password.
    pub(crate) fn authenticate(&self, credentials: &Credentials) -> Result<Principal> {
        match (&self.mode, credentials) {
            (AuthMode::Open, Credentials::UserPassword { user, .. }) => Ok(Principal::new(
                user.as_str(),
                GLOBAL_ACCOUNT,
                Arc::clone(&self.allow_all),
            )),
            (AuthMode::Open, _) => Ok(Principal::new(
                ANONYMOUS_PRINCIPAL,
                GLOBAL_ACCOUNT,
                Arc::clone(&self.allow_all),
            )),
            (AuthMode::Token(expected), Credentials::Token(presented))
                if secrets_equal(expected, presented) =>
            {
                Ok(Principal::new(
                    TOKEN_PRINCIPAL,
                    GLOBAL_ACCOUNT,
                    Arc::clone(&self.allow_all),
                ))
            }
            (AuthMode::Users(users), Credentials::UserPassword { user, password }) => {
                match users.get(user.as_str()) {
                    Some(entry) if secrets_equal(&entry.password, password) => Ok(Principal::new(
                        user.as_str(),
                        Arc::clone(&entry.account),
                        Arc::clone(&entry.permissions),
                    )),
                    Some(_) => Err(BrokerError::AuthorizationViolation),
                    None => {
                        // Burn a comparison so unknown users cost the same as bad passwords.
                        let _ = secrets_equal(password, password);
                        Err(BrokerError::AuthorizationViolation)
                    }
                }
            }
            _ => Err(BrokerError::AuthorizationViolation),
        }
    }
}

fn secrets_equal(expected: &str, presented: &str) -> bool {
    let lengths_equal = expected.len().ct_eq(&presented.len());
    let max_len = expected.len().max(presented.len());
    let mut expected_padded = vec![0u8; max_len];
    let mut presented_padded = vec![0u8; max_len];
    expected_padded[..expected.len()].copy_from_slice(expected.as_bytes());
    presented_padded[..presented.len()].copy_from_slice(presented.as_bytes());
    let contents_equal = expected_padded.ct_eq(&presented_padded);
    (lengths_equal & contents_equal).into()
}
