//! Permission sets and their configuration form.
//!
//! # Purpose
//! Defines the per-principal [`Permissions`] value and the serde types used to
//! declare permissions in broker configuration.
//!
//! # How it fits
//! Config loaders deserialize [`PermissionsConfig`] values and call
//! [`PermissionsConfig::build`]; the broker attaches the resulting
//! [`Permissions`] to every principal it authenticates.
//!
//! # Key invariants
//! - A capability that is absent or empty in a permissions block denies that
//!   capability entirely.
//! - Subscribe checks treat the requested subject as a pattern and require a
//!   granted pattern to cover it.
//!
//! # Examples
//! ```rust
//! use courier_authz::{Action, PermissionsConfig};
//!
//! let config: PermissionsConfig = serde_yaml::from_str(
//!     "publish: \"_INBOX.>\"\nsubscribe: [\"server.server_a.>\"]",
//! )
//! .expect("yaml");
//! let permissions = config.build().expect("build");
//! assert!(permissions.allows(Action::Publish, "_INBOX.abc"));
//! assert!(permissions.allows(Action::Subscribe, "server.server_a.>"));
//! assert!(!permissions.allows(Action::Publish, "server.server_a.ping"));
//! ```
use crate::{Action, AuthzResult, PermissionMatcher};
use serde::{Deserialize, Serialize};

/// Publish and subscribe grants for one principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permissions {
    publish: PermissionMatcher,
    subscribe: PermissionMatcher,
}

impl Permissions {
    pub fn new(publish: PermissionMatcher, subscribe: PermissionMatcher) -> Self {
        Self { publish, subscribe }
    }

    /// Grants used when no authorization is configured.
    pub fn allow_all() -> Self {
        Self::new(PermissionMatcher::allow_all(), PermissionMatcher::allow_all())
    }

    /// Check an action against a subject.
    ///
    /// # Parameters
    /// - `action`: publish or subscribe.
    /// - `subject`: concrete subject for publish; subject pattern for subscribe.
    ///
    /// # Returns
    /// - `true` when at least one granted pattern allows it.
    pub fn allows(&self, action: Action, subject: &str) -> bool {
        match action {
            Action::Publish => self.publish.allows(subject),
            Action::Subscribe => self.subscribe.allows_pattern(subject),
        }
    }

    pub fn publish(&self) -> &PermissionMatcher {
        &self.publish
    }

    pub fn subscribe(&self) -> &PermissionMatcher {
        &self.subscribe
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::allow_all()
    }
}

/// A single pattern or an ordered list of patterns.
///
/// # Example
/// ```rust
/// use courier_authz::PermissionList;
///
/// let one: PermissionList = serde_yaml::from_str("\">\"").expect("yaml");
/// let many: PermissionList = serde_yaml::from_str("[\"a.*\", \"b.>\"]").expect("yaml");
/// assert_eq!(one.patterns(), vec![">"]);
/// assert_eq!(many.patterns(), vec!["a.*", "b.>"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionList {
    One(String),
    Many(Vec<String>),
}

impl PermissionList {
    pub fn patterns(&self) -> Vec<&str> {
        match self {
            PermissionList::One(pattern) => vec![pattern.as_str()],
            PermissionList::Many(patterns) => patterns.iter().map(String::as_str).collect(),
        }
    }

    /// Parse every pattern into a matcher.
    ///
    /// # Errors
    /// - [`crate::AuthzError::InvalidPattern`] for the first malformed pattern.
    pub fn to_matcher(&self) -> AuthzResult<PermissionMatcher> {
        PermissionMatcher::from_strings(&self.patterns())
    }
}

/// Configuration form of a permissions block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PermissionList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<PermissionList>,
}

impl PermissionsConfig {
    pub fn build(&self) -> AuthzResult<Permissions> {
        Ok(Permissions::new(
            capability(self.publish.as_ref())?,
            capability(self.subscribe.as_ref())?,
        ))
    }
}

fn capability(list: Option<&PermissionList>) -> AuthzResult<PermissionMatcher> {
    match list {
        Some(list) => list.to_matcher(),
        None => Ok(PermissionMatcher::deny_all()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuthzError;

    #[test]
    fn absent_capability_denies() {
        let config = PermissionsConfig {
            publish: Some(PermissionList::One("server.server_a.>".to_string())),
            subscribe: None,
        };
        let permissions = config.build().expect("build");
        assert!(permissions.allows(Action::Publish, "server.server_a.ping"));
        assert!(!permissions.allows(Action::Subscribe, "_INBOX.abc"));
    }

    #[test]
    fn empty_list_denies() {
        let config = PermissionsConfig {
            publish: Some(PermissionList::Many(Vec::new())),
            subscribe: Some(PermissionList::One(">".to_string())),
        };
        let permissions = config.build().expect("build");
        assert!(!permissions.allows(Action::Publish, "anything"));
        assert!(permissions.allows(Action::Subscribe, "anything.>"));
    }

    #[test]
    fn allow_all_grants_everything() {
        let permissions = Permissions::default();
        assert!(permissions.allows(Action::Publish, "a.b"));
        assert!(permissions.allows(Action::Subscribe, ">"));
    }

    #[test]
    fn subscribe_uses_pattern_coverage() {
        let config: PermissionsConfig =
            serde_yaml::from_str("subscribe: [\"ucserver.*\", \"_INBOX.>\"]").expect("yaml");
        let permissions = config.build().expect("build");
        assert!(permissions.allows(Action::Subscribe, "ucserver.*"));
        assert!(permissions.allows(Action::Subscribe, "ucserver.asnPing"));
        assert!(!permissions.allows(Action::Subscribe, "ucserver.>"));
        assert!(permissions.allows(Action::Subscribe, "_INBOX.root.*"));
    }

    #[test]
    fn build_rejects_invalid_pattern() {
        let config = PermissionsConfig {
            publish: Some(PermissionList::Many(vec!["ok.>".into(), "bad.>.x".into()])),
            subscribe: None,
        };
        assert!(matches!(config.build(), Err(AuthzError::InvalidPattern(_))));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_yaml::from_str::<PermissionsConfig>("publish: \">\"\nrequest: \">\"");
        assert!(err.is_err());
    }
}
