//! Courier subject grammar and authorization primitives.
//!
//! # Purpose
//! Centralizes subject validation, wildcard matching, and the permission model
//! used by the broker to decide who may publish or subscribe where.
//!
//! # How it fits
//! The broker builds a [`Permissions`] value for every authenticated principal
//! from its configuration and consults it on each publish and subscribe.
//! Dispatch uses [`matches`] to route published subjects to subscriptions.
//!
//! # Key invariants
//! - Subjects are `.`-separated tokens; publish subjects never contain wildcards.
//! - `*` matches exactly one token; `>` matches one or more trailing tokens and
//!   may only appear as the final token.
//! - A capability with no granted patterns denies everything.
//!
//! # Examples
//! ```rust
//! use courier_authz::{Action, Permissions, PermissionMatcher, SubjectPattern};
//!
//! let permissions = Permissions::new(
//!     PermissionMatcher::new(vec!["server.server_a.>".parse::<SubjectPattern>().unwrap()]),
//!     PermissionMatcher::deny_all(),
//! );
//! assert!(permissions.allows(Action::Publish, "server.server_a.ping"));
//! assert!(!permissions.allows(Action::Publish, "server.server_b.ping"));
//! assert!(!permissions.allows(Action::Subscribe, "server.server_a.ping"));
//! ```
//!
//! # Common pitfalls
//! - Checking a wildcard subscription with [`matches`] instead of [`is_subset`]
//!   lets `ucserver.>` through a `ucserver.*` grant.
//! - Matching is case-sensitive; `Server.A` and `server.a` are distinct.

mod action;
mod errors;
mod matcher;
mod permission;
mod subject;

pub use action::Action;
pub use errors::{AuthzError, AuthzResult};
pub use matcher::PermissionMatcher;
pub use permission::{PermissionList, Permissions, PermissionsConfig};
pub use subject::{
    FULL_WILDCARD, SEPARATOR, SINGLE_WILDCARD, SubjectPattern, is_literal, is_subset, matches,
    validate_pattern, validate_subject,
};
