//! Subject grammar and wildcard matching.
//!
//! Subjects are dot-delimited token sequences such as `server.server_a.ping`.
//! Patterns use the same grammar plus two wildcard tokens: `*` matches exactly
//! one token and `>` matches one or more trailing tokens.
//!
//! Matching is a single left-to-right scan over both token streams; there is
//! no backtracking because `>` can only close a pattern.
use crate::{AuthzError, AuthzResult};
use serde::{Deserialize, Serialize};

pub const SEPARATOR: char = '.';
pub const SINGLE_WILDCARD: &str = "*";
pub const FULL_WILDCARD: &str = ">";

/// Validate a concrete subject used for publishing.
///
/// Rejects empty subjects, empty tokens, whitespace, and wildcard tokens.
pub fn validate_subject(subject: &str) -> AuthzResult<()> {
    if subject.is_empty() {
        return Err(AuthzError::InvalidSubject(subject.to_string()));
    }
    for token in subject.split(SEPARATOR) {
        if !valid_token(token) || token == SINGLE_WILDCARD || token == FULL_WILDCARD {
            return Err(AuthzError::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}

/// Validate a subscription or permission pattern.
///
/// Wildcards must occupy a whole token and `>` must be the final token.
pub fn validate_pattern(pattern: &str) -> AuthzResult<()> {
    if pattern.is_empty() {
        return Err(AuthzError::InvalidPattern(pattern.to_string()));
    }
    let mut tokens = pattern.split(SEPARATOR).peekable();
    while let Some(token) = tokens.next() {
        if !valid_token(token) {
            return Err(AuthzError::InvalidPattern(pattern.to_string()));
        }
        if token == FULL_WILDCARD && tokens.peek().is_some() {
            return Err(AuthzError::InvalidPattern(pattern.to_string()));
        }
    }
    Ok(())
}

// A token is non-empty, has no whitespace, and only carries `*`/`>` as a whole token.
fn valid_token(token: &str) -> bool {
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return false;
    }
    if token.len() > 1 && (token.contains('*') || token.contains('>')) {
        return false;
    }
    true
}

/// True when the pattern contains no wildcard tokens.
pub fn is_literal(pattern: &str) -> bool {
    pattern
        .split(SEPARATOR)
        .all(|token| token != SINGLE_WILDCARD && token != FULL_WILDCARD)
}

/// Does `pattern` match the concrete `subject`?
///
/// ```
/// use courier_authz::matches;
///
/// assert!(matches("server.*.ping", "server.server_a.ping"));
/// assert!(matches("server.server_a.>", "server.server_a.client.c1.ping"));
/// assert!(!matches("server.server_a.>", "server.server_a"));
/// assert!(matches(">", "anything.at.all"));
/// ```
pub fn matches(pattern: &str, subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    let mut pattern_tokens = pattern.split(SEPARATOR);
    let mut subject_tokens = subject.split(SEPARATOR);
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            // `>` absorbs the remaining subject tokens but must close the pattern.
            (Some(FULL_WILDCARD), Some(_)) => return pattern_tokens.next().is_none(),
            (Some(SINGLE_WILDCARD), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Is every subject matched by `pattern` also matched by `allowed`?
///
/// For a literal `pattern` this is exactly `matches(allowed, pattern)`.
///
/// ```
/// use courier_authz::is_subset;
///
/// assert!(is_subset("ucserver.*", "ucserver.*"));
/// assert!(is_subset("ucserver.ping", "ucserver.*"));
/// assert!(!is_subset("ucserver.>", "ucserver.*"));
/// assert!(is_subset("_INBOX.abc.*", "_INBOX.>"));
/// ```
pub fn is_subset(pattern: &str, allowed: &str) -> bool {
    let mut allowed_tokens = allowed.split(SEPARATOR);
    let mut pattern_tokens = pattern.split(SEPARATOR);
    loop {
        match (allowed_tokens.next(), pattern_tokens.next()) {
            (Some(FULL_WILDCARD), Some(_)) => return allowed_tokens.next().is_none(),
            // Anything short of `>` cannot cover an open-ended tail.
            (Some(_), Some(FULL_WILDCARD)) => return false,
            (Some(SINGLE_WILDCARD), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validated subject pattern.
///
/// # Invariants
/// - The inner string passed [`validate_pattern`].
///
/// # Example
/// ```rust
/// use courier_authz::SubjectPattern;
///
/// let pattern: SubjectPattern = "client.*.ping".parse().expect("pattern");
/// assert!(pattern.matches("client.c1.ping"));
/// assert!(!pattern.is_literal());
/// assert!("client.>.ping".parse::<SubjectPattern>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectPattern(String);

impl SubjectPattern {
    pub fn parse(value: &str) -> AuthzResult<Self> {
        value.parse()
    }

    /// Pattern that matches every valid subject.
    pub fn full_wildcard() -> Self {
        Self(FULL_WILDCARD.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, subject: &str) -> bool {
        matches(&self.0, subject)
    }

    pub fn covers(&self, pattern: &str) -> bool {
        is_subset(pattern, &self.0)
    }

    pub fn is_literal(&self) -> bool {
        is_literal(&self.0)
    }
}

impl std::str::FromStr for SubjectPattern {
    type Err = AuthzError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        validate_pattern(value)?;
        Ok(Self(value.to_string()))
    }
}

impl TryFrom<String> for SubjectPattern {
    type Error = AuthzError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_pattern(&value)?;
        Ok(Self(value))
    }
}

impl From<SubjectPattern> for String {
    fn from(value: SubjectPattern) -> Self {
        value.0
    }
}

impl std::fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match_requires_equal_tokens() {
        assert!(matches("ucserver.A.AsnHello", "ucserver.A.AsnHello"));
        assert!(!matches("ucserver.A.AsnHello", "ucserver.A.AsnHello.v2"));
        assert!(!matches("ucserver.A.AsnHello.v2", "ucserver.A.AsnHello"));
        assert!(!matches("ucserver.A", "ucserver.B"));
    }

    #[test]
    fn single_wildcard_matches_exactly_one_token() {
        assert!(matches("ucserver.A.*", "ucserver.A.AsnHello"));
        assert!(!matches("ucserver.A.*", "ucserver.A"));
        assert!(!matches("ucserver.A.*", "ucserver.A.AsnHello.extra"));
        assert!(matches("*.A.*", "ucserver.A.tick"));
    }

    #[test]
    fn full_wildcard_matches_one_or_more_tail_tokens() {
        assert!(matches("server.server_a.>", "server.server_a.ping"));
        assert!(matches(
            "server.server_a.>",
            "server.server_a.client.client_a.ping"
        ));
        assert!(!matches("server.server_a.>", "server.server_a"));
        assert!(!matches("server.server_a.>", "server.server_b.ping"));
    }

    #[test]
    fn bare_full_wildcard_matches_any_non_empty_subject() {
        assert!(matches(">", "a"));
        assert!(matches(">", "a.b.c"));
        assert!(!matches(">", ""));
    }

    #[test]
    fn misplaced_full_wildcard_never_matches() {
        assert!(!matches("a.>.c", "a.b.c"));
    }

    #[test]
    fn matching_is_case_sensitive() {
        assert!(!matches("Server.A", "server.A"));
        assert!(matches("Server.*", "Server.a"));
    }

    #[test]
    fn subject_validation() {
        assert!(validate_subject("server.server_a.ping").is_ok());
        assert!(validate_subject("_INBOX.abc.def").is_ok());
        for bad in ["", ".a", "a.", "a..b", "a.*", "a.>", "a b", "a.\tb"] {
            assert!(
                matches!(validate_subject(bad), Err(AuthzError::InvalidSubject(_))),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn pattern_validation() {
        for good in [">", "*", "a.*", "a.>", "*.b.>", "a.b"] {
            assert!(validate_pattern(good).is_ok(), "expected {good:?} to pass");
        }
        for bad in ["", "a.>.b", "a*", "a.b>", "a..b", "a. b", ">.a"] {
            assert!(
                matches!(validate_pattern(bad), Err(AuthzError::InvalidPattern(_))),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn subset_of_wildcards() {
        assert!(is_subset("server.server_a.>", ">"));
        assert!(is_subset("server.server_a.>", "server.server_a.>"));
        assert!(is_subset("server.server_a.x.>", "server.server_a.>"));
        assert!(!is_subset("server.>", "server.server_a.>"));
        assert!(is_subset("client.c1.*", "client.*.*"));
        assert!(!is_subset("client.*.*", "client.c1.*"));
        assert!(!is_subset("ucserver.>", "ucserver.*"));
        assert!(!is_subset("ucserver", "ucserver.>"));
    }

    #[test]
    fn subset_agrees_with_matches_for_literals() {
        let cases = [
            ("server.*.ping", "server.a.ping"),
            ("server.>", "server.a.ping"),
            ("server.a", "server.b"),
            (">", "x"),
            ("a.*", "a"),
        ];
        for (allowed, subject) in cases {
            assert_eq!(
                is_subset(subject, allowed),
                matches(allowed, subject),
                "{allowed} vs {subject}"
            );
        }
    }

    #[test]
    fn literal_detection() {
        assert!(is_literal("a.b.c"));
        assert!(!is_literal("a.*.c"));
        assert!(!is_literal(">"));
    }

    #[test]
    fn pattern_serde_validates() {
        let pattern: SubjectPattern = serde_yaml::from_str("\"client.>\"").expect("yaml");
        assert_eq!(pattern.as_str(), "client.>");
        assert!(serde_yaml::from_str::<SubjectPattern>("\"client.>.x\"").is_err());
    }

    #[test]
    fn pattern_covers() {
        let pattern = SubjectPattern::parse("_INBOX.>").expect("pattern");
        assert!(pattern.covers("_INBOX.abc.def"));
        assert!(pattern.covers("_INBOX.abc.*"));
        assert!(!pattern.covers("_OTHER.abc"));
        assert!(SubjectPattern::full_wildcard().covers(">"));
    }
}
