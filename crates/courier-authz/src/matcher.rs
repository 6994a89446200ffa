use crate::{AuthzResult, SubjectPattern};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionMatcher {
    patterns: Vec<SubjectPattern>,
}

impl PermissionMatcher {
    pub fn new(patterns: Vec<SubjectPattern>) -> Self {
        Self { patterns }
    }

    pub fn allow_all() -> Self {
        Self::new(vec![SubjectPattern::full_wildcard()])
    }

    // No patterns: every check fails.
    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn from_strings<S: AsRef<str>>(patterns: &[S]) -> AuthzResult<Self> {
        let mut parsed = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            parsed.push(pattern.as_ref().parse()?);
        }
        Ok(Self::new(parsed))
    }

    /// Does any granted pattern match the concrete subject?
    pub fn allows(&self, subject: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(subject))
    }

    /// Does any granted pattern cover every subject the given pattern can match?
    pub fn allows_pattern(&self, pattern: &str) -> bool {
        self.patterns.iter().any(|granted| granted.covers(pattern))
    }

    pub fn patterns(&self) -> &[SubjectPattern] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuthzError;

    #[test]
    fn matcher_allows_any_granted_pattern() {
        let matcher =
            PermissionMatcher::from_strings(&["ucserver.*", "_INBOX.>"]).expect("patterns");
        assert!(matcher.allows("ucserver.asnPing"));
        assert!(matcher.allows("_INBOX.abc.def"));
        assert!(!matcher.allows("client.c1.asnPing"));
    }

    #[test]
    fn deny_all_rejects_everything() {
        let matcher = PermissionMatcher::deny_all();
        assert!(matcher.is_empty());
        assert!(!matcher.allows("a"));
        assert!(!matcher.allows_pattern(">"));
    }

    #[test]
    fn allow_all_accepts_subjects_and_patterns() {
        let matcher = PermissionMatcher::allow_all();
        assert!(matcher.allows("a.b.c"));
        assert!(matcher.allows_pattern(">"));
        assert!(matcher.allows_pattern("a.*"));
    }

    #[test]
    fn pattern_checks_use_subset_semantics() {
        let matcher = PermissionMatcher::from_strings(&["server.server_a.>"]).expect("patterns");
        assert!(matcher.allows_pattern("server.server_a.>"));
        assert!(matcher.allows_pattern("server.server_a.*.ping"));
        assert!(!matcher.allows_pattern("server.>"));
        assert!(!matcher.allows_pattern(">"));
    }

    #[test]
    fn from_strings_rejects_bad_pattern() {
        let err = PermissionMatcher::from_strings(&["a.>.b"]).expect_err("invalid");
        assert!(matches!(err, AuthzError::InvalidPattern(p) if p == "a.>.b"));
    }
}
