use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
    #[error("invalid subject pattern: {0:?}")]
    InvalidPattern(String),
    #[error("invalid action: {0}")]
    InvalidAction(String),
}

pub type AuthzResult<T> = Result<T, AuthzError>;
