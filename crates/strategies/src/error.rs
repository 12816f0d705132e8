use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// One problem found while validating a strategy payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// Dotted path of the offending field, e.g. `s1_signal.conditions[0].operator`.
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// A rejected strategy, with everything needed to trace the payload later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationFailure {
    pub strategy_id: String,
    pub fingerprint: String,
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "strategy '{}' ({}) rejected with {} issue(s)",
            self.strategy_id,
            self.fingerprint,
            self.issues.len()
        )?;
        for issue in &self.issues {
            write!(f, "; {}", issue)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(ValidationFailure),

    #[error("Malformed strategy payload: {0}")]
    Malformed(String),

    #[error("Strategy '{0}' not found")]
    NotFound(String),

    #[error("Failed to read strategy file: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
