use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Unknown section id: {0}")]
    UnknownSection(String),

    #[error("Unknown strategy state: {0}")]
    UnknownState(String),

    #[error("Unknown volume tier: {0}")]
    UnknownTier(String),
}

pub type Result<T> = std::result::Result<T, Error>;
