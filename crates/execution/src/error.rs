use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Execution failed: {reason}")]
    ExecutionFailed { reason: String },

    #[error("Invalid setting '{name}': {value}")]
    InvalidSetting { name: &'static str, value: f64 },

    #[error("No open position for {0}")]
    NoPosition(String),

    #[error("A position for {0} is already open")]
    PositionExists(String),
}

pub type Result<T> = std::result::Result<T, Error>;
