use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Strategy error: {0}")]
    Strategy(#[from] strategies::Error),

    #[error("Link error: {0}")]
    Link(#[from] api_client::Error),

    #[error("Execution error: {0}")]
    Execution(#[from] execution::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid transition from {from} on {trigger}")]
    InvalidTransition { from: core_types::StrategyState, trigger: core_types::TransitionTrigger },
}

pub type Result<T> = std::result::Result<T, Error>;
