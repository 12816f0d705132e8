// In crates/execution/src/lib.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

pub mod error;
pub mod simulated;
pub mod types;

// Re-export public types
pub use error::{Error, Result};
pub use simulated::PaperExecutor;
pub use types::{Fill, OrderIntent, OrderRequest, Portfolio, Position};

/// The universal interface for an execution handler.
///
/// An `Executor` takes an `OrderRequest` and fills it against some target.
/// The only target in this workspace is the paper simulation; the trait keeps
/// the trading task independent of it.
#[async_trait]
pub trait Executor: Send {
    /// The name of the executor (e.g., "PaperExecutor").
    fn name(&self) -> &'static str;

    /// Executes an order at `current_price` and updates `portfolio`.
    async fn execute(
        &mut self,
        order: &OrderRequest,
        current_price: Decimal,
        now: DateTime<Utc>,
        portfolio: &mut Portfolio,
    ) -> Result<Fill>;
}
