use chrono::{DateTime, Utc};
use core_types::{Side, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderIntent {
    Open,
    Close,
}

/// A market order handed to an [`crate::Executor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    /// The side of the position being opened or closed.
    pub side: Side,
    pub quantity: Decimal,
    pub intent: OrderIntent,
}

/// A simulated open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_fee: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Mark-to-market PnL at `price`, before fees.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        let direction = match self.side {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        };
        (price - self.entry_price) * self.quantity * direction
    }

    pub fn unrealized_pnl_pct(&self, price: Decimal) -> Option<Decimal> {
        let notional = self.entry_price * self.quantity;
        if notional.is_zero() {
            return None;
        }
        Some(self.unrealized_pnl(price) / notional * Decimal::ONE_HUNDRED)
    }
}

/// The result of an executed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: Symbol,
    pub side: Side,
    pub intent: OrderIntent,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    /// Set on closing fills: PnL net of both legs' fees.
    pub realized_pnl: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// Represents the state of the simulated trading portfolio.
#[derive(Debug, Clone)]
pub struct Portfolio {
    /// The cash balance (e.g., in USDT).
    pub cash: Decimal,

    /// Currently open positions, keyed by symbol.
    pub open_positions: HashMap<Symbol, Position>,

    /// Sum of realised PnL over all closed positions.
    pub realized_pnl: Decimal,
}

impl Portfolio {
    /// Creates a new portfolio with an initial cash balance.
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            cash: initial_cash,
            open_positions: HashMap::new(),
            realized_pnl: Decimal::ZERO,
        }
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.open_positions.get(symbol)
    }
}
