use crate::types::{Fill, OrderIntent, OrderRequest, Portfolio, Position};
use crate::{Error, Executor, Result};
use app_config::SimulationSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{Side, Symbol};
use num_traits::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Fills market orders against the last known price, applying slippage and a
/// taker fee. Nothing leaves the process.
#[derive(Debug, Clone)]
pub struct PaperExecutor {
    taker_fee: Decimal,
    slippage: Decimal,
    position_notional: Decimal,
}

fn decimal_setting(name: &'static str, value: f64) -> Result<Decimal> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidSetting { name, value });
    }
    Decimal::from_f64(value).ok_or(Error::InvalidSetting { name, value })
}

impl PaperExecutor {
    pub fn new(settings: &SimulationSettings) -> Result<Self> {
        Ok(Self {
            taker_fee: decimal_setting("taker_fee", settings.taker_fee)?,
            slippage: decimal_setting("slippage_percent", settings.slippage_percent)?,
            position_notional: decimal_setting("position_notional", settings.position_notional)?,
        })
    }

    /// An opening order sized to the configured notional at `price`.
    pub fn entry_order(&self, symbol: &Symbol, side: Side, price: Decimal) -> Result<OrderRequest> {
        if price <= Decimal::ZERO {
            return Err(Error::ExecutionFailed { reason: format!("cannot size an order at price {}", price) });
        }
        let quantity = (self.position_notional / price).round_dp(8);
        if quantity.is_zero() {
            return Err(Error::ExecutionFailed { reason: "order quantity rounds to zero".to_string() });
        }
        Ok(OrderRequest { symbol: symbol.clone(), side, quantity, intent: OrderIntent::Open })
    }

    /// A closing order for whatever is open on `symbol`.
    pub fn exit_order(&self, portfolio: &Portfolio, symbol: &Symbol) -> Result<OrderRequest> {
        let position = portfolio.position(symbol).ok_or_else(|| Error::NoPosition(symbol.0.clone()))?;
        Ok(OrderRequest {
            symbol: symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            intent: OrderIntent::Close,
        })
    }

    /// Slippage always works against us: buys fill higher, sells lower.
    fn slipped(&self, price: Decimal, buying: bool) -> Decimal {
        if buying {
            price * (dec!(1) + self.slippage)
        } else {
            price * (dec!(1) - self.slippage)
        }
    }

    fn process_entry(
        &self,
        order: &OrderRequest,
        current_price: Decimal,
        now: DateTime<Utc>,
        portfolio: &mut Portfolio,
    ) -> Result<Fill> {
        if portfolio.open_positions.contains_key(&order.symbol) {
            return Err(Error::PositionExists(order.symbol.0.clone()));
        }

        let execution_price = self.slipped(current_price, order.side == Side::Long);
        let fee = order.quantity * execution_price * self.taker_fee;

        // Veto if there is not enough cash to cover the fee. A real exchange would check margin.
        if portfolio.cash < fee {
            return Err(Error::ExecutionFailed { reason: "Insufficient cash for fees".to_string() });
        }
        portfolio.cash -= fee;

        portfolio.open_positions.insert(
            order.symbol.clone(),
            Position {
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: order.quantity,
                entry_price: execution_price,
                entry_fee: fee,
                opened_at: now,
            },
        );

        tracing::info!(symbol = %order.symbol, side = ?order.side, price = %execution_price, quantity = %order.quantity, "Paper position opened.");
        Ok(Fill {
            symbol: order.symbol.clone(),
            side: order.side,
            intent: OrderIntent::Open,
            price: execution_price,
            quantity: order.quantity,
            fee,
            realized_pnl: None,
            timestamp: now,
        })
    }

    fn process_close(
        &self,
        order: &OrderRequest,
        current_price: Decimal,
        now: DateTime<Utc>,
        portfolio: &mut Portfolio,
    ) -> Result<Fill> {
        let position = portfolio
            .open_positions
            .remove(&order.symbol)
            .ok_or_else(|| Error::NoPosition(order.symbol.0.clone()))?;

        // Closing a long sells, closing a short buys.
        let execution_price = self.slipped(current_price, position.side == Side::Short);
        let gross = position.unrealized_pnl(execution_price);
        let fee = position.quantity * execution_price * self.taker_fee;
        let net = gross - fee - position.entry_fee;

        portfolio.cash += gross - fee;
        portfolio.realized_pnl += net;

        tracing::info!(symbol = %order.symbol, price = %execution_price, pnl = %net, "Paper position closed.");
        Ok(Fill {
            symbol: order.symbol.clone(),
            side: position.side,
            intent: OrderIntent::Close,
            price: execution_price,
            quantity: position.quantity,
            fee,
            realized_pnl: Some(net),
            timestamp: now,
        })
    }
}

#[async_trait]
impl Executor for PaperExecutor {
    fn name(&self) -> &'static str {
        "PaperExecutor"
    }

    async fn execute(
        &mut self,
        order: &OrderRequest,
        current_price: Decimal,
        now: DateTime<Utc>,
        portfolio: &mut Portfolio,
    ) -> Result<Fill> {
        if current_price <= Decimal::ZERO {
            return Err(Error::ExecutionFailed { reason: format!("invalid market price {}", current_price) });
        }
        match order.intent {
            OrderIntent::Open => self.process_entry(order, current_price, now, portfolio),
            OrderIntent::Close => self.process_close(order, current_price, now, portfolio),
        }
    }
}
