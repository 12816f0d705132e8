use crate::indicators::IndicatorEngine;
use crate::machine::{MachineAction, StateMachineInstance};
use crate::Result;
use api_client::Shutdown;
use app_config::IndicatorSettings;
use chrono::{DateTime, Utc};
use core_types::{MarketFrame, SessionId, Side, StrategyState, Symbol, Transition};
use events::{InstanceView, PositionView, StateEvent, TradeEvent, WsMessage};
use execution::{Executor, Fill, PaperExecutor, Portfolio};
use std::sync::Arc;
use strategies::StrategyDefinition;
use tokio::sync::{broadcast, mpsc, watch};

/// A self-contained task that runs one strategy instance on one symbol.
///
/// Frames arrive one at a time from the link task. Each frame updates the
/// indicators, then the state machine is ticked and its actions are carried
/// out against the paper executor before the next frame is read.
pub struct TradingTask {
    machine: StateMachineInstance,
    indicators: IndicatorEngine,
    executor: PaperExecutor,
    portfolio: Portfolio,
    side: Side,
    ws_tx: broadcast::Sender<WsMessage>,
    view_tx: watch::Sender<InstanceView>,
}

impl TradingTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        symbol: Symbol,
        strategy: Arc<StrategyDefinition>,
        indicator_settings: &IndicatorSettings,
        executor: PaperExecutor,
        portfolio: Portfolio,
        ws_tx: broadcast::Sender<WsMessage>,
        now: DateTime<Utc>,
    ) -> Self {
        let machine = StateMachineInstance::new(session_id, symbol.clone(), strategy, now);
        let indicators = IndicatorEngine::new(symbol, indicator_settings);
        let view = build_view(&machine, &indicators, &portfolio);
        let (view_tx, _) = watch::channel(view);
        Self {
            machine,
            indicators,
            executor,
            portfolio,
            side: Side::Long,
            ws_tx,
            view_tx,
        }
    }

    /// A receiver that always holds the latest published view.
    pub fn subscribe(&self) -> watch::Receiver<InstanceView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> InstanceView {
        build_view(&self.machine, &self.indicators, &self.portfolio)
    }

    /// The main loop. Returns the final view once the session is told to stop.
    pub async fn run(mut self, mut frames: mpsc::Receiver<MarketFrame>, mut shutdown: Shutdown) -> InstanceView {
        let session_id = self.machine.session_id().clone();
        let symbol = self.machine.symbol().clone();
        tracing::info!(session_id = %session_id, symbol = %symbol, strategy_id = %self.machine.strategy().id, "Starting trading task.");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = self.on_frame(frame).await {
                            tracing::error!(session_id = %session_id, symbol = %symbol, error = %e, "Failed to process frame.");
                        }
                    }
                    None => {
                        tracing::warn!(session_id = %session_id, symbol = %symbol, "Frame channel closed. Waiting for stop.");
                        shutdown.triggered().await;
                        break;
                    }
                },
            }
        }

        if shutdown.is_emergency() {
            tracing::warn!(session_id = %session_id, symbol = %symbol, "Emergency stop.");
        }
        self.finish(Utc::now()).await
    }

    /// Processes one frame. Evaluation time is the frame's own timestamp.
    pub async fn on_frame(&mut self, frame: MarketFrame) -> Result<()> {
        let now = frame.timestamp();
        self.indicators.on_frame(&frame);

        if self.machine.state() == StrategyState::Exiting {
            self.close_position(now).await?;
        }

        let has_price = self.indicators.last_price().is_some();
        let outcome = self.machine.tick(self.indicators.board(), has_price, now);

        for section in &outcome.sections {
            for detail in section.errors() {
                tracing::warn!(
                    session_id = %self.machine.session_id(),
                    section = %section.section,
                    condition = detail.index,
                    error = detail.error.as_deref().unwrap_or_default(),
                    "Condition could not be evaluated; treated as false."
                );
            }
        }
        for transition in &outcome.transitions {
            self.emit_transition(transition);
        }
        for action in outcome.actions {
            match action {
                MachineAction::OpenPosition => self.open_position(now).await?,
                MachineAction::ClosePosition(_) => self.close_position(now).await?,
            }
        }

        self.publish_view();
        Ok(())
    }

    async fn open_position(&mut self, now: DateTime<Utc>) -> Result<()> {
        let symbol = self.machine.symbol().clone();
        let result = match self.indicators.last_price() {
            Some(price) => match self.executor.entry_order(&symbol, self.side, price) {
                Ok(order) => self.executor.execute(&order, price, now, &mut self.portfolio).await,
                Err(e) => Err(e),
            },
            None => Err(execution::Error::ExecutionFailed { reason: "no known price".to_string() }),
        };

        match result {
            Ok(fill) => {
                self.indicators.set_entry(Some((fill.side, fill.price)));
                self.emit_fill(&fill);
                let transition = self.machine.on_entry_fill(now)?;
                self.emit_transition(&transition);
            }
            Err(e) => {
                tracing::warn!(session_id = %self.machine.session_id(), symbol = %symbol, error = %e, "Entry rejected.");
                let transition = self.machine.on_entry_rejected(now)?;
                self.emit_transition(&transition);
            }
        }
        Ok(())
    }

    /// Closes the open position. A failed close leaves the instance in
    /// EXITING and is retried on the next frame.
    async fn close_position(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.execute_close(now).await {
            Ok(_) => {
                let transition = self.machine.on_exit_fill(now)?;
                self.emit_transition(&transition);
            }
            Err(e) => {
                tracing::warn!(session_id = %self.machine.session_id(), error = %e, "Exit failed; will retry on the next frame.");
            }
        }
        Ok(())
    }

    /// Closes whatever position is open at the last known price.
    /// `Ok(None)` means there was nothing to close.
    async fn execute_close(&mut self, now: DateTime<Utc>) -> execution::Result<Option<Fill>> {
        let symbol = self.machine.symbol().clone();
        if self.portfolio.position(&symbol).is_none() {
            return Ok(None);
        }
        let price = self
            .indicators
            .last_price()
            .ok_or_else(|| execution::Error::ExecutionFailed { reason: "no known price".to_string() })?;
        let order = self.executor.exit_order(&self.portfolio, &symbol)?;
        let fill = self.executor.execute(&order, price, now, &mut self.portfolio).await?;
        self.indicators.set_entry(None);
        self.emit_fill(&fill);
        Ok(Some(fill))
    }

    /// Closes any open position, marks the instance STOPPED and returns
    /// the final view.
    pub async fn finish(mut self, now: DateTime<Utc>) -> InstanceView {
        if let Err(e) = self.execute_close(now).await {
            tracing::error!(session_id = %self.machine.session_id(), error = %e, "Could not close the position on stop.");
        }
        if let Some(transition) = self.machine.stop(now) {
            self.emit_transition(&transition);
        }
        self.publish_view();
        tracing::info!(session_id = %self.machine.session_id(), state = %self.machine.state(), "Trading task finished.");
        self.view()
    }

    fn emit_transition(&self, transition: &Transition) {
        let event = StateEvent {
            session_id: self.machine.session_id().clone(),
            symbol: self.machine.symbol().clone(),
            strategy_id: self.machine.strategy().id.clone(),
            previous_state: Some(transition.from),
            new_state: transition.to,
            timestamp: transition.at,
            trigger: Some(transition.trigger),
        };
        // No listeners is fine.
        let _ = self.ws_tx.send(WsMessage::StateChange(event));
    }

    fn emit_fill(&self, fill: &Fill) {
        let event = TradeEvent {
            session_id: self.machine.session_id().clone(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            price: fill.price,
            quantity: fill.quantity,
            fee: fill.fee,
            realized_pnl: fill.realized_pnl,
            timestamp: fill.timestamp,
        };
        let _ = self.ws_tx.send(WsMessage::TradeExecuted(event));
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(self.view());
    }
}

fn build_view(machine: &StateMachineInstance, indicators: &IndicatorEngine, portfolio: &Portfolio) -> InstanceView {
    InstanceView {
        session_id: machine.session_id().clone(),
        symbol: machine.symbol().clone(),
        strategy_id: machine.strategy().id.clone(),
        state: machine.state(),
        entered_at: machine.entered_at(),
        transitions: machine.history().len(),
        last_price: indicators.last_price(),
        position: portfolio.position(machine.symbol()).map(|p| PositionView {
            side: p.side,
            quantity: p.quantity,
            entry_price: p.entry_price,
            entry_fee: p.entry_fee,
            opened_at: p.opened_at,
        }),
        realized_pnl: portfolio.realized_pnl,
    }
}
