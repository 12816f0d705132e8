use crate::task::TradingTask;
use crate::{Error, Result};
use api_client::{FrameSource, HealthHandler, LinkControl, LinkRequest, LinkState, Shutdown};
use app_config::Settings;
use chrono::Utc;
use core_types::{SessionId, StrategyState, Symbol, TransitionTrigger};
use events::{FullUpdate, HealthEvent, InstanceView, StateEvent, TradeEvent, WsMessage};
use execution::{Executor, Fill, PaperExecutor, Portfolio, Position};
use futures::future;
use num_traits::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use strategies::{StrategyDefinition, StrategyStore, StrategyValidator};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

struct SessionEntry {
    stop_tx: watch::Sender<bool>,
    view: watch::Receiver<InstanceView>,
    control: LinkControl,
    /// Settles the last published position when the task has to be aborted.
    executor: PaperExecutor,
    trading: JoinHandle<InstanceView>,
    link: JoinHandle<()>,
}

/// Owns every running session.
///
/// Each session is a link task fed by the injected [`FrameSource`] and a
/// [`TradingTask`] consuming its frames. Stops are cooperative and bounded
/// by the configured budget; tasks that miss it are aborted.
pub struct SessionController {
    settings: Arc<Settings>,
    store: Arc<dyn StrategyStore>,
    source: Arc<dyn FrameSource>,
    validator: StrategyValidator,
    events: broadcast::Sender<WsMessage>,
    emergency: watch::Sender<u64>,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionController {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn StrategyStore>,
        source: Arc<dyn FrameSource>,
        events: broadcast::Sender<WsMessage>,
    ) -> Self {
        let validator = StrategyValidator::from_allowlist(&settings.strategies.allowed_indicators);
        let (emergency, _) = watch::channel(0);
        Self {
            settings,
            store,
            source,
            validator,
            events,
            emergency,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn validator(&self) -> &StrategyValidator {
        &self.validator
    }

    pub fn events(&self) -> broadcast::Sender<WsMessage> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsMessage> {
        self.events.subscribe()
    }

    /// Loads and validates `strategy_id`, opens a link for `symbol` and
    /// starts trading. Nothing is created when validation fails.
    pub async fn start(&self, symbol: Symbol, strategy_id: &str) -> Result<SessionId> {
        let raw = self.store.load(strategy_id)?;
        let definition = Arc::new(self.validator.validate(&raw)?);
        self.start_with(symbol, definition).await
    }

    /// Starts a session for an already validated strategy.
    pub async fn start_with(&self, symbol: Symbol, strategy: Arc<StrategyDefinition>) -> Result<SessionId> {
        let simulation = &self.settings.simulation;
        let executor = PaperExecutor::new(simulation)?;
        let cash = Decimal::from_f64(simulation.initial_cash).ok_or(execution::Error::InvalidSetting {
            name: "initial_cash",
            value: simulation.initial_cash,
        })?;

        let session_id = SessionId(Uuid::new_v4().to_string());
        let (stop_tx, shutdown) = Shutdown::channel(self.emergency.subscribe());

        let events = self.events.clone();
        let on_health: HealthHandler = Arc::new(move |event: &HealthEvent| {
            let _ = events.send(WsMessage::ConnectionHealth(event.clone()));
        });
        let link = self
            .source
            .open(LinkRequest {
                connection_id: session_id.0.clone(),
                symbol: symbol.clone(),
                shutdown: shutdown.clone(),
                frame_buffer: self.settings.session.frame_buffer,
                on_health: Some(on_health),
            })
            .await?;

        let now = Utc::now();
        let strategy_id = strategy.id.clone();
        let task = TradingTask::new(
            session_id.clone(),
            symbol.clone(),
            strategy,
            &self.settings.indicators,
            executor.clone(),
            Portfolio::new(cash),
            self.events.clone(),
            now,
        );
        let view = task.subscribe();
        let trading = tokio::spawn(task.run(link.frames, shutdown));

        self.sessions.lock().await.insert(
            session_id.clone(),
            SessionEntry { stop_tx, view, control: link.control, executor, trading, link: link.task },
        );

        tracing::info!(session_id = %session_id, symbol = %symbol, strategy_id = %strategy_id, "Session started.");
        let _ = self.events.send(WsMessage::InstanceAdded(StateEvent {
            session_id: session_id.clone(),
            symbol,
            strategy_id,
            previous_state: None,
            new_state: StrategyState::Idle,
            timestamp: now,
            trigger: None,
        }));
        Ok(session_id)
    }

    /// Stops one session within the stop budget and returns its final view.
    pub async fn stop(&self, session_id: &SessionId) -> Result<InstanceView> {
        let entry = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.0.clone()))?;
        let deadline = Instant::now() + self.settings.session.stop_budget();
        Ok(self.shut_down(session_id, entry, deadline).await)
    }

    /// Emergency stop of every session. All sessions are stopped concurrently
    /// under one budget. Calling it again with nothing running is a no-op.
    pub async fn stop_all(&self) -> Vec<InstanceView> {
        let entries: Vec<(SessionId, SessionEntry)> = self.sessions.lock().await.drain().collect();
        if entries.is_empty() {
            return Vec::new();
        }

        self.emergency.send_modify(|generation| *generation += 1);
        tracing::warn!(sessions = entries.len(), "Emergency stop of all sessions.");

        let deadline = Instant::now() + self.settings.session.stop_budget();
        future::join_all(entries.into_iter().map(|(id, entry)| async move {
            self.shut_down(&id, entry, deadline).await
        }))
        .await
    }

    async fn shut_down(&self, session_id: &SessionId, mut entry: SessionEntry, deadline: Instant) -> InstanceView {
        // The receiver lives in the tasks; a send error only means they are gone.
        let _ = entry.stop_tx.send(true);

        let finished = timeout_at(deadline, &mut entry.trading).await;
        let view = match finished {
            Ok(Ok(view)) => view,
            Ok(Err(e)) => {
                tracing::error!(session_id = %session_id, error = %e, "Trading task failed.");
                self.force_stopped(&mut entry).await
            }
            Err(_) => {
                tracing::error!(session_id = %session_id, "Trading task missed the stop budget. Aborting.");
                entry.trading.abort();
                self.force_stopped(&mut entry).await
            }
        };

        if timeout_at(deadline, &mut entry.link).await.is_err() {
            tracing::warn!(session_id = %session_id, "Link task missed the stop budget. Aborting.");
            entry.link.abort();
        }

        tracing::info!(session_id = %session_id, state = %view.state, "Session stopped.");
        let _ = self.events.send(WsMessage::InstanceRemoved(StateEvent {
            session_id: session_id.clone(),
            symbol: view.symbol.clone(),
            strategy_id: view.strategy_id.clone(),
            previous_state: Some(view.state),
            new_state: view.state,
            timestamp: Utc::now(),
            trigger: None,
        }));
        view
    }

    /// The last published view for a task that never reported back. Any
    /// position it still shows is closed at its last price, then the view
    /// is marked STOPPED.
    async fn force_stopped(&self, entry: &mut SessionEntry) -> InstanceView {
        let mut view = entry.view.borrow().clone();
        let now = Utc::now();

        match close_recorded_position(&mut entry.executor, &view, now).await {
            Ok(Some(fill)) => {
                view.position = None;
                view.realized_pnl += fill.realized_pnl.unwrap_or_default();
                let _ = self.events.send(WsMessage::TradeExecuted(TradeEvent {
                    session_id: view.session_id.clone(),
                    symbol: fill.symbol,
                    side: fill.side,
                    price: fill.price,
                    quantity: fill.quantity,
                    fee: fill.fee,
                    realized_pnl: fill.realized_pnl,
                    timestamp: fill.timestamp,
                }));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(session_id = %view.session_id, error = %e, "Could not close the position of an aborted session.");
            }
        }

        if !view.state.is_terminal() {
            let _ = self.events.send(WsMessage::StateChange(StateEvent {
                session_id: view.session_id.clone(),
                symbol: view.symbol.clone(),
                strategy_id: view.strategy_id.clone(),
                previous_state: Some(view.state),
                new_state: StrategyState::Stopped,
                timestamp: now,
                trigger: Some(TransitionTrigger::ManualStop),
            }));
            view.state = StrategyState::Stopped;
            view.entered_at = now;
        }
        view
    }

    /// Wakes a link out of the Failed state and restarts it with a fresh
    /// retry budget.
    pub async fn reset_connection(&self, session_id: &SessionId) -> Result<LinkState> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.0.clone()))?;
        let state = entry.control.state();
        tracing::info!(session_id = %session_id, link_state = ?state, "Manual connection reset.");
        entry.control.reset();
        Ok(state)
    }

    pub async fn link_state(&self, session_id: &SessionId) -> Option<LinkState> {
        self.sessions.lock().await.get(session_id).map(|entry| entry.control.state())
    }

    /// Views of all running sessions, ordered by symbol.
    pub async fn sessions(&self) -> Vec<InstanceView> {
        let mut views: Vec<InstanceView> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|entry| entry.view.borrow().clone())
            .collect();
        views.sort_by(|a, b| a.symbol.cmp(&b.symbol).then_with(|| a.session_id.cmp(&b.session_id)));
        views
    }

    pub async fn full_update(&self) -> FullUpdate {
        FullUpdate { timestamp: Utc::now(), instances: self.sessions().await }
    }
}

/// Books the close of the position recorded in `view` at the view's last
/// price. `Ok(None)` means there was nothing to close.
async fn close_recorded_position(
    executor: &mut PaperExecutor,
    view: &InstanceView,
    now: chrono::DateTime<Utc>,
) -> execution::Result<Option<Fill>> {
    let Some(position) = &view.position else {
        return Ok(None);
    };
    let price = view
        .last_price
        .ok_or_else(|| execution::Error::ExecutionFailed { reason: "no known price".to_string() })?;

    let mut portfolio = Portfolio::new(Decimal::ZERO);
    portfolio.open_positions.insert(
        view.symbol.clone(),
        Position {
            symbol: view.symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            entry_fee: position.entry_fee,
            opened_at: position.opened_at,
        },
    );
    let order = executor.exit_order(&portfolio, &view.symbol)?;
    executor.execute(&order, price, now, &mut portfolio).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_client::LinkHandle;
    use async_trait::async_trait;
    use core_types::{MarketFrame, Side, Trade};
    use events::PositionView;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use strategies::{MemoryStrategyStore, RawStrategy};
    use tokio::sync::mpsc;

    const LADDER: &str = r#"{
        "id": "ladder",
        "s1_signal":      {"logic": "AND", "conditions": [{"kind": "threshold", "indicator": "price", "operator": ">", "value": 100.0}]},
        "o1_cancel":      {"logic": "OR",  "conditions": [{"kind": "threshold", "indicator": "price", "operator": "<", "value": 90.0}]},
        "z1_entry":       {"logic": "AND", "conditions": [{"kind": "threshold", "indicator": "price", "operator": ">", "value": 101.0}]},
        "ze1_close":      {"logic": "AND", "conditions": [{"kind": "threshold", "indicator": "price", "operator": ">", "value": 110.0}]},
        "emergency_exit": {"logic": "OR",  "conditions": [{"kind": "threshold", "indicator": "price", "operator": "<", "value": 95.0}]}
    }"#;

    fn trade(price: Decimal) -> MarketFrame {
        MarketFrame::Trade(Trade {
            symbol: Symbol::new("BTCUSDT"),
            price,
            quantity: dec!(1),
            timestamp: Utc::now(),
            is_buyer_maker: false,
        })
    }

    /// Plays a fixed list of frames, then either idles or keeps the
    /// consumer busy with an endless stream until shut down.
    struct ScriptedFrameSource {
        frames: Vec<MarketFrame>,
        endless: bool,
    }

    #[async_trait]
    impl FrameSource for ScriptedFrameSource {
        async fn open(&self, request: LinkRequest) -> api_client::Result<LinkHandle> {
            let (tx, rx) = mpsc::channel(request.frame_buffer);
            let (control, signals) = LinkControl::pair();
            let frames = self.frames.clone();
            let endless = self.endless;
            let mut shutdown = request.shutdown;

            let task = tokio::spawn(async move {
                let _ = signals.state.send(LinkState::Connected);
                for frame in frames {
                    tokio::select! {
                        _ = shutdown.triggered() => return,
                        sent = tx.send(frame) => if sent.is_err() { return },
                    }
                }
                let mut tick = 0u32;
                while endless {
                    let price = Decimal::from(100 + tick % 5);
                    tick += 1;
                    tokio::select! {
                        _ = shutdown.triggered() => return,
                        sent = tx.send(trade(price)) => if sent.is_err() { return },
                    }
                }
                shutdown.triggered().await;
            });
            Ok(LinkHandle { frames: rx, control, task })
        }
    }

    fn settings() -> Arc<Settings> {
        let mut settings = app_config::parse_settings(
            r#"
            [app]
            environment = "test"
            log_level = "debug"

            [server]
            host = "127.0.0.1"
            port = 0
            "#,
        )
        .unwrap();
        settings.simulation.taker_fee = 0.0;
        settings.simulation.slippage_percent = 0.0;
        Arc::new(settings)
    }

    fn controller(frames: Vec<MarketFrame>, endless: bool) -> SessionController {
        let store = MemoryStrategyStore::new();
        store.insert(RawStrategy::from_json(LADDER).unwrap());
        store.insert(RawStrategy { id: "broken".into(), ..Default::default() });
        let (events, _) = broadcast::channel(1024);
        SessionController::new(settings(), Arc::new(store), Arc::new(ScriptedFrameSource { frames, endless }), events)
    }

    async fn wait_for_state(controller: &SessionController, state: StrategyState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if controller.sessions().await.iter().any(|v| v.state == state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn invalid_strategy_creates_nothing() {
        let controller = controller(Vec::new(), false);
        let mut events = controller.subscribe();

        let result = controller.start(Symbol::new("BTCUSDT"), "broken").await;
        assert!(matches!(result, Err(Error::Strategy(strategies::Error::Validation(_)))));
        let result = controller.start(Symbol::new("BTCUSDT"), "missing").await;
        assert!(matches!(result, Err(Error::Strategy(strategies::Error::NotFound(_)))));

        assert!(controller.sessions().await.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_closes_the_position_at_the_last_price() {
        let frames = [dec!(99), dec!(100.5), dec!(102), dec!(103)].into_iter().map(trade).collect();
        let controller = controller(frames, false);
        let mut events = controller.subscribe();

        let id = controller.start(Symbol::new("btcusdt"), "ladder").await.unwrap();
        wait_for_state(&controller, StrategyState::PositionMonitoring).await;

        let view = controller.stop(&id).await.unwrap();
        assert_eq!(view.state, StrategyState::Stopped);
        assert!(view.position.is_none());
        assert_eq!(view.last_price, Some(dec!(103)));
        // 100 notional bought at 102, sold at 103.
        assert!(view.realized_pnl > Decimal::ZERO);
        assert!(controller.sessions().await.is_empty());

        let mut kinds = Vec::new();
        while let Ok(message) = events.try_recv() {
            kinds.push(message);
        }
        assert!(matches!(kinds.first(), Some(WsMessage::InstanceAdded(_))));
        assert!(matches!(kinds.last(), Some(WsMessage::InstanceRemoved(_))));
        assert!(kinds.iter().any(|m| matches!(
            m,
            WsMessage::StateChange(e) if e.new_state == StrategyState::Stopped
                && e.trigger == Some(TransitionTrigger::ManualStop)
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_session_still_closes_its_position() {
        let controller = controller(Vec::new(), false);
        let mut events = controller.subscribe();
        let session_id = SessionId("stuck".into());

        let (_view_tx, view) = watch::channel(InstanceView {
            session_id: session_id.clone(),
            symbol: Symbol::new("BTCUSDT"),
            strategy_id: "ladder".into(),
            state: StrategyState::PositionMonitoring,
            entered_at: Utc::now(),
            transitions: 4,
            last_price: Some(dec!(110)),
            position: Some(PositionView {
                side: Side::Long,
                quantity: dec!(1),
                entry_price: dec!(100),
                entry_fee: Decimal::ZERO,
                opened_at: Utc::now(),
            }),
            realized_pnl: Decimal::ZERO,
        });
        let (stop_tx, _) = watch::channel(false);
        let (control, _signals) = LinkControl::pair();
        let entry = SessionEntry {
            stop_tx,
            view,
            control,
            executor: PaperExecutor::new(&controller.settings.simulation).unwrap(),
            trading: tokio::spawn(std::future::pending::<InstanceView>()),
            link: tokio::spawn(async {}),
        };
        controller.sessions.lock().await.insert(session_id.clone(), entry);

        let view = controller.stop(&session_id).await.unwrap();
        assert_eq!(view.state, StrategyState::Stopped);
        assert!(view.position.is_none());
        assert_eq!(view.realized_pnl, dec!(10));

        let mut messages = Vec::new();
        while let Ok(message) = events.try_recv() {
            messages.push(message);
        }
        let trade = messages.iter().position(|m| {
            matches!(m, WsMessage::TradeExecuted(t) if t.price == dec!(110) && t.realized_pnl == Some(dec!(10)))
        });
        let stopped = messages.iter().position(|m| {
            matches!(m, WsMessage::StateChange(e) if e.new_state == StrategyState::Stopped)
        });
        assert!(trade.unwrap() < stopped.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_all_finishes_within_budget() {
        let controller = controller(Vec::new(), true);
        for _ in 0..8 {
            controller.start(Symbol::new("BTCUSDT"), "ladder").await.unwrap();
        }
        assert_eq!(controller.sessions().await.len(), 8);

        let started = std::time::Instant::now();
        let views = controller.stop_all().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(views.len(), 8);
        assert!(views.iter().all(|v| v.state.is_terminal()));
        assert!(controller.sessions().await.is_empty());

        // Idempotent.
        assert!(controller.stop_all().await.is_empty());
    }

    #[tokio::test]
    async fn sessions_started_after_an_emergency_keep_running() {
        let controller = controller(Vec::new(), false);
        controller.start(Symbol::new("BTCUSDT"), "ladder").await.unwrap();
        controller.stop_all().await;

        let id = controller.start(Symbol::new("ETHUSDT"), "ladder").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let views = controller.sessions().await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].state, StrategyState::Idle);
        assert_eq!(controller.link_state(&id).await, Some(LinkState::Connected));
    }

    #[tokio::test]
    async fn unknown_sessions_are_reported() {
        let controller = controller(Vec::new(), false);
        let missing = SessionId("nope".into());
        assert!(matches!(controller.stop(&missing).await, Err(Error::SessionNotFound(_))));
        assert!(matches!(controller.reset_connection(&missing).await, Err(Error::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn full_update_lists_running_instances() {
        let controller = controller(Vec::new(), false);
        controller.start(Symbol::new("ETHUSDT"), "ladder").await.unwrap();
        controller.start(Symbol::new("BTCUSDT"), "ladder").await.unwrap();

        let update = controller.full_update().await;
        let symbols: Vec<&str> = update.instances.iter().map(|v| v.symbol.0.as_str()).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert!(update.instances.iter().all(|v| v.strategy_id == "ladder"));
    }
}
