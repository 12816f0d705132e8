use crate::health::{ConnectionHealthMonitor, HealthAction, LinkState, ReconnectPlan};
use crate::router::{MessageRouter, RoutedFrame};
use crate::shutdown::Shutdown;
use crate::source::{FrameSource, LinkControl, LinkHandle, LinkRequest, LinkSignals};
use crate::types::SubscribeRequest;
use crate::{Error, Result};
use app_config::{ActivitySettings, BackoffSettings, ExchangeSettings, HealthSettings, Settings};
use async_trait::async_trait;
use chrono::Utc;
use core_types::{MarketFrame, Symbol};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A connector for receiving live trade and depth streams from Binance.
#[derive(Debug, Clone)]
pub struct LiveConnector {
    exchange: ExchangeSettings,
    health: HealthSettings,
    activity: ActivitySettings,
    backoff: BackoffSettings,
}

impl LiveConnector {
    pub fn new(settings: &Settings) -> Self {
        Self {
            exchange: settings.exchange.clone(),
            health: settings.health.clone(),
            activity: settings.activity.clone(),
            backoff: settings.backoff.clone(),
        }
    }

    pub fn stream_names(&self, symbol: &Symbol) -> Vec<String> {
        let name = symbol.stream_name();
        vec![
            format!("{}@aggTrade", name),
            format!("{}@{}", name, self.exchange.depth_stream),
        ]
    }

    pub fn stream_url(&self, symbol: &Symbol) -> String {
        format!(
            "{}/stream?streams={}",
            self.exchange.ws_base_url.trim_end_matches('/'),
            self.stream_names(symbol).join("/")
        )
    }
}

#[async_trait]
impl FrameSource for LiveConnector {
    async fn open(&self, request: LinkRequest) -> Result<LinkHandle> {
        let url = self.stream_url(&request.symbol);
        let mut monitor = ConnectionHealthMonitor::from_settings(
            request.connection_id.clone(),
            url.clone(),
            request.symbol.clone(),
            &self.health,
            &self.activity,
            &self.backoff,
            Instant::now(),
        );
        if let Some(handler) = request.on_health {
            monitor.add_handler(handler);
        }

        let (frames_tx, frames_rx) = mpsc::channel(request.frame_buffer.max(1));
        let (control, signals) = LinkControl::pair();
        let ctx = LinkContext {
            streams: self.stream_names(&request.symbol),
            router: MessageRouter::for_symbol(request.symbol.clone()),
            symbol: request.symbol,
            url,
            connect_timeout: self.exchange.connect_timeout(),
            ping_interval: self.exchange.ping_interval(),
            check_interval: self.health.check_interval(),
            monitor,
            frames: frames_tx,
            shutdown: request.shutdown,
            signals,
            next_request_id: 1,
        };

        let task = tokio::spawn(run_link(ctx));
        Ok(LinkHandle { frames: frames_rx, control, task })
    }
}

struct LinkContext {
    symbol: Symbol,
    url: String,
    streams: Vec<String>,
    connect_timeout: Duration,
    ping_interval: Duration,
    check_interval: Duration,
    monitor: ConnectionHealthMonitor,
    router: MessageRouter,
    frames: mpsc::Sender<MarketFrame>,
    shutdown: Shutdown,
    signals: LinkSignals,
    next_request_id: u64,
}

impl LinkContext {
    fn publish_state(&self) {
        self.signals.state.send_replace(self.monitor.state());
    }
}

enum ConnectResult {
    Connected(Box<WsStream>),
    Shutdown,
    Error(Error),
}

async fn connect(url: &str, timeout: Duration, shutdown: &mut Shutdown) -> ConnectResult {
    tokio::select! {
        biased;

        _ = shutdown.triggered() => ConnectResult::Shutdown,

        result = tokio::time::timeout(timeout, connect_async(url)) => match result {
            Ok(Ok((stream, _))) => ConnectResult::Connected(Box::new(stream)),
            Ok(Err(e)) => ConnectResult::Error(Error::WebSocket(e)),
            Err(_) => ConnectResult::Error(Error::ConnectTimeout(timeout)),
        },
    }
}

/// How a connected session ended.
enum SessionEnd {
    Shutdown,
    Reset,
    Closed(Error),
}

/// Owns the socket for one symbol until shutdown: connect, stream, check
/// health, back off, and park in `Failed` until a manual reset.
async fn run_link(mut ctx: LinkContext) {
    tracing::info!(symbol = %ctx.symbol, url = %ctx.url, "Link task started.");

    loop {
        if ctx.shutdown.is_triggered() {
            break;
        }
        ctx.publish_state();

        if ctx.monitor.state() == LinkState::Failed {
            tracing::error!(symbol = %ctx.symbol, "Link failed permanently; waiting for a manual reset.");
            tokio::select! {
                biased;
                _ = ctx.shutdown.triggered() => break,
                _ = ctx.signals.reset.notified() => {
                    ctx.monitor.reset();
                    continue;
                }
            }
        }

        tracing::info!(symbol = %ctx.symbol, attempt = ctx.monitor.connection().reconnect_attempt, "Connecting to WebSocket stream...");
        let error = match connect(&ctx.url, ctx.connect_timeout, &mut ctx.shutdown).await {
            ConnectResult::Shutdown => break,
            ConnectResult::Connected(ws) => {
                tracing::info!(symbol = %ctx.symbol, "WebSocket connection successful.");
                ctx.monitor.on_connected(Instant::now());
                ctx.publish_state();
                match run_session(&mut ctx, *ws).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Reset => {
                        ctx.monitor.reset();
                        continue;
                    }
                    SessionEnd::Closed(e) => e,
                }
            }
            ConnectResult::Error(e) => e,
        };

        tracing::warn!(symbol = %ctx.symbol, error = %error, transient = error.is_transient(), "WebSocket link dropped.");
        ctx.monitor.on_disconnected(&error.to_string());

        let sample = rand::thread_rng().gen_range(0.0..=1.0);
        match ctx.monitor.schedule_reconnect(sample) {
            ReconnectPlan::Retry { attempt, delay } => {
                tracing::info!(symbol = %ctx.symbol, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting after backoff.");
                ctx.publish_state();
                tokio::select! {
                    biased;
                    _ = ctx.shutdown.triggered() => break,
                    _ = ctx.signals.reset.notified() => ctx.monitor.reset(),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            ReconnectPlan::Exhausted => {
                let error = Error::ReconnectExhausted { attempts: ctx.monitor.connection().reconnect_attempt };
                tracing::error!(symbol = %ctx.symbol, error = %error, "Giving up on the link.");
            }
        }
    }

    ctx.publish_state();
    tracing::info!(symbol = %ctx.symbol, "Link task stopped.");
}

async fn run_session(ctx: &mut LinkContext, ws: WsStream) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    let mut ping = tokio::time::interval_at(Instant::now() + ctx.ping_interval, ctx.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut check = tokio::time::interval_at(Instant::now() + ctx.check_interval, ctx.check_interval);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = ctx.shutdown.triggered() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }

            _ = ctx.signals.reset.notified() => {
                tracing::info!(symbol = %ctx.symbol, "Manual reset requested; reconnecting.");
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Reset;
            }

            message = read.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return SessionEnd::Closed(Error::WebSocket(e)),
                    None => return SessionEnd::Closed(Error::LinkClosed),
                };
                let now = Instant::now();
                let frame = match ctx.router.route(&message, Utc::now()) {
                    RoutedFrame::Trade(trade) => MarketFrame::Trade(trade),
                    RoutedFrame::OrderBook(book) => MarketFrame::OrderBook(book),
                    RoutedFrame::Ping(payload) => {
                        if let Err(e) = write.send(Message::Pong(payload.into())).await {
                            return SessionEnd::Closed(Error::WebSocket(e));
                        }
                        continue;
                    }
                    RoutedFrame::Pong => {
                        ctx.monitor.on_pong(now);
                        ctx.publish_state();
                        continue;
                    }
                    RoutedFrame::Close(reason) => {
                        return SessionEnd::Closed(Error::Stale(reason.unwrap_or_else(|| "closed by server".to_string())));
                    }
                    RoutedFrame::StateEvent { .. } | RoutedFrame::Other(_) => continue,
                };
                ctx.monitor.on_activity(now);
                if ctx.frames.send(frame).await.is_err() {
                    // The trading task is gone; nobody wants this link anymore.
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }

            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                    return SessionEnd::Closed(Error::WebSocket(e));
                }
            }

            _ = check.tick() => {
                let actions = ctx.monitor.check(Instant::now());
                ctx.publish_state();
                for action in actions {
                    match action {
                        HealthAction::SendProbe => {
                            let request = SubscribeRequest::new(ctx.streams.clone(), ctx.next_request_id);
                            ctx.next_request_id += 1;
                            let text = match serde_json::to_string(&request) {
                                Ok(text) => text,
                                Err(e) => return SessionEnd::Closed(Error::DeserializationFailed(e)),
                            };
                            tracing::debug!(symbol = %ctx.symbol, "Sending subscription-refresh probe.");
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                return SessionEnd::Closed(Error::WebSocket(e));
                            }
                        }
                        HealthAction::Reconnect(reason) => {
                            let _ = write.send(Message::Close(None)).await;
                            return SessionEnd::Closed(Error::Stale(reason));
                        }
                    }
                }
            }
        }
    }
}
