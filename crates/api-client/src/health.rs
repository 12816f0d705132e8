//! Connection health tracking for a single exchange link.
//!
//! [`ConnectionHealthMonitor`] is a plain state machine: the link task feeds
//! it pongs, data activity and periodic `check` calls, and acts on the
//! returned [`HealthAction`]s. It never touches the socket itself, which keeps
//! every escalation path testable with synthetic instants.

use crate::backoff::ExponentialBackoff;
use app_config::{ActivitySettings, BackoffSettings, HealthSettings};
use chrono::Utc;
use core_types::Symbol;
use events::{HealthEvent, HealthEventKind, Severity};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub type HealthHandler = Arc<dyn Fn(&HealthEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Connected,
    /// Pongs are overdue; waiting for one before escalating.
    Checking,
    Reconnecting,
    /// Reconnect attempts are exhausted. Nothing happens until `reset`.
    Failed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Checking => "checking",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected | Self::Checking)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub endpoint: String,
    pub symbol: Symbol,
    pub state: LinkState,
    pub last_pong_at: Instant,
    pub last_activity_at: Instant,
    pub consecutive_timeouts: u32,
    pub reconnect_attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub warn_after: Duration,
    pub reconnect_after: Duration,
    pub max_missed_pongs: u32,
    pub check_window: Duration,
    /// Data silence tolerated before a subscription-refresh probe is sent.
    pub activity_timeout: Duration,
    pub probe_grace: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from_settings(
            &HealthSettings::default(),
            &ActivitySettings::default(),
            &Symbol::new(""),
        )
    }
}

impl HealthThresholds {
    pub fn from_settings(health: &HealthSettings, activity: &ActivitySettings, symbol: &Symbol) -> Self {
        Self {
            warn_after: health.warn_after(),
            reconnect_after: health.reconnect_after(),
            max_missed_pongs: health.max_missed_pongs.max(1),
            check_window: health.check_window(),
            activity_timeout: activity.threshold(activity.tier_for(symbol)),
            probe_grace: activity.probe_grace(),
        }
    }
}

/// What the link task must do after a `check`.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAction {
    /// Re-send the subscription to provoke data on a quiet stream.
    SendProbe,
    /// Drop the socket and go through the reconnect schedule.
    Reconnect(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectPlan {
    Retry { attempt: u32, delay: Duration },
    Exhausted,
}

pub struct ConnectionHealthMonitor {
    connection: Connection,
    thresholds: HealthThresholds,
    backoff: ExponentialBackoff,
    window_started_at: Option<Instant>,
    probe_sent_at: Option<Instant>,
    handlers: Vec<HealthHandler>,
}

impl fmt::Debug for ConnectionHealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHealthMonitor")
            .field("connection", &self.connection)
            .field("thresholds", &self.thresholds)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl ConnectionHealthMonitor {
    /// A new monitor starts in `Reconnecting` until the first connection succeeds.
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        symbol: Symbol,
        thresholds: HealthThresholds,
        backoff: ExponentialBackoff,
        now: Instant,
    ) -> Self {
        Self {
            connection: Connection {
                id: id.into(),
                endpoint: endpoint.into(),
                symbol,
                state: LinkState::Reconnecting,
                last_pong_at: now,
                last_activity_at: now,
                consecutive_timeouts: 0,
                reconnect_attempt: 0,
            },
            thresholds,
            backoff,
            window_started_at: None,
            probe_sent_at: None,
            handlers: Vec::new(),
        }
    }

    pub fn from_settings(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        symbol: Symbol,
        health: &HealthSettings,
        activity: &ActivitySettings,
        backoff: &BackoffSettings,
        now: Instant,
    ) -> Self {
        let thresholds = HealthThresholds::from_settings(health, activity, &symbol);
        Self::new(id, endpoint, symbol, thresholds, ExponentialBackoff::from_settings(backoff), now)
    }

    /// Registers a handler called synchronously for every emitted event.
    pub fn on_event(&mut self, handler: impl Fn(&HealthEvent) + Send + Sync + 'static) {
        self.handlers.push(Arc::new(handler));
    }

    pub fn add_handler(&mut self, handler: HealthHandler) {
        self.handlers.push(handler);
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> LinkState {
        self.connection.state
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    pub fn on_pong(&mut self, now: Instant) {
        self.connection.last_pong_at = now;
        if !self.connection.state.is_live() {
            return;
        }
        self.window_started_at = None;
        let recovered = self.connection.state == LinkState::Checking;
        self.connection.state = LinkState::Connected;
        if recovered {
            self.emit(HealthEventKind::PongRecovered, Severity::Info, None);
        }
        self.connection.consecutive_timeouts = 0;
    }

    /// Any data frame counts as activity and cancels an outstanding probe.
    pub fn on_activity(&mut self, now: Instant) {
        self.connection.last_activity_at = now;
        self.probe_sent_at = None;
    }

    /// Runs the periodic health check.
    pub fn check(&mut self, now: Instant) -> Vec<HealthAction> {
        if !self.connection.state.is_live() {
            return Vec::new();
        }

        let pong_age = now.saturating_duration_since(self.connection.last_pong_at);

        if self.connection.state == LinkState::Connected && pong_age > self.thresholds.warn_after {
            self.connection.state = LinkState::Checking;
            self.connection.consecutive_timeouts += 1;
            self.window_started_at = Some(now);
            self.emit(
                HealthEventKind::PongTimeoutWarning,
                Severity::Warning,
                Some(format!("no pong for {}s", pong_age.as_secs())),
            );
        } else if self.connection.state == LinkState::Checking {
            let window_started = *self.window_started_at.get_or_insert(now);
            if pong_age <= self.thresholds.reconnect_after
                && now.saturating_duration_since(window_started) >= self.thresholds.check_window
            {
                self.connection.consecutive_timeouts += 1;
                self.window_started_at = Some(now);
                if self.connection.consecutive_timeouts >= self.thresholds.max_missed_pongs {
                    let reason = format!("{} missed pong windows", self.connection.consecutive_timeouts);
                    return vec![self.escalate(reason, false)];
                }
            }
        }

        if self.connection.state == LinkState::Checking && pong_age > self.thresholds.reconnect_after {
            let reason = format!("no pong for {}s", pong_age.as_secs());
            return vec![self.escalate(reason, true)];
        }

        self.check_activity(now).into_iter().collect()
    }

    fn check_activity(&mut self, now: Instant) -> Option<HealthAction> {
        if let Some(sent) = self.probe_sent_at {
            if now.saturating_duration_since(sent) >= self.thresholds.probe_grace {
                self.probe_sent_at = None;
                self.connection.state = LinkState::Reconnecting;
                let reason = format!("no data within {}s of the probe", self.thresholds.probe_grace.as_secs());
                self.emit(HealthEventKind::ActivityTimeout, Severity::Warning, Some(reason.clone()));
                return Some(HealthAction::Reconnect(reason));
            }
            return None;
        }

        let silence = now.saturating_duration_since(self.connection.last_activity_at);
        if silence > self.thresholds.activity_timeout {
            self.probe_sent_at = Some(now);
            self.emit(
                HealthEventKind::ActivityProbe,
                Severity::Info,
                Some(format!("no data for {}s", silence.as_secs())),
            );
            return Some(HealthAction::SendProbe);
        }
        None
    }

    fn escalate(&mut self, reason: String, count: bool) -> HealthAction {
        if count {
            self.connection.consecutive_timeouts += 1;
        }
        self.connection.state = LinkState::Reconnecting;
        self.window_started_at = None;
        self.probe_sent_at = None;
        self.emit(HealthEventKind::PongTimeoutReconnecting, Severity::Warning, Some(reason.clone()));
        HealthAction::Reconnect(reason)
    }

    /// The socket went away on its own (closed, errored, or dropped by us).
    pub fn on_disconnected(&mut self, reason: &str) {
        if self.connection.state.is_live() {
            tracing::warn!(connection_id = %self.connection.id, symbol = %self.connection.symbol, reason, "Connection lost.");
            self.connection.state = LinkState::Reconnecting;
        }
        self.window_started_at = None;
        self.probe_sent_at = None;
    }

    /// Picks the delay before the next attempt, or gives up. `jitter_sample`
    /// is in `[0, 1]`.
    pub fn schedule_reconnect(&mut self, jitter_sample: f64) -> ReconnectPlan {
        if self.connection.state == LinkState::Failed {
            return ReconnectPlan::Exhausted;
        }
        self.connection.state = LinkState::Reconnecting;
        match self.backoff.next_delay_with(jitter_sample) {
            Some(delay) => {
                self.connection.reconnect_attempt = self.backoff.attempt();
                self.emit(
                    HealthEventKind::ReconnectScheduled,
                    Severity::Warning,
                    Some(format!("retrying in {}ms", delay.as_millis())),
                );
                ReconnectPlan::Retry { attempt: self.connection.reconnect_attempt, delay }
            }
            None => {
                self.connection.state = LinkState::Failed;
                self.emit(
                    HealthEventKind::ConnectionFailed,
                    Severity::Critical,
                    Some(format!("gave up after {} attempts", self.backoff.max_attempts())),
                );
                ReconnectPlan::Exhausted
            }
        }
    }

    pub fn on_connected(&mut self, now: Instant) {
        let was_retrying = self.connection.reconnect_attempt > 0 || self.connection.consecutive_timeouts > 0;
        self.connection.state = LinkState::Connected;
        self.connection.last_pong_at = now;
        self.connection.last_activity_at = now;
        self.window_started_at = None;
        self.probe_sent_at = None;
        self.backoff.reset();
        if was_retrying {
            self.emit(HealthEventKind::Reconnected, Severity::Info, None);
        }
        self.connection.consecutive_timeouts = 0;
        self.connection.reconnect_attempt = 0;
    }

    /// Manual reset; the only way out of `Failed`.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.connection.state = LinkState::Reconnecting;
        self.connection.consecutive_timeouts = 0;
        self.connection.reconnect_attempt = 0;
        self.window_started_at = None;
        self.probe_sent_at = None;
        self.emit(HealthEventKind::ConnectionReset, Severity::Info, Some("manual reset".to_string()));
    }

    fn emit(&self, kind: HealthEventKind, severity: Severity, detail: Option<String>) {
        let event = HealthEvent {
            connection_id: self.connection.id.clone(),
            symbol: self.connection.symbol.clone(),
            kind,
            severity,
            consecutive_timeouts: self.connection.consecutive_timeouts,
            reconnect_attempt: self.connection.reconnect_attempt,
            detail,
            timestamp: Utc::now(),
        };
        match severity {
            Severity::Critical => {
                tracing::error!(connection_id = %event.connection_id, symbol = %event.symbol, kind = ?kind, detail = ?event.detail, "Connection health event.")
            }
            Severity::Warning => {
                tracing::warn!(connection_id = %event.connection_id, symbol = %event.symbol, kind = ?kind, timeouts = event.consecutive_timeouts, detail = ?event.detail, "Connection health event.")
            }
            Severity::Info => {
                tracing::info!(connection_id = %event.connection_id, symbol = %event.symbol, kind = ?kind, "Connection health event.")
            }
        }
        for handler in &self.handlers {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            warn_after: Duration::from_secs(60),
            reconnect_after: Duration::from_secs(120),
            max_missed_pongs: 3,
            check_window: Duration::from_secs(30),
            activity_timeout: Duration::from_secs(120),
            probe_grace: Duration::from_secs(15),
        }
    }

    fn monitor(thresholds: HealthThresholds, max_attempts: u32, t0: Instant) -> (ConnectionHealthMonitor, Arc<Mutex<Vec<HealthEvent>>>) {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.25, max_attempts);
        let mut monitor = ConnectionHealthMonitor::new("c-1", "wss://example", Symbol::new("BTCUSDT"), thresholds, backoff, t0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.on_event(move |e| sink.lock().unwrap().push(e.clone()));
        monitor.on_connected(t0);
        (monitor, seen)
    }

    fn kinds(seen: &Arc<Mutex<Vec<HealthEvent>>>) -> Vec<HealthEventKind> {
        seen.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    #[test]
    fn silent_pongs_for_130s_warn_then_reconnect() {
        let t0 = Instant::now();
        let (mut monitor, seen) = monitor(thresholds(), 10, t0);

        let mut timeouts = vec![monitor.connection().consecutive_timeouts];
        let mut actions = Vec::new();
        for secs in (5..=130).step_by(5) {
            let now = t0 + Duration::from_secs(secs);
            // Data keeps flowing; only the pongs are missing.
            monitor.on_activity(now);
            actions.extend(monitor.check(now));
            let current = monitor.connection().consecutive_timeouts;
            if current != *timeouts.last().unwrap() {
                timeouts.push(current);
            }
        }

        assert_eq!(
            kinds(&seen),
            vec![HealthEventKind::PongTimeoutWarning, HealthEventKind::PongTimeoutReconnecting]
        );
        assert!(timeouts.windows(2).all(|w| w[1] > w[0]), "{:?}", timeouts);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], HealthAction::Reconnect(_)));
        assert_eq!(monitor.state(), LinkState::Reconnecting);

        monitor.on_connected(t0 + Duration::from_secs(131));
        assert_eq!(monitor.connection().consecutive_timeouts, 0);
        assert_eq!(monitor.state(), LinkState::Connected);
        assert_eq!(kinds(&seen).last(), Some(&HealthEventKind::Reconnected));
    }

    #[test]
    fn pong_while_checking_recovers() {
        let t0 = Instant::now();
        let (mut monitor, seen) = monitor(thresholds(), 10, t0);

        monitor.on_activity(t0 + Duration::from_secs(61));
        monitor.check(t0 + Duration::from_secs(61));
        assert_eq!(monitor.state(), LinkState::Checking);
        assert_eq!(monitor.connection().consecutive_timeouts, 1);

        monitor.on_pong(t0 + Duration::from_secs(70));
        assert_eq!(monitor.state(), LinkState::Connected);
        assert_eq!(monitor.connection().consecutive_timeouts, 0);
        assert_eq!(kinds(&seen), vec![HealthEventKind::PongTimeoutWarning, HealthEventKind::PongRecovered]);
    }

    #[test]
    fn missed_windows_escalate_before_the_reconnect_threshold() {
        let t0 = Instant::now();
        let mut t = thresholds();
        t.warn_after = Duration::from_secs(10);
        t.reconnect_after = Duration::from_secs(1000);
        let (mut monitor, _) = monitor(t, 10, t0);

        let mut escalated_at = None;
        for secs in (5..=200).step_by(5) {
            let now = t0 + Duration::from_secs(secs);
            monitor.on_activity(now);
            if !monitor.check(now).is_empty() {
                escalated_at = Some(secs);
                break;
            }
        }
        // Warned at 15s, missed windows at 45s and 75s.
        assert_eq!(escalated_at, Some(75));
        assert_eq!(monitor.connection().consecutive_timeouts, 3);
    }

    #[test]
    fn quiet_stream_is_probed_before_being_dropped() {
        let t0 = Instant::now();
        let (mut monitor, seen) = monitor(thresholds(), 10, t0);

        let probe_at = t0 + Duration::from_secs(121);
        monitor.on_pong(probe_at);
        assert_eq!(monitor.check(probe_at), vec![HealthAction::SendProbe]);

        // Data arrives inside the grace window: nothing happens.
        monitor.on_activity(probe_at + Duration::from_secs(5));
        monitor.on_pong(probe_at + Duration::from_secs(20));
        assert!(monitor.check(probe_at + Duration::from_secs(20)).is_empty());

        // Silent again, and this time the grace window runs out.
        let second = probe_at + Duration::from_secs(5 + 121);
        monitor.on_pong(second);
        assert_eq!(monitor.check(second), vec![HealthAction::SendProbe]);
        let late = second + Duration::from_secs(15);
        monitor.on_pong(late);
        assert!(matches!(monitor.check(late).as_slice(), [HealthAction::Reconnect(_)]));

        assert_eq!(
            kinds(&seen),
            vec![HealthEventKind::ActivityProbe, HealthEventKind::ActivityProbe, HealthEventKind::ActivityTimeout]
        );
    }

    #[test]
    fn exhausted_attempts_fail_until_reset() {
        let t0 = Instant::now();
        let (mut monitor, seen) = monitor(thresholds(), 2, t0);
        monitor.on_disconnected("socket closed");

        assert!(matches!(monitor.schedule_reconnect(0.0), ReconnectPlan::Retry { attempt: 1, .. }));
        assert!(matches!(monitor.schedule_reconnect(0.0), ReconnectPlan::Retry { attempt: 2, .. }));
        assert_eq!(monitor.schedule_reconnect(0.0), ReconnectPlan::Exhausted);
        assert_eq!(monitor.state(), LinkState::Failed);

        let failed = seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(failed.kind, HealthEventKind::ConnectionFailed);
        assert_eq!(failed.severity, Severity::Critical);

        // Failed is sticky.
        assert_eq!(monitor.schedule_reconnect(0.0), ReconnectPlan::Exhausted);
        assert!(monitor.check(t0 + Duration::from_secs(500)).is_empty());

        monitor.reset();
        assert_eq!(monitor.state(), LinkState::Reconnecting);
        assert!(matches!(monitor.schedule_reconnect(0.0), ReconnectPlan::Retry { attempt: 1, .. }));
        assert!(kinds(&seen).contains(&HealthEventKind::ConnectionReset));
    }

    #[test]
    fn thresholds_follow_the_volume_tier() {
        let mut activity = ActivitySettings::default();
        activity.tiers.insert("DOGEUSDT".into(), core_types::VolumeTier::Low);
        let low = HealthThresholds::from_settings(&HealthSettings::default(), &activity, &Symbol::new("dogeusdt"));
        let default = HealthThresholds::from_settings(&HealthSettings::default(), &activity, &Symbol::new("BTCUSDT"));
        assert_eq!(low.activity_timeout, Duration::from_secs(300));
        assert_eq!(default.activity_timeout, Duration::from_secs(120));
    }
}
