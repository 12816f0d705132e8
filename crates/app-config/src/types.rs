use core_types::{Symbol, VolumeTier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    /// The application's general settings.
    pub app: AppSettings,
    /// Where and how to reach the exchange WebSocket.
    #[serde(default)]
    pub exchange: ExchangeSettings,
    /// Pong-age thresholds for the connection health monitor.
    #[serde(default)]
    pub health: HealthSettings,
    /// Reconnect backoff policy.
    #[serde(default)]
    pub backoff: BackoffSettings,
    /// Data-frame silence thresholds per liquidity tier.
    #[serde(default)]
    pub activity: ActivitySettings,
    #[serde(default)]
    pub indicators: IndicatorSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
    pub server: ServerSettings,
    #[serde(default)]
    pub strategies: StrategySettings,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppSettings {
    /// The environment the application is running in (e.g., "development", "production").
    pub environment: String,
    /// The log level for the application.
    pub log_level: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ExchangeSettings {
    /// The WebSocket base URL, without a trailing slash.
    pub ws_base_url: String,
    /// Depth stream suffix appended to each symbol's order-book stream.
    pub depth_stream: String,
    pub connect_timeout_secs: u64,
    /// How often a keep-alive ping is sent on an otherwise healthy link.
    pub ping_interval_secs: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            ws_base_url: "wss://fstream.binance.com".to_string(),
            depth_stream: "depth10@100ms".to_string(),
            connect_timeout_secs: 10,
            ping_interval_secs: 20,
        }
    }
}

impl ExchangeSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct HealthSettings {
    /// Pong age after which the link moves to `Checking`.
    pub warn_after_secs: u64,
    /// Pong age after which a reconnect is forced.
    pub reconnect_after_secs: u64,
    /// Consecutive missed health-check windows that force a reconnect.
    pub max_missed_pongs: u32,
    /// How long a health-check ping may stay unanswered before it counts as missed.
    pub check_window_secs: u64,
    /// Period of the health check loop.
    pub check_interval_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            warn_after_secs: 60,
            reconnect_after_secs: 120,
            max_missed_pongs: 3,
            check_window_secs: 30,
            check_interval_secs: 5,
        }
    }
}

impl HealthSettings {
    pub fn warn_after(&self) -> Duration {
        Duration::from_secs(self.warn_after_secs)
    }

    pub fn reconnect_after(&self) -> Duration {
        Duration::from_secs(self.reconnect_after_secs)
    }

    pub fn check_window(&self) -> Duration {
        Duration::from_secs(self.check_window_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the capped delay.
    pub jitter: f64,
    /// Reconnect attempts before the link is declared failed.
    pub max_attempts: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            jitter: 0.25,
            max_attempts: 10,
        }
    }
}

impl BackoffSettings {
    /// Jitter may add at most a quarter of the capped delay.
    pub const MAX_JITTER: f64 = 0.25;

    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ActivitySettings {
    pub high_secs: u64,
    pub medium_secs: u64,
    pub low_secs: u64,
    /// How long to wait for data after a subscription-refresh probe.
    pub probe_grace_secs: u64,
    pub default_tier: VolumeTier,
    /// Per-symbol tier overrides, keyed by upper-case symbol.
    pub tiers: HashMap<String, VolumeTier>,
}

impl Default for ActivitySettings {
    fn default() -> Self {
        Self {
            high_secs: 60,
            medium_secs: 120,
            low_secs: 300,
            probe_grace_secs: 15,
            default_tier: VolumeTier::Medium,
            tiers: HashMap::new(),
        }
    }
}

impl ActivitySettings {
    pub fn tier_for(&self, symbol: &Symbol) -> VolumeTier {
        self.tiers
            .get(&symbol.0)
            .copied()
            .unwrap_or(self.default_tier)
    }

    pub fn threshold(&self, tier: VolumeTier) -> Duration {
        let secs = match tier {
            VolumeTier::High => self.high_secs,
            VolumeTier::Medium => self.medium_secs,
            VolumeTier::Low => self.low_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn probe_grace(&self) -> Duration {
        Duration::from_secs(self.probe_grace_secs)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct IndicatorSettings {
    /// Window for pump magnitude, velocity and trade rate.
    pub short_window_secs: u64,
    /// Window the volume surge ratio compares against.
    pub baseline_window_secs: u64,
    /// Order-book levels used for the bid/ask imbalance.
    pub book_depth: usize,
}

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self {
            short_window_secs: 60,
            baseline_window_secs: 600,
            book_depth: 10,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct SessionSettings {
    /// Upper bound for `stop` and `stop_all`, end-to-end.
    pub stop_budget_ms: u64,
    /// Capacity of the per-session frame queue.
    pub frame_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            stop_budget_ms: 1_000,
            frame_buffer: 1_024,
        }
    }
}

impl SessionSettings {
    pub fn stop_budget(&self) -> Duration {
        Duration::from_millis(self.stop_budget_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct SimulationSettings {
    /// The taker fee for the exchange (e.g., 0.0004 for 0.04%).
    pub taker_fee: f64,
    /// The simulated slippage percentage for market orders (e.g., 0.0005 for 0.05%).
    pub slippage_percent: f64,
    /// Quote-currency notional of every simulated entry.
    pub position_notional: f64,
    pub initial_cash: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            taker_fee: 0.0004,
            slippage_percent: 0.0005,
            position_notional: 100.0,
            initial_cash: 10_000.0,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct StrategySettings {
    /// Directory holding `<id>.json` / `<id>.toml` strategy files.
    pub dir: String,
    /// Indicator allowlist. Empty means the engine's built-in indicators.
    pub allowed_indicators: Vec<String>,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            dir: "strategies".to_string(),
            allowed_indicators: Vec::new(),
        }
    }
}
