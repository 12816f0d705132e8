use crate::Result;
use crate::health::{HealthHandler, LinkState};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use core_types::{MarketFrame, Symbol};
use std::sync::Arc;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

/// Everything a source needs to open one symbol's link.
pub struct LinkRequest {
    pub connection_id: String,
    pub symbol: Symbol,
    pub shutdown: Shutdown,
    /// Capacity of the frame queue towards the trading task.
    pub frame_buffer: usize,
    pub on_health: Option<HealthHandler>,
}

/// The consumer's side of an open link.
pub struct LinkHandle {
    pub frames: mpsc::Receiver<MarketFrame>,
    pub control: LinkControl,
    pub task: JoinHandle<()>,
}

/// Lets the owner of a link observe its state and request a manual reset.
#[derive(Debug, Clone)]
pub struct LinkControl {
    reset: Arc<Notify>,
    state: watch::Receiver<LinkState>,
}

/// The link task's side of [`LinkControl`].
#[derive(Debug)]
pub struct LinkSignals {
    pub reset: Arc<Notify>,
    pub state: watch::Sender<LinkState>,
}

impl LinkControl {
    pub fn pair() -> (LinkControl, LinkSignals) {
        let reset = Arc::new(Notify::new());
        let (state_tx, state_rx) = watch::channel(LinkState::Reconnecting);
        (
            LinkControl { reset: reset.clone(), state: state_rx },
            LinkSignals { reset, state: state_tx },
        )
    }

    /// Requests a fresh connection attempt with a cleared retry budget.
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }
}

/// Opens market-data links. The live implementation is [`crate::LiveConnector`];
/// tests substitute scripted sources.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn open(&self, request: LinkRequest) -> Result<LinkHandle>;
}
