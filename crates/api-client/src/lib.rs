//! Exchange connectivity: the live WebSocket link, frame classification and
//! the health monitor that keeps a link alive under partial failure.

pub mod backoff;
pub mod error;
pub mod health;
pub mod live_connector;
pub mod router;
pub mod shutdown;
pub mod source;
pub mod types;

// Re-export public types
pub use backoff::ExponentialBackoff;
pub use error::{Error, Result};
pub use health::{
    Connection, ConnectionHealthMonitor, HealthAction, HealthHandler, HealthThresholds, LinkState,
    ReconnectPlan,
};
pub use live_connector::LiveConnector;
pub use router::{FrameClass, MessageRouter, RoutedFrame, StateEventHandler};
pub use shutdown::Shutdown;
pub use source::{FrameSource, LinkControl, LinkHandle, LinkRequest, LinkSignals};
