use api_client::LinkState;
use core_types::SessionId;
use events::InstanceView;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub symbol: String,
    pub strategy_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: SessionId,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub session_id: SessionId,
    /// The link state observed just before the reset was requested.
    pub previous_link_state: &'static str,
}

pub fn link_state_name(state: LinkState) -> &'static str {
    match state {
        LinkState::Connected => "connected",
        LinkState::Checking => "checking",
        LinkState::Reconnecting => "reconnecting",
        LinkState::Failed => "failed",
    }
}

#[derive(Debug, Serialize)]
pub struct EmergencyStopResponse {
    pub stopped: usize,
    pub instances: Vec<InstanceView>,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub strategy_id: String,
    pub fingerprint: String,
    /// Ids of the sections that hold at least one condition.
    pub sections: Vec<&'static str>,
}
