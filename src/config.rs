use serde::Deserialize;
use std::time::Duration;

use crate::calls::CallProtocol;

/// Tunables for a call. All fields have working defaults.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Delay before a busy, hanging-up or abandoned call is forced to `Ended`.
    pub hangup_timeout_ms: u64,
    pub min_layer: i32,
    pub max_layer: i32,
    pub udp_p2p: bool,
    pub udp_reflector: bool,
    pub media: MediaConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            hangup_timeout_ms: 5000,
            min_layer: 65,
            max_layer: 65,
            udp_p2p: true,
            udp_reflector: true,
            media: MediaConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn hangup_timeout(&self) -> Duration {
        Duration::from_millis(self.hangup_timeout_ms)
    }

    /// Protocol descriptor advertised in create and confirm requests.
    pub fn protocol(&self) -> CallProtocol {
        CallProtocol {
            udp_p2p: self.udp_p2p,
            udp_reflector: self.udp_reflector,
            min_layer: self.min_layer,
            max_layer: self.max_layer,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSaving {
    #[default]
    Never,
    Mobile,
    Always,
}

/// Media engine settings passed through on session creation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub data_saving: DataSaving,
    pub enable_aec: bool,
    pub enable_ns: bool,
    pub enable_agc: bool,
    pub init_timeout_secs: u32,
    pub recv_timeout_secs: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            data_saving: DataSaving::Never,
            enable_aec: true,
            enable_ns: true,
            enable_agc: true,
            init_timeout_secs: 30,
            recv_timeout_secs: 10,
        }
    }
}
