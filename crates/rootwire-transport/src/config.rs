//! Transport tunables.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TransportError};

/// How the multiplexer picks the downlink sub-stream of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownlinkPolicy {
    /// Uniformly random among connected secondary sub-streams.
    #[default]
    Random,
    /// Connected secondary sub-stream with the fewest outstanding responses.
    LeastLoaded,
}

/// Configuration of a transport channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Seconds to wait for a response during the handshake.
    pub request_timeout_secs: u64,
    /// Number of sub-streams per channel, primary included.
    pub substreams_per_channel: u16,
    /// Idle time after which a data server connection may be closed.
    pub data_server_ttl_secs: u64,
    /// Idle time after which a redirector connection may be closed.
    pub load_balancer_ttl_secs: u64,
    /// Inactivity after which a stream with outstanding requests is broken.
    pub stream_timeout_secs: u64,
    /// Application name reported at login.
    pub app_name: String,
    /// Monitoring info reported at login.
    pub mon_info: String,
    /// Announce multi-protocol ability at login.
    pub multi_protocol: bool,
/// How read responses are spread over parallel sub-streams.
    pub downlink_policy: DownlinkPolicy,
    /// Grace period added to a server `wait` before the stream may be judged.
    pub wait_extra_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 1800,
            substreams_per_channel: 1,
            data_server_ttl_secs: 300,
            load_balancer_ttl_secs: 1200,
            stream_timeout_secs: 60,
            app_name: String::new(),
            mon_info: String::new(),
            multi_protocol: false,
            downlink_policy: DownlinkPolicy::Random,
            wait_extra_secs: 5,
        }
    }
}

fn parse_into<T: FromStr>(name: &str, value: &str, slot: &mut T) {
    match value.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(variable = name, value = value, "ignoring unparseable setting"),
    }
}

impl TransportConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: TransportConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| TransportError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| TransportError::Config(e.to_string()))?
            }
            _ => {
                return Err(TransportError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        Ok(config.normalized())
    }

    /// Overlays `XRD_*` environment variables.
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Overlays settings found through `lookup`, keyed by `XRD_*` names.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("XRD_REQUESTTIMEOUT") {
            parse_into("XRD_REQUESTTIMEOUT", &v, &mut self.request_timeout_secs);
        }
        if let Some(v) = lookup("XRD_SUBSTREAMSPERCHANNEL") {
            parse_into("XRD_SUBSTREAMSPERCHANNEL", &v, &mut self.substreams_per_channel);
        }
        if let Some(v) = lookup("XRD_DATASERVERTTL") {
            parse_into("XRD_DATASERVERTTL", &v, &mut self.data_server_ttl_secs);
        }
        if let Some(v) = lookup("XRD_LOADBALANCERTTL") {
            parse_into("XRD_LOADBALANCERTTL", &v, &mut self.load_balancer_ttl_secs);
        }
        if let Some(v) = lookup("XRD_STREAMTIMEOUT") {
            parse_into("XRD_STREAMTIMEOUT", &v, &mut self.stream_timeout_secs);
        }
        if let Some(v) = lookup("XRD_APPNAME") {
            self.app_name = v;
        }
        if let Some(v) = lookup("XRD_MONINFO") {
            self.mon_info = v;
        }
        if let Some(v) = lookup("XRD_MULTIPROTOCOL") {
            let mut flag = 0u32;
            parse_into("XRD_MULTIPROTOCOL", &v, &mut flag);
            self.multi_protocol = flag != 0;
        }
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        if self.substreams_per_channel < 1 {
            self.substreams_per_channel = 1;
        }
        self
    }
}
