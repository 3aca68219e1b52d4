// Bridge configuration
//
// Defaults match a stock ADB install. Values can come from a JSON file and
// from the same environment variables the adb tool itself honors.

use crate::protocol::{AdbError, AdbResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 5037;
pub const DEFAULT_DEBUG_PORT_BASE: u16 = 8600;

pub const ENV_SERVER_ADDRESS: &str = "ANDROID_ADB_SERVER_ADDRESS";
pub const ENV_SERVER_PORT: &str = "ANDROID_ADB_SERVER_PORT";
pub const ENV_DEBUG_PORT_BASE: &str = "ADB_BRIDGE_DEBUG_PORT_BASE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server_host: String,
    pub server_port: u16,
    /// adb executable used to restart the server
    pub adb_path: String,
    /// Sleep between reconnect attempts once a server restart did not help
    pub connect_backoff_ms: u64,
    /// Delay before a dropped track-jdwp session is reopened
    pub jdwp_reconnect_delay_ms: u64,
    /// Settle time between tearing a client down and reopening it
    pub reopen_delay_ms: u64,
    pub debug_port_base: u16,
    pub debug_port_count: u16,
    /// Run a JDWP process tracker for every online device
    pub track_clients: bool,
    /// Use host:track-devices-l and keep the reported device properties
    pub long_device_list: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            adb_path: "adb".to_string(),
            connect_backoff_ms: 1000,
            jdwp_reconnect_delay_ms: 1000,
            reopen_delay_ms: 500,
            debug_port_base: DEFAULT_DEBUG_PORT_BASE,
            debug_port_count: 16,
            track_clients: true,
            long_device_list: false,
        }
    }
}

impl BridgeConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> AdbResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| AdbError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Layer the ADB environment variables over this config.
    /// Unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var(ENV_SERVER_ADDRESS) {
            if !host.trim().is_empty() {
                self.server_host = host.trim().to_string();
            }
        }

        if let Some(port) = env_u16(ENV_SERVER_PORT) {
            self.server_port = port;
        }

        if let Some(base) = env_u16(ENV_DEBUG_PORT_BASE) {
            self.debug_port_base = base;
        }

        self
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn jdwp_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.jdwp_reconnect_delay_ms)
    }

    pub fn reopen_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_delay_ms)
    }
}

fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u16>().ok())
}
