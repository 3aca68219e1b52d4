// ADB device and JDWP process bridge
//
// Talks to a local ADB server over its host protocol:
// - Device tracking with automatic reconnect and server restart
// - Per-device tracking of debuggable (JDWP) processes
// - Local debugger ports forwarded to each process
// - Change events for devices and clients

pub mod protocol;
pub mod connection;
pub mod server;
pub mod config;
pub mod ports;
pub mod device;
pub mod client;
pub mod events;
pub mod jdwp;
pub mod monitor;
mod tracker;

#[cfg(test)]
mod testing;

pub use client::{ClientInfo, ClientStatus};
pub use config::BridgeConfig;
pub use connection::{Connector, ConnectionPhase, ConnectionStats, TcpConnector};
pub use device::{DeviceInfo, DeviceState};
pub use events::BridgeEvent;
pub use monitor::DeviceMonitor;
pub use protocol::{AdbError, AdbResult};
pub use server::{AdbExecutable, ServerControl};
