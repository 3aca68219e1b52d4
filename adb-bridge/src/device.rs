// Device roster types
//
// A device is identified by its serial, compared case-insensitively. Device
// lines come from host:track-devices ("serial\tstate") or, in long mode,
// host:track-devices-l ("serial  state key:value ...").

use crate::jdwp::{DeviceSession, ProcessTracker};
use crate::protocol::payload_lines;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Connection state as reported by the ADB server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Offline,
    Bootloader,
    /// Reported as "device" on the wire
    Online,
    Host,
    Recovery,
    Rescue,
    Sideload,
    Unauthorized,
    Authorizing,
    Connecting,
    NoPermissions,
    Unknown,
}

impl DeviceState {
    pub fn from_adb(state: &str) -> Self {
        match state.trim() {
            "offline" => DeviceState::Offline,
            "bootloader" => DeviceState::Bootloader,
            "device" => DeviceState::Online,
            "host" => DeviceState::Host,
            "recovery" => DeviceState::Recovery,
            "rescue" => DeviceState::Rescue,
            "sideload" => DeviceState::Sideload,
            "unauthorized" => DeviceState::Unauthorized,
            "authorizing" => DeviceState::Authorizing,
            "connecting" => DeviceState::Connecting,
            s if s.starts_with("no permissions") => DeviceState::NoPermissions,
            _ => DeviceState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Offline => "offline",
            DeviceState::Bootloader => "bootloader",
            DeviceState::Online => "device",
            DeviceState::Host => "host",
            DeviceState::Recovery => "recovery",
            DeviceState::Rescue => "rescue",
            DeviceState::Sideload => "sideload",
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::Authorizing => "authorizing",
            DeviceState::Connecting => "connecting",
            DeviceState::NoPermissions => "no permissions",
            DeviceState::Unknown => "unknown",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, DeviceState::Online)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a device-list snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub serial: String,
    pub state: DeviceState,
    pub properties: BTreeMap<String, String>,
}

impl DeviceEntry {
    pub fn new(serial: impl Into<String>, state: DeviceState) -> Self {
        Self {
            serial: serial.into(),
            state,
            properties: BTreeMap::new(),
        }
    }
}

/// Parse a short-format line: serial, TAB, state
pub fn parse_device_line(line: &str) -> Option<DeviceEntry> {
    let (serial, state) = line.split_once('\t')?;
    let serial = serial.trim();
    let state = state.trim();
    if serial.is_empty() || state.is_empty() {
        return None;
    }

    Some(DeviceEntry::new(serial, DeviceState::from_adb(state)))
}

/// Parse a long-format line: serial, state, then key:value properties
pub fn parse_device_line_long(line: &str) -> Option<DeviceEntry> {
    let mut tokens = line.split_whitespace();
    let serial = tokens.next()?;
    let state = tokens.next()?;

    let mut entry = DeviceEntry::new(serial, DeviceState::from_adb(state));
    for token in tokens {
        if let Some((key, value)) = token.split_once(':') {
            entry.properties.insert(key.to_string(), value.to_string());
        }
    }

    Some(entry)
}

/// Parse a whole snapshot payload. Malformed lines are logged and skipped.
pub fn parse_device_list(payload: &str, long_format: bool) -> Vec<DeviceEntry> {
    let mut entries = Vec::new();

    for line in payload_lines(payload) {
        let parsed = if long_format {
            parse_device_line_long(line)
        } else {
            parse_device_line(line)
        };

        match parsed {
            Some(entry) => entries.push(entry),
            None => warn!("Skipping malformed device line: {:?}", line),
        }
    }

    entries
}

/// Snapshot of a device handed to event consumers and queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub state: DeviceState,
    pub is_emulator: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// A roster entry.
///
/// Only mutated under the device roster lock. Its client roster lives in the
/// shared `DeviceSession` so the process tracker can update it without that
/// lock.
pub struct Device {
    serial: String,
    state: DeviceState,
    is_emulator: bool,
    properties: BTreeMap<String, String>,
    session: Arc<DeviceSession>,
    process_tracker: Option<ProcessTracker>,
}

impl Device {
    pub(crate) fn new(entry: DeviceEntry) -> Self {
        let is_emulator = entry.serial.starts_with("emulator-");
        let session = Arc::new(DeviceSession::new(&entry.serial));

        Self {
            serial: entry.serial,
            state: entry.state,
            is_emulator,
            properties: entry.properties,
            session,
            process_tracker: None,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_emulator(&self) -> bool {
        self.is_emulator
    }

    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn matches_serial(&self, serial: &str) -> bool {
        self.serial.eq_ignore_ascii_case(serial)
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            serial: self.serial.clone(),
            state: self.state,
            is_emulator: self.is_emulator,
            properties: self.properties.clone(),
        }
    }

    pub(crate) fn set_state(&mut self, state: DeviceState) {
        self.state = state;
    }

    pub(crate) fn set_properties(&mut self, properties: BTreeMap<String, String>) {
        self.properties = properties;
    }

    pub(crate) fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub(crate) fn has_process_tracker(&self) -> bool {
        self.process_tracker.is_some()
    }

    pub(crate) fn attach_process_tracker(&mut self, tracker: ProcessTracker) {
        self.process_tracker = Some(tracker);
    }

    pub(crate) fn take_process_tracker(&mut self) -> Option<ProcessTracker> {
        self.process_tracker.take()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.serial)
            .field("state", &self.state)
            .field("is_emulator", &self.is_emulator)
            .field("tracking_clients", &self.process_tracker.is_some())
            .finish()
    }
}
