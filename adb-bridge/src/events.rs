// Bridge notifications
//
// Events are published from inside the roster critical section, so every
// subscriber sees them in roster order. Each subscriber gets its own
// unbounded channel; a bridge with no subscribers simply drops them.

use crate::client::ClientInfo;
use crate::device::DeviceInfo;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeEvent {
    DeviceConnected {
        device: DeviceInfo,
    },
    DeviceDisconnected {
        device: DeviceInfo,
    },
    DeviceStateChanged {
        device: DeviceInfo,
    },
    ClientListChanged {
        serial: String,
        clients: Vec<ClientInfo>,
    },
    ClientStatusChanged {
        client: ClientInfo,
    },
}

impl BridgeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeEvent::DeviceConnected { .. } => "DeviceConnected",
            BridgeEvent::DeviceDisconnected { .. } => "DeviceDisconnected",
            BridgeEvent::DeviceStateChanged { .. } => "DeviceStateChanged",
            BridgeEvent::ClientListChanged { .. } => "ClientListChanged",
            BridgeEvent::ClientStatusChanged { .. } => "ClientStatusChanged",
        }
    }

    /// Serial of the device the event concerns
    pub fn serial(&self) -> &str {
        match self {
            BridgeEvent::DeviceConnected { device }
            | BridgeEvent::DeviceDisconnected { device }
            | BridgeEvent::DeviceStateChanged { device } => &device.serial,
            BridgeEvent::ClientListChanged { serial, .. } => serial,
            BridgeEvent::ClientStatusChanged { client } => &client.serial,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<BridgeEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BridgeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber, pruning closed ones
    pub fn publish(&self, event: BridgeEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(
            "Published {} for {} to {} subscribers",
            event.kind(),
            event.serial(),
            subscribers.len()
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<BridgeEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
