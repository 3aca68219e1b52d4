// Debuggable process (client) types
//
// A client is one JDWP-capable process on a device, identified by pid. While
// its debugger channel is open a forwarder task owns the device-side stream
// and the local listening socket.

use crate::ports::DebugPortAllocator;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    NotAttached,
    /// Waiting for a debugger on the allocated port
    Listening,
    Connected,
    /// The JDWP handshake with the process failed; not retried automatically
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub serial: String,
    pub pid: u32,
    pub status: ClientStatus,
    pub debugger_port: Option<u16>,
}

#[derive(Debug)]
pub struct Client {
    pid: u32,
    status: ClientStatus,
    debugger_port: Option<u16>,
    forwarder: Option<JoinHandle<()>>,
}

impl Client {
    pub(crate) fn listening(pid: u32, port: u16, forwarder: JoinHandle<()>) -> Self {
        Self {
            pid,
            status: ClientStatus::Listening,
            debugger_port: Some(port),
            forwarder: Some(forwarder),
        }
    }

    pub(crate) fn failed(pid: u32) -> Self {
        Self {
            pid,
            status: ClientStatus::Error,
            debugger_port: None,
            forwarder: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn status(&self) -> ClientStatus {
        self.status
    }

    pub fn debugger_port(&self) -> Option<u16> {
        self.debugger_port
    }

    pub(crate) fn set_status(&mut self, status: ClientStatus) {
        self.status = status;
    }

    pub fn info(&self, serial: &str) -> ClientInfo {
        ClientInfo {
            serial: serial.to_string(),
            pid: self.pid,
            status: self.status,
            debugger_port: self.debugger_port,
        }
    }

    /// Stop forwarding and hand the port to the caller, still held
    pub(crate) fn detach(&mut self) -> Option<u16> {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if self.status != ClientStatus::Error {
            self.status = ClientStatus::NotAttached;
        }
        self.debugger_port.take()
    }

    /// Tear down the forwarding session and give the port back.
    /// Safe to call more than once.
    pub(crate) fn close(&mut self, ports: &DebugPortAllocator) {
        if let Some(port) = self.detach() {
            ports.release(port);
        }
        debug!(pid = self.pid, "Client closed");
    }
}

/// Request to drop and reconnect a client's debugger channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReopen {
    pub pid: u32,
    /// `None` lets the allocator pick
    pub port: Option<u16>,
}

/// FIFO of pending reopens holding each pid at most once
#[derive(Debug, Default)]
pub struct ReopenQueue {
    entries: VecDeque<PendingReopen>,
}

impl ReopenQueue {
    /// Returns false when the pid is already queued; the first request wins
    pub fn enqueue(&mut self, request: PendingReopen) -> bool {
        if self.entries.iter().any(|queued| queued.pid == request.pid) {
            return false;
        }
        self.entries.push_back(request);
        true
    }

    pub fn drain(&mut self) -> Vec<PendingReopen> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_same_client_twice_reopens_once() {
        let mut queue = ReopenQueue::default();
        assert!(queue.enqueue(PendingReopen { pid: 1234, port: None }));
        assert!(!queue.enqueue(PendingReopen { pid: 1234, port: Some(8700) }));
        assert!(queue.enqueue(PendingReopen { pid: 99, port: Some(8601) }));

        let drained = queue.drain();
        assert_eq!(
            drained,
            vec![
                PendingReopen { pid: 1234, port: None },
                PendingReopen { pid: 99, port: Some(8601) },
            ]
        );
        assert!(queue.is_empty());

        // Draining allows the same client to be queued again
        assert!(queue.enqueue(PendingReopen { pid: 1234, port: None }));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_close_releases_port_once() {
        let ports = DebugPortAllocator::new(8600, 2);
        let port = ports.acquire();
        let forwarder = tokio::spawn(std::future::pending::<()>());

        let mut client = Client::listening(4321, port, forwarder);
        assert!(!ports.snapshot().is_free(port));

        client.close(&ports);
        client.close(&ports);

        assert_eq!(client.status(), ClientStatus::NotAttached);
        assert_eq!(client.debugger_port(), None);
        assert_eq!(ports.snapshot().free_ports(), vec![8600, 8601]);
    }

    #[tokio::test]
    async fn test_detach_keeps_port_held() {
        let ports = DebugPortAllocator::new(8600, 2);
        let port = ports.acquire();
        let forwarder = tokio::spawn(std::future::pending::<()>());

        let mut client = Client::listening(4321, port, forwarder);
        assert_eq!(client.detach(), Some(port));
        assert_eq!(client.status(), ClientStatus::NotAttached);
        assert_eq!(client.detach(), None);
        assert!(ports.snapshot().is_held(port));
    }

    #[test]
    fn test_failed_client_keeps_error_status() {
        let ports = DebugPortAllocator::new(8600, 1);
        let mut client = Client::failed(77);
        client.close(&ports);

        assert_eq!(client.status(), ClientStatus::Error);
        assert_eq!(client.info("emulator-5554").debugger_port, None);
    }
}
