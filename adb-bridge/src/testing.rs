// In-process ADB server for tests
//
// Speaks just enough of the host protocol for the trackers: track-devices,
// host:transport, track-jdwp and jdwp:<pid>. A jdwp channel echoes the
// handshake and then echoes every byte, standing in for the VM.

use crate::events::BridgeEvent;
use crate::protocol::{read_exact, parse_length, JDWP_HANDSHAKE};
use crate::server::ServerControl;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Server control that only counts calls
#[derive(Default)]
pub(crate) struct CountingServer {
    pub(crate) kills: AtomicU32,
    pub(crate) starts: AtomicU32,
    /// Report every start as failed
    pub(crate) refuse_start: AtomicBool,
}

impl ServerControl for CountingServer {
    fn ensure_server_started(&self) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        !self.refuse_start.load(Ordering::SeqCst)
    }

    fn kill_server(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }
}

/// Port that was free a moment ago
pub(crate) fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub(crate) async fn next_event(rx: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> BridgeEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Poll `check` until it holds, failing after five seconds
pub(crate) async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Misbehaviour injected into open track-devices streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamFault {
    None,
    /// Send a length prefix that is not hex, then close
    Garbage,
    /// Close without a word
    Hangup,
}

struct FakeState {
    devices: watch::Sender<String>,
    pids: watch::Sender<String>,
    requests: Mutex<Vec<String>>,
    bad_handshakes: Mutex<HashSet<u32>>,
    stalled_jdwp: Mutex<HashSet<u32>>,
    device_faults: watch::Sender<StreamFault>,
    jdwp_opens: Mutex<HashMap<u32, u32>>,
    refuse_tracking: AtomicU32,
    track_devices_sessions: AtomicU32,
}

pub(crate) struct FakeAdbServer {
    addr: String,
    state: Arc<FakeState>,
    task: JoinHandle<()>,
}

impl FakeAdbServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let state = Arc::new(FakeState {
            devices: watch::channel(String::new()).0,
            pids: watch::channel(String::new()).0,
            requests: Mutex::new(Vec::new()),
            bad_handshakes: Mutex::new(HashSet::new()),
            stalled_jdwp: Mutex::new(HashSet::new()),
            device_faults: watch::channel(StreamFault::None).0,
            jdwp_opens: Mutex::new(HashMap::new()),
            refuse_tracking: AtomicU32::new(0),
            track_devices_sessions: AtomicU32::new(0),
        });

        let task = tokio::spawn({
            let state = state.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    tokio::spawn(serve(socket, state.clone()));
                }
            }
        });

        Self { addr, state, task }
    }

    pub(crate) fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Publish a raw track-devices payload
    pub(crate) fn set_devices(&self, payload: &str) {
        self.state.devices.send_replace(payload.to_string());
    }

    pub(crate) fn set_pids(&self, pids: &[u32]) {
        let payload: String = pids.iter().map(|pid| format!("{}\n", pid)).collect();
        self.state.pids.send_replace(payload);
    }

    pub(crate) fn fail_handshake(&self, pid: u32) {
        self.state.bad_handshakes.lock().unwrap().insert(pid);
    }

    /// Accept jdwp:<pid> for `pid` and then never answer
    pub(crate) fn stall_jdwp(&self, pid: u32) {
        self.state.stalled_jdwp.lock().unwrap().insert(pid);
    }

    /// Break every open track-devices stream with an unparsable length
    pub(crate) fn corrupt_device_stream(&self) {
        self.state.device_faults.send_replace(StreamFault::Garbage);
    }

    /// Drop every open track-devices stream
    pub(crate) fn hang_up_device_streams(&self) {
        self.state.device_faults.send_replace(StreamFault::Hangup);
    }

    /// FAIL the next `count` track-devices requests
    pub(crate) fn refuse_tracking(&self, count: u32) {
        self.state.refuse_tracking.store(count, Ordering::SeqCst);
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.state.requests.lock().unwrap().clone()
    }

    pub(crate) fn jdwp_opens(&self, pid: u32) -> u32 {
        self.state.jdwp_opens.lock().unwrap().get(&pid).copied().unwrap_or(0)
    }

    pub(crate) fn track_devices_sessions(&self) -> u32 {
        self.state.track_devices_sessions.load(Ordering::SeqCst)
    }
}

impl Drop for FakeAdbServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn frame(payload: &str) -> Vec<u8> {
    format!("{:04x}{}", payload.len(), payload).into_bytes()
}

async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let prefix = read_exact(socket, 4).await.ok()?;
    let len = parse_length(&prefix)?;
    let body = read_exact(socket, len).await.ok()?;
    String::from_utf8(body).ok()
}

async fn stream_snapshots(
    socket: &mut TcpStream,
    mut rx: watch::Receiver<String>,
    mut faults: Option<watch::Receiver<StreamFault>>,
) {
    loop {
        let payload = rx.borrow_and_update().clone();
        if socket.write_all(&frame(&payload)).await.is_err() {
            return;
        }

        let fault = match faults.as_mut() {
            Some(faults) => tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                changed = faults.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let fault = *faults.borrow_and_update();
                    fault
                }
            },
            None => {
                if rx.changed().await.is_err() {
                    return;
                }
                continue;
            }
        };

        match fault {
            StreamFault::None => {}
            StreamFault::Garbage => {
                socket.write_all(b"zz!!").await.ok();
                return;
            }
            StreamFault::Hangup => return,
        }
    }
}

async fn serve(mut socket: TcpStream, state: Arc<FakeState>) {
    while let Some(request) = read_request(&mut socket).await {
        state.requests.lock().unwrap().push(request.clone());

        if request == "host:track-devices" {
            let refused = state
                .refuse_tracking
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                let mut reply = b"FAIL".to_vec();
                reply.extend(frame("tracking refused"));
                socket.write_all(&reply).await.ok();
                return;
            }

            // Faults injected before this stream opened do not apply to it
            let faults = state.device_faults.subscribe();

            state.track_devices_sessions.fetch_add(1, Ordering::SeqCst);
            if socket.write_all(b"OKAY").await.is_err() {
                return;
            }
            stream_snapshots(&mut socket, state.devices.subscribe(), Some(faults)).await;
            return;
        }

        if request.starts_with("host:transport:") {
            if socket.write_all(b"OKAY").await.is_err() {
                return;
            }
            continue;
        }

        if request == "track-jdwp" {
            if socket.write_all(b"OKAY").await.is_err() {
                return;
            }
            stream_snapshots(&mut socket, state.pids.subscribe(), None).await;
            return;
        }

        if let Some(pid) = request.strip_prefix("jdwp:").and_then(|p| p.parse::<u32>().ok()) {
            *state.jdwp_opens.lock().unwrap().entry(pid).or_insert(0) += 1;
            if socket.write_all(b"OKAY").await.is_err() {
                return;
            }

            let stalled = state.stalled_jdwp.lock().unwrap().contains(&pid);
            if stalled {
                std::future::pending::<()>().await;
            }

            let mut greeting = [0u8; 14];
            if socket.read_exact(&mut greeting).await.is_err() {
                return;
            }

            let bad = state.bad_handshakes.lock().unwrap().contains(&pid);
            let reply: &[u8] = if bad { b"NOT-A-JDWP-VM!" } else { JDWP_HANDSHAKE };
            if socket.write_all(reply).await.is_err() || bad {
                return;
            }

            let (mut reader, mut writer) = socket.split();
            tokio::io::copy(&mut reader, &mut writer).await.ok();
            return;
        }

        let mut reply = b"FAIL".to_vec();
        reply.extend(frame("unknown service"));
        socket.write_all(&reply).await.ok();
        return;
    }
}
