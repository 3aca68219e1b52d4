// JDWP process tracking
//
// One tracker per online device runs track-jdwp over its own connection.
// Every pid it reports gets a jdwp:<pid> channel; once the JDWP handshake
// succeeds the channel is exposed to debuggers on a local port.
//
// Lock order: the device roster lock (monitor) is always taken before a
// session's client lock, never the other way around. Code in this module only
// takes client locks.

use crate::client::{Client, ClientInfo, ClientStatus, PendingReopen, ReopenQueue};
use crate::connection::{wait_for_stop, AdbStream, Connector};
use crate::events::{BridgeEvent, EventBus};
use crate::ports::DebugPortAllocator;
use crate::protocol::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Debuggers connect to forwarded processes on this address
pub const DEBUGGER_HOST: &str = "127.0.0.1";

/// Upper bound on opening a jdwp:<pid> channel, handshake included
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Allocator ports tried before a client is marked as failed
const MAX_BIND_ATTEMPTS: usize = 8;

/// Parse a track-jdwp payload: one decimal pid per line
pub fn parse_pid_list(payload: &str) -> Vec<u32> {
    let mut pids = Vec::new();

    for line in payload_lines(payload) {
        match line.trim().parse::<u32>() {
            Ok(pid) => pids.push(pid),
            Err(_) => warn!("Skipping malformed pid line: {:?}", line),
        }
    }

    pids
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PidDiff {
    pub added: Vec<u32>,
    pub removed: Vec<u32>,
}

impl PidDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Diff a pid snapshot against the pids currently tracked
pub fn diff_pids(existing: &[u32], snapshot: &[u32]) -> PidDiff {
    let current: HashSet<u32> = existing.iter().copied().collect();
    let reported: HashSet<u32> = snapshot.iter().copied().collect();

    let mut seen = HashSet::new();
    let added = snapshot
        .iter()
        .copied()
        .filter(|pid| !current.contains(pid) && seen.insert(*pid))
        .collect();
    let removed = existing
        .iter()
        .copied()
        .filter(|pid| !reported.contains(pid))
        .collect();

    PidDiff { added, removed }
}

/// Perform the JDWP handshake as the debugger side
pub async fn jdwp_handshake<S>(stream: &mut S) -> AdbResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    debug!("Performing JDWP handshake");

    stream.write_all(JDWP_HANDSHAKE).await?;
    stream.flush().await?;

    let reply = read_exact(stream, JDWP_HANDSHAKE.len()).await?;
    if reply != JDWP_HANDSHAKE {
        warn!("Invalid handshake response: {:?}", reply);
        return Err(AdbError::InvalidHandshake);
    }

    Ok(())
}

/// Answer a debugger's handshake on behalf of the VM, whose own handshake
/// was already consumed when the channel was opened
async fn answer_debugger_handshake<S>(stream: &mut S) -> AdbResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let greeting = read_exact(stream, JDWP_HANDSHAKE.len()).await?;
    if greeting != JDWP_HANDSHAKE {
        return Err(AdbError::InvalidHandshake);
    }

    stream.write_all(JDWP_HANDSHAKE).await?;
    stream.flush().await?;
    Ok(())
}

/// Send a service request and require OKAY
async fn request_service<S>(stream: &mut S, service: &str) -> AdbResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    send_request(stream, service).await?;
    read_response(stream, true).await?.into_result()
}

/// Per-device state shared by the roster entry, the process tracker and the
/// forwarders of its clients
pub(crate) struct DeviceSession {
    serial: String,
    clients: Mutex<Vec<Client>>,
    reopen_queue: std::sync::Mutex<ReopenQueue>,
    reopen_notify: Notify,
}

impl DeviceSession {
    pub(crate) fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            clients: Mutex::new(Vec::new()),
            reopen_queue: std::sync::Mutex::new(ReopenQueue::default()),
            reopen_notify: Notify::new(),
        }
    }

    pub(crate) fn serial(&self) -> &str {
        &self.serial
    }

    pub(crate) async fn client_infos(&self) -> Vec<ClientInfo> {
        let clients = self.clients.lock().await;
        infos(&self.serial, &clients)
    }

    /// Queue a client for reopen and wake the tracker. False if already queued.
    pub(crate) fn request_reopen(&self, request: PendingReopen) -> bool {
        let queued = self.queue().enqueue(request);
        if queued {
            debug!(serial = %self.serial, pid = request.pid, "Reopen queued");
            self.reopen_notify.notify_one();
        }
        queued
    }

    fn take_reopens(&self) -> Vec<PendingReopen> {
        self.queue().drain()
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, ReopenQueue> {
        self.reopen_queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn set_client_status(&self, pid: u32, status: ClientStatus, events: &EventBus) {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.iter_mut().find(|c| c.pid() == pid) {
            client.set_status(status);
            events.publish(BridgeEvent::ClientStatusChanged {
                client: client.info(&self.serial),
            });
        }
    }
}

fn infos(serial: &str, clients: &[Client]) -> Vec<ClientInfo> {
    clients.iter().map(|client| client.info(serial)).collect()
}

/// Everything a process tracker needs besides its device
#[derive(Clone)]
pub(crate) struct TrackerContext {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) ports: DebugPortAllocator,
    pub(crate) events: EventBus,
    pub(crate) reconnect_delay: Duration,
    pub(crate) reopen_delay: Duration,
}

/// Handle to a running track-jdwp worker
pub(crate) struct ProcessTracker {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProcessTracker {
    pub(crate) fn spawn(session: Arc<DeviceSession>, context: TrackerContext) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(process_tracker_task(session, context, stop_rx));
        Self { stop_tx, task }
    }

    /// Signal the worker and wait for it to close every client
    pub(crate) async fn stop(self) {
        self.stop_tx.send_replace(true);
        if let Err(e) = self.task.await {
            error!("Process tracker task failed: {}", e);
        }
    }
}

async fn process_tracker_task(
    session: Arc<DeviceSession>,
    context: TrackerContext,
    mut stop_rx: watch::Receiver<bool>,
) {
    let serial = session.serial().to_string();
    info!(serial = %serial, "JDWP tracker started");

    while !*stop_rx.borrow() {
        let opened = tokio::select! {
            result = open_jdwp_tracking(&context, &serial) => result,
            _ = wait_for_stop(&mut stop_rx) => break,
        };

        match opened {
            Ok(stream) => {
                if let Err(e) = run_tracking_session(stream, &session, &context, &mut stop_rx).await {
                    warn!(serial = %serial, "track-jdwp session ended: {}", e);
                }
            }
            Err(e) => warn!(serial = %serial, "Failed to start track-jdwp: {}", e),
        }

        tokio::select! {
            _ = tokio::time::sleep(context.reconnect_delay) => {}
            _ = wait_for_stop(&mut stop_rx) => break,
        }
    }

    close_all_clients(&session, &context).await;
    info!(serial = %serial, "JDWP tracker stopped");
}

async fn open_jdwp_tracking(context: &TrackerContext, serial: &str) -> AdbResult<AdbStream> {
    let mut stream = context.connector.connect().await?;
    request_service(&mut stream, &services::transport(serial)).await?;
    request_service(&mut stream, services::TRACK_JDWP).await?;
    debug!(serial, "track-jdwp confirmed");
    Ok(stream)
}

/// Reads pid snapshots off the tracking socket. Owning the socket here keeps
/// the select loop below free of partially consumed frames.
async fn read_pid_snapshots(mut stream: AdbStream, tx: mpsc::Sender<AdbResult<Vec<u32>>>) {
    loop {
        let result = match read_framed_string(&mut stream).await {
            Ok(Some(payload)) => Ok(parse_pid_list(&payload)),
            Ok(None) => Err(AdbError::Protocol("Unparsable track-jdwp length".to_string())),
            Err(e) => Err(e),
        };

        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            break;
        }
    }
}

async fn run_tracking_session(
    stream: AdbStream,
    session: &Arc<DeviceSession>,
    context: &TrackerContext,
    stop_rx: &mut watch::Receiver<bool>,
) -> AdbResult<()> {
    let (snapshot_tx, mut snapshot_rx) = mpsc::channel(8);
    let reader = tokio::spawn(read_pid_snapshots(stream, snapshot_tx));

    let result = loop {
        for request in session.take_reopens() {
            if !reopen_client(session, context, request, stop_rx).await {
                break;
            }
        }

        if *stop_rx.borrow() {
            break Ok(());
        }

        tokio::select! {
            _ = wait_for_stop(stop_rx) => break Ok(()),
            _ = session.reopen_notify.notified() => {}
            snapshot = snapshot_rx.recv() => match snapshot {
                Some(Ok(pids)) => {
                    if !reconcile_clients(session, context, &pids, stop_rx).await {
                        break Ok(());
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Err(AdbError::ConnectionClosed),
            },
        }
    };

    // Dropping the reader closes the tracking socket
    reader.abort();
    close_all_clients(session, context).await;
    result
}

/// Apply one pid snapshot to the client roster. New clients are opened
/// without the client lock held; only this task adds or removes clients.
/// Returns false if a stop arrived while opening.
async fn reconcile_clients(
    session: &Arc<DeviceSession>,
    context: &TrackerContext,
    pids: &[u32],
    stop_rx: &mut watch::Receiver<bool>,
) -> bool {
    let added = {
        let mut clients = session.clients.lock().await;

        let existing: Vec<u32> = clients.iter().map(Client::pid).collect();
        let diff = diff_pids(&existing, pids);
        if diff.is_empty() {
            return true;
        }

        debug!(
            serial = %session.serial,
            "Client diff: {} added, {} removed",
            diff.added.len(),
            diff.removed.len()
        );

        for pid in &diff.removed {
            if let Some(index) = clients.iter().position(|c| c.pid() == *pid) {
                let mut client = clients.remove(index);
                client.close(&context.ports);
            }
        }

        diff.added
    };

    let mut running = true;
    for pid in added {
        match open_client(session, context, pid, PortClaim::Any, stop_rx).await {
            Some(client) => session.clients.lock().await.push(client),
            None => {
                running = false;
                break;
            }
        }
    }

    publish_client_list(session, context).await;
    running
}

/// Tear a client down, let the VM settle, then open it again. A reopen on
/// the client's own port keeps that port held throughout. Returns false if
/// a stop arrived.
async fn reopen_client(
    session: &Arc<DeviceSession>,
    context: &TrackerContext,
    request: PendingReopen,
    stop_rx: &mut watch::Receiver<bool>,
) -> bool {
    let claim = {
        let mut clients = session.clients.lock().await;
        let Some(client) = clients.iter_mut().find(|c| c.pid() == request.pid) else {
            debug!(pid = request.pid, "Reopen skipped, client is gone");
            return true;
        };

        info!(serial = %session.serial, pid = request.pid, "Reopening client");
        let held = client.detach();
        context.events.publish(BridgeEvent::ClientStatusChanged {
            client: client.info(&session.serial),
        });

        match (held, request.port) {
            (Some(port), Some(wanted)) if port == wanted => PortClaim::Reserved(port),
            (held, wanted) => {
                if let Some(port) = held {
                    context.ports.release(port);
                }
                wanted.map_or(PortClaim::Any, PortClaim::Requested)
            }
        }
    };

    // The VM drops its side of the old channel asynchronously; reconnecting
    // too early gets the new handshake refused.
    tokio::select! {
        _ = tokio::time::sleep(context.reopen_delay) => {}
        _ = wait_for_stop(stop_rx) => {
            claim.release(&context.ports);
            return false;
        }
    }

    let Some(client) = open_client(session, context, request.pid, claim, stop_rx).await else {
        return false;
    };

    {
        let mut clients = session.clients.lock().await;
        match clients.iter().position(|c| c.pid() == request.pid) {
            Some(index) => clients[index] = client,
            None => {
                let mut client = client;
                client.close(&context.ports);
            }
        }
    }

    publish_client_list(session, context).await;
    true
}

async fn publish_client_list(session: &DeviceSession, context: &TrackerContext) {
    let clients = session.clients.lock().await;
    context.events.publish(BridgeEvent::ClientListChanged {
        serial: session.serial.clone(),
        clients: infos(&session.serial, &clients),
    });
}

async fn close_all_clients(session: &DeviceSession, context: &TrackerContext) {
    session.take_reopens();

    let mut clients = session.clients.lock().await;
    if clients.is_empty() {
        return;
    }

    for client in clients.iter_mut() {
        client.close(&context.ports);
    }
    clients.clear();

    context.events.publish(BridgeEvent::ClientListChanged {
        serial: session.serial.clone(),
        clients: Vec::new(),
    });
}

/// Where a client's debugger port comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortClaim {
    /// Lowest free allocator port
    Any,
    /// A specific port that still has to be claimed
    Requested(u16),
    /// A port the client kept held across its reopen
    Reserved(u16),
}

impl PortClaim {
    /// Give back a port held by this claim that will not be bound
    fn release(self, ports: &DebugPortAllocator) {
        if let PortClaim::Reserved(port) = self {
            ports.release(port);
        }
    }
}

/// Open the JDWP channel for `pid` and start listening for a debugger.
///
/// Channel failures produce a client in `Error` status instead of no client.
/// Returns `None` only when a stop arrives first.
async fn open_client(
    session: &Arc<DeviceSession>,
    context: &TrackerContext,
    pid: u32,
    claim: PortClaim,
    stop_rx: &mut watch::Receiver<bool>,
) -> Option<Client> {
    let serial = session.serial.as_str();

    let connected = tokio::select! {
        result = tokio::time::timeout(OPEN_TIMEOUT, connect_jdwp(context, serial, pid)) => result,
        _ = wait_for_stop(stop_rx) => {
            claim.release(&context.ports);
            return None;
        }
    };

    let device_stream = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(serial, pid, "Failed to open JDWP channel: {}", e);
            claim.release(&context.ports);
            return Some(Client::failed(pid));
        }
        Err(_) => {
            warn!(serial, pid, "Timed out opening JDWP channel");
            claim.release(&context.ports);
            return Some(Client::failed(pid));
        }
    };

    let Some((listener, port)) = bind_debugger_port(context, claim).await else {
        return Some(Client::failed(pid));
    };

    info!(serial, pid, port, "Listening for debugger");
    let forwarder = tokio::spawn(forward_debugger(
        listener,
        device_stream,
        session.clone(),
        context.events.clone(),
        pid,
        port,
    ));

    Some(Client::listening(pid, port, forwarder))
}

async fn connect_jdwp(context: &TrackerContext, serial: &str, pid: u32) -> AdbResult<AdbStream> {
    let mut stream = context.connector.connect().await?;
    request_service(&mut stream, &services::transport(serial)).await?;
    request_service(&mut stream, &services::jdwp(pid)).await?;
    jdwp_handshake(&mut stream).await?;
    Ok(stream)
}

/// Bind the claimed port, falling back to allocator ports when it is held
/// elsewhere or cannot be bound. Allocator ports that fail to bind are in
/// use by another process and stay out of the pool.
async fn bind_debugger_port(context: &TrackerContext, claim: PortClaim) -> Option<(TcpListener, u16)> {
    let explicit = match claim {
        PortClaim::Any => None,
        PortClaim::Reserved(port) => Some(port),
        PortClaim::Requested(port) => {
            if context.ports.acquire_specific(port) {
                Some(port)
            } else {
                warn!(port, "Requested debugger port is held by another client");
                None
            }
        }
    };

    if let Some(port) = explicit {
        match TcpListener::bind((DEBUGGER_HOST, port)).await {
            Ok(listener) => return Some((listener, port)),
            Err(e) => {
                warn!(port, "Failed to bind requested debugger port: {}", e);
                context.ports.release(port);
            }
        }
    }

    for _ in 0..MAX_BIND_ATTEMPTS {
        let port = context.ports.acquire();
        match TcpListener::bind((DEBUGGER_HOST, port)).await {
            Ok(listener) => return Some((listener, port)),
            Err(e) => warn!(port, "Debugger port unavailable: {}", e),
        }
    }

    error!("No bindable debugger port after {} attempts", MAX_BIND_ATTEMPTS);
    None
}

/// Relay one debugger session between the local port and the device.
///
/// When the session ends the VM side is spent, so the client is queued for
/// reopen on the same port.
async fn forward_debugger(
    listener: TcpListener,
    mut device: AdbStream,
    session: Arc<DeviceSession>,
    events: EventBus,
    pid: u32,
    port: u16,
) {
    let (mut debugger, peer) = loop {
        let (mut socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(pid, port, "Debugger accept failed: {}", e);
                return;
            }
        };

        socket.set_nodelay(true).ok();
        match answer_debugger_handshake(&mut socket).await {
            Ok(()) => break (socket, peer),
            Err(e) => warn!(pid, port, %peer, "Rejected debugger: {}", e),
        }
    };
    drop(listener);

    info!(pid, port, %peer, "Debugger attached");
    session.set_client_status(pid, ClientStatus::Connected, &events).await;

    match tokio::io::copy_bidirectional(&mut debugger, &mut device).await {
        Ok((to_device, to_debugger)) => info!(
            pid,
            port,
            "Debugger detached ({} bytes to device, {} bytes to debugger)",
            to_device,
            to_debugger
        ),
        Err(e) => warn!(pid, port, "Debugger session failed: {}", e),
    }

    session.set_client_status(pid, ClientStatus::NotAttached, &events).await;
    session.request_reopen(PendingReopen { pid, port: Some(port) });
}
