// Device monitor
//
// Public entry point of the bridge: owns the device tracking worker, exposes
// roster queries and fans out change events.

use crate::client::{ClientInfo, PendingReopen};
use crate::config::BridgeConfig;
use crate::connection::{ConnectionManager, ConnectionStats, Connector, TcpConnector};
use crate::device::DeviceInfo;
use crate::events::{BridgeEvent, EventBus};
use crate::jdwp::TrackerContext;
use crate::ports::DebugPortAllocator;
use crate::protocol::{AdbError, AdbResult};
use crate::server::{AdbExecutable, ServerControl};
use crate::tracker::DeviceTracker;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Tracks devices attached to an ADB server and the debuggable processes
/// running on them.
///
/// ```no_run
/// # async fn demo() -> adb_bridge::AdbResult<()> {
/// use adb_bridge::{BridgeConfig, DeviceMonitor};
///
/// let monitor = DeviceMonitor::new(BridgeConfig::from_env());
/// let mut events = monitor.subscribe();
/// monitor.start().await?;
///
/// while let Some(event) = events.recv().await {
///     println!("{:?}", event);
/// }
/// # Ok(())
/// # }
/// ```
pub struct DeviceMonitor {
    tracker: Arc<DeviceTracker>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceMonitor {
    /// Monitor that restarts the server through the `adb` executable
    pub fn new(config: BridgeConfig) -> Self {
        let server = Arc::new(AdbExecutable::new(&config.adb_path, config.server_port));
        Self::with_server(config, server)
    }

    pub fn with_server(config: BridgeConfig, server: Arc<dyn ServerControl>) -> Self {
        let connector = Arc::new(TcpConnector::new(config.server_addr()));
        Self::with_connector(config, connector, server)
    }

    pub fn with_connector(
        config: BridgeConfig,
        connector: Arc<dyn Connector>,
        server: Arc<dyn ServerControl>,
    ) -> Self {
        let connection = ConnectionManager::new(connector.clone(), server, config.connect_backoff());
        let context = TrackerContext {
            connector,
            ports: DebugPortAllocator::new(config.debug_port_base, config.debug_port_count),
            events: EventBus::new(),
            reconnect_delay: config.jdwp_reconnect_delay(),
            reopen_delay: config.reopen_delay(),
        };

        let tracker = DeviceTracker::new(
            connection,
            context,
            config.track_clients,
            config.long_device_list,
        );

        Self {
            tracker: Arc::new(tracker),
            worker: Mutex::new(None),
        }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BridgeEvent> {
        self.tracker.events.subscribe()
    }

    /// Launch the tracking worker and wait until it is running.
    ///
    /// Calling it again while running is a no-op. A monitor cannot be
    /// restarted after `stop`.
    pub async fn start(&self) -> AdbResult<()> {
        if self.tracker.connection.is_stop_requested() {
            return Err(AdbError::Stopped);
        }

        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(self.tracker.clone().run(ready_tx));

        ready_rx
            .await
            .map_err(|_| AdbError::Protocol("Device tracker exited during startup".to_string()))?;

        *worker = Some(handle);
        info!("Device monitor started");
        Ok(())
    }

    /// Stop tracking. Returns once the worker has exited and every process
    /// tracker has closed its clients; no connection is opened afterwards.
    pub async fn stop(&self) {
        self.tracker.connection.request_stop().await;

        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                error!("Device tracker task failed: {}", e);
            }
        }

        self.tracker.shutdown_process_trackers().await;
        info!("Device monitor stopped");
    }

    /// True while a track-devices session is established
    pub fn is_tracking(&self) -> bool {
        self.tracker.is_tracking()
    }

    pub async fn devices(&self) -> Vec<DeviceInfo> {
        let roster = self.tracker.roster.lock().await;
        roster.iter().map(|device| device.info()).collect()
    }

    pub async fn device(&self, serial: &str) -> Option<DeviceInfo> {
        let roster = self.tracker.roster.lock().await;
        roster
            .iter()
            .find(|device| device.matches_serial(serial))
            .map(|device| device.info())
    }

    /// Debuggable processes on a device, `None` if the device is unknown
    pub async fn clients(&self, serial: &str) -> Option<Vec<ClientInfo>> {
        let roster = self.tracker.roster.lock().await;
        let device = roster.iter().find(|device| device.matches_serial(serial))?;
        Some(device.session().client_infos().await)
    }

    /// Ask the device's process tracker to reopen the JDWP channel of `pid`,
    /// optionally on a specific debugger port. Returns false if the device
    /// is unknown or a reopen for `pid` is already queued.
    pub async fn request_reopen(&self, serial: &str, pid: u32, port: Option<u16>) -> bool {
        let roster = self.tracker.roster.lock().await;
        match roster.iter().find(|device| device.matches_serial(serial)) {
            Some(device) => device.session().request_reopen(PendingReopen { pid, port }),
            None => false,
        }
    }

    pub async fn connection_stats(&self) -> ConnectionStats {
        self.tracker.connection.stats().await
    }
}
