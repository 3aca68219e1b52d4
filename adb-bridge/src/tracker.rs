// Device tracking loop
//
// Keeps one host:track-devices session open against the ADB server and folds
// every pushed snapshot into the device roster. Each snapshot is a complete
// list, so reconciliation is a diff of the roster against it.

use crate::connection::{wait_for_stop, AdbStream, ConnectionManager};
use crate::device::{parse_device_list, Device, DeviceEntry, DeviceState};
use crate::events::{BridgeEvent, EventBus};
use crate::jdwp::{ProcessTracker, TrackerContext};
use crate::protocol::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// What applying one snapshot did to the roster
#[derive(Debug, Default)]
pub(crate) struct ReconcileOutcome {
    /// Events in the order they must be published
    pub(crate) events: Vec<BridgeEvent>,
    /// Serials that just entered the online state
    pub(crate) came_online: Vec<String>,
    /// Serials still listed that just left the online state
    pub(crate) went_offline: Vec<String>,
    /// Devices dropped from the roster
    pub(crate) removed: Vec<Device>,
}

/// Fold a full device-list snapshot into `roster`.
///
/// Serials match case-insensitively. A device missing from the snapshot is
/// removed; if it was online it is first moved to offline so consumers see
/// the state change before the disconnect.
pub(crate) fn reconcile_devices(roster: &mut Vec<Device>, mut snapshot: Vec<DeviceEntry>) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    let mut index = 0;
    while index < roster.len() {
        let position = snapshot
            .iter()
            .position(|entry| roster[index].matches_serial(&entry.serial));

        let Some(position) = position else {
            let mut device = roster.remove(index);
            if device.is_online() {
                device.set_state(DeviceState::Offline);
                outcome.events.push(BridgeEvent::DeviceStateChanged { device: device.info() });
            }
            outcome.events.push(BridgeEvent::DeviceDisconnected { device: device.info() });
            outcome.removed.push(device);
            continue;
        };

        let entry = snapshot.remove(position);
        let device = &mut roster[index];

        if &entry.properties != device.properties() {
            device.set_properties(entry.properties);
        }

        if entry.state != device.state() {
            let was_online = device.is_online();
            device.set_state(entry.state);
            outcome.events.push(BridgeEvent::DeviceStateChanged { device: device.info() });

            if device.is_online() {
                outcome.came_online.push(device.serial().to_string());
            } else if was_online {
                outcome.went_offline.push(device.serial().to_string());
            }
        }

        index += 1;
    }

    for entry in snapshot {
        if roster.iter().any(|device| device.matches_serial(&entry.serial)) {
            warn!("Duplicate serial {} in device list", entry.serial);
            continue;
        }

        let device = Device::new(entry);
        outcome.events.push(BridgeEvent::DeviceConnected { device: device.info() });
        if device.is_online() {
            outcome.came_online.push(device.serial().to_string());
        }
        roster.push(device);
    }

    outcome
}

/// Send the tracking request on a fresh connection and check the reply
pub(crate) async fn request_device_tracking<S>(stream: &mut S, service: &str) -> AdbResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + ?Sized,
{
    send_request(stream, service).await?;
    read_response(stream, true).await?.into_result()
}

/// State shared between the device tracking worker and the public monitor.
///
/// Lock order: `roster` is always taken before any device session's client
/// lock, never the other way round.
pub(crate) struct DeviceTracker {
    pub(crate) connection: ConnectionManager,
    pub(crate) roster: Mutex<Vec<Device>>,
    pub(crate) events: EventBus,
    pub(crate) context: TrackerContext,
    track_clients: bool,
    long_format: bool,
    tracking: AtomicBool,
}

impl DeviceTracker {
    pub(crate) fn new(
        connection: ConnectionManager,
        context: TrackerContext,
        track_clients: bool,
        long_format: bool,
    ) -> Self {
        Self {
            connection,
            roster: Mutex::new(Vec::new()),
            events: context.events.clone(),
            context,
            track_clients,
            long_format,
            tracking: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    fn tracking_service(&self) -> &'static str {
        if self.long_format {
            services::TRACK_DEVICES_LONG
        } else {
            services::TRACK_DEVICES
        }
    }

    /// Worker body. Signals `ready` once running, returns after a stop.
    pub(crate) async fn run(self: Arc<Self>, ready: oneshot::Sender<()>) {
        let mut stop_rx = self.connection.stop_signal();
        let mut stream: Option<AdbStream> = None;

        info!("Device tracker started");
        ready.send(()).ok();

        loop {
            let fresh = match self.connection.ensure_connected(&mut stream).await {
                Ok(fresh) => fresh,
                Err(AdbError::Stopped) => break,
                Err(e) => {
                    error!("Unexpected connection failure: {}", e);
                    self.connection.backoff().await;
                    continue;
                }
            };

            let Some(socket) = stream.as_mut() else {
                continue;
            };

            if fresh {
                if let Err(e) = request_device_tracking(socket, self.tracking_service()).await {
                    warn!("Device tracking request failed: {}", e);
                    self.drop_connection(&mut stream).await;
                    self.connection.backoff().await;
                    continue;
                }
                self.tracking.store(true, Ordering::SeqCst);
                info!("Tracking devices");
            }

            let read = tokio::select! {
                result = read_framed_string(socket) => result,
                _ = wait_for_stop(&mut stop_rx) => break,
            };

            match read {
                Ok(Some(payload)) => self.apply_snapshot(&payload).await,
                Ok(None) => {
                    warn!("Device list stream desynchronized, reconnecting");
                    self.drop_connection(&mut stream).await;
                }
                Err(e) => {
                    warn!("Device tracking connection lost: {}", e);
                    self.drop_connection(&mut stream).await;
                }
            }
        }

        drop(stream);
        self.tracking.store(false, Ordering::SeqCst);
        info!("Device tracker stopped");
    }

    async fn drop_connection(&self, stream: &mut Option<AdbStream>) {
        *stream = None;
        self.tracking.store(false, Ordering::SeqCst);
        self.connection.mark_disconnected().await;
    }

    /// Reconcile one snapshot, publish its events and start or stop
    /// per-device process trackers, all under the roster lock
    pub(crate) async fn apply_snapshot(&self, payload: &str) {
        let snapshot = parse_device_list(payload, self.long_format);
        debug!("Device snapshot with {} entries", snapshot.len());

        let mut roster = self.roster.lock().await;
        let outcome = reconcile_devices(&mut roster, snapshot);

        for event in outcome.events {
            debug!(serial = %event.serial(), "{}", event.kind());
            self.events.publish(event);
        }

        for mut device in outcome.removed {
            info!(serial = %device.serial(), "Device disconnected");
            stop_process_tracker(&mut device).await;
        }

        for serial in &outcome.went_offline {
            if let Some(device) = roster.iter_mut().find(|d| d.matches_serial(serial)) {
                info!(serial = %serial, state = %device.state(), "Device left online state");
                stop_process_tracker(device).await;
            }
        }

        for serial in &outcome.came_online {
            if let Some(device) = roster.iter_mut().find(|d| d.matches_serial(serial)) {
                info!(serial = %serial, "Device online");
                self.on_device_online(device);
            }
        }
    }

    fn on_device_online(&self, device: &mut Device) {
        if !self.track_clients || device.has_process_tracker() {
            return;
        }

        let tracker = ProcessTracker::spawn(device.session().clone(), self.context.clone());
        device.attach_process_tracker(tracker);
    }

    /// Stop every process tracker, closing all clients
    pub(crate) async fn shutdown_process_trackers(&self) {
        let mut roster = self.roster.lock().await;
        for device in roster.iter_mut() {
            stop_process_tracker(device).await;
        }
    }
}

async fn stop_process_tracker(device: &mut Device) {
    if let Some(tracker) = device.take_process_tracker() {
        debug!(serial = %device.serial(), "Stopping JDWP tracker");
        tracker.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(serial: &str, state: DeviceState) -> DeviceEntry {
        DeviceEntry::new(serial, state)
    }

    fn roster_view(roster: &[Device]) -> Vec<(String, DeviceState)> {
        roster
            .iter()
            .map(|device| (device.serial().to_string(), device.state()))
            .collect()
    }

    #[test]
    fn test_new_emulator_comes_online() {
        let mut roster = Vec::new();
        let outcome = reconcile_devices(&mut roster, parse_device_list("emulator-5554\tdevice\n", false));

        assert_eq!(roster.len(), 1);
        assert!(roster[0].is_emulator());
        assert_eq!(outcome.came_online, vec!["emulator-5554".to_string()]);
        assert_eq!(outcome.events.len(), 1);
        assert!(matches!(
            &outcome.events[0],
            BridgeEvent::DeviceConnected { device } if device.state == DeviceState::Online
        ));
    }

    #[test]
    fn test_same_snapshot_twice_is_silent() {
        let mut roster = Vec::new();
        let snapshot = vec![
            entry("emulator-5554", DeviceState::Online),
            entry("R58M123", DeviceState::Unauthorized),
        ];

        reconcile_devices(&mut roster, snapshot.clone());
        let outcome = reconcile_devices(&mut roster, snapshot);

        assert!(outcome.events.is_empty());
        assert!(outcome.came_online.is_empty());
        assert!(outcome.went_offline.is_empty());
        assert!(outcome.removed.is_empty());
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_roster_matches_last_snapshot() {
        let mut roster = Vec::new();

        reconcile_devices(
            &mut roster,
            vec![entry("a", DeviceState::Online), entry("b", DeviceState::Offline)],
        );
        reconcile_devices(
            &mut roster,
            vec![entry("b", DeviceState::Online), entry("c", DeviceState::Unauthorized)],
        );
        reconcile_devices(&mut roster, vec![]);
        reconcile_devices(
            &mut roster,
            vec![entry("c", DeviceState::Recovery), entry("d", DeviceState::Online)],
        );

        assert_eq!(
            roster_view(&roster),
            vec![
                ("c".to_string(), DeviceState::Recovery),
                ("d".to_string(), DeviceState::Online),
            ]
        );
    }

    #[test]
    fn test_online_transition_reported_once_per_edge() {
        let mut roster = Vec::new();
        let mut online_edges = 0;

        for state in [
            DeviceState::Offline,
            DeviceState::Online,
            DeviceState::Online,
            DeviceState::Offline,
            DeviceState::Online,
            DeviceState::Online,
        ] {
            let outcome = reconcile_devices(&mut roster, vec![entry("R58M123", state)]);
            online_edges += outcome.came_online.len();
        }

        assert_eq!(online_edges, 2);
    }

    #[test]
    fn test_removed_online_device_goes_offline_first() {
        let mut roster = Vec::new();
        reconcile_devices(&mut roster, vec![entry("emulator-5554", DeviceState::Online)]);

        let outcome = reconcile_devices(&mut roster, vec![]);

        assert!(roster.is_empty());
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.events.len(), 2);
        assert!(matches!(
            &outcome.events[0],
            BridgeEvent::DeviceStateChanged { device } if device.state == DeviceState::Offline
        ));
        assert!(matches!(
            &outcome.events[1],
            BridgeEvent::DeviceDisconnected { device } if device.state == DeviceState::Offline
        ));
    }

    #[test]
    fn test_removed_offline_device_only_disconnects() {
        let mut roster = Vec::new();
        reconcile_devices(&mut roster, vec![entry("R58M123", DeviceState::Unauthorized)]);

        let outcome = reconcile_devices(&mut roster, vec![]);

        assert_eq!(outcome.events.len(), 1);
        assert!(matches!(&outcome.events[0], BridgeEvent::DeviceDisconnected { .. }));
    }

    #[test]
    fn test_leaving_online_state_is_reported() {
        let mut roster = Vec::new();
        reconcile_devices(&mut roster, vec![entry("R58M123", DeviceState::Online)]);

        let outcome = reconcile_devices(&mut roster, vec![entry("R58M123", DeviceState::Offline)]);

        assert_eq!(outcome.went_offline, vec!["R58M123".to_string()]);
        assert!(outcome.removed.is_empty());
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_serial_match_ignores_case() {
        let mut roster = Vec::new();
        reconcile_devices(&mut roster, vec![entry("emulator-5554", DeviceState::Online)]);

        let outcome = reconcile_devices(&mut roster, vec![entry("EMULATOR-5554", DeviceState::Online)]);

        assert!(outcome.events.is_empty());
        assert_eq!(roster[0].serial(), "emulator-5554");
    }

    #[test]
    fn test_property_update_is_silent() {
        let mut roster = Vec::new();
        reconcile_devices(
            &mut roster,
            parse_device_list("R58M123 device model:Pixel", true),
        );

        let outcome = reconcile_devices(
            &mut roster,
            parse_device_list("R58M123 device model:Pixel_7", true),
        );

        assert!(outcome.events.is_empty());
        assert_eq!(
            roster[0].properties().get("model").map(String::as_str),
            Some("Pixel_7")
        );
    }

    #[test]
    fn test_duplicate_serial_in_snapshot_added_once() {
        let mut roster = Vec::new();
        let outcome = reconcile_devices(
            &mut roster,
            vec![entry("a", DeviceState::Online), entry("A", DeviceState::Offline)],
        );

        assert_eq!(roster.len(), 1);
        assert_eq!(outcome.events.len(), 1);
    }

    #[tokio::test]
    async fn test_request_device_tracking_refused() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut server, b"FAIL0007no adbd")
            .await
            .unwrap();

        let result = request_device_tracking(&mut client, services::TRACK_DEVICES).await;
        assert!(matches!(result, Err(AdbError::Refused(msg)) if msg == "no adbd"));

        let mut sent = [0u8; 22];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut sent).await.unwrap();
        assert_eq!(&sent, b"0012host:track-devices");
    }
}
