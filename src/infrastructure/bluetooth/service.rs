//! Bluetooth Service Module
//!
//! Central dispatcher: routes user commands and bridge signals to the
//! permission gate, lifecycle manager, scanner and connection controller.
//!
//! Meant to run on a `current_thread` runtime, so handlers interleave only at
//! their `.await` points. Each command or signal kind runs as its own task;
//! a newer task of the same kind aborts an unfinished older one.

use crate::domain::models::{BluetoothCommand, Peripheral};
use crate::domain::settings::BleSettings;
use crate::domain::store::{Store, StoreReader};
use crate::infrastructure::bluetooth::{
    connection::ConnectionController,
    events::{EventBridge, Signal, SignalKind, Throttle},
    lifecycle::AdapterLifecycle,
    native::{NativeAdapter, PermissionsProvider},
    permissions::PermissionGate,
    scanner::ScanController,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TaskKey {
    Init,
    CheckPermissions,
    RequestPermissions,
    Enable,
    StartManager,
    StateUpdate,
    AdapterName,
    StartScan,
    StopScan,
    RefreshDevices,
    Disconnect,
    Signal(SignalKind),
}

/// Cloneable front door for the application: send commands, read state
#[derive(Clone)]
pub struct BluetoothHandle {
    commands: mpsc::UnboundedSender<BluetoothCommand>,
    reader: StoreReader,
}

impl BluetoothHandle {
    pub fn new(commands: mpsc::UnboundedSender<BluetoothCommand>, reader: StoreReader) -> Self {
        Self { commands, reader }
    }

    /// Returns false once the dispatcher has stopped
    pub fn send(&self, command: BluetoothCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn state(&self) -> &StoreReader {
        &self.reader
    }
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    dispatcher: Dispatcher,
    /// Follow-up commands queued by the components themselves
    loopback: mpsc::UnboundedReceiver<BluetoothCommand>,
}

struct Dispatcher {
    gate: Arc<PermissionGate>,
    lifecycle: Arc<AdapterLifecycle>,
    scanner: Arc<ScanController>,
    connection: Arc<ConnectionController>,
    state_updates: Throttle<()>,
    tasks: HashMap<TaskKey, JoinHandle<()>>,
    connects: Vec<JoinHandle<()>>,
}

impl BluetoothService {
    /// Wire the components around a fresh store
    pub fn new(
        adapter: Arc<dyn NativeAdapter>,
        permissions: Arc<dyn PermissionsProvider>,
        settings: BleSettings,
    ) -> (Self, StoreReader) {
        let (reader, writers) = Store::new().split();
        let (loopback_tx, loopback) = mpsc::unbounded_channel();
        let platform = adapter.platform();
        let state_update_window = settings.state_update_throttle();

        let gate = PermissionGate::new(permissions, platform, writers.permissions);
        let lifecycle =
            AdapterLifecycle::new(adapter.clone(), writers.adapter, loopback_tx.clone());
        let scanner = ScanController::new(
            adapter.clone(),
            writers.scan,
            settings.clone(),
            loopback_tx.clone(),
        );
        let connection =
            ConnectionController::new(adapter, writers.connection, settings, loopback_tx);

        let dispatcher = Dispatcher {
            gate: Arc::new(gate),
            lifecycle: Arc::new(lifecycle),
            scanner: Arc::new(scanner),
            connection: Arc::new(connection),
            state_updates: Throttle::new(state_update_window),
            tasks: HashMap::new(),
            connects: Vec::new(),
        };
        (
            Self {
                dispatcher,
                loopback,
            },
            reader,
        )
    }

    /// Process commands and signals in arrival order until every sender of
    /// `commands` is dropped
    pub async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<BluetoothCommand>,
        mut bridge: EventBridge,
    ) {
        let Self {
            mut dispatcher,
            mut loopback,
        } = self;

        info!("Bluetooth dispatcher running");
        let mut bridge_open = true;
        loop {
            let deadline = dispatcher.state_updates.deadline();
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    if dispatcher.state_updates.take_due(Instant::now()).is_some() {
                        dispatcher.spawn_state_check();
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => dispatcher.dispatch_command(command),
                    None => break,
                },
                Some(command) = loopback.recv() => dispatcher.dispatch_command(command),
                signal = bridge.next_signal(), if bridge_open => match signal {
                    Some(signal) => dispatcher.dispatch_signal(signal),
                    None => {
                        debug!("adapter notification channel closed");
                        bridge_open = false;
                    }
                },
            }
        }

        dispatcher.abort_all();
        info!("Bluetooth dispatcher stopped");
    }
}

impl Dispatcher {
    fn dispatch_command(&mut self, command: BluetoothCommand) {
        debug!("command: {:?}", command);
        match command {
            BluetoothCommand::Init => {
                let gate = self.gate.clone();
                let lifecycle = self.lifecycle.clone();
                self.spawn_latest(TaskKey::Init, async move {
                    gate.refresh().await;
                    lifecycle.enable().await;
                    lifecycle.start().await;
                });
            }
            BluetoothCommand::Shutdown | BluetoothCommand::Disable => self.reset_all(),
            BluetoothCommand::CheckPermissions => {
                let gate = self.gate.clone();
                self.spawn_latest(TaskKey::CheckPermissions, async move {
                    gate.refresh().await;
                });
            }
            BluetoothCommand::RequestPermissions => {
                let gate = self.gate.clone();
                self.spawn_latest(TaskKey::RequestPermissions, async move {
                    gate.request_permissions().await;
                });
            }
            BluetoothCommand::Enable => {
                let lifecycle = self.lifecycle.clone();
                self.spawn_latest(TaskKey::Enable, async move { lifecycle.enable().await });
            }
            BluetoothCommand::Toggle => self.lifecycle.toggle(),
            BluetoothCommand::StartManager => {
                let lifecycle = self.lifecycle.clone();
                self.spawn_latest(TaskKey::StartManager, async move { lifecycle.start().await });
            }
            BluetoothCommand::RequestStateUpdate => {
                if self.state_updates.offer((), Instant::now()).is_some() {
                    self.spawn_state_check();
                } else {
                    debug!("state update throttled");
                }
            }
            BluetoothCommand::SetAdapterName(name) => {
                let lifecycle = self.lifecycle.clone();
                self.spawn_latest(TaskKey::AdapterName, async move {
                    lifecycle.set_adapter_name(&name).await;
                });
            }
            BluetoothCommand::StartScan => {
                let scanner = self.scanner.clone();
                self.spawn_latest(TaskKey::StartScan, async move { scanner.start_scan().await });
            }
            BluetoothCommand::StopScan => {
                let scanner = self.scanner.clone();
                self.spawn_latest(TaskKey::StopScan, async move { scanner.stop_scan().await });
            }
            BluetoothCommand::RefreshDevices => {
                let scanner = self.scanner.clone();
                self.spawn_latest(TaskKey::RefreshDevices, async move {
                    scanner.refresh_devices().await;
                });
            }
            BluetoothCommand::Connect(peripheral) => self.spawn_connect(peripheral),
            BluetoothCommand::Disconnect(id) => {
                let connection = self.connection.clone();
                self.spawn_latest(TaskKey::Disconnect, async move {
                    connection.disconnect(&id).await;
                });
            }
        }
    }

    fn dispatch_signal(&mut self, signal: Signal) {
        debug!("signal: {:?}", signal.kind());
        let key = TaskKey::Signal(signal.kind());
        match signal {
            Signal::ScanStopped(reason) => {
                let scanner = self.scanner.clone();
                self.spawn_latest(key, async move { scanner.on_scan_stopped(reason).await });
            }
            Signal::DeviceDiscovered(peripheral) => self.scanner.on_device_discovered(&peripheral),
            Signal::StateChanged(state) => self.lifecycle.apply_notification(&state),
            Signal::DeviceConnected(notification) => {
                let connection = self.connection.clone();
                self.spawn_latest(key, async move {
                    let _ = connection.on_connected(&notification).await;
                });
            }
            Signal::DeviceDisconnected(notification) => {
                let connection = self.connection.clone();
                let scanner = self.scanner.clone();
                self.spawn_latest(key, async move {
                    connection.on_disconnected(&notification);
                    scanner.reconcile_devices().await;
                });
            }
            Signal::CharacteristicValue(value) => self.connection.on_characteristic_value(value),
        }
    }

    fn spawn_latest<F>(&mut self, key: TaskKey, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = self.tasks.insert(key, tokio::spawn(task)) {
            if !previous.is_finished() {
                debug!("superseding unfinished {:?} task", key);
                previous.abort();
            }
        }
    }

    /// Connects are never superseded; the controller rejects overlapping ones
    fn spawn_connect(&mut self, peripheral: Peripheral) {
        self.connects.retain(|task| !task.is_finished());
        let connection = self.connection.clone();
        self.connects.push(tokio::spawn(async move {
            let _ = connection.connect(&peripheral).await;
        }));
    }

    fn spawn_state_check(&mut self) {
        let lifecycle = self.lifecycle.clone();
        self.spawn_latest(TaskKey::StateUpdate, async move {
            lifecycle.check_state().await;
        });
    }

    fn abort_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        for task in self.connects.drain(..) {
            task.abort();
        }
    }

    fn reset_all(&mut self) {
        info!("Resetting Bluetooth state");
        self.abort_all();
        self.lifecycle.disable();
        self.scanner.reset();
        self.connection.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        AdapterNotification, AdapterState, BluetoothState, ConnectionState, PermissionStatus,
        PeripheralNotification, Platform,
    };
    use crate::infrastructure::bluetooth::simulated::{
        AdapterCall, SimOp, SimulatedAdapter, SimulatedPermissions,
    };

    const LIMIT: Duration = Duration::from_secs(60);

    struct Harness {
        adapter: Arc<SimulatedAdapter>,
        handle: BluetoothHandle,
        runner: JoinHandle<()>,
    }

    fn harness(
        adapter_for: impl FnOnce(mpsc::UnboundedSender<AdapterNotification>) -> SimulatedAdapter,
        permissions: SimulatedPermissions,
    ) -> Harness {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(adapter_for(notify_tx));
        let settings = BleSettings::default();
        let bridge = EventBridge::new(notify_rx, settings.discovery_throttle());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (service, reader) =
            BluetoothService::new(adapter.clone(), Arc::new(permissions), settings);
        let handle = BluetoothHandle::new(cmd_tx, reader);
        let runner = tokio::spawn(service.run(cmd_rx, bridge));
        Harness {
            adapter,
            handle,
            runner,
        }
    }

    fn quiet_android(tx: mpsc::UnboundedSender<AdapterNotification>) -> SimulatedAdapter {
        SimulatedAdapter::new(Platform::Android, tx)
    }

    impl Harness {
        async fn wait(
            &self,
            what: &str,
            pred: impl FnMut(&BluetoothState) -> bool,
        ) -> BluetoothState {
            match self.handle.state().wait_for(LIMIT, pred).await {
                Some(state) => state,
                None => panic!(
                    "timed out waiting for {}: {:?}",
                    what,
                    self.handle.state().snapshot()
                ),
            }
        }

        async fn ready(&self) {
            self.handle.send(BluetoothCommand::Init);
            self.wait("adapter ready", |s| s.adapter.started && s.adapter.state == AdapterState::On)
                .await;
        }

        fn count(&self, pred: impl Fn(&AdapterCall) -> bool) -> usize {
            self.adapter.count_calls(pred)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_scan_with_sample_adapter() {
        let h = harness(
            |tx| SimulatedAdapter::with_sample_data(Platform::Android, tx),
            SimulatedPermissions::granted(),
        );
        h.ready().await;

        h.handle.send(BluetoothCommand::StartScan);
        h.wait("scan start", |s| s.scan.is_scanning).await;
        let state = h
            .wait("scan end", |s| !s.scan.is_scanning && s.scan.devices.len() == 3)
            .await;
        assert_eq!(state.scan.devices["C4:7F:51:00:00:03"].name, "<unknown>");
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_permissions_block_scanning() {
        let h = harness(quiet_android, SimulatedPermissions::answering(PermissionStatus::Denied));
        h.ready().await;
        assert!(!h.handle.state().snapshot().permissions.is_complete());

        h.handle.send(BluetoothCommand::StartScan);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!h.handle.state().snapshot().scan.is_scanning);
        assert_eq!(h.count(|c| matches!(c, AdapterCall::Scan { .. })), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_stop_reconciles_with_adapter_cache() {
        let h = harness(quiet_android, SimulatedPermissions::granted());
        h.ready().await;

        h.handle.send(BluetoothCommand::StartScan);
        h.wait("scan start", |s| s.scan.is_scanning).await;
        for id in ["A", "B", "C"] {
            h.adapter.emit(AdapterNotification::DeviceDiscovered(Peripheral::new(id, None, None)));
        }
        h.handle.send(BluetoothCommand::StopScan);
        h.adapter.set_cache(vec![
            Peripheral::new("A", None, None),
            Peripheral::new("C", None, None),
        ]);
        h.adapter.emit(AdapterNotification::ScanStopped(0));

        let state = h
            .wait("reconciled", |s| {
                !s.scan.is_scanning && s.scan.devices.keys().map(String::as_str).eq(["A", "C"])
            })
            .await;
        assert_eq!(state.scan.devices.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_disconnect_round_trip() {
        let h = harness(
            |tx| SimulatedAdapter::with_sample_data(Platform::Ios, tx),
            SimulatedPermissions::granted(),
        );
        h.ready().await;

        let target = Peripheral::new("C4:7F:51:00:00:01", Some("Heart Rate Strap"), Some(-58));
        h.handle.send(BluetoothCommand::Connect(target.clone()));
        let state = h
            .wait("connected", |s| matches!(s.connection.state, ConnectionState::Connected { .. }))
            .await;
        assert_eq!(state.connection.state.device_id(), Some(target.id.as_str()));

        h.handle.send(BluetoothCommand::Disconnect(target.id.clone()));
        h.wait("idle", |s| s.connection.state.is_idle() && !s.connection.busy)
            .await;
        assert_eq!(h.count(|c| *c == AdapterCall::Disconnect(target.id.clone())), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_connected_device_skips_connect() {
        let h = harness(quiet_android, SimulatedPermissions::granted());
        h.ready().await;
        h.adapter.set_connected("X", true);

        h.handle.send(BluetoothCommand::Connect(Peripheral::new("X", None, None)));
        h.wait("connected", |s| matches!(s.connection.state, ConnectionState::Connected { .. }))
            .await;

        assert_eq!(h.count(|c| matches!(c, AdapterCall::Connect(_))), 0);
        assert_eq!(h.count(|c| *c == AdapterCall::RetrieveServices("X".to_string())), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_disconnect_notification_resets_and_reenumerates() {
        let h = harness(quiet_android, SimulatedPermissions::granted());
        h.ready().await;
        h.adapter.set_connected("X", true);
        h.handle.send(BluetoothCommand::Connect(Peripheral::new("X", None, None)));
        h.wait("connected", |s| matches!(s.connection.state, ConnectionState::Connected { .. }))
            .await;

        h.adapter.set_cache(vec![Peripheral::new("Q", None, None)]);
        h.adapter
            .emit(AdapterNotification::DeviceDisconnected(PeripheralNotification::new("other")));

        let state = h
            .wait("reset", |s| s.connection.state.is_idle() && s.scan.devices.contains_key("Q"))
            .await;
        assert_eq!(state.scan.devices.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_updates_are_throttled() {
        let h = harness(quiet_android, SimulatedPermissions::granted());
        h.ready().await;
        // let the check queued by a successful start go out and its window close
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.adapter.clear_calls();

        for _ in 0..3 {
            h.handle.send(BluetoothCommand::RequestStateUpdate);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.count(|c| *c == AdapterCall::CheckState), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.count(|c| *c == AdapterCall::CheckState), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_signal_aborts_unfinished_handler() {
        let h = harness(quiet_android, SimulatedPermissions::granted());
        h.ready().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.adapter.clear_calls();
        h.adapter.hang(SimOp::DiscoveredDevices);

        h.adapter.emit(AdapterNotification::ScanStopped(0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.adapter.set_cache(vec![Peripheral::new("B", None, None)]);
        h.adapter.emit(AdapterNotification::ScanStopped(0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.count(|c| *c == AdapterCall::DiscoveredDevices), 2);

        h.adapter.heal();
        tokio::time::sleep(Duration::from_secs(3)).await;

        // only the second handler finished and asked for a state update
        assert_eq!(h.count(|c| *c == AdapterCall::CheckState), 1);
        assert!(h.handle.state().snapshot().scan.devices.contains_key("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_command_aborts_unfinished_task() {
        let h = harness(quiet_android, SimulatedPermissions::granted());
        h.ready().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.adapter.clear_calls();
        h.adapter.hang(SimOp::IsConnected);

        h.handle.send(BluetoothCommand::Disconnect("A".to_string()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.handle.send(BluetoothCommand::Disconnect("B".to_string()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.count(|c| matches!(c, AdapterCall::IsConnected(_))), 2);

        h.adapter.heal();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(h.count(|c| *c == AdapterCall::CheckState), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_off_resets_every_slice() {
        let h = harness(quiet_android, SimulatedPermissions::granted());
        h.ready().await;
        h.adapter
            .emit(AdapterNotification::DeviceDiscovered(Peripheral::new("A", None, None)));
        h.wait("discovered", |s| !s.scan.devices.is_empty()).await;

        h.handle.send(BluetoothCommand::Toggle);
        let state = h
            .wait("reset", |s| !s.adapter.started && s.adapter.state == AdapterState::Off)
            .await;
        assert!(state.scan.devices.is_empty());
        assert!(state.connection.state.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_stops_when_handles_drop() {
        let Harness {
            adapter: _adapter,
            handle,
            runner,
        } = harness(quiet_android, SimulatedPermissions::granted());
        drop(handle);
        tokio::time::timeout(LIMIT, runner)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
    }
}
