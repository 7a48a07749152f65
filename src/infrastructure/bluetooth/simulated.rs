//! Simulated Adapter
//!
//! In-memory stand-in for the native BLE plugin and the permission
//! subsystem. Every command is recorded so callers can check which native
//! calls were (or were not) issued, and individual commands can be made to
//! fail or hang.

use crate::domain::models::{
    AdapterNotification, CharacteristicDescriptor, PeripheralNotification, PermissionStatus,
    Peripheral, Platform, ServiceDescriptor,
};
use crate::infrastructure::bluetooth::native::{
    BleError, BleResult, NativeAdapter, PermissionsProvider, StartOptions,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Scan-stop reason code the native layer uses when the scan duration elapsed
pub const SCAN_STOP_TIMEOUT_REASON: i32 = 10;

/// Battery service advertised by every simulated peripheral
pub const BATTERY_SERVICE_UUID: &str = "180f";
pub const BATTERY_LEVEL_CHAR_UUID: &str = "2a19";

/// A native command as recorded by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Enable,
    Start(StartOptions),
    CheckState,
    Scan {
        service_uuids: Vec<String>,
        duration_secs: u32,
        allow_duplicates: bool,
    },
    StopScan,
    DiscoveredDevices,
    ConnectedDevices,
    IsConnected(String),
    Connect(String),
    Disconnect(String),
    RetrieveServices(String),
    SetName(String),
}

/// Commands that can be scripted to fail or hang
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Enable,
    Start,
    CheckState,
    Scan,
    StopScan,
    DiscoveredDevices,
    ConnectedDevices,
    IsConnected,
    Connect,
    Disconnect,
    RetrieveServices,
    SetName,
}

#[derive(Default)]
struct SimState {
    powered: bool,
    /// Peripherals currently advertising in range
    in_range: Vec<Peripheral>,
    /// What `discovered_devices` reports
    cache: Vec<Peripheral>,
    connected: BTreeSet<String>,
    calls: Vec<AdapterCall>,
    failing: HashSet<SimOp>,
    hanging: HashSet<SimOp>,
    auto_notify: bool,
}

pub struct SimulatedAdapter {
    platform: Platform,
    notifier: mpsc::UnboundedSender<AdapterNotification>,
    inner: Mutex<SimState>,
    /// Wakes hung calls after `heal`
    released: Notify,
}

impl SimulatedAdapter {
    pub fn new(platform: Platform, notifier: mpsc::UnboundedSender<AdapterNotification>) -> Self {
        Self {
            platform,
            notifier,
            inner: Mutex::new(SimState::default()),
            released: Notify::new(),
        }
    }

    /// An adapter that behaves like real hardware: peripherals in range,
    /// notifications emitted for scans, connects and disconnects.
    pub fn with_sample_data(
        platform: Platform,
        notifier: mpsc::UnboundedSender<AdapterNotification>,
    ) -> Self {
        let adapter = Self::new(platform, notifier);
        {
            let mut inner = adapter.lock();
            inner.auto_notify = true;
            inner.in_range = vec![
                Peripheral::new("C4:7F:51:00:00:01", Some("Heart Rate Strap"), Some(-58)),
                Peripheral::new("C4:7F:51:00:00:02", Some("Bike Cadence"), Some(-71)),
                Peripheral::new("C4:7F:51:00:00:03", None, Some(-90)),
            ];
        }
        adapter
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge the simulator for the others
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_auto_notify(&self, enabled: bool) {
        self.lock().auto_notify = enabled;
    }

    pub fn set_powered(&self, powered: bool) {
        self.lock().powered = powered;
    }

    pub fn set_in_range(&self, peripherals: Vec<Peripheral>) {
        self.lock().in_range = peripherals;
    }

    /// Overwrite the adapter's discovered-device cache
    pub fn set_cache(&self, peripherals: Vec<Peripheral>) {
        self.lock().cache = peripherals;
    }

    pub fn set_connected(&self, peripheral_id: &str, connected: bool) {
        let mut inner = self.lock();
        if connected {
            inner.connected.insert(peripheral_id.to_string());
        } else {
            inner.connected.remove(peripheral_id);
        }
    }

    pub fn fail(&self, op: SimOp) {
        self.lock().failing.insert(op);
    }

    pub fn hang(&self, op: SimOp) {
        self.lock().hanging.insert(op);
    }

    /// Clear scripted failures and let hung calls continue
    pub fn heal(&self) {
        {
            let mut inner = self.lock();
            inner.failing.clear();
            inner.hanging.clear();
        }
        self.released.notify_waiters();
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&AdapterCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Push a notification as if the native layer had fired it
    pub fn emit(&self, notification: AdapterNotification) {
        trace!("simulated notification: {:?}", notification);
        let _ = self.notifier.send(notification);
    }

    /// Record the call and decide whether it fails or hangs
    async fn enter(&self, call: AdapterCall, op: SimOp) -> BleResult<()> {
        {
            let mut inner = self.lock();
            debug!("native call: {:?}", call);
            inner.calls.push(call);
        }
        loop {
            // registered before the check so a concurrent `heal` is not missed
            let released = self.released.notified();
            if !self.lock().hanging.contains(&op) {
                break;
            }
            released.await;
        }
        if self.lock().failing.contains(&op) {
            return Err(BleError::Native(format!("simulated {:?} failure", op)));
        }
        Ok(())
    }

    fn auto_notify(&self) -> bool {
        self.lock().auto_notify
    }

    fn state_string(&self) -> &'static str {
        if self.lock().powered {
            "on"
        } else {
            "off"
        }
    }
}

#[async_trait]
impl NativeAdapter for SimulatedAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn enable(&self) -> BleResult<()> {
        self.enter(AdapterCall::Enable, SimOp::Enable).await?;
        self.lock().powered = true;
        if self.auto_notify() {
            self.emit(AdapterNotification::StateChanged("on".to_string()));
        }
        Ok(())
    }

    async fn start(&self, options: StartOptions) -> BleResult<()> {
        self.enter(AdapterCall::Start(options), SimOp::Start).await
    }

    async fn check_state(&self) -> BleResult<()> {
        self.enter(AdapterCall::CheckState, SimOp::CheckState).await?;
        self.emit(AdapterNotification::StateChanged(
            self.state_string().to_string(),
        ));
        Ok(())
    }

    async fn scan(
        &self,
        service_uuids: &[String],
        duration_secs: u32,
        allow_duplicates: bool,
    ) -> BleResult<()> {
        let call = AdapterCall::Scan {
            service_uuids: service_uuids.to_vec(),
            duration_secs,
            allow_duplicates,
        };
        self.enter(call, SimOp::Scan).await?;

        let (auto, found) = {
            let mut inner = self.lock();
            inner.cache = inner.in_range.clone();
            (inner.auto_notify, inner.in_range.clone())
        };
        if auto {
            let notifier = self.notifier.clone();
            let duration = Duration::from_secs(duration_secs as u64);
            tokio::spawn(async move {
                for peripheral in found {
                    let _ = notifier.send(AdapterNotification::DeviceDiscovered(peripheral));
                }
                tokio::time::sleep(duration).await;
                let _ = notifier.send(AdapterNotification::ScanStopped(SCAN_STOP_TIMEOUT_REASON));
            });
        }
        Ok(())
    }

    async fn stop_scan(&self) -> BleResult<()> {
        self.enter(AdapterCall::StopScan, SimOp::StopScan).await?;
        if self.auto_notify() {
            self.emit(AdapterNotification::ScanStopped(0));
        }
        Ok(())
    }

    async fn discovered_devices(&self) -> BleResult<Vec<Peripheral>> {
        self.enter(AdapterCall::DiscoveredDevices, SimOp::DiscoveredDevices)
            .await?;
        Ok(self.lock().cache.clone())
    }

    async fn connected_devices(&self, _service_uuids: &[String]) -> BleResult<Vec<Peripheral>> {
        self.enter(AdapterCall::ConnectedDevices, SimOp::ConnectedDevices)
            .await?;
        let inner = self.lock();
        let devices = inner
            .connected
            .iter()
            .map(|id| {
                inner
                    .cache
                    .iter()
                    .chain(inner.in_range.iter())
                    .find(|p| &p.id == id)
                    .cloned()
                    .unwrap_or_else(|| Peripheral::new(id.clone(), None, None))
            })
            .collect();
        Ok(devices)
    }

    async fn is_connected(&self, peripheral_id: &str) -> BleResult<bool> {
        self.enter(
            AdapterCall::IsConnected(peripheral_id.to_string()),
            SimOp::IsConnected,
        )
        .await?;
        Ok(self.lock().connected.contains(peripheral_id))
    }

    async fn connect(&self, peripheral_id: &str) -> BleResult<()> {
        self.enter(AdapterCall::Connect(peripheral_id.to_string()), SimOp::Connect)
            .await?;
        self.lock().connected.insert(peripheral_id.to_string());
        if self.auto_notify() {
            self.emit(AdapterNotification::DeviceConnected(
                PeripheralNotification::new(peripheral_id),
            ));
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral_id: &str) -> BleResult<()> {
        self.enter(
            AdapterCall::Disconnect(peripheral_id.to_string()),
            SimOp::Disconnect,
        )
        .await?;
        self.lock().connected.remove(peripheral_id);
        if self.auto_notify() {
            self.emit(AdapterNotification::DeviceDisconnected(
                PeripheralNotification::new(peripheral_id),
            ));
        }
        Ok(())
    }

    async fn retrieve_services(&self, peripheral_id: &str) -> BleResult<ServiceDescriptor> {
        self.enter(
            AdapterCall::RetrieveServices(peripheral_id.to_string()),
            SimOp::RetrieveServices,
        )
        .await?;
        if !self.lock().connected.contains(peripheral_id) {
            return Err(BleError::NotConnected(peripheral_id.to_string()));
        }
        Ok(ServiceDescriptor {
            peripheral_id: peripheral_id.to_string(),
            services: vec![BATTERY_SERVICE_UUID.to_string()],
            characteristics: vec![CharacteristicDescriptor {
                service: BATTERY_SERVICE_UUID.to_string(),
                characteristic: BATTERY_LEVEL_CHAR_UUID.to_string(),
                properties: vec!["Read".to_string(), "Notify".to_string()],
            }],
        })
    }

    async fn set_name(&self, name: &str) -> BleResult<()> {
        self.enter(AdapterCall::SetName(name.to_string()), SimOp::SetName)
            .await?;
        if !self.platform.supports_adapter_name() {
            return Err(BleError::Unsupported("set adapter name".to_string()));
        }
        Ok(())
    }
}

/// Permission subsystem with scripted answers
pub struct SimulatedPermissions {
    inner: Mutex<PermissionScript>,
}

struct PermissionScript {
    /// Status reported by `check` for ids that were never answered
    unanswered: PermissionStatus,
    current: BTreeMap<String, PermissionStatus>,
    /// What the user answers to a request prompt
    answer: PermissionStatus,
    checks: usize,
    requests: usize,
}

impl SimulatedPermissions {
    /// Every permission already granted
    pub fn granted() -> Self {
        Self::scripted(PermissionStatus::Granted, PermissionStatus::Granted)
    }

    /// Nothing granted yet; prompts are answered with `answer`
    pub fn answering(answer: PermissionStatus) -> Self {
        Self::scripted(PermissionStatus::Denied, answer)
    }

    fn scripted(unanswered: PermissionStatus, answer: PermissionStatus) -> Self {
        Self {
            inner: Mutex::new(PermissionScript {
                unanswered,
                current: BTreeMap::new(),
                answer,
                checks: 0,
                requests: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PermissionScript> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, id: &str, status: PermissionStatus) {
        self.lock().current.insert(id.to_string(), status);
    }

    pub fn checks(&self) -> usize {
        self.lock().checks
    }

    pub fn requests(&self) -> usize {
        self.lock().requests
    }
}

#[async_trait]
impl PermissionsProvider for SimulatedPermissions {
    async fn check(&self, ids: &[String]) -> BleResult<BTreeMap<String, PermissionStatus>> {
        let mut inner = self.lock();
        inner.checks += 1;
        Ok(ids
            .iter()
            .map(|id| {
                let status = inner.current.get(id).copied().unwrap_or(inner.unanswered);
                (id.clone(), status)
            })
            .collect())
    }

    async fn request(&self, ids: &[String]) -> BleResult<BTreeMap<String, PermissionStatus>> {
        let mut inner = self.lock();
        inner.requests += 1;
        let answer = inner.answer;
        for id in ids {
            inner.current.insert(id.clone(), answer);
        }
        Ok(ids.iter().map(|id| (id.clone(), answer)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> (SimulatedAdapter, mpsc::UnboundedReceiver<AdapterNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SimulatedAdapter::with_sample_data(Platform::Android, tx), rx)
    }

    #[tokio::test]
    async fn test_state_check_reports_power() {
        let (sim, mut rx) = adapter();
        sim.check_state().await.unwrap();
        sim.set_powered(true);
        sim.check_state().await.unwrap();

        assert_eq!(rx.try_recv().ok(), Some(AdapterNotification::StateChanged("off".to_string())));
        assert_eq!(rx.try_recv().ok(), Some(AdapterNotification::StateChanged("on".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_reports_peripherals_in_range() {
        let (sim, mut rx) = adapter();
        sim.set_in_range(vec![Peripheral::new("A", Some("Strap"), Some(-40))]);

        sim.scan(&[], 2, false).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(AdapterNotification::DeviceDiscovered(Peripheral::new(
                "A",
                Some("Strap"),
                Some(-40)
            )))
        );
        assert_eq!(
            rx.recv().await,
            Some(AdapterNotification::ScanStopped(SCAN_STOP_TIMEOUT_REASON))
        );
        assert_eq!(sim.discovered_devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_quiet_adapter_emits_nothing_on_connect() {
        let (sim, mut rx) = adapter();
        sim.set_auto_notify(false);

        sim.connect("A").await.unwrap();

        assert!(sim.is_connected("A").await.unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heal_releases_hung_call() {
        let (sim, _rx) = adapter();
        sim.hang(SimOp::Enable);
        sim.fail(SimOp::Enable);

        let (result, ()) = tokio::join!(sim.enable(), async {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            sim.heal();
        });

        assert_eq!(result, Ok(()));
        assert_eq!(sim.count_calls(|c| *c == AdapterCall::Enable), 1);
    }
}
