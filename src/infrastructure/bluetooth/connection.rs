//! BLE Connection Module
//!
//! Connect/disconnect requests for a single peripheral and reconciliation of
//! the adapter's connect/disconnect notifications.

use crate::domain::models::{
    now_millis, BluetoothCommand, CharacteristicValue, ConnectionSlice, ConnectionState,
    DiscoveredDevice, Peripheral, PeripheralNotification, ServiceDescriptor,
};
use crate::domain::settings::BleSettings;
use crate::domain::store::SliceWriter;
use crate::infrastructure::bluetooth::native::{BleError, BleResult, NativeAdapter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct ConnectionController {
    adapter: Arc<dyn NativeAdapter>,
    writer: SliceWriter<ConnectionSlice>,
    settings: BleSettings,
    commands: mpsc::UnboundedSender<BluetoothCommand>,
}

impl ConnectionController {
    pub fn new(
        adapter: Arc<dyn NativeAdapter>,
        writer: SliceWriter<ConnectionSlice>,
        settings: BleSettings,
        commands: mpsc::UnboundedSender<BluetoothCommand>,
    ) -> Self {
        Self {
            adapter,
            writer,
            settings,
            commands,
        }
    }

    /// Request a connection to `peripheral`.
    ///
    /// Success only means the request went out; the handshake completes when
    /// the adapter's connected notification is handled by [`Self::on_connected`].
    pub async fn connect(&self, peripheral: &Peripheral) -> BleResult<()> {
        let device = DiscoveredDevice::from_peripheral(
            peripheral,
            &self.settings.unknown_device_name,
            now_millis(),
        );

        let claimed = self.writer.update(|c| {
            if let ConnectionState::Connecting { device: current } = &c.state {
                return Err(current.id.clone());
            }
            c.state = ConnectionState::Connecting {
                device: device.clone(),
            };
            Ok(())
        });
        if let Err(current) = claimed {
            warn!(
                "Ignoring connect to {} while connecting to {}",
                device.id, current
            );
            return Err(BleError::ConnectInFlight(current));
        }
        info!("Connecting to Bluetooth device: {}", device.id);

        match self.adapter.is_connected(&device.id).await {
            Ok(true) => {
                debug!("BT already connected to {}", device.id);
                return self.complete_connection(device).await;
            }
            Ok(false) => {}
            Err(e) => {
                error!("Error checking if device is connected: {}", e);
                self.clear();
                return Err(e);
            }
        }

        let result = if self.adapter.platform().connect_needs_client_timeout() {
            match tokio::time::timeout(
                self.settings.connect_timeout(),
                self.adapter.connect(&device.id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    debug!("connection to {} timed out", device.id);
                    Err(BleError::Timeout)
                }
            }
        } else {
            self.adapter.connect(&device.id).await
        };

        if let Err(e) = result {
            error!("Error connecting to device {}: {}", device.id, e);
            self.clear();
            return Err(e);
        }
        self.await_handshake(&device.id).await
    }

    /// The connected notification may never arrive; the claim on the slice
    /// is released after `connect_timeout` either way.
    async fn await_handshake(&self, id: &str) -> BleResult<()> {
        let limit = self.settings.connect_timeout();
        let settled = self
            .writer
            .wait_until(limit, |c| !Self::is_connecting_to(&c.state, id))
            .await;
        if !settled {
            warn!("No connected notification from {} within {:?}", id, limit);
            self.abandon(id);
            return Err(BleError::Timeout);
        }
        match self.writer.read().state {
            ConnectionState::Connected { device, .. } if device.id == id => Ok(()),
            _ => Err(BleError::NotConnected(id.to_string())),
        }
    }

    fn is_connecting_to(state: &ConnectionState, id: &str) -> bool {
        matches!(state, ConnectionState::Connecting { device } if device.id == id)
    }

    /// Handle the adapter's connected notification
    pub async fn on_connected(&self, notification: &PeripheralNotification) -> BleResult<()> {
        let id = notification.peripheral.as_str();
        let known = self.writer.state().scan.devices.get(id).cloned();
        let device = self.writer.update(|c| {
            let device = match &c.state {
                ConnectionState::Connecting { device } | ConnectionState::Connected { device, .. }
                    if device.id == id =>
                {
                    device.clone()
                }
                _ => known.unwrap_or_else(|| {
                    DiscoveredDevice::from_peripheral(
                        &Peripheral::new(id, None, None),
                        &self.settings.unknown_device_name,
                        now_millis(),
                    )
                }),
            };
            c.state = ConnectionState::Connecting {
                device: device.clone(),
            };
            device
        });
        self.complete_connection(device).await
    }

    /// Verify the adapter really lists the device as connected, then fetch its services
    async fn complete_connection(&self, device: DiscoveredDevice) -> BleResult<()> {
        match self.verified_services(&device.id).await {
            Ok(services) => {
                info!(
                    "Connected to {} ({} services)",
                    device.id,
                    services.services.len()
                );
                self.writer
                    .update(|c| c.state = ConnectionState::Connected { device, services });
                Ok(())
            }
            Err(e) => {
                error!("Error retrieving services for {}: {}", device.id, e);
                self.clear();
                Err(e)
            }
        }
    }

    async fn verified_services(&self, id: &str) -> BleResult<ServiceDescriptor> {
        let connected = self
            .adapter
            .connected_devices(&self.settings.service_uuids)
            .await?;
        if !connected.iter().any(|p| p.id == id) {
            return Err(BleError::StaleNotification(id.to_string()));
        }
        debug!("peripheral {} found in connected peripherals", id);
        self.adapter.retrieve_services(id).await
    }

    pub async fn disconnect(&self, peripheral_id: &str) {
        match self.adapter.is_connected(peripheral_id).await {
            Ok(true) => {
                self.writer.update(|c| c.busy = true);
                if let Err(e) = self.adapter.disconnect(peripheral_id).await {
                    error!("Error disconnecting from device {}: {}", peripheral_id, e);
                }
                self.writer.update(|c| c.busy = false);
                self.abandon(peripheral_id);
            }
            Ok(false) => {
                debug!("device {} is not connected", peripheral_id);
                self.clear();
            }
            Err(e) => {
                error!("Error checking if device is connected: {}", e);
                self.clear();
            }
        }
        let _ = self.commands.send(BluetoothCommand::RequestStateUpdate);
    }

    /// The notification is trusted at face value, whichever device it names
    pub fn on_disconnected(&self, notification: &PeripheralNotification) {
        info!(
            "Disconnected from {} (status {:?})",
            notification.peripheral, notification.status
        );
        self.writer.update(|c| {
            c.state = ConnectionState::Idle;
            c.last_value = None;
        });
    }

    pub fn on_characteristic_value(&self, value: CharacteristicValue) {
        self.writer.update(|c| {
            if let ConnectionState::Connected { device, .. } = &mut c.state {
                if device.id == value.peripheral {
                    device.last_seen = now_millis();
                }
            }
            c.last_value = Some(value);
        });
    }

    pub fn reset(&self) {
        self.writer.replace(ConnectionSlice::default());
    }

    /// Drop a pending connection to `peripheral_id`, leaving any other state alone
    fn abandon(&self, peripheral_id: &str) {
        self.writer.update(|c| {
            if Self::is_connecting_to(&c.state, peripheral_id) {
                c.state = ConnectionState::Idle;
            }
        });
    }

    fn clear(&self) {
        self.writer.update(|c| {
            c.state = ConnectionState::Idle;
            c.busy = false;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Platform;
    use crate::domain::store::{Store, StoreReader};
    use crate::infrastructure::bluetooth::simulated::{AdapterCall, SimOp, SimulatedAdapter};
    use std::time::Duration;

    struct Fixture {
        adapter: Arc<SimulatedAdapter>,
        controller: ConnectionController,
        reader: StoreReader,
        commands: mpsc::UnboundedReceiver<BluetoothCommand>,
    }

    fn fixture(platform: Platform) -> Fixture {
        let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(SimulatedAdapter::new(platform, notify_tx));
        let (reader, writers) = Store::new().split();
        let (cmd_tx, commands) = mpsc::unbounded_channel();
        let controller = ConnectionController::new(
            adapter.clone(),
            writers.connection,
            BleSettings::default(),
            cmd_tx,
        );
        Fixture {
            adapter,
            controller,
            reader,
            commands,
        }
    }

    fn connection(reader: &StoreReader) -> ConnectionState {
        reader.snapshot().connection.state
    }

    #[tokio::test]
    async fn test_already_connected_skips_connect_call() {
        let f = fixture(Platform::Android);
        f.adapter.set_connected("X", true);

        f.controller
            .connect(&Peripheral::new("X", Some("Strap"), Some(-40)))
            .await
            .unwrap();

        assert_eq!(f.adapter.count_calls(|c| matches!(c, AdapterCall::Connect(_))), 0);
        assert_eq!(
            f.adapter.count_calls(|c| *c == AdapterCall::RetrieveServices("X".to_string())),
            1
        );
        match connection(&f.reader) {
            ConnectionState::Connected { device, services } => {
                assert_eq!(device.name, "Strap");
                assert_eq!(services.peripheral_id, "X");
            }
            other => panic!("expected connected, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_completes_on_notification() {
        let f = fixture(Platform::Android);
        let target = Peripheral::new("X", None, None);

        let (connected, ()) = tokio::join!(f.controller.connect(&target), async {
            tokio::task::yield_now().await;
            assert!(connection(&f.reader).is_connecting());
            f.controller
                .on_connected(&PeripheralNotification::new("X"))
                .await
                .unwrap();
        });

        assert_eq!(connected, Ok(()));
        assert!(matches!(connection(&f.reader), ConnectionState::Connected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connected_notification_releases_claim() {
        let f = fixture(Platform::Android);

        let started = tokio::time::Instant::now();
        let result = f.controller.connect(&Peripheral::new("X", None, None)).await;

        assert_eq!(result, Err(BleError::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(10_000));
        assert_eq!(connection(&f.reader), ConnectionState::Idle);

        // a retry is accepted again
        f.adapter.set_connected("Y", true);
        f.controller
            .connect(&Peripheral::new("Y", None, None))
            .await
            .unwrap();
        assert_eq!(connection(&f.reader).device_id(), Some("Y"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_connection() {
        let f = fixture(Platform::Android);
        let target = Peripheral::new("X", None, None);

        let (connected, ()) = tokio::join!(f.controller.connect(&target), async {
            tokio::task::yield_now().await;
            f.controller.disconnect("X").await;
        });

        assert_eq!(connected, Err(BleError::NotConnected("X".to_string())));
        assert_eq!(connection(&f.reader), ConnectionState::Idle);
        assert_eq!(
            f.adapter.count_calls(|c| *c == AdapterCall::Disconnect("X".to_string())),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ios_connect_timeout_returns_to_idle() {
        let f = fixture(Platform::Ios);
        f.adapter.hang(SimOp::Connect);

        let result = f.controller.connect(&Peripheral::new("X", None, None)).await;

        assert_eq!(result, Err(BleError::Timeout));
        assert_eq!(connection(&f.reader), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_android_connect_has_no_client_timer() {
        let f = fixture(Platform::Android);
        f.adapter.hang(SimOp::Connect);

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            f.controller.connect(&Peripheral::new("X", None, None)),
        )
        .await;

        assert!(outcome.is_err());
        assert!(connection(&f.reader).is_connecting());
    }

    #[tokio::test]
    async fn test_connect_failure_clears_state() {
        let f = fixture(Platform::Android);
        f.adapter.fail(SimOp::Connect);
        let result = f.controller.connect(&Peripheral::new("X", None, None)).await;
        assert!(matches!(result, Err(BleError::Native(_))));
        assert_eq!(connection(&f.reader), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_rejected_while_in_flight() {
        let f = fixture(Platform::Ios);
        f.adapter.hang(SimOp::Connect);

        let first_target = Peripheral::new("X", None, None);
        let second_target = Peripheral::new("Y", None, None);
        let (first, second) = tokio::join!(
            f.controller.connect(&first_target),
            async {
                tokio::task::yield_now().await;
                let second = f.controller.connect(&second_target).await;
                // the first target is still the only one in flight
                assert_eq!(connection(&f.reader).device_id(), Some("X"));
                second
            }
        );

        assert_eq!(second, Err(BleError::ConnectInFlight("X".to_string())));
        assert_eq!(first, Err(BleError::Timeout));
        assert_eq!(
            f.adapter.count_calls(|c| *c == AdapterCall::IsConnected("Y".to_string())),
            0
        );
    }

    #[tokio::test]
    async fn test_stale_connected_notification_is_failure() {
        let f = fixture(Platform::Android);
        let result = f
            .controller
            .on_connected(&PeripheralNotification::new("ghost"))
            .await;

        assert_eq!(result, Err(BleError::StaleNotification("ghost".to_string())));
        assert_eq!(connection(&f.reader), ConnectionState::Idle);
        assert_eq!(
            f.adapter.count_calls(|c| matches!(c, AdapterCall::RetrieveServices(_))),
            0
        );
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected_is_noop() {
        let mut f = fixture(Platform::Android);
        f.controller.disconnect("X").await;

        assert_eq!(f.adapter.count_calls(|c| matches!(c, AdapterCall::Disconnect(_))), 0);
        assert_eq!(connection(&f.reader), ConnectionState::Idle);
        assert_eq!(f.commands.try_recv().ok(), Some(BluetoothCommand::RequestStateUpdate));
    }

    #[tokio::test]
    async fn test_disconnect_connected_device() {
        let mut f = fixture(Platform::Android);
        f.adapter.set_connected("X", true);
        f.adapter.fail(SimOp::Disconnect);

        f.controller.disconnect("X").await;

        assert_eq!(
            f.adapter.count_calls(|c| *c == AdapterCall::Disconnect("X".to_string())),
            1
        );
        assert!(!f.reader.snapshot().connection.busy);
        assert_eq!(f.commands.try_recv().ok(), Some(BluetoothCommand::RequestStateUpdate));
    }

    #[tokio::test]
    async fn test_disconnect_notification_for_other_device_still_clears() {
        let f = fixture(Platform::Android);
        f.adapter.set_connected("X", true);
        f.controller
            .connect(&Peripheral::new("X", None, None))
            .await
            .unwrap();
        assert!(matches!(connection(&f.reader), ConnectionState::Connected { .. }));

        f.controller.on_disconnected(&PeripheralNotification::new("Z"));

        assert_eq!(connection(&f.reader), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_characteristic_value_touches_connected_device() {
        let f = fixture(Platform::Android);
        f.adapter.set_connected("X", true);
        f.controller
            .connect(&Peripheral::new("X", None, None))
            .await
            .unwrap();

        f.controller.on_characteristic_value(CharacteristicValue {
            peripheral: "X".to_string(),
            service: "180f".to_string(),
            characteristic: "2a19".to_string(),
            value: vec![87],
        });

        let slice = f.reader.snapshot().connection;
        assert_eq!(slice.last_value.map(|v| v.value), Some(vec![87]));
    }
}
