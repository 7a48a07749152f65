//! BLE Scanner Module
//!
//! Time-boxed discovery scans and the discovered-device collection.

use crate::domain::models::{
    now_millis, AdapterState, BluetoothCommand, DiscoveredDevice, Peripheral, ScanState,
};
use crate::domain::settings::BleSettings;
use crate::domain::store::SliceWriter;
use crate::infrastructure::bluetooth::native::NativeAdapter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub struct ScanController {
    adapter: Arc<dyn NativeAdapter>,
    writer: SliceWriter<ScanState>,
    settings: BleSettings,
    commands: mpsc::UnboundedSender<BluetoothCommand>,
}

impl ScanController {
    pub fn new(
        adapter: Arc<dyn NativeAdapter>,
        writer: SliceWriter<ScanState>,
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

    /// Start a scan if permissions, adapter power and lifecycle allow it.
    ///
    /// The native scan call races a guard timer of scan duration plus margin;
    /// if the guard fires first the scan is considered over locally.
    pub async fn start_scan(&self) {
        let state = self.writer.state();
        let can_scan = state.permissions.is_complete()
            && state.adapter.state == AdapterState::On
            && state.adapter.started;
        if !can_scan {
            debug!(
                "not currently able to scan (permissions: {}, adapter: {:?}, started: {})",
                state.permissions.is_complete(),
                state.adapter.state,
                state.adapter.started
            );
            return;
        }

        self.writer.update(|scan| {
            scan.is_scanning = true;
            scan.devices.clear();
        });
        info!(
            "Starting BLE scan for {}s (services: {:?})",
            self.settings.scan_duration_secs, self.settings.service_uuids
        );

        tokio::select! {
            result = self.adapter.scan(
                &self.settings.service_uuids,
                self.settings.scan_duration_secs,
                self.settings.allow_duplicates,
            ) => {
                if let Err(e) = result {
                    error!("Error scanning for bluetooth devices: {}", e);
                    self.writer.update(|scan| scan.is_scanning = false);
                }
            }
            _ = tokio::time::sleep(self.settings.scan_guard_timeout()) => {
                debug!("scan call timed out");
                self.writer.update(|scan| scan.is_scanning = false);
            }
        }
    }

    /// Only requests a stop; `is_scanning` clears when the adapter confirms
    pub async fn stop_scan(&self) {
        if let Err(e) = self.adapter.stop_scan().await {
            error!("Error stopping scan: {}", e);
        }
    }

    pub async fn on_scan_stopped(&self, reason: i32) {
        info!("Scan stopped (reason {})", reason);
        self.writer.update(|scan| scan.is_scanning = false);
        self.reconcile_devices().await;
        let _ = self.commands.send(BluetoothCommand::RequestStateUpdate);
    }

    pub fn on_device_discovered(&self, peripheral: &Peripheral) {
        let device =
            DiscoveredDevice::from_peripheral(peripheral, &self.settings.unknown_device_name, now_millis());
        self.writer.update(|scan| {
            scan.devices.insert(device.id.clone(), device);
        });
    }

    /// Replace the collection wholesale with the adapter's own cache
    pub async fn reconcile_devices(&self) {
        match self.adapter.discovered_devices().await {
            Ok(peripherals) => {
                let seen_at = now_millis();
                let devices: BTreeMap<_, _> = peripherals
                    .iter()
                    .map(|p| {
                        let device = DiscoveredDevice::from_peripheral(
                            p,
                            &self.settings.unknown_device_name,
                            seen_at,
                        );
                        (device.id.clone(), device)
                    })
                    .collect();
                debug!("reconciled {} discovered devices", devices.len());
                self.writer.update(|scan| scan.devices = devices);
            }
            Err(e) => error!("Error fetching discovered peripherals: {}", e),
        }
    }

    /// Merge the adapter's cache into the collection
    pub async fn refresh_devices(&self) {
        match self.adapter.discovered_devices().await {
            Ok(peripherals) => {
                let seen_at = now_millis();
                self.writer.update(|scan| {
                    for p in &peripherals {
                        let device = DiscoveredDevice::from_peripheral(
                            p,
                            &self.settings.unknown_device_name,
                            seen_at,
                        );
                        scan.devices.insert(device.id.clone(), device);
                    }
                });
            }
            Err(e) => error!("Error fetching discovered peripherals: {}", e),
        }
    }

    pub fn reset(&self) {
        self.writer.update(|scan| {
            scan.is_scanning = false;
            scan.devices.clear();
        });
    }
}
