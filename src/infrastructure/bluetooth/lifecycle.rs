//! Adapter Lifecycle Manager
//!
//! Enables and starts the platform adapter and tracks its reported state.
//! Calls made here only *request* a change; the state the adapter actually
//! reaches is reported later through the event bridge.

use crate::domain::models::{AdapterSlice, AdapterState, BluetoothCommand};
use crate::domain::store::SliceWriter;
use crate::infrastructure::bluetooth::native::{NativeAdapter, StartOptions};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct AdapterLifecycle {
    adapter: Arc<dyn NativeAdapter>,
    writer: SliceWriter<AdapterSlice>,
    commands: mpsc::UnboundedSender<BluetoothCommand>,
}

impl AdapterLifecycle {
    pub fn new(
        adapter: Arc<dyn NativeAdapter>,
        writer: SliceWriter<AdapterSlice>,
        commands: mpsc::UnboundedSender<BluetoothCommand>,
    ) -> Self {
        Self {
            adapter,
            writer,
            commands,
        }
    }

    pub async fn enable(&self) {
        debug!("enabling Bluetooth adapter");
        match self.adapter.enable().await {
            Ok(()) => self.writer.update(|a| a.state = AdapterState::On),
            Err(e) => {
                warn!("Error enabling bluetooth: {}", e);
                self.writer.update(|a| a.state = AdapterState::Off);
            }
        }
    }

    /// Local shutdown of the workflow. The radio itself is left alone.
    pub fn disable(&self) {
        info!("Bluetooth workflow disabled");
        self.writer.update(|a| {
            a.started = false;
            a.state = AdapterState::Off;
        });
    }

    /// Dispatch the inverse of the current adapter state
    pub fn toggle(&self) {
        let command = if self.writer.read().state == AdapterState::On {
            BluetoothCommand::Disable
        } else {
            BluetoothCommand::Enable
        };
        debug!("toggle -> {:?}", command);
        let _ = self.commands.send(command);
    }

    /// Must succeed before scanning or connecting is allowed
    pub async fn start(&self) {
        match self.adapter.start(StartOptions::default()).await {
            Ok(()) => {
                self.request_state_update();
                self.writer.update(|a| a.started = true);
                info!("Bluetooth manager started");
            }
            Err(e) => {
                error!("Error starting bluetooth manager: {}", e);
                self.writer.update(|a| {
                    a.started = false;
                    a.state = AdapterState::Unknown;
                });
            }
        }
    }

    /// Queue a (throttled) state check through the dispatcher
    pub fn request_state_update(&self) {
        let _ = self.commands.send(BluetoothCommand::RequestStateUpdate);
    }

    /// Ask the adapter to report its state. The answer arrives as a notification.
    pub async fn check_state(&self) {
        if let Err(e) = self.adapter.check_state().await {
            error!("Error checking bluetooth state: {}", e);
        }
    }

    /// Authoritative state as reported by the adapter
    pub fn apply_notification(&self, raw: &str) {
        let state = AdapterState::from_native(raw);
        debug!("adapter state notification: {} -> {:?}", raw, state);
        self.writer.update(|a| a.state = state);
    }

    pub async fn set_adapter_name(&self, name: &str) {
        if !self.adapter.platform().supports_adapter_name() {
            debug!("Setting the adapter name is not supported on this platform");
            return;
        }
        match self.adapter.set_name(name).await {
            Ok(()) => self.writer.update(|a| a.name = Some(name.to_string())),
            Err(e) => error!("Error setting bluetooth adapter name: {}", e),
        }
        self.request_state_update();
    }
}
