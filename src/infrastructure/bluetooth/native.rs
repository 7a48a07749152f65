//! Native Adapter Boundary
//!
//! The platform BLE plugin and the OS permission subsystem are external
//! collaborators. The workflow only talks to them through these traits.

use crate::domain::models::{PermissionStatus, Peripheral, Platform, ServiceDescriptor};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("native call failed: {0}")]
    Native(String),

    #[error("operation timed out")]
    Timeout,

    #[error("peripheral {0} is not connected")]
    NotConnected(String),

    #[error("a connection to {0} is already in flight")]
    ConnectInFlight(String),

    #[error("peripheral {0} not found in connected peripherals")]
    StaleNotification(String),

    #[error("not supported on this platform: {0}")]
    Unsupported(String),
}

pub type BleResult<T> = Result<T, BleError>;

/// Options for starting the native adapter subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    pub show_alert: bool,
    pub force_legacy: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            show_alert: false,
            force_legacy: true,
        }
    }
}

/// Commands understood by the native BLE plugin.
///
/// Results of long-running work (scan end, connect, disconnect, state changes)
/// are reported separately as [`AdapterNotification`]s.
///
/// [`AdapterNotification`]: crate::domain::models::AdapterNotification
#[async_trait]
pub trait NativeAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    async fn enable(&self) -> BleResult<()>;
    async fn start(&self, options: StartOptions) -> BleResult<()>;
    /// Ask the adapter to emit its current state as a notification
    async fn check_state(&self) -> BleResult<()>;

    async fn scan(
        &self,
        service_uuids: &[String],
        duration_secs: u32,
        allow_duplicates: bool,
    ) -> BleResult<()>;
    async fn stop_scan(&self) -> BleResult<()>;
    /// The adapter's own cache of everything seen since the last scan started
    async fn discovered_devices(&self) -> BleResult<Vec<Peripheral>>;
    async fn connected_devices(&self, service_uuids: &[String]) -> BleResult<Vec<Peripheral>>;

    async fn is_connected(&self, peripheral_id: &str) -> BleResult<bool>;
    async fn connect(&self, peripheral_id: &str) -> BleResult<()>;
    async fn disconnect(&self, peripheral_id: &str) -> BleResult<()>;
    async fn retrieve_services(&self, peripheral_id: &str) -> BleResult<ServiceDescriptor>;

    /// Android only
    async fn set_name(&self, name: &str) -> BleResult<()>;
}

/// Runtime permission subsystem
#[async_trait]
pub trait PermissionsProvider: Send + Sync {
    /// Never prompts the user
    async fn check(&self, ids: &[String]) -> BleResult<BTreeMap<String, PermissionStatus>>;
    /// May suspend until the user answers
    async fn request(&self, ids: &[String]) -> BleResult<BTreeMap<String, PermissionStatus>>;
}
