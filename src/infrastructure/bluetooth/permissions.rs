//! Permission Gate
//!
//! Decides whether the OS has granted the runtime permissions the radio needs.

use crate::domain::models::{now_millis, PermissionState, PermissionStatus, Platform};
use crate::domain::store::SliceWriter;
use crate::infrastructure::bluetooth::native::{BleResult, PermissionsProvider};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

const ANDROID_PERMISSIONS: &[&str] = &[
    "android.permission.ACCESS_FINE_LOCATION",
    "android.permission.ACCESS_COARSE_LOCATION",
    "android.permission.BLUETOOTH_ADVERTISE",
    "android.permission.BLUETOOTH_CONNECT",
    "android.permission.BLUETOOTH_SCAN",
];

const IOS_PERMISSIONS: &[&str] = &[
    "ios.permission.LOCATION_WHEN_IN_USE",
    "ios.permission.BLUETOOTH_PERIPHERAL",
];

/// Runtime permissions gating Bluetooth on `platform`
pub fn required_permissions(platform: Platform) -> Vec<String> {
    let ids: &[&str] = match platform {
        Platform::Android => ANDROID_PERMISSIONS,
        Platform::Ios => IOS_PERMISSIONS,
        Platform::Other => &[],
    };
    ids.iter().map(|id| id.to_string()).collect()
}

pub struct PermissionGate {
    provider: Arc<dyn PermissionsProvider>,
    required: Vec<String>,
    writer: SliceWriter<PermissionState>,
}

impl PermissionGate {
    pub fn new(
        provider: Arc<dyn PermissionsProvider>,
        platform: Platform,
        writer: SliceWriter<PermissionState>,
    ) -> Self {
        Self {
            provider,
            required: required_permissions(platform),
            writer,
        }
    }

    /// Query statuses without prompting the user
    pub async fn check_permissions(&self) -> PermissionState {
        let result = if self.required.is_empty() {
            Ok(BTreeMap::new())
        } else {
            self.provider.check(&self.required).await
        };
        self.record("check", result)
    }

    /// Prompt for every required permission; suspends until the user answers
    pub async fn request_permissions(&self) -> PermissionState {
        let result = if self.required.is_empty() {
            Ok(BTreeMap::new())
        } else {
            self.provider.request(&self.required).await
        };
        self.record("request", result)
    }

    /// Check, and prompt only if something is missing
    pub async fn refresh(&self) -> PermissionState {
        let checked = self.check_permissions().await;
        if checked.is_complete() {
            return checked;
        }
        self.request_permissions().await
    }

    fn record(
        &self,
        what: &str,
        result: BleResult<BTreeMap<String, PermissionStatus>>,
    ) -> PermissionState {
        match result {
            Ok(statuses) => {
                debug!("permission {} statuses: {:?}", what, statuses);
                let state = PermissionState::new(statuses, now_millis());
                if !state.is_complete() {
                    warn!("Bluetooth permissions incomplete after {}", what);
                }
                self.writer.replace(state.clone());
                state
            }
            Err(e) => {
                error!("permission {} failed: {}", what, e);
                self.writer.read()
            }
        }
    }
}
