use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Placeholder used when a peripheral does not advertise a name
pub const UNKNOWN_DEVICE_NAME: &str = "<unknown>";

/// Current wall-clock time in Unix milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Mobile platform family the native adapter runs on.
///
/// The two families differ in which runtime permissions gate the radio and in
/// whether the native connect call enforces its own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    #[default]
    Other,
}

impl Platform {
    /// The native connect call never gives up on its own on iOS
    pub fn connect_needs_client_timeout(self) -> bool {
        matches!(self, Platform::Ios)
    }

    /// Setting the adapter display name is an Android-only capability
    pub fn supports_adapter_name(self) -> bool {
        matches!(self, Platform::Android)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Blocked,
    Unavailable,
}

/// Result of the most recent permission check or request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionState {
    pub statuses: BTreeMap<String, PermissionStatus>,
    /// Unix milliseconds of the check that produced `statuses`
    pub checked_at: Option<u64>,
}

impl PermissionState {
    pub fn new(statuses: BTreeMap<String, PermissionStatus>, checked_at: u64) -> Self {
        Self {
            statuses,
            checked_at: Some(checked_at),
        }
    }

    /// Radio use is allowed once a check happened and nothing is denied or blocked.
    /// `Unavailable` permissions do not gate the radio.
    pub fn is_complete(&self) -> bool {
        self.checked_at.is_some()
            && !self
                .statuses
                .values()
                .any(|s| matches!(s, PermissionStatus::Denied | PermissionStatus::Blocked))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    Off,
    TurningOn,
    TurningOff,
    On,
}

impl AdapterState {
    /// Parse the state string reported by the native layer
    pub fn from_native(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "resetting" => Self::Resetting,
            "unsupported" => Self::Unsupported,
            "unauthorized" => Self::Unauthorized,
            "off" => Self::Off,
            "turning_on" => Self::TurningOn,
            "turning_off" => Self::TurningOff,
            "on" => Self::On,
            _ => Self::Unknown,
        }
    }
}

/// A peripheral record as reported by the native adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peripheral {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl Peripheral {
    pub fn new(id: impl Into<String>, name: Option<&str>, rssi: Option<i16>) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
            rssi,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: String,
    pub rssi: i16,
    pub last_seen: u64,
}

impl DiscoveredDevice {
    pub fn from_peripheral(peripheral: &Peripheral, placeholder: &str, seen_at: u64) -> Self {
        let name = match peripheral.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => placeholder.to_string(),
        };
        Self {
            id: peripheral.id.clone(),
            name,
            rssi: peripheral.rssi.unwrap_or(0),
            last_seen: seen_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDescriptor {
    pub service: String,
    pub characteristic: String,
    pub properties: Vec<String>,
}

/// GATT layout returned by service retrieval
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub peripheral_id: String,
    pub services: Vec<String>,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting {
        device: DiscoveredDevice,
    },
    Connected {
        device: DiscoveredDevice,
        services: ServiceDescriptor,
    },
}

impl ConnectionState {
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Identifier of the device being connected or already connected
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Connecting { device } | Self::Connected { device, .. } => Some(&device.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicValue {
    pub peripheral: String,
    pub service: String,
    pub characteristic: String,
    pub value: Vec<u8>,
}

/// Payload of the native connect/disconnect notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralNotification {
    pub peripheral: String,
    /// Android GATT status code, absent on iOS
    pub status: Option<i32>,
}

impl PeripheralNotification {
    pub fn new(peripheral: impl Into<String>) -> Self {
        Self {
            peripheral: peripheral.into(),
            status: None,
        }
    }
}

/// Notifications emitted asynchronously by the native adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterNotification {
    /// Reason code 10 means the scan duration elapsed
    ScanStopped(i32),
    DeviceDiscovered(Peripheral),
    StateChanged(String),
    DeviceConnected(PeripheralNotification),
    DeviceDisconnected(PeripheralNotification),
    CharacteristicValueUpdated(CharacteristicValue),
}

/// User-facing requests handled by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluetoothCommand {
    Init,
    Shutdown,
    CheckPermissions,
    RequestPermissions,
    Enable,
    Disable,
    Toggle,
    StartManager,
    RequestStateUpdate,
    SetAdapterName(String),
    StartScan,
    StopScan,
    RefreshDevices,
    Connect(Peripheral),
    Disconnect(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSlice {
    pub state: AdapterState,
    pub started: bool,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanState {
    pub is_scanning: bool,
    pub devices: BTreeMap<String, DiscoveredDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSlice {
    pub state: ConnectionState,
    /// An operation such as a disconnect is in flight
    pub busy: bool,
    pub last_value: Option<CharacteristicValue>,
}

/// Snapshot of everything the rest of the application reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothState {
    pub permissions: PermissionState,
    pub adapter: AdapterSlice,
    pub scan: ScanState,
    pub connection: ConnectionSlice,
}
