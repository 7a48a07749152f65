//! Bluetooth Module
//!
//! Discovery and connection workflow for BLE peripherals on top of a
//! platform adapter.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │   (dispatcher: commands + signals -> component tasks)    │
//! └───────┬──────────────┬──────────────┬──────────────┬─────┘
//!         │              │              │              │
//!         ▼              ▼              ▼              ▼
//! ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐
//! │ Permission │ │ Lifecycle  │ │  Scanner   │ │ Connection │
//! │   Gate     │ │            │ │            │ │            │
//! └─────┬──────┘ └─────┬──────┘ └─────┬──────┘ └─────┬──────┘
//!       │              └──────┬───────┴──────────────┘
//!       ▼                     ▼
//! PermissionsProvider    NativeAdapter ──notifications──► EventBridge
//! ```
//!
//! ## Modules
//!
//! - [`native`] - Adapter and permission traits, error type
//! - [`permissions`] - Permission check/request and the completeness rule
//! - [`lifecycle`] - Enable/start and adapter state tracking
//! - [`scanner`] - Time-boxed discovery and the device collection
//! - [`connection`] - Connect/disconnect and notification reconciliation
//! - [`events`] - Notification to signal translation, discovery throttling
//! - [`service`] - Main dispatcher
//! - [`simulated`] - In-memory adapter used by the demo binary and tests

pub mod connection;
pub mod events;
pub mod lifecycle;
pub mod native;
pub mod permissions;
pub mod scanner;
pub mod service;
pub mod simulated;

// Re-export main service for convenience
pub use service::{BluetoothHandle, BluetoothService};
