//! Event Bridge
//!
//! Translates native adapter notifications into workflow signals. Discovery
//! notifications arrive in bursts during a scan, so they are throttled: the
//! first one in a window passes, later ones overwrite a single pending slot
//! that is released when the window closes.

use crate::domain::models::{
    AdapterNotification, CharacteristicValue, Peripheral, PeripheralNotification,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    ScanStopped(i32),
    DeviceDiscovered(Peripheral),
    StateChanged(String),
    DeviceConnected(PeripheralNotification),
    DeviceDisconnected(PeripheralNotification),
    CharacteristicValue(CharacteristicValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    ScanStopped,
    DeviceDiscovered,
    StateChanged,
    DeviceConnected,
    DeviceDisconnected,
    CharacteristicValue,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::ScanStopped(_) => SignalKind::ScanStopped,
            Signal::DeviceDiscovered(_) => SignalKind::DeviceDiscovered,
            Signal::StateChanged(_) => SignalKind::StateChanged,
            Signal::DeviceConnected(_) => SignalKind::DeviceConnected,
            Signal::DeviceDisconnected(_) => SignalKind::DeviceDisconnected,
            Signal::CharacteristicValue(_) => SignalKind::CharacteristicValue,
        }
    }
}

impl From<AdapterNotification> for Signal {
    fn from(notification: AdapterNotification) -> Self {
        match notification {
            AdapterNotification::ScanStopped(reason) => Signal::ScanStopped(reason),
            AdapterNotification::DeviceDiscovered(p) => Signal::DeviceDiscovered(p),
            AdapterNotification::StateChanged(state) => Signal::StateChanged(state),
            AdapterNotification::DeviceConnected(n) => Signal::DeviceConnected(n),
            AdapterNotification::DeviceDisconnected(n) => Signal::DeviceDisconnected(n),
            AdapterNotification::CharacteristicValueUpdated(v) => Signal::CharacteristicValue(v),
        }
    }
}

/// Leading-edge throttle with a one-slot trailing buffer (latest wins)
#[derive(Debug)]
pub struct Throttle<T> {
    window: Duration,
    open_until: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            open_until: None,
            pending: None,
        }
    }

    /// Returns the item when it may pass right now, otherwise parks it
    pub fn offer(&mut self, item: T, now: Instant) -> Option<T> {
        match self.open_until {
            Some(until) if now < until => {
                self.pending = Some(item);
                None
            }
            _ => {
                self.open_until = Some(now + self.window);
                Some(item)
            }
        }
    }

    /// When the parked item becomes due, if there is one
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().and(self.open_until)
    }

    /// Release the parked item once its window closed; that opens a new window
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match self.open_until {
            Some(until) if now >= until => {
                let item = self.pending.take()?;
                self.open_until = Some(now + self.window);
                Some(item)
            }
            _ => None,
        }
    }

    pub fn flush(&mut self) -> Option<T> {
        self.pending.take()
    }
}

pub struct EventBridge {
    notifications: mpsc::UnboundedReceiver<AdapterNotification>,
    discoveries: Throttle<Peripheral>,
    closed: bool,
}

impl EventBridge {
    pub fn new(
        notifications: mpsc::UnboundedReceiver<AdapterNotification>,
        discovery_window: Duration,
    ) -> Self {
        Self {
            notifications,
            discoveries: Throttle::new(discovery_window),
            closed: false,
        }
    }

    /// Next signal in arrival order, `None` once the adapter side hung up
    /// and nothing is left parked.
    pub async fn next_signal(&mut self) -> Option<Signal> {
        loop {
            if self.closed {
                return self.discoveries.flush().map(Signal::DeviceDiscovered);
            }

            let deadline = self.discoveries.deadline();
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    if let Some(p) = self.discoveries.take_due(Instant::now()) {
                        return Some(Signal::DeviceDiscovered(p));
                    }
                }
                received = self.notifications.recv() => match received {
                    Some(notification) => {
                        if let Some(signal) = self.accept(notification, Instant::now()) {
                            return Some(signal);
                        }
                    }
                    None => self.closed = true,
                }
            }
        }
    }

    fn accept(&mut self, notification: AdapterNotification, now: Instant) -> Option<Signal> {
        match Signal::from(notification) {
            Signal::DeviceDiscovered(p) => {
                let passed = self.discoveries.offer(p, now);
                if passed.is_none() {
                    trace!("discovery coalesced");
                }
                passed.map(Signal::DeviceDiscovered)
            }
            other => Some(other),
        }
    }
}
