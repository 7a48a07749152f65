//! Observable State Store
//!
//! Holds the [`BluetoothState`] snapshot in a `watch` channel. Anyone can read
//! it through a [`StoreReader`]; each slice can only be written through the
//! single writer handed out by [`Store::split`], so write ownership follows
//! whichever component holds that writer.

use crate::domain::models::{
    AdapterSlice, BluetoothState, ConnectionSlice, PermissionState, ScanState,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

pub struct Store {
    tx: Arc<watch::Sender<BluetoothState>>,
}

/// One writer per slice of the state
pub struct StoreWriters {
    pub permissions: SliceWriter<PermissionState>,
    pub adapter: SliceWriter<AdapterSlice>,
    pub scan: SliceWriter<ScanState>,
    pub connection: SliceWriter<ConnectionSlice>,
}

impl Store {
    pub fn new() -> Self {
        Self::with_state(BluetoothState::default())
    }

    pub fn with_state(state: BluetoothState) -> Self {
        let (tx, _rx) = watch::channel(state);
        Self { tx: Arc::new(tx) }
    }

    /// Consume the store, handing out the reader and the per-slice writers
    pub fn split(self) -> (StoreReader, StoreWriters) {
        let reader = StoreReader {
            tx: self.tx.clone(),
        };
        let writers = StoreWriters {
            permissions: SliceWriter {
                tx: self.tx.clone(),
                get: |s| &s.permissions,
                get_mut: |s| &mut s.permissions,
                lock: Mutex::new(()),
            },
            adapter: SliceWriter {
                tx: self.tx.clone(),
                get: |s| &s.adapter,
                get_mut: |s| &mut s.adapter,
                lock: Mutex::new(()),
            },
            scan: SliceWriter {
                tx: self.tx.clone(),
                get: |s| &s.scan,
                get_mut: |s| &mut s.scan,
                lock: Mutex::new(()),
            },
            connection: SliceWriter {
                tx: self.tx,
                get: |s| &s.connection,
                get_mut: |s| &mut s.connection,
                lock: Mutex::new(()),
            },
        };
        (reader, writers)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Read access to the whole state
#[derive(Clone)]
pub struct StoreReader {
    tx: Arc<watch::Sender<BluetoothState>>,
}

impl StoreReader {
    pub fn snapshot(&self) -> BluetoothState {
        self.tx.borrow().clone()
    }

    /// Read a projection without cloning the whole snapshot
    pub fn select<R>(&self, f: impl FnOnce(&BluetoothState) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<BluetoothState> {
        self.tx.subscribe()
    }

    /// Wait until `predicate` holds, giving up after `limit`
    pub async fn wait_for(
        &self,
        limit: Duration,
        mut predicate: impl FnMut(&BluetoothState) -> bool,
    ) -> Option<BluetoothState> {
        let mut rx = self.subscribe();
        let seen = tokio::time::timeout(limit, async move {
            let state = rx.wait_for(|s| predicate(s)).await.ok().map(|state| state.clone());
            state
        })
        .await;
        seen.ok().flatten()
    }
}

/// Write access to one slice of the state
pub struct SliceWriter<S> {
    tx: Arc<watch::Sender<BluetoothState>>,
    get: fn(&BluetoothState) -> &S,
    get_mut: fn(&mut BluetoothState) -> &mut S,
    // serializes read-modify-write of this slice across tasks
    lock: Mutex<()>,
}

impl<S: Clone> SliceWriter<S> {
    pub fn read(&self) -> S {
        (self.get)(&self.tx.borrow()).clone()
    }

    /// Mutate the slice and notify observers
    pub fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut slice = self.read();
        let out = f(&mut slice);
        let get_mut = self.get_mut;
        self.tx.send_modify(|state| *get_mut(state) = slice);
        out
    }

    /// Wait until the slice satisfies `predicate`; false if `limit` elapsed first
    pub async fn wait_until(
        &self,
        limit: Duration,
        mut predicate: impl FnMut(&S) -> bool,
    ) -> bool {
        let get = self.get;
        let mut rx = self.tx.subscribe();
        let reached = tokio::time::timeout(limit, async move {
            let reached = rx.wait_for(|state| predicate(get(state))).await.is_ok();
            reached
        })
        .await;
        matches!(reached, Ok(true))
    }

    pub fn replace(&self, value: S) {
        self.update(|slice| *slice = value);
    }

    /// Peek at the whole snapshot; components read other slices but only write their own
    pub fn state(&self) -> BluetoothState {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AdapterState;

    #[test]
    fn test_writers_only_touch_their_slice() {
        let (reader, writers) = Store::new().split();

        writers.scan.update(|scan| scan.is_scanning = true);
        writers.adapter.update(|a| a.state = AdapterState::On);

        let snapshot = reader.snapshot();
        assert!(snapshot.scan.is_scanning);
        assert_eq!(snapshot.adapter.state, AdapterState::On);
        assert!(snapshot.connection.state.is_idle());
        assert!(snapshot.permissions.checked_at.is_none());
    }

    #[test]
    fn test_update_returns_closure_result() {
        let (_reader, writers) = Store::new().split();
        let was = writers.connection.update(|c| std::mem::replace(&mut c.busy, true));
        assert!(!was);
        assert!(writers.connection.read().busy);
    }

    #[tokio::test]
    async fn test_wait_for_observes_later_write() {
        let (reader, writers) = Store::new().split();
        let (seen, ()) = tokio::join!(
            reader.wait_for(Duration::from_secs(1), |s| s.adapter.started),
            async {
                tokio::task::yield_now().await;
                writers.adapter.update(|a| a.started = true);
            }
        );
        assert!(seen.is_some_and(|s| s.adapter.started));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slice_wait_until_reached_or_expired() {
        let (_reader, writers) = Store::new().split();
        assert!(!writers.scan.wait_until(Duration::from_secs(5), |s| s.is_scanning).await);

        let (reached, ()) = tokio::join!(
            writers.scan.wait_until(Duration::from_secs(5), |s| s.is_scanning),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                writers.scan.update(|s| s.is_scanning = true);
            }
        );
        assert!(reached);
    }
}
