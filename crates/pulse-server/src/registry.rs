//! Connection registry: admission, removal, and fan-out to live observers.
//!
//! Each observer is a bounded outbound queue drained by its connection's
//! writer task. Broadcasting never awaits: it takes a snapshot of the
//! membership, `try_send`s the frame to every queue, and then unregisters
//! every observer whose queue was closed or full.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// A serialized envelope, shared between all observer queues.
pub type Frame = Arc<str>;

/// The sending half of an observer's outbound queue.
pub type ObserverHandle = mpsc::Sender<Frame>;

/// Unique identifier of a registered observer.
pub type ObserverId = Uuid;

/// Sentinel for "never delivered" in [`Slot::last_delivered_us`].
const NEVER: i64 = i64::MIN;

/// Errors returned by [`ConnectionRegistry::register`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The handle's receiving side is already gone.
    #[error("connection handle is already closed")]
    HandleClosed,
}

/// Point-in-time view of a registered observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observer {
    pub id: ObserverId,
    pub registered_at: DateTime<Utc>,
    /// When a frame was last handed to this observer's queue.
    pub last_delivered_at: Option<DateTime<Utc>>,
}

/// Outcome of a single broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Observers whose queue accepted the frame.
    pub delivered: usize,
    /// Observers that failed and were unregistered.
    pub dropped: usize,
}

struct Slot {
    handle: ObserverHandle,
    registered_at: DateTime<Utc>,
    last_delivered_us: AtomicI64,
}

impl Slot {
    fn view(&self, id: ObserverId) -> Observer {
        let last = self.last_delivered_us.load(Ordering::Relaxed);
        Observer {
            id,
            registered_at: self.registered_at,
            last_delivered_at: if last == NEVER {
                None
            } else {
                DateTime::<Utc>::from_timestamp_micros(last)
            },
        }
    }
}

/// Tracks live observer connections.
///
/// Uses `std::sync::RwLock` intentionally: every critical section is a
/// short map operation that never spans an `.await`, and `broadcast` must be
/// callable from synchronous code.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    observers: Arc<RwLock<HashMap<ObserverId, Arc<Slot>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObserverId, Arc<Slot>>> {
        self.observers.read().unwrap_or_else(|poisoned| {
            tracing::error!("connection registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObserverId, Arc<Slot>>> {
        self.observers.write().unwrap_or_else(|poisoned| {
            tracing::error!("connection registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Admits a new observer.
    ///
    /// Registering a queue that is already present returns the existing
    /// observer instead of adding a second entry.
    ///
    /// # Errors
    ///
    /// `RegistryError::HandleClosed` if nothing is reading from the handle.
    pub fn register(&self, handle: ObserverHandle) -> Result<Observer, RegistryError> {
        if handle.is_closed() {
            return Err(RegistryError::HandleClosed);
        }

        let mut observers = self.write();
        if let Some((existing, slot)) = observers
            .iter()
            .find(|(_, slot)| slot.handle.same_channel(&handle))
        {
            return Ok(slot.view(*existing));
        }

        let id = Uuid::new_v4();
        let slot = Arc::new(Slot {
            handle,
            registered_at: Utc::now(),
            last_delivered_us: AtomicI64::new(NEVER),
        });
        let observer = slot.view(id);
        observers.insert(id, slot);

        tracing::debug!(observer_id = %id, total = observers.len(), "observer registered");
        Ok(observer)
    }

    /// Removes an observer. Safe to call repeatedly.
    ///
    /// Returns `true` if the observer was present.
    pub fn unregister(&self, observer: &Observer) -> bool {
        self.unregister_id(observer.id)
    }

    /// Removes an observer by id. Safe to call repeatedly.
    pub fn unregister_id(&self, id: ObserverId) -> bool {
        let removed = self.write().remove(&id).is_some();
        if removed {
            tracing::debug!(observer_id = %id, "observer unregistered");
        }
        removed
    }

    /// Sends a frame to every observer registered at the time of the call.
    ///
    /// Observers whose queue is closed or saturated are unregistered; the
    /// failure is logged and never propagated.
    pub fn broadcast(&self, frame: Frame) -> BroadcastReport {
        let snapshot: Vec<(ObserverId, Arc<Slot>)> = self
            .read()
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        let now_us = Utc::now().timestamp_micros();
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for (id, slot) in &snapshot {
            match slot.handle.try_send(Arc::clone(&frame)) {
                Ok(()) => {
                    slot.last_delivered_us.store(now_us, Ordering::Relaxed);
                    report.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        observer_id = %id,
                        "observer queue saturated, dropping observer"
                    );
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(observer_id = %id, "observer connection closed, dropping observer");
                    failed.push(*id);
                }
            }
        }

        if !failed.is_empty() {
            let mut observers = self.write();
            for id in &failed {
                observers.remove(id);
            }
            report.dropped = failed.len();
        }

        report
    }

    /// Drops every registered handle.
    ///
    /// Each connection's writer drains what is already queued, then sends a
    /// close frame. Returns the number of observers removed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.write().drain().collect();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "closed all observer connections");
        }
        drained.len()
    }

    /// Returns a view of a single observer.
    pub fn get(&self, id: ObserverId) -> Option<Observer> {
        self.read().get(&id).map(|slot| slot.view(id))
    }

    /// Returns views of all observers, oldest registration first.
    pub fn observers(&self) -> Vec<Observer> {
        let mut all: Vec<Observer> = self
            .read()
            .iter()
            .map(|(id, slot)| slot.view(*id))
            .collect();
        all.sort_by_key(|o| o.registered_at);
        all
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("observers", &self.len())
            .finish()
    }
}
