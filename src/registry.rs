//! Connection registry
//!
//! Process-wide table of live connection handles keyed by identity.
//! Admission is a two-step reserve/register protocol: `try_admit` atomically
//! checks the per-identity count (live plus reserved) against the cap and
//! hands back a [`Reservation`] that returns its slot on drop unless it is
//! converted into a registered handle. This closes the race where two
//! concurrent handshakes both observe "count < cap", and guarantees that a
//! handshake abandoned on any path never leaks a slot.
//!
//! All mutation runs under one short-lived mutex; critical sections never
//! await, which also lets the reservation guard release synchronously.

use crate::config::LimitsConfig;
use crate::error::{Error, Result};
use crate::protocol::{Identity, Topic};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One live duplex connection
///
/// The outbound sender is the handle's exclusive write path; only the
/// owning session's socket loop drains the other end. Everything else a
/// collaborator may touch (activity timestamp, cancellation) is safe to
/// poke from outside the owning session.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    identity: Identity,
    topic: Topic,
    created_at: i64,
    last_activity: AtomicI64,
    sender: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle for an accepted connection
    pub fn new(identity: Identity, topic: Topic, sender: mpsc::UnboundedSender<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            identity,
            topic,
            created_at: now,
            last_activity: AtomicI64::new(now),
            sender,
            cancel: CancellationToken::new(),
        }
    }

    /// Unique handle id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Owning identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Subscribed topic
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Creation timestamp in Unix milliseconds
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Last-activity timestamp in Unix milliseconds
    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Refresh the activity timestamp
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Queue a pre-serialized frame on the exclusive write path
    ///
    /// Returns false when the owning session is gone; callers treat that as
    /// a skipped delivery, never an error.
    pub fn send(&self, frame: String) -> bool {
        match self.sender.send(frame) {
            Ok(()) => {
                self.touch();
                true
            }
            Err(_) => false,
        }
    }

    /// Token cancelled when the connection is being torn down
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Signal the owning session to close
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: HashMap<Identity, Vec<Arc<ConnectionHandle>>>,
    reserved: HashMap<Identity, usize>,
}

impl RegistryInner {
    fn occupancy(&self, identity: &Identity) -> usize {
        let live = self.connections.get(identity).map_or(0, Vec::len);
        let reserved = self.reserved.get(identity).copied().unwrap_or(0);
        live + reserved
    }

    fn release_reservation(&mut self, identity: &Identity) {
        match self.reserved.get_mut(identity) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.reserved.remove(identity);
            }
            None => {}
        }
    }
}

/// Provisional admission slot held during handshake
///
/// Dropping an unconverted reservation returns the slot, so every early
/// exit of session setup is covered without explicit cleanup calls.
#[derive(Debug)]
pub struct Reservation {
    inner: Arc<Mutex<RegistryInner>>,
    identity: Identity,
    converted: bool,
}

impl Reservation {
    /// Identity this slot was reserved for
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.converted {
            if let Ok(mut inner) = self.inner.lock() {
                inner.release_reservation(&self.identity);
            }
        }
    }
}

/// Bounded per-identity table of live connections
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    cap: usize,
    max_age_ms: i64,
    idle_timeout_ms: Option<i64>,
}

impl ConnectionRegistry {
    /// Create a registry from limit configuration
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            cap: limits.max_connections_per_user,
            max_age_ms: limits.max_age_ms(),
            idle_timeout_ms: limits.idle_timeout_ms(),
        }
    }

    /// Atomically reserve an admission slot for an identity
    ///
    /// Rejects (never evicts) when live plus reserved connections have
    /// reached the cap.
    pub fn try_admit(&self, identity: &Identity) -> Result<Reservation> {
        let mut inner = self.lock();

        if inner.occupancy(identity) >= self.cap {
            tracing::warn!(identity = %identity, cap = self.cap, "Connection rejected: cap reached");
            return Err(Error::RateLimited(identity.to_string()));
        }

        *inner.reserved.entry(identity.clone()).or_insert(0) += 1;
        Ok(Reservation {
            inner: self.inner.clone(),
            identity: identity.clone(),
            converted: false,
        })
    }

    /// Convert a reservation into a live registry entry
    pub fn register(&self, mut reservation: Reservation, handle: Arc<ConnectionHandle>) -> Result<()> {
        if reservation.identity() != handle.identity() {
            return Err(Error::Registry(format!(
                "reservation for {} cannot register a handle owned by {}",
                reservation.identity(),
                handle.identity()
            )));
        }

        let mut inner = self.lock();
        reservation.converted = true;
        inner.release_reservation(&reservation.identity);
        inner
            .connections
            .entry(handle.identity().clone())
            .or_default()
            .push(handle.clone());

        tracing::info!(
            identity = %handle.identity(),
            handle = %handle.id(),
            topic = %handle.topic(),
            "Connection registered"
        );
        Ok(())
    }

    /// Remove a live entry; releasing an already-released handle is a no-op
    pub fn release(&self, identity: &Identity, handle_id: Uuid) {
        let mut inner = self.lock();
        let Some(handles) = inner.connections.get_mut(identity) else {
            return;
        };

        let before = handles.len();
        handles.retain(|h| h.id() != handle_id);
        let removed = before != handles.len();
        if handles.is_empty() {
            inner.connections.remove(identity);
        }
        drop(inner);

        if removed {
            tracing::info!(identity = %identity, handle = %handle_id, "Connection released");
        }
    }

    /// Live connection count for an identity
    pub fn count(&self, identity: &Identity) -> usize {
        self.lock().connections.get(identity).map_or(0, Vec::len)
    }

    /// Total live connections across all identities
    pub fn total(&self) -> usize {
        self.lock().connections.values().map(Vec::len).sum()
    }

    /// Live connection count per identity
    pub fn identity_counts(&self) -> HashMap<String, usize> {
        self.lock()
            .connections
            .iter()
            .map(|(identity, handles)| (identity.to_string(), handles.len()))
            .collect()
    }

    /// Every live handle, for shutdown fan-out
    pub fn all_handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.lock()
            .connections
            .values()
            .flat_map(|handles| handles.iter().cloned())
            .collect()
    }

    /// Handles due for eviction at `now_ms`: any past the hard lifetime
    /// regardless of activity, plus any past the idle threshold when one
    /// is configured. The caller closes each through the ordinary teardown
    /// path so bookkeeping stays consistent with explicit close.
    pub fn expired(&self, now_ms: i64) -> Vec<Arc<ConnectionHandle>> {
        self.lock()
            .connections
            .values()
            .flat_map(|handles| handles.iter())
            .filter(|handle| {
                let over_age = now_ms - handle.created_at() > self.max_age_ms;
                let over_idle = self
                    .idle_timeout_ms
                    .map(|idle| now_ms - handle.last_activity() > idle)
                    .unwrap_or(false);
                over_age || over_idle
            })
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // Registry state is count bookkeeping only; recover from poisoning
        // rather than wedging every session.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
