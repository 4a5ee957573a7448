//! In-flight set and typed event bus (spec §4.7 "Hold", §5 "shared resources
//! and locking", §9). The in-flight set is the authoritative per-tenant
//! mutual-exclusion mechanism: at most one of {spawn, evict, suspend, resume,
//! molt, snap} may run on a given tenant at a time, and the watchdog/
//! scheduler both consult it before touching a tenant.
//!
//! The event bus is a `[SUPPLEMENT]` — the spec's watchdog/scheduler sections
//! describe emitting named events (`check-complete`, `state-change`,
//! `repair-complete`) without naming a transport; grounded on the broadcast
//! fan-out idiom already used for `tower-http`/axum state sharing in the
//! teacher's `AppState`, here a `tokio::sync::broadcast` channel.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

/// Per-tenant mutual exclusion, held for the duration of a lifecycle command.
#[derive(Default)]
pub struct InFlightSet {
    names: Mutex<HashSet<String>>,
}

/// RAII guard: dropping it releases the hold even on a cancelled/panicking task.
pub struct InFlightGuard {
    set: Arc<InFlightSet>,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let set = self.set.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            set.names.lock().await.remove(&name);
        });
    }
}

impl InFlightSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.names.lock().await.contains(name)
    }

    /// Attempts to take the hold for `name`. Returns `None` if another
    /// operation already holds it.
    pub async fn try_acquire(self: &Arc<Self>, name: &str) -> Option<InFlightGuard> {
        let mut guard = self.names.lock().await;
        if guard.contains(name) {
            return None;
        }
        guard.insert(name.to_string());
        Some(InFlightGuard { set: self.clone(), name: name.to_string() })
    }
}

/// Events the watchdog and scheduler emit, consumed by logging, the CLI's
/// `watch` subcommand, and (indirectly) the HTTP API's own tracing spans.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    CheckComplete { tenant: String, results: Vec<crate::checks::HealthCheckResult> },
    StateChange { tenant: String, from: String, to: String },
    RepairComplete { tenant: String, repair: String, fixed: bool, actions: Vec<String> },
    /// A suspended tenant is being woken (trigger: `traffic` | `cron` | `manual`).
    Wake { tenant: String, trigger: String },
    /// An active tenant crossed the idle threshold and auto-suspend is running.
    IdleSuspendRequested { tenant: String },
    Suspended { tenant: String },
    Resumed { tenant: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast sends are best-effort: with no subscribers this is a no-op.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_refused_while_first_is_held() {
        let set = InFlightSet::new();
        let guard = set.try_acquire("alpha").await;
        assert!(guard.is_some());
        assert!(set.try_acquire("alpha").await.is_none());
    }

    #[tokio::test]
    async fn drop_releases_the_hold() {
        let set = InFlightSet::new();
        {
            let _guard = set.try_acquire("alpha").await.unwrap();
            assert!(set.contains("alpha").await);
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!set.contains("alpha").await);
    }

    #[tokio::test]
    async fn event_bus_delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Event::Suspended { tenant: "alpha".into() });
        let event = rx.recv().await.unwrap();
        matches!(event, Event::Suspended { .. });
    }
}
