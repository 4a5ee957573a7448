//! Watchdog state machine and periodic tick loop (spec §4.4, §4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::checks::{self, HealthCheckResult};
use crate::config::HostConfig;
use crate::drivers::proxy::ProxyClient;
use crate::inflight::{EventBus, Event, InFlightSet};
use crate::registry::{self, Tenant, TenantStatus};
use crate::repairs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchState {
    Unknown,
    Healthy,
    Degraded,
    Recovering,
    Failed,
    Suspended,
}

impl std::fmt::Display for WatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
pub struct TenantWatchState {
    pub state: WatchState,
    pub last_check_ts: Option<Instant>,
    pub last_results: Vec<HealthCheckResult>,
    pub repair_attempts: u32,
    pub last_repair_at: Option<Instant>,
}

impl Default for TenantWatchState {
    fn default() -> Self {
        Self { state: WatchState::Unknown, last_check_ts: None, last_results: Vec::new(), repair_attempts: 0, last_repair_at: None }
    }
}

/// The transition table in spec §4.4. Returns `(next_state, needs_repair)`.
pub fn transition(current: WatchState, all_ok: bool, attempts: u32, max_attempts: u32) -> (WatchState, bool) {
    use WatchState::*;
    match (current, all_ok) {
        (Unknown, true) => (Healthy, false),
        (Unknown, false) => (Degraded, true),
        (Healthy, true) => (Healthy, false),
        (Healthy, false) => (Degraded, true),
        (Degraded, true) => (Recovering, false),
        (Degraded, false) if attempts >= max_attempts => (Failed, false),
        (Degraded, false) => (Degraded, true),
        (Recovering, true) => (Healthy, false),
        (Recovering, false) => (Degraded, true),
        (Failed, true) => (Healthy, false),
        (Failed, false) => (Failed, false),
        (Suspended, true) => (Healthy, false),
        (Suspended, false) => (Degraded, true),
    }
}

/// Transitions reset `repair_attempts` for every row except the two
/// `DEGRADED -> DEGRADED` / `FAILED -> FAILED` "stay" rows (spec §4.4).
fn resets_attempts(current: WatchState, next: WatchState) -> bool {
    !(current == WatchState::Degraded && next == WatchState::Degraded) && !(current == WatchState::Failed && next == WatchState::Failed)
}

pub struct Watchdog {
    config_dir: std::path::PathBuf,
    states: Mutex<HashMap<String, TenantWatchState>>,
    inflight: Arc<InFlightSet>,
    events: EventBus,
    proxy: ProxyClient,
    tick_in_progress: Mutex<bool>,
}

impl Watchdog {
    pub fn new(config_dir: std::path::PathBuf, inflight: Arc<InFlightSet>, events: EventBus, proxy: ProxyClient) -> Self {
        Self {
            config_dir,
            states: Mutex::new(HashMap::new()),
            inflight,
            events,
            proxy,
            tick_in_progress: Mutex::new(false),
        }
    }

    /// Runs one watchdog tick: re-sync registry, check, transition, repair
    /// (spec §4.5). Non-reentrant — a tick already running is a no-op.
    pub async fn tick(&self) {
        {
            let mut in_progress = self.tick_in_progress.lock().await;
            if *in_progress {
                return;
            }
            *in_progress = true;
        }

        self.tick_inner().await;

        *self.tick_in_progress.lock().await = false;
    }

    async fn tick_inner(&self) {
        let config = match crate::config::load_config(&self.config_dir) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e.message, "watchdog tick: failed to load config");
                return;
            }
        };
        let registry = match registry::load_registry(&self.config_dir) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e.message, "watchdog tick: failed to load registry");
                return;
            }
        };

        {
            let mut states = self.states.lock().await;
            let known: std::collections::HashSet<&str> = registry.tenants.iter().map(|t| t.name.as_str()).collect();
            states.retain(|name, _| known.contains(name.as_str()));
        }

        for tenant in &registry.tenants {
            if matches!(tenant.status, TenantStatus::Removing) {
                continue;
            }
            if self.inflight.contains(&tenant.name).await {
                continue;
            }
            self.tick_tenant(tenant, &config).await;
        }
    }

    async fn tick_tenant(&self, tenant: &Tenant, config: &HostConfig) {
        if tenant.is_suspended() {
            let mut states = self.states.lock().await;
            let entry = states.entry(tenant.name.clone()).or_default();
            if entry.state != WatchState::Suspended {
                let from = entry.state;
                entry.state = WatchState::Suspended;
                self.events.emit(Event::StateChange { tenant: tenant.name.clone(), from: from.to_string(), to: WatchState::Suspended.to_string() });
            }
            return;
        }

        let (attempts, last_repair_at) = {
            let states = self.states.lock().await;
            let entry = states.get(&tenant.name).cloned().unwrap_or_default();
            (entry.repair_attempts, entry.last_repair_at)
        };

        if let Some(last) = last_repair_at {
            if last.elapsed() < Duration::from_millis(config.watchdog.repair_cooldown_ms) {
                return;
            }
        }

        let results = checks::run_all(tenant, config, &self.proxy).await;
        let ok = checks::all_ok(&results);
        let max_attempts = config.watchdog.max_repair_attempts;

        let (current, next, needs_repair) = {
            let mut states = self.states.lock().await;
            let entry = states.entry(tenant.name.clone()).or_default();
            let current = entry.state;
            let (next, needs_repair) = transition(current, ok, attempts, max_attempts);
            entry.last_check_ts = Some(Instant::now());
            entry.last_results = results.clone();
            if resets_attempts(current, next) {
                entry.repair_attempts = 0;
            }
            entry.state = next;
            (current, next, needs_repair)
        };

        self.events.emit(Event::CheckComplete { tenant: tenant.name.clone(), results: results.clone() });
        if current != next {
            self.events.emit(Event::StateChange { tenant: tenant.name.clone(), from: current.to_string(), to: next.to_string() });
        }

        if !needs_repair {
            return;
        }

        // Re-read on-disk status: a manual suspend may have landed between
        // the check pass above and now (spec §4.5 step 4).
        let fresh = match registry::load_registry(&self.config_dir) {
            Ok(r) => r,
            Err(_) => return,
        };
        let still_active = fresh.find(&tenant.name).map(|t| matches!(t.status, TenantStatus::Active)).unwrap_or(false);
        if !still_active {
            return;
        }

        let failed_checks: Vec<String> = results.iter().filter(|r| r.status != checks::CheckStatus::Ok).map(|r| r.check.clone()).collect();
        for repair_name in repairs::repairs_to_run(&failed_checks) {
            let repair_result = match repair_name {
                "ensure-gateway-repair" => repairs::ensure_gateway_repair(tenant, config).await,
                "net-tap-repair" => repairs::net_tap_repair(tenant, config).await,
                "caddy-route-repair" => repairs::caddy_route_repair(tenant, config, &self.proxy).await,
                "vm-process-repair" => crate::lifecycle::run_vm_process_repair(&self.config_dir, tenant, config).await,
                _ => continue,
            };
            self.events.emit(Event::RepairComplete {
                tenant: tenant.name.clone(),
                repair: repair_result.repair.clone(),
                fixed: repair_result.fixed,
                actions: repair_result.actions.clone(),
            });
        }

        let mut states = self.states.lock().await;
        let entry = states.entry(tenant.name.clone()).or_default();
        entry.repair_attempts += 1;
        entry.last_repair_at = Some(Instant::now());
    }

    pub async fn snapshot(&self, name: &str) -> Option<TenantWatchState> {
        self.states.lock().await.get(name).cloned()
    }

    /// Full state map, used by the scheduler's idle tick to skip tenants the
    /// watchdog doesn't currently consider healthy (spec §4.6).
    pub async fn snapshot_all(&self) -> HashMap<String, TenantWatchState> {
        self.states.lock().await.clone()
    }

    /// Runs the tick loop forever at `interval_ms`, with one immediate tick
    /// at startup (spec §4.5 step 5).
    pub async fn run(self: Arc<Self>, interval_ms: u64, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        self.tick().await;
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.tick().await; }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WatchState::*;

    #[test]
    fn unknown_to_healthy_on_ok() {
        assert_eq!(transition(Unknown, true, 0, 3), (Healthy, false));
    }

    #[test]
    fn degraded_escalates_to_failed_at_max_attempts() {
        assert_eq!(transition(Degraded, false, 3, 3), (Failed, false));
        assert_eq!(transition(Degraded, false, 2, 3), (Degraded, true));
    }

    #[test]
    fn recovering_to_healthy_on_ok() {
        assert_eq!(transition(Recovering, true, 0, 3), (Healthy, false));
    }

    #[test]
    fn failed_stays_failed_until_ok() {
        assert_eq!(transition(Failed, false, 0, 3), (Failed, false));
        assert_eq!(transition(Failed, true, 0, 3), (Healthy, false));
    }

    #[test]
    fn suspended_degrades_on_failure() {
        assert_eq!(transition(Suspended, false, 0, 3), (Degraded, true));
    }

    #[test]
    fn attempts_reset_on_every_transition_except_the_two_stay_rows() {
        assert!(!resets_attempts(Degraded, Degraded));
        assert!(!resets_attempts(Failed, Failed));
        assert!(resets_attempts(Degraded, Recovering));
        assert!(resets_attempts(Unknown, Healthy));
    }
}
