//! Idle/wake scheduler (spec §4.6): idle detector driving auto-suspend, the
//! wake-on-traffic TCP sentinel, and cron/heartbeat wake timers.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::drivers::agent_client::AgentClient;
use crate::exec;
use crate::inflight::{Event, EventBus, InFlightSet};
use crate::registry::{self, TenantStatus};
use crate::watchdog::{TenantWatchState, WatchState};

const SENTINEL_GUEST_PORT: u16 = 9000;

struct IdleTracker {
    idle_since: Option<Instant>,
}

struct Sentinel {
    stop: tokio::sync::oneshot::Sender<()>,
}

/// An internal wake request, carrying the held client socket for `traffic`
/// wakes so it can be dropped only once resume actually completes (spec
/// §4.6: "hold the socket open... after resume completes close the held
/// socket so the reverse proxy retries").
struct WakeRequest {
    tenant: String,
    trigger: WakeTrigger,
    held: Option<TcpStream>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeTrigger {
    Traffic,
    Cron,
    Manual,
}

impl WakeTrigger {
    fn as_str(self) -> &'static str {
        match self {
            WakeTrigger::Traffic => "traffic",
            WakeTrigger::Cron => "cron",
            WakeTrigger::Manual => "manual",
        }
    }
}

pub struct Scheduler {
    config_dir: std::path::PathBuf,
    inflight: Arc<InFlightSet>,
    events: EventBus,
    idle: Mutex<HashMap<String, IdleTracker>>,
    sentinels: Mutex<HashMap<String, Sentinel>>,
    /// Tenant name -> `next_wake_at_ms` a cron-wake timer is already
    /// pending for, so re-reading the same `suspend_info` every
    /// `traffic_poll_ms` tick doesn't spawn a duplicate sleeping task.
    scheduled_wakes: Mutex<HashMap<String, i64>>,
    wake_tx: mpsc::UnboundedSender<WakeRequest>,
    wake_rx: Mutex<Option<mpsc::UnboundedReceiver<WakeRequest>>>,
}

impl Scheduler {
    pub fn new(config_dir: std::path::PathBuf, inflight: Arc<InFlightSet>, events: EventBus) -> Self {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        Self {
            config_dir,
            inflight,
            events,
            idle: Mutex::new(HashMap::new()),
            sentinels: Mutex::new(HashMap::new()),
            scheduled_wakes: Mutex::new(HashMap::new()),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
        }
    }

    /// Drains wake requests forever, performing the actual resume (and, for
    /// `manual`/idle-suspend requests routed through the same queue, the
    /// actual suspend) while holding the tenant's in-flight slot (spec §4.6).
    /// Must be spawned once at daemon startup; takes the receiver out of
    /// `self` so a second call is a silent no-op.
    pub async fn run_wake_consumer(self: Arc<Self>) {
        let mut rx = match self.wake_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        while let Some(request) = rx.recv().await {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.handle_wake(request).await });
        }
    }

    async fn handle_wake(self: Arc<Self>, request: WakeRequest) {
        let WakeRequest { tenant, trigger, held } = request;
        self.scheduled_wakes.lock().await.remove(&tenant);

        let guard = match self.inflight.try_acquire(&tenant).await {
            Some(g) => g,
            None => {
                tracing::info!(tenant = %tenant, "wake suppressed: tenant already in flight");
                return;
            }
        };

        let guest_ip = match registry::load_registry(&self.config_dir).ok().and_then(|r| r.find(&tenant).map(|t| t.guest_ip)) {
            Some(ip) => ip,
            None => {
                drop(guard);
                return;
            }
        };
        self.stop_sentinel(&tenant, guest_ip).await;

        self.events.emit(Event::Wake { tenant: tenant.clone(), trigger: trigger.as_str().into() });

        let result = crate::lifecycle::resume::resume(&self.config_dir, &tenant).await;
        match &result {
            Ok(()) => {
                self.events.emit(Event::Resumed { tenant: tenant.clone() });
                tracing::info!(tenant = %tenant, trigger = trigger.as_str(), "tenant woken");
            }
            Err(e) => tracing::warn!(tenant = %tenant, error = %e.message, "wake: resume failed"),
        }

        if result.is_ok() && trigger == WakeTrigger::Cron {
            if let Ok(config) = crate::config::load_config(&self.config_dir) {
                if let Ok(reg) = registry::load_registry(&self.config_dir) {
                    if let Some(t) = reg.find(&tenant) {
                        let client = AgentClient::new(t.guest_ip, config.agent.agent_port, &t.agent_token);
                        let _ = client.poke_cron().await;
                        let _ = client.poke_heartbeat().await;
                    }
                }
                let mut idle = self.idle.lock().await;
                let ahead = Duration::from_millis(config.watchdog.cron_wake_ahead_ms + 5_000);
                idle.insert(tenant.clone(), IdleTracker { idle_since: Some(Instant::now() - ahead) });
            }
        }

        // Held socket is dropped here, after resume has run, letting the
        // reverse proxy's retried connection reach the now-running VM.
        drop(held);
        drop(guard);
    }

    /// Removes any stale loopback aliases left from a previous run before
    /// starting new sentinels (spec §5 "Loopback aliases for sentinels").
    pub async fn clear_stale_aliases(&self, guest_ips: &[Ipv4Addr]) {
        for ip in guest_ips {
            let _ = exec::unchecked("ip", &["addr", "del", &format!("{}/32", ip), "dev", "lo"]).await;
        }
    }

    /// One `traffic_poll_ms` tick: poll active tenants for idle, ensure
    /// sentinels for suspended tenants (spec §4.6).
    pub async fn tick(self: &Arc<Self>, watch_states: &HashMap<String, TenantWatchState>, idle_threshold_ms: u64, agent_port: u16) {
        let config = match crate::config::load_config(&self.config_dir) {
            Ok(c) => c,
            Err(_) => return,
        };
        let registry = match registry::load_registry(&self.config_dir) {
            Ok(r) => r,
            Err(_) => return,
        };

        for tenant in &registry.tenants {
            if self.inflight.contains(&tenant.name).await {
                continue;
            }
            match tenant.status {
                TenantStatus::Active => {
                    let watch_ok = matches!(
                        watch_states.get(&tenant.name).map(|s| s.state),
                        Some(WatchState::Healthy) | Some(WatchState::Unknown) | None
                    );
                    if !watch_ok {
                        continue;
                    }
                    let client = AgentClient::new(tenant.guest_ip, agent_port, &tenant.agent_token);
                    let total = match client.get_active_connections().await {
                        Ok(v) => {
                            v.get("tcp").and_then(|x| x.as_u64()).unwrap_or(0)
                                + v.get("cron").and_then(|x| x.as_u64()).unwrap_or(0)
                                + v.get("heartbeat").and_then(|x| x.as_u64()).unwrap_or(0)
                        }
                        Err(_) => continue,
                    };

                    let mut idle = self.idle.lock().await;
                    let tracker = idle.entry(tenant.name.clone()).or_insert(IdleTracker { idle_since: None });
                    if total == 0 {
                        let since = *tracker.idle_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= Duration::from_millis(idle_threshold_ms) {
                            tracker.idle_since = None;
                            drop(idle);
                            self.trigger_suspend(&tenant.name).await;
                        }
                    } else {
                        tracker.idle_since = None;
                    }
                }
                TenantStatus::Suspended => {
                    self.ensure_sentinel(tenant.name.clone(), tenant.guest_ip).await;
                    if let Some(info) = &tenant.suspend_info {
                        if let Some(wake_at_ms) = info.next_wake_at_ms {
                            self.schedule_cron_wake(tenant.name.clone(), wake_at_ms).await;
                        }
                    }
                }
                TenantStatus::Removing => {}
            }
        }
    }

    /// Runs auto-suspend for an idle tenant, holding its in-flight slot for
    /// the duration (spec §4.6: "mark in-flight" applies symmetrically to
    /// the suspend side of the scheduler, not just wake).
    async fn trigger_suspend(self: &Arc<Self>, name: &str) {
        let scheduler = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let guard = match scheduler.inflight.try_acquire(&name).await {
                Some(g) => g,
                None => return,
            };
            tracing::info!(tenant = %name, "idle threshold reached, triggering suspend");
            scheduler.events.emit(Event::IdleSuspendRequested { tenant: name.clone() });
            match crate::lifecycle::suspend::suspend(&scheduler.config_dir, &name).await {
                Ok(()) => scheduler.events.emit(Event::Suspended { tenant: name.clone() }),
                Err(e) => tracing::warn!(tenant = %name, error = %e.message, "auto-suspend failed"),
            }
            drop(guard);
        });
    }

    /// Enqueues a manual wake, used by the `resume` CLI/API path when a
    /// tenant is currently suspended with a live sentinel (spec §4.6
    /// trigger vocabulary `{traffic, cron, manual}`).
    pub fn request_manual_wake(&self, name: &str) {
        let _ = self.wake_tx.send(WakeRequest { tenant: name.to_string(), trigger: WakeTrigger::Manual, held: None });
    }

    /// Ensures a wake sentinel is bound for a suspended tenant: adds the
    /// guest IP to loopback, binds `guest_ip:9000`, and on first connection
    /// holds the socket and fires a `traffic` wake (spec §4.6).
    async fn ensure_sentinel(self: &Arc<Self>, name: String, guest_ip: Ipv4Addr) {
        {
            let sentinels = self.sentinels.lock().await;
            if sentinels.contains_key(&name) {
                return;
            }
        }

        if exec::unchecked("ip", &["addr", "add", &format!("{}/32", guest_ip), "dev", "lo"]).await.status != 0 {
            // Already present from a prior run; not fatal.
        }

        let listener = match TcpListener::bind((guest_ip, SENTINEL_GUEST_PORT)).await {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(tenant = %name, error = %e, "failed to bind wake sentinel");
                return;
            }
        };

        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        let wake_tx = self.wake_tx.clone();
        let tenant_name = name.clone();
        tokio::spawn(async move {
            tokio::select! {
                accepted = listener.accept() => {
                    if let Ok((socket, _)) = accepted {
                        // Held until `handle_wake` drops it post-resume, so the
                        // reverse proxy's retry lands on the now-running VM.
                        let _ = wake_tx.send(WakeRequest { tenant: tenant_name, trigger: WakeTrigger::Traffic, held: Some(socket) });
                    }
                }
                _ = &mut stop_rx => {}
            }
        });

        self.sentinels.lock().await.insert(name, Sentinel { stop: stop_tx });
    }

    /// Tears down a sentinel: stops the listener task and removes the
    /// loopback alias (spec §4.6: "torn down on every stop").
    pub async fn stop_sentinel(&self, name: &str, guest_ip: Ipv4Addr) {
        if let Some(sentinel) = self.sentinels.lock().await.remove(name) {
            let _ = sentinel.stop.send(());
        }
        let _ = exec::unchecked("ip", &["addr", "del", &format!("{}/32", guest_ip), "dev", "lo"]).await;
    }

    /// Schedules a cron wake timer for `name` unless one is already pending
    /// for this exact `wake_at_ms` (the scheduler re-reads `suspend_info`
    /// every `traffic_poll_ms` tick, so without this check each tick would
    /// spawn another sleeping task for the same wake).
    async fn schedule_cron_wake(self: &Arc<Self>, name: String, wake_at_ms: i64) {
        {
            let mut scheduled = self.scheduled_wakes.lock().await;
            if scheduled.get(&name) == Some(&wake_at_ms) {
                return;
            }
            scheduled.insert(name.clone(), wake_at_ms);
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let delay_ms = (wake_at_ms - now_ms).max(0) as u64;
        let wake_tx = self.wake_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = wake_tx.send(WakeRequest { tenant: name, trigger: WakeTrigger::Cron, held: None });
        });
    }

    /// Stops every live sentinel; used on SIGINT/SIGTERM (spec §5).
    pub async fn stop_all_sentinels(&self) {
        let mut sentinels = self.sentinels.lock().await;
        for (_, sentinel) in sentinels.drain() {
            let _ = sentinel.stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sentinel_map_starts_empty() {
        let scheduler = Scheduler::new(std::path::PathBuf::from("/tmp"), InFlightSet::new(), EventBus::new());
        assert!(scheduler.sentinels.lock().await.is_empty());
    }
}
