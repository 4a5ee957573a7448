//! Hold: the entry point every lifecycle command and CLI/API handler goes
//! through first (spec §4.7 "Hold"). Auto-resumes a suspended tenant,
//! registers it in the in-flight set, and manages an agent-side hold token
//! refreshed on an interval so auto-suspend never fires underneath an
//! in-progress operation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::drivers::agent_client::AgentClient;
use crate::error::{ctor, Result};
use crate::inflight::{InFlightGuard, InFlightSet};
use crate::registry;

const HOLD_REFRESH_INTERVAL: Duration = Duration::from_secs(120);

pub struct Hold {
    _guard: InFlightGuard,
    stop_refresh: Option<oneshot::Sender<()>>,
}

impl Drop for Hold {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_refresh.take() {
            let _ = tx.send(());
        }
    }
}

/// Acquires a hold on `name`: auto-resumes if suspended, takes the in-flight
/// slot, and (if the tenant ends up active with an agent) starts a
/// refresh-every-2-minutes hold-token loop.
pub async fn acquire(config_dir: &std::path::Path, inflight: &Arc<InFlightSet>, name: &str, agent_port: u16) -> Result<Hold> {
    let guard = inflight
        .try_acquire(name)
        .await
        .ok_or_else(|| ctor::lock_failed(format!("tenant {} is already in flight", name)))?;

    let registry = registry::load_registry(config_dir)?;
    let tenant = registry.find(name).ok_or_else(|| ctor::tenant_not_found(name))?;

    if tenant.is_suspended() {
        crate::lifecycle::resume::resume(config_dir, name).await?;
    }

    let registry = registry::load_registry(config_dir)?;
    let tenant = registry.find(name).ok_or_else(|| ctor::tenant_not_found(name))?;
    let guest_ip = tenant.guest_ip;
    let token = tenant.agent_token.clone();

    let (stop_tx, mut stop_rx) = oneshot::channel();
    tokio::spawn(async move {
        let client = AgentClient::new(guest_ip, agent_port, token);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HOLD_REFRESH_INTERVAL) => {
                    // Best-effort: the agent doesn't expose a dedicated
                    // acquire-hold/release-hold RPC in this protocol revision,
                    // so a health ping doubles as the liveness refresh.
                    let _ = client.health_ping().await;
                }
                _ = &mut stop_rx => break,
            }
        }
    });

    Ok(Hold { _guard: guard, stop_refresh: Some(stop_tx) })
}
