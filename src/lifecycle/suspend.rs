//! Suspend: snapshot + stop (spec §4.7 "Suspend"). Pre-condition:
//! `status=active`.

use crate::config;
use crate::drivers::{agent_client::AgentClient, jailer, network, vmm::VmmClient};
use crate::error::{ctor, Result};
use crate::registry::{self, CronSchedule, SuspendInfo, TenantStatus};

pub async fn suspend(config_dir: &std::path::Path, name: &str) -> Result<()> {
    let config = config::load_config(config_dir)?;
    let mut reg = registry::load_registry(config_dir)?;
    let tenant = reg.find(name).ok_or_else(|| ctor::tenant_not_found(name))?.clone();

    if !matches!(tenant.status, TenantStatus::Active) {
        return Err(ctor::validation_failed(format!("tenant {} is not active", name)));
    }

    // 1. Fetch cron schedules from the agent (soft-fail; empty on error).
    let client = AgentClient::new(tenant.guest_ip, config.agent.agent_port, &tenant.agent_token);
    let schedules: Vec<CronSchedule> = match client.get_cron_schedules().await {
        Ok(value) => serde_json::from_value(value.get("schedules").cloned().unwrap_or(serde_json::json!([]))).unwrap_or_default(),
        Err(_) => Vec::new(),
    };

    // 2. Compute the earliest future run time; abort if too close to wake.
    let now_ms = chrono::Utc::now().timestamp_millis();
    let earliest_future_run = schedules.iter().map(|s| s.next_run_at_ms).filter(|t| *t > now_ms).min();
    if let Some(t) = earliest_future_run {
        if t - config.watchdog.cron_wake_ahead_ms as i64 <= now_ms {
            return Err(ctor::suspend_skipped(format!("tenant {} has a cron run too close to suspend", name)));
        }
    }

    // 3. Record TAP rx_bytes.
    let rx_bytes_before = network::tap_rx_bytes(&tenant.tap_dev).await;

    // 4. Pause VM.
    let vmm = VmmClient::new(tenant.socket_path.display().to_string());
    vmm.pause().await.map_err(|e| ctor::suspend_failed(e.message))?;

    // 5. Create snapshot inside the chroot.
    let paths = jailer::JailerPaths::new(&config.paths.chroot_base, &tenant.vm_id);
    vmm.snapshot_create(super::IN_JAIL_SNAPSHOT_FILE, super::IN_JAIL_MEM_FILE).await?;

    // 6. Copy snapshot + mem files out of the chroot into the persistent snapshots dir.
    let snapshot_dir = config.paths.snapshots_dir.join(name);
    tokio::fs::create_dir_all(&snapshot_dir).await.map_err(|e| ctor::suspend_failed(format!("mkdir snapshot dir: {}", e)))?;
    let persistent_snapshot = snapshot_dir.join("snapshot_file");
    let persistent_mem = snapshot_dir.join("mem_file");
    tokio::fs::copy(paths.snapshot_file(), &persistent_snapshot)
        .await
        .map_err(|e| ctor::suspend_failed(format!("copy snapshot_file: {}", e)))?;
    tokio::fs::copy(paths.mem_file(), &persistent_mem)
        .await
        .map_err(|e| ctor::suspend_failed(format!("copy mem_file: {}", e)))?;

    // 7. SIGKILL the VMM, cleanup chroot.
    if let Some(pid) = tenant.vm_pid {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL);
    }
    let _ = jailer::cleanup_chroot(&config.paths.chroot_base, &tenant.vm_id).await;

    // 8. Re-read TAP rx_bytes after kill (captures trailing teardown bytes).
    let rx_bytes_after = network::tap_rx_bytes(&tenant.tap_dev).await;
    let last_rx_bytes = rx_bytes_after.max(rx_bytes_before);

    // 9. Compute next_wake_at_ms.
    let next_wake_at_ms = earliest_future_run.map(|t| t - config.watchdog.cron_wake_ahead_ms as i64);

    // 10. Update tenant.
    let t = reg.find_mut(name).ok_or_else(|| ctor::tenant_not_found(name))?;
    t.status = TenantStatus::Suspended;
    t.vm_pid = None;
    t.suspend_info = Some(SuspendInfo {
        suspended_at: chrono::Utc::now(),
        snapshot_dir,
        cron_schedules: schedules,
        next_wake_at_ms,
        last_rx_bytes,
    });
    registry::save_registry(config_dir, &reg)?;

    tracing::info!(tenant = name, "tenant suspended");
    Ok(())
}
