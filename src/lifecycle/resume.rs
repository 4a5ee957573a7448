//! Resume: re-spawn the jailer, load the persisted snapshot, sync the
//! guest clock (spec §4.7 "Resume"). Pre-condition: `status=suspended` and
//! `suspend_info != null`.

use crate::config;
use crate::drivers::{agent_client::AgentClient, jailer, vmm::VmmClient};
use crate::error::{ctor, Result};
use crate::registry::{self, TenantStatus};

pub async fn resume(config_dir: &std::path::Path, name: &str) -> Result<()> {
    let config = config::load_config(config_dir)?;
    let mut reg = registry::load_registry(config_dir)?;
    let tenant = reg.find(name).ok_or_else(|| ctor::tenant_not_found(name))?.clone();

    if !matches!(tenant.status, TenantStatus::Suspended) {
        return Err(ctor::validation_failed(format!("tenant {} is not suspended", name)));
    }
    let info = tenant.suspend_info.clone().ok_or_else(|| ctor::resume_failed(format!("tenant {} has no suspend_info", name)))?;

    // 1. Cleanup stale chroot.
    let paths = jailer::JailerPaths::new(&config.paths.chroot_base, &tenant.vm_id);
    jailer::cleanup_chroot(&config.paths.chroot_base, &tenant.vm_id).await?;

    // 2. Spawn new jailer+VMM detached (same cgroup/CPU policy as spawn).
    let version = jailer::detect_cgroup_version();
    let pid = super::spawn_jailer_detached(
        &config.paths.jailer_bin.display().to_string(),
        &config.paths.vmm_bin.display().to_string(),
        &tenant.vm_id,
        tenant.jail_uid,
        &config.paths.chroot_base,
        version,
        config.defaults.vcpu_count,
        config.defaults.mem_size_mib,
        &paths.api_socket(),
    )
    .await
    .map_err(|e| ctor::resume_failed(e.message))?;

    // 3. Hard-link kernel, rootfs, overlay into the fresh chroot.
    jailer::link_chroot_files(&paths, &config.paths.kernel_image, &config.paths.rootfs_image, &tenant.overlay_path, tenant.jail_uid)
        .await
        .map_err(|e| ctor::resume_failed(e.message))?;

    // 4. Copy persistent snapshot and mem files into the chroot, chown to jail_uid.
    let persistent_snapshot = info.snapshot_dir.join("snapshot_file");
    let persistent_mem = info.snapshot_dir.join("mem_file");
    tokio::fs::copy(&persistent_snapshot, paths.snapshot_file())
        .await
        .map_err(|e| ctor::resume_failed(format!("copy snapshot_file: {}", e)))?;
    tokio::fs::copy(&persistent_mem, paths.mem_file())
        .await
        .map_err(|e| ctor::resume_failed(format!("copy mem_file: {}", e)))?;
    crate::exec::must(
        "chown",
        &[&format!("{}:{}", tenant.jail_uid, tenant.jail_uid), &paths.snapshot_file().display().to_string(), &paths.mem_file().display().to_string()],
    )
    .await
    .map_err(|e| ctor::resume_failed(e.message))?;

    // 5. VMM snapshot/load with resume_vm: true.
    let vmm = VmmClient::new(paths.api_socket().display().to_string());
    vmm.snapshot_load(super::IN_JAIL_SNAPSHOT_FILE, super::IN_JAIL_MEM_FILE).await?;

    // 6. Sync the guest wall-clock (soft-fail; stale after restore).
    let client = AgentClient::new(tenant.guest_ip, config.agent.agent_port, &tenant.agent_token);
    let _ = client.set_time(chrono::Utc::now().timestamp_millis()).await;

    // 7. Remove the persistent snapshot dir.
    let _ = tokio::fs::remove_dir_all(&info.snapshot_dir).await;

    // 8. Update tenant.
    let t = reg.find_mut(name).ok_or_else(|| ctor::tenant_not_found(name))?;
    t.status = TenantStatus::Active;
    t.vm_pid = Some(pid);
    t.suspend_info = None;
    registry::save_registry(config_dir, &reg)?;

    tracing::info!(tenant = name, pid, "tenant resumed");
    Ok(())
}
