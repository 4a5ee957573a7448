//! Evict: best-effort tear-down ignoring per-step failures except the final
//! registry update (spec §4.7 "Evict").

use std::time::Duration;

use crate::config;
use crate::drivers::{jailer, network, overlay, proxy::ProxyClient, ssh_key};
use crate::error::{ctor, Result};
use crate::registry::{self, TenantStatus};

pub struct EvictReport {
    pub steps_failed: Vec<String>,
}

pub async fn evict(config_dir: &std::path::Path, name: &str) -> Result<EvictReport> {
    let config = config::load_config(config_dir)?;
    let mut reg = registry::load_registry(config_dir)?;
    let tenant = reg.find_mut(name).ok_or_else(|| ctor::tenant_not_found(name))?.clone();

    {
        let t = reg.find_mut(name).unwrap();
        t.status = TenantStatus::Removing;
    }
    registry::save_registry(config_dir, &reg)?;

    let mut failed = Vec::new();
    let proxy = ProxyClient::new(config.proxy.admin_url.clone());

    if proxy.remove_tenant_routes(name).await.is_err() {
        failed.push("remove_proxy_routes".to_string());
    }

    if let Some(info) = &tenant.suspend_info {
        if tokio::fs::remove_dir_all(&info.snapshot_dir).await.is_err() {
            failed.push("delete_snapshot_dir".to_string());
        }
    }

    if let Some(pid) = tenant.vm_pid {
        let vmm = crate::drivers::vmm::VmmClient::new(tenant.socket_path.display().to_string());
        let _ = vmm.send_ctrl_alt_del().await;
        let exited = super::wait_for_exit(pid, Duration::from_secs(5)).await;
        if !exited {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL);
        }
    }

    if network::remove_isolation_rules(&tenant.tap_dev).await.is_err() {
        failed.push("remove_isolation_rules".to_string());
    }

    if network::remove_nat(&tenant.tap_dev, tenant.gateway_port, tenant.guest_ip).await.is_err() {
        failed.push("remove_nat".to_string());
    }
    if network::delete_tap(&tenant.tap_dev).await.is_err() {
        failed.push("delete_tap".to_string());
    }

    if jailer::cleanup_chroot(&config.paths.chroot_base, &tenant.vm_id).await.is_err() {
        failed.push("cleanup_chroot".to_string());
    }

    if overlay::delete_overlay(&tenant.overlay_path).await.is_err() {
        failed.push("delete_overlay".to_string());
    }

    let key_paths = ssh_key::SshKeyPaths::new(&config.paths.ssh_dir, name);
    if ssh_key::remove(&key_paths).await.is_err() {
        failed.push("remove_ssh_keypair".to_string());
    }

    let mut reg = registry::load_registry(config_dir)?;
    reg.remove(name);
    registry::save_registry(config_dir, &reg)?;

    tracing::info!(tenant = name, failed_steps = ?failed, "tenant evicted");
    Ok(EvictReport { steps_failed: failed })
}
