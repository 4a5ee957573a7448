//! Repair table: idempotent fixers keyed by check name (spec §4.3 "Repair
//! table"). Each repair returns `fixed: bool` plus an ordered action log.
//! The watchdog loop deduplicates across failed checks within a tick so a
//! repair never runs twice for the same tenant on the same pass.

use std::collections::HashSet;

use serde::Serialize;

use crate::config::HostConfig;
use crate::drivers::{agent_client::AgentClient, jailer, network, proxy::ProxyClient, vmm::VmmClient};
use crate::error::Result;
use crate::registry::Tenant;

#[derive(Debug, Clone, Serialize)]
pub struct RepairResult {
    pub repair: String,
    pub fixed: bool,
    pub actions: Vec<String>,
}

impl RepairResult {
    fn new(repair: &str) -> Self {
        Self { repair: repair.into(), fixed: false, actions: Vec::new() }
    }

    fn log(&mut self, action: impl Into<String>) {
        self.actions.push(action.into());
    }
}

/// Maps a failed check name to the repair that should run for it (spec §4.3).
pub fn repair_for_check(check: &str) -> Option<&'static str> {
    match check {
        "vm.process" => Some("vm-process-repair"),
        "vm.responsive" => Some("ensure-gateway-repair"),
        "net.tap" => Some("net-tap-repair"),
        "net.gateway" => Some("ensure-gateway-repair"),
        "net.caddy-route" => Some("caddy-route-repair"),
        _ => None,
    }
}

/// Given this tick's failed checks, returns the distinct repair names to run
/// (spec §4.3: "Deduplicate across failed checks").
pub fn repairs_to_run(failed_checks: &[String]) -> Vec<&'static str> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for check in failed_checks {
        if let Some(repair) = repair_for_check(check) {
            if seen.insert(repair) {
                out.push(repair);
            }
        }
    }
    out
}

/// `ensure-gateway repair`: launches the in-guest gateway via the agent if
/// not already running (spec §4.3).
pub async fn ensure_gateway_repair(tenant: &Tenant, config: &HostConfig) -> RepairResult {
    let mut result = RepairResult::new("ensure-gateway-repair");
    let client = AgentClient::new(tenant.guest_ip, config.agent.agent_port, &tenant.agent_token);
    match client.ensure_gateway().await {
        Ok(value) => {
            result.fixed = true;
            result.log(format!("ensure-gateway -> {}", value));
        }
        Err(e) => result.log(format!("ensure-gateway failed: {}", e.message)),
    }
    result
}

/// `net.tap` repair: recreate TAP, restore NAT, restore isolation rules.
pub async fn net_tap_repair(tenant: &Tenant, config: &HostConfig) -> RepairResult {
    let mut result = RepairResult::new("net-tap-repair");

    if let Err(e) = network::create_tap(&tenant.tap_dev, tenant.host_ip, config.network.subnet_mask).await {
        result.log(format!("create_tap failed: {}", e.message));
        return result;
    }
    result.log(format!("recreated {}", tenant.tap_dev));

    if let Err(e) = network::add_nat(&tenant.tap_dev, tenant.gateway_port, tenant.guest_ip).await {
        result.log(format!("add_nat failed: {}", e.message));
        return result;
    }
    result.log("restored NAT rules");

    if let Err(e) = network::ensure_chains().await {
        result.log(format!("ensure_chains failed: {}", e.message));
        return result;
    }
    if let Err(e) = network::add_isolation_rules(&tenant.tap_dev).await {
        result.log(format!("add_isolation_rules failed: {}", e.message));
        return result;
    }
    result.log("restored isolation rules");

    result.fixed = true;
    result
}

/// `net.caddy-route` repair: re-add both tenant routes.
pub async fn caddy_route_repair(tenant: &Tenant, config: &HostConfig, proxy: &ProxyClient) -> RepairResult {
    let mut result = RepairResult::new("caddy-route-repair");
    match proxy.add_tenant_routes(&tenant.name, &config.proxy.domain, tenant.guest_ip).await {
        Ok(()) => {
            result.fixed = true;
            result.log("re-added both routes");
        }
        Err(e) => result.log(format!("add_tenant_routes failed: {}", e.message)),
    }
    result
}

/// `vm.process` repair: kill any stale PID, kill orphan VMM processes for
/// this `vm_id`, rebuild the jailer chroot, re-boot the VM, wait for the
/// agent, re-inject secrets, and persist the new `vm_pid` to the registry
/// (spec §4.3 "vm.process" repair). Mirrors spawn's boot sequence (spec
/// §4.7 step 9) but re-entrant over an existing tenant record rather than
/// a freshly allocated one.
pub async fn vm_process_repair(
    config_dir: &std::path::Path,
    tenant: &Tenant,
    config: &HostConfig,
    spawn_boot: impl std::future::Future<Output = Result<u32>>,
) -> RepairResult {
    let mut result = RepairResult::new("vm-process-repair");

    if let Some(pid) = tenant.vm_pid {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL);
        result.log(format!("killed stale pid {}", pid));
    }

    let _ = crate::exec::unchecked("pkill", &["-9", "-f", &format!("--id {}", tenant.vm_id)]).await;
    result.log("swept orphan VMM processes");

    if let Err(e) = jailer::cleanup_chroot(&config.paths.chroot_base, &tenant.vm_id).await {
        result.log(format!("cleanup_chroot failed: {}", e.message));
        return result;
    }
    result.log("cleaned up chroot");

    match spawn_boot.await {
        Ok(new_pid) => {
            result.log(format!("re-booted with pid {}", new_pid));
            match crate::registry::load_registry(config_dir) {
                Ok(mut reg) => {
                    if let Some(t) = reg.find_mut(&tenant.name) {
                        t.vm_pid = Some(new_pid);
                    }
                    match crate::registry::save_registry(config_dir, &reg) {
                        Ok(()) => {
                            result.fixed = true;
                            result.log("persisted new vm_pid to registry");
                        }
                        Err(e) => result.log(format!("failed to persist vm_pid: {}", e.message)),
                    }
                }
                Err(e) => result.log(format!("failed to reload registry: {}", e.message)),
            }
        }
        Err(e) => result.log(format!("re-boot failed: {}", e.message)),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repairs_to_run_dedups() {
        let failed = vec!["vm.responsive".to_string(), "net.gateway".to_string(), "net.tap".to_string()];
        let repairs = repairs_to_run(&failed);
        assert_eq!(repairs, vec!["ensure-gateway-repair", "net-tap-repair"]);
    }

    #[test]
    fn unknown_check_has_no_repair() {
        assert!(repair_for_check("does.not.exist").is_none());
    }
}
