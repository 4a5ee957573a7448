//! Spawn: resource allocation plus the transactional bring-up with an undo
//! stack (spec §4.7 "Spawn"). Each side-effecting step pushes an undo action
//! before it runs; on failure the stack unwinds in reverse order, each
//! undo action best-effort (failures only logged).

use std::future::Future;
use std::net::Ipv4Addr;
use std::path::Path;
use std::pin::Pin;

use crate::config::{self, HostConfig};
use crate::drivers::{agent_client::{self, AgentClient, InjectSecrets}, jailer, network, overlay, proxy::ProxyClient, ssh_key};
use crate::error::{ctor, Result};
use crate::registry::{self, Tenant, TenantStatus};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type UndoAction = Box<dyn FnOnce() -> BoxFuture + Send>;

fn undo<F, Fut>(f: F) -> UndoAction
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// Unwinds the undo stack in reverse (LIFO), best-effort; returns how many
/// steps ran for the caller's log line (spec: "count surfaced in the error message").
async fn unwind(mut stack: Vec<UndoAction>) -> usize {
    let mut count = 0;
    while let Some(action) = stack.pop() {
        action().await;
        count += 1;
    }
    count
}

pub struct SpawnResult {
    pub tenant: Tenant,
}

/// Runs the full spawn transaction for `name` (spec §4.7 steps 1-13).
pub async fn spawn(config_dir: &Path, name: &str) -> Result<SpawnResult> {
    registry::validate_name(name)?;

    let config = config::load_config(config_dir)?;
    let mut reg = registry::load_registry(config_dir)?;
    if reg.contains(name) {
        return Err(ctor::tenant_exists(name));
    }

    let cid = reg.next_cid;
    let subnet_index = reg.next_subnet_index;
    let gateway_port = reg.next_gateway_port;
    let jail_uid = reg.next_jail_uid;

    let base: Ipv4Addr = config
        .network
        .subnet_base
        .parse()
        .map_err(|_| ctor::config_invalid("network.subnet_base is not a valid IPv4 address"))?;
    let (host_ip, guest_ip) = registry::allocate_subnet(base, subnet_index);

    let vm_id = format!("vm-{}", name);
    let tap_dev = format!("tap-{}", name);
    let overlay_path = config.paths.overlay_base.join(format!("{}.ext4", name));
    let socket_path = config.paths.sockets_dir.join(format!("{}.sock", vm_id));
    let agent_token = super::random_token();
    let gateway_token = super::random_token();

    let mut undo_stack: Vec<UndoAction> = Vec::new();

    let boot = run_transaction(
        &config,
        name,
        &vm_id,
        &tap_dev,
        &overlay_path,
        &socket_path,
        host_ip,
        guest_ip,
        gateway_port,
        jail_uid,
        &agent_token,
        &gateway_token,
        &mut undo_stack,
    )
    .await;

    let vm_pid = match boot {
        Ok(pid) => pid,
        Err(e) => {
            let undone = unwind(undo_stack).await;
            return Err(ctor::vm_boot_failed(format!("spawn {} failed after {} undo step(s): {}", name, undone, e.message)));
        }
    };

    let tenant = Tenant {
        name: name.to_string(),
        vm_id,
        cid,
        host_ip,
        guest_ip,
        tap_dev,
        gateway_port,
        overlay_path,
        socket_path,
        jail_uid,
        agent_token,
        gateway_token,
        created_at: chrono::Utc::now(),
        vm_pid: Some(vm_pid),
        status: TenantStatus::Active,
        suspend_info: None,
    };

    reg.tenants.push(tenant.clone());
    reg.next_cid += 1;
    reg.next_subnet_index += 1;
    reg.next_gateway_port += 1;
    reg.next_jail_uid += 1;
    registry::save_registry(config_dir, &reg)?;

    tracing::info!(tenant = name, cid, %host_ip, %guest_ip, gateway_port, "tenant spawned");
    Ok(SpawnResult { tenant })
}

#[allow(clippy::too_many_arguments)]
async fn run_transaction(
    config: &HostConfig,
    name: &str,
    vm_id: &str,
    tap_dev: &str,
    overlay_path: &Path,
    socket_path: &Path,
    host_ip: Ipv4Addr,
    guest_ip: Ipv4Addr,
    gateway_port: u16,
    jail_uid: u32,
    agent_token: &str,
    gateway_token: &str,
    stack: &mut Vec<UndoAction>,
) -> Result<u32> {
    // 1. Create overlay image (undo: delete overlay).
    overlay::create_overlay(overlay_path, config.defaults.overlay_mib).await?;
    let p = overlay_path.to_path_buf();
    stack.push(undo(move || async move {
        let _ = overlay::delete_overlay(&p).await;
    }));

    // 2. Create TAP + addresses (undo: delete TAP).
    network::create_tap(tap_dev, host_ip, config.network.subnet_mask).await?;
    let t = tap_dev.to_string();
    stack.push(undo(move || async move {
        let _ = network::delete_tap(&t).await;
    }));

    // 3. Add NAT rules (undo: remove NAT rules).
    network::add_nat(tap_dev, gateway_port, guest_ip).await?;
    let t = tap_dev.to_string();
    stack.push(undo(move || async move {
        let _ = network::remove_nat(&t, gateway_port, guest_ip).await;
    }));

    // 4. Add isolation rules (undo: remove isolation rules).
    network::ensure_chains().await?;
    network::add_isolation_rules(tap_dev).await?;
    let t = tap_dev.to_string();
    stack.push(undo(move || async move {
        let _ = network::remove_isolation_rules(&t).await;
    }));

    // 5. Generate SSH keypair (undo: remove keypair).
    let key_paths = ssh_key::generate(&config.paths.ssh_dir, name).await?;
    let priv_key = key_paths.private_key.clone();
    let pub_key = key_paths.public_key.clone();
    stack.push(undo(move || async move {
        let _ = ssh_key::remove(&ssh_key::SshKeyPaths { private_key: priv_key, public_key: pub_key }).await;
    }));
    let public_key = ssh_key::read_public_key(&key_paths).await?;

    // 6. Clean stale VMM sockets for this tenant (no undo).
    let _ = tokio::fs::remove_file(socket_path).await;

    // 7. Spawn jailer+VMM detached (undo: SIGKILL the PID; remove socket).
    let version = jailer::detect_cgroup_version();
    let paths = jailer::JailerPaths::new(&config.paths.chroot_base, vm_id);
    let pid = super::spawn_jailer_detached(
        &config.paths.jailer_bin.display().to_string(),
        &config.paths.vmm_bin.display().to_string(),
        vm_id,
        jail_uid,
        &config.paths.chroot_base,
        version,
        config.defaults.vcpu_count,
        config.defaults.mem_size_mib,
        &paths.api_socket(),
    )
    .await?;
    let undo_socket = socket_path.to_path_buf();
    stack.push(undo(move || async move {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL);
        let _ = tokio::fs::remove_file(&undo_socket).await;
    }));

    // 8. Hard-link kernel/rootfs/overlay into chroot (undo: delete chroot).
    jailer::link_chroot_files(&paths, &config.paths.kernel_image, &config.paths.rootfs_image, overlay_path, jail_uid).await?;
    let chroot_base = config.paths.chroot_base.clone();
    let undo_vm_id = vm_id.to_string();
    stack.push(undo(move || async move {
        let _ = jailer::cleanup_chroot(&chroot_base, &undo_vm_id).await;
    }));

    // 9. configure → set-boot-source → add rootfs (ro) → add overlay (rw) → add net iface → start.
    let plan = super::BootPlan {
        vm_id,
        socket_path: &paths.api_socket(),
        guest_ip,
        host_ip,
        agent_token,
        vcpu_count: config.defaults.vcpu_count,
        mem_size_mib: config.defaults.mem_size_mib,
        iface_host_dev: tap_dev,
    };
    super::boot_vm(&plan).await?;

    // 10. Wait for agent.
    agent_client::wait_for_agent(guest_ip, config.agent.agent_port, std::time::Duration::from_secs(30)).await?;

    // 11. Inject secrets.
    let public_origin = format!("https://{}.{}", name, config.proxy.domain);
    let mut gateway_config = serde_json::to_value(&config.gateway_defaults).unwrap_or_default();
    if let Some(origins) = gateway_config.get_mut("allowed_origins").and_then(|v| v.as_array_mut()) {
        origins.push(serde_json::Value::String(public_origin));
    }
    let client = AgentClient::new(guest_ip, config.agent.agent_port, agent_token);
    client
        .inject_secrets(InjectSecrets {
            openclaw_config: Some(gateway_config),
            openclaw_gateway_token: Some(gateway_token.to_string()),
            ssh_authorized_key: Some(public_key),
        })
        .await?;

    // 12. Add both reverse-proxy routes (undo: remove routes).
    let proxy = ProxyClient::new(config.proxy.admin_url.clone());
    proxy.add_tenant_routes(name, &config.proxy.domain, guest_ip).await?;
    let proxy_url = config.proxy.admin_url.clone();
    let undo_name = name.to_string();
    stack.push(undo(move || async move {
        let proxy = ProxyClient::new(proxy_url);
        let _ = proxy.remove_tenant_routes(&undo_name).await;
    }));

    Ok(pid)
}
