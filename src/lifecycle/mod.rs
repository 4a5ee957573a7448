//! Lifecycle commands (spec §4.7): spawn, evict, suspend, resume, molt,
//! snap, hold. Each acquires the in-flight hold for its tenant name before
//! doing anything else, mirroring the teacher's `TenantManager` methods
//! (`create_tenant`, `delete_tenant`, `pause_tenant`, `start_tenant`) but
//! generalized to the spec's wider transaction/undo-stack discipline.

pub mod evict;
pub mod hold;
pub mod molt;
pub mod resume;
pub mod snap;
pub mod spawn;
pub mod suspend;

use std::net::Ipv4Addr;

/// The names `link_chroot_files` hard-links kernel/rootfs/overlay to inside
/// the chroot (spec §4.2 "Jailer driver"). The jailed Firecracker process
/// sees its own root as `/`, so these — not the host-absolute chroot paths
/// `JailerPaths` exposes — are what the VMM API's `kernel_image_path` and
/// `path_on_host` fields must carry.
pub const IN_JAIL_KERNEL: &str = "/vmlinux";
pub const IN_JAIL_ROOTFS: &str = "/rootfs.ext4";
pub const IN_JAIL_OVERLAY: &str = "/overlay.ext4";
pub const IN_JAIL_SNAPSHOT_FILE: &str = "/snapshot_file";
pub const IN_JAIL_MEM_FILE: &str = "/mem_file";

/// Shared boot-sequence inputs, threaded through spawn and the
/// `vm.process` repair so both build the identical VMM argument set
/// (spec §4.7 step 9, §4.3 "vm.process" repair).
pub struct BootPlan<'a> {
    pub vm_id: &'a str,
    pub socket_path: &'a std::path::Path,
    pub guest_ip: Ipv4Addr,
    pub host_ip: Ipv4Addr,
    pub agent_token: &'a str,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub iface_host_dev: &'a str,
}

/// Boot args as assembled in spec §4.7 step 9:
/// `ip=... agent_token=... reboot=k panic=1 pci=off 8250.nr_uarts=0 init=/sbin/overlay-init`
pub fn boot_args(plan: &BootPlan<'_>) -> String {
    format!(
        "{} agent_token={} reboot=k panic=1 pci=off 8250.nr_uarts=0 init=/sbin/overlay-init",
        crate::registry::boot_ip_param(plan.guest_ip, plan.host_ip),
        plan.agent_token,
    )
}

/// Runs the VMM configure/boot/drives/net/start sequence common to spawn
/// and the `vm.process` repair's re-boot step.
pub async fn boot_vm(plan: &BootPlan<'_>) -> crate::error::Result<()> {
    let client = crate::drivers::vmm::VmmClient::new(plan.socket_path.display().to_string());
    client.configure(plan.vcpu_count, plan.mem_size_mib).await?;
    client.set_boot_source(IN_JAIL_KERNEL, &boot_args(plan)).await?;
    client
        .add_drive("rootfs", IN_JAIL_ROOTFS, true, true, Some(&crate::drivers::vmm::default_disk_rate_limiter()))
        .await?;
    client
        .add_drive("overlay", IN_JAIL_OVERLAY, false, false, Some(&crate::drivers::vmm::default_disk_rate_limiter()))
        .await?;
    client
        .add_net_iface(
            "eth0",
            plan.iface_host_dev,
            Some(&crate::drivers::vmm::default_net_rate_limiter()),
            Some(&crate::drivers::vmm::default_net_rate_limiter()),
        )
        .await?;
    client.start().await?;
    Ok(())
}

/// Spawns the jailer+VMM process detached, returning its PID once the API
/// socket appears (spec §4.7 step 7, grounded on the teacher's
/// `start_vm`'s "spawn, then poll for the socket" idiom).
pub async fn spawn_jailer_detached(
    jailer_bin: &str,
    vmm_bin: &str,
    vm_id: &str,
    uid: u32,
    chroot_base: &std::path::Path,
    version: crate::drivers::jailer::CgroupVersion,
    vcpu_count: u32,
    mem_size_mib: u32,
    api_socket: &std::path::Path,
) -> crate::error::Result<u32> {
    let _ = tokio::fs::remove_file(api_socket).await;

    let args = crate::drivers::jailer::build_args(jailer_bin, vm_id, vmm_bin, uid, chroot_base, version, vcpu_count, mem_size_mib);
    let mut command = tokio::process::Command::new(&args[0]);
    command
        .args(&args[1..])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    let child = command
        .spawn()
        .map_err(|e| crate::error::ctor::vm_boot_failed(format!("spawn jailer: {}", e)))?;
    let pid = child.id().ok_or_else(|| crate::error::ctor::vm_boot_failed("jailer exited immediately"))?;
    // Detach: don't hold the Child, or dropping it would SIGKILL on scope exit.
    std::mem::forget(child);

    for _ in 0..50 {
        if api_socket.exists() {
            return Ok(pid);
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    Err(crate::error::ctor::vm_boot_failed("VMM API socket did not appear within 5s"))
}

/// Polls `kill(pid, 0)` every 500ms up to 5s waiting for a process to exit
/// (spec §4.7 "Evict" step: "wait up to 5 s for the VMM to exit").
pub async fn wait_for_exit(pid: u32, budget: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}

/// Runs the `vm.process` repair for `tenant`, rebooting it via the same
/// boot sequence as spawn (spec §4.3 "vm.process" repair). The inner boot
/// future re-links the chroot and re-injects secrets so a recovered VM
/// ends up identical to a freshly spawned one.
pub async fn run_vm_process_repair(
    config_dir: &std::path::Path,
    tenant: &crate::registry::Tenant,
    config: &crate::config::HostConfig,
) -> crate::repairs::RepairResult {
    let paths = crate::drivers::jailer::JailerPaths::new(&config.paths.chroot_base, &tenant.vm_id);
    let version = crate::drivers::jailer::detect_cgroup_version();
    let vm_id = tenant.vm_id.clone();
    let jailer_bin = config.paths.jailer_bin.display().to_string();
    let vmm_bin = config.paths.vmm_bin.display().to_string();
    let jail_uid = tenant.jail_uid;
    let chroot_base = config.paths.chroot_base.clone();
    let vcpu_count = config.defaults.vcpu_count;
    let mem_size_mib = config.defaults.mem_size_mib;
    let api_socket = paths.api_socket();
    let kernel = config.paths.kernel_image.clone();
    let rootfs = config.paths.rootfs_image.clone();
    let overlay = tenant.overlay_path.clone();
    let guest_ip = tenant.guest_ip;
    let host_ip = tenant.host_ip;
    let agent_token = tenant.agent_token.clone();
    let gateway_token = tenant.gateway_token.clone();
    let iface_host_dev = tenant.tap_dev.clone();
    let agent_port = config.agent.agent_port;
    let gateway_defaults = config.gateway_defaults.clone();
    let domain = config.proxy.domain.clone();
    let ssh_dir = config.paths.ssh_dir.clone();
    let name = tenant.name.clone();

    let boot_future = async move {
        let pid = spawn_jailer_detached(
            &jailer_bin,
            &vmm_bin,
            &vm_id,
            jail_uid,
            &chroot_base,
            version,
            vcpu_count,
            mem_size_mib,
            &api_socket,
        )
        .await?;
        link_chroot_files_for_repair(&chroot_base, &vm_id, &kernel, &rootfs, &overlay, jail_uid).await?;
        let plan = BootPlan {
            vm_id: &vm_id,
            socket_path: &api_socket,
            guest_ip,
            host_ip,
            agent_token: &agent_token,
            vcpu_count,
            mem_size_mib,
            iface_host_dev: &iface_host_dev,
        };
        boot_vm(&plan).await?;
        crate::drivers::agent_client::wait_for_agent(guest_ip, agent_port, std::time::Duration::from_secs(30)).await?;

        let public_origin = format!("https://{}.{}", name, domain);
        let mut gateway_config = serde_json::to_value(&gateway_defaults).unwrap_or_default();
        if let Some(origins) = gateway_config.get_mut("allowed_origins").and_then(|v| v.as_array_mut()) {
            origins.push(serde_json::Value::String(public_origin));
        }
        let ssh_key_paths = crate::drivers::ssh_key::SshKeyPaths::new(&ssh_dir, &name);
        let public_key = crate::drivers::ssh_key::read_public_key(&ssh_key_paths).await.ok();
        let client = crate::drivers::agent_client::AgentClient::new(guest_ip, agent_port, agent_token.clone());
        let _ = client
            .inject_secrets(crate::drivers::agent_client::InjectSecrets {
                openclaw_config: Some(gateway_config),
                openclaw_gateway_token: Some(gateway_token),
                ssh_authorized_key: public_key,
            })
            .await;

        Ok(pid)
    };

    crate::repairs::vm_process_repair(config_dir, tenant, config, boot_future).await
}

async fn link_chroot_files_for_repair(
    chroot_base: &std::path::Path,
    vm_id: &str,
    kernel: &std::path::Path,
    rootfs: &std::path::Path,
    overlay: &std::path::Path,
    jail_uid: u32,
) -> crate::error::Result<()> {
    let paths = crate::drivers::jailer::JailerPaths::new(chroot_base, vm_id);
    crate::drivers::jailer::link_chroot_files(&paths, kernel, rootfs, overlay, jail_uid).await
}

pub fn random_token() -> String {
    use rand::Rng;
    let bytes: [u8; 24] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
