//! `HostConfig` — paths, defaults, watchdog/API tunings (spec §3, §4.1, §6).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub vmm_bin: PathBuf,
    pub jailer_bin: PathBuf,
    pub kernel_image: PathBuf,
    pub rootfs_image: PathBuf,
    pub chroot_base: PathBuf,
    pub overlay_base: PathBuf,
    pub sockets_dir: PathBuf,
    pub kernels_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub ssh_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            vmm_bin: "/usr/bin/firecracker".into(),
            jailer_bin: "/usr/bin/jailer".into(),
            kernel_image: "/var/lib/lobsterd/kernels/vmlinux".into(),
            rootfs_image: "/var/lib/lobsterd/rootfs.ext4".into(),
            chroot_base: "/var/lib/lobsterd/jailer".into(),
            overlay_base: "/var/lib/lobsterd/overlays".into(),
            sockets_dir: "/var/lib/lobsterd/sockets".into(),
            kernels_dir: "/var/lib/lobsterd/kernels".into(),
            snapshots_dir: "/var/lib/lobsterd/snapshots".into(),
            ssh_dir: "/var/lib/lobsterd/ssh".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DefaultsConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub overlay_mib: u32,
    pub snapshot_retention: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self { vcpu_count: 2, mem_size_mib: 1024, overlay_mib: 4096, snapshot_retention: 7 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bridge_name: String,
    /// Dotted-form IPv4 base of the /30 stepping range (spec §3 "Address allocation").
    pub subnet_base: String,
    pub subnet_mask: u8,
    pub gateway_port_start: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: "lobster0".into(),
            subnet_base: "10.0.0.0".into(),
            subnet_mask: 30,
            gateway_port_start: 9000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    pub admin_url: String,
    pub domain: String,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_port: u16,
    pub health_port: u16,
    pub connect_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { agent_port: 52, health_port: 53, connect_timeout_ms: 3000 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WatchdogTunings {
    pub interval_ms: u64,
    pub max_repair_attempts: u32,
    pub repair_cooldown_ms: u64,
    pub idle_threshold_ms: u64,
    pub traffic_poll_ms: u64,
    pub cron_wake_ahead_ms: u64,
}

impl Default for WatchdogTunings {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            max_repair_attempts: 3,
            repair_cooldown_ms: 60_000,
            idle_threshold_ms: 10 * 60_000,
            traffic_poll_ms: 5_000,
            cron_wake_ahead_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub port: u16,
    pub host: String,
    pub api_token: Option<String>,
    pub agent_lockdown: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 7711, host: "0.0.0.0".into(), api_token: None, agent_lockdown: false }
    }
}

/// The default in-guest gateway config object (merged per-tenant on spawn by
/// injecting the tenant's public origin into `allowed_origins`, spec §4.7 step 11).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayDefaults {
    pub allowed_origins: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub paths: PathsConfig,
    pub defaults: DefaultsConfig,
    pub network: NetworkConfig,
    pub proxy: ProxyConfig,
    pub agent: AgentConfig,
    pub watchdog: WatchdogTunings,
    pub api: ApiConfig,
    pub gateway_defaults: GatewayDefaults,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            defaults: DefaultsConfig::default(),
            network: NetworkConfig::default(),
            proxy: ProxyConfig { admin_url: "http://localhost:2019".into(), ..Default::default() },
            agent: AgentConfig::default(),
            watchdog: WatchdogTunings::default(),
            api: ApiConfig::default(),
            gateway_defaults: GatewayDefaults::default(),
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.json")
}

/// `load_config() → HostConfig` (spec §4.1). File absence returns a defaulted value.
pub fn load_config(config_dir: &Path) -> Result<HostConfig> {
    let path = config_path(config_dir);
    Ok(store::read_json(path)?.unwrap_or_default())
}

/// `save_config(HostConfig)` (spec §4.1). 0600 on the file, 0711 on the directory.
pub fn save_config(config_dir: &Path, config: &HostConfig) -> Result<()> {
    store::ensure_dir(config_dir, store::MODE_CONFIG_DIR)?;
    store::write_atomic(config_path(config_dir), config, store::MODE_SECRET_FILE)?;
    if let Some(cert_dir) = config.proxy.tls_cert_path.as_ref().and_then(|p| p.parent()) {
        if cert_dir.exists() {
            store::ensure_dir(cert_dir, store::MODE_CERT_DIR)?;
        }
    }
    if let Some(key_path) = &config.proxy.tls_key_path {
        if key_path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(store::MODE_TLS_KEY));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_ranges() {
        let cfg = HostConfig::default();
        assert_eq!(cfg.network.subnet_mask, 30);
        assert_eq!(cfg.network.gateway_port_start, 9000);
        assert_eq!(cfg.defaults.vcpu_count, 2);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = HostConfig::default();
        cfg.network.bridge_name = "test0".into();
        save_config(dir.path(), &cfg).unwrap();
        let loaded = load_config(dir.path()).unwrap();
        assert_eq!(loaded.network.bridge_name, "test0");
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(dir.path()).unwrap();
        assert_eq!(loaded.network.gateway_port_start, HostConfig::default().network.gateway_port_start);
    }
}
