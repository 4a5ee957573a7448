//! The tenant registry: on-disk source of truth for tenant identity and
//! mutable state, plus the monotonic allocators (spec §3, §4.1).

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ctor, Result};
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Removing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSchedule {
    pub id: String,
    pub name: String,
    pub next_run_at_ms: i64,
    pub schedule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendInfo {
    pub suspended_at: DateTime<Utc>,
    /// Persistent copy of mem-file + vm-state, survives host restarts.
    pub snapshot_dir: PathBuf,
    pub cron_schedules: Vec<CronSchedule>,
    pub next_wake_at_ms: Option<i64>,
    /// TAP rx counter at pause time, seeds idle detection after resume.
    pub last_rx_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    // Immutable identity.
    pub name: String,
    pub vm_id: String,
    pub cid: u32,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub tap_dev: String,
    pub gateway_port: u16,
    pub overlay_path: PathBuf,
    pub socket_path: PathBuf,
    pub jail_uid: u32,
    pub agent_token: String,
    pub gateway_token: String,
    pub created_at: DateTime<Utc>,

    // Mutable.
    pub vm_pid: Option<u32>,
    pub status: TenantStatus,
    pub suspend_info: Option<SuspendInfo>,
}

impl Tenant {
    pub fn is_suspended(&self) -> bool {
        matches!(self.status, TenantStatus::Suspended)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub tenants: Vec<Tenant>,
    pub next_cid: u32,
    pub next_subnet_index: u32,
    pub next_gateway_port: u16,
    pub next_jail_uid: u32,
}

impl Default for Registry {
    fn default() -> Self {
        Self { tenants: Vec::new(), next_cid: 3, next_subnet_index: 1, next_gateway_port: 9000, next_jail_uid: 10_000 }
    }
}

impl Registry {
    pub fn find(&self, name: &str) -> Option<&Tenant> {
        self.tenants.iter().find(|t| t.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Tenant> {
        self.tenants.iter_mut().find(|t| t.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        self.tenants.retain(|t| t.name != name);
    }

    /// Invariant check used by tests and by `molt`/debug tooling (spec §8).
    pub fn check_invariants(&self, uid_start: u32, port_start: u16) -> Result<()> {
        let mut cids = std::collections::HashSet::new();
        let mut ports = std::collections::HashSet::new();
        let mut uids = std::collections::HashSet::new();
        for t in &self.tenants {
            if t.cid < 3 {
                return Err(ctor::validation_failed(format!("tenant {} has cid < 3", t.name)));
            }
            if t.jail_uid < uid_start {
                return Err(ctor::validation_failed(format!("tenant {} has jail_uid below uid_start", t.name)));
            }
            if t.gateway_port < port_start {
                return Err(ctor::validation_failed(format!("tenant {} has gateway_port below port_start", t.name)));
            }
            if !cids.insert(t.cid) {
                return Err(ctor::validation_failed(format!("duplicate cid {}", t.cid)));
            }
            if !ports.insert(t.gateway_port) {
                return Err(ctor::validation_failed(format!("duplicate gateway_port {}", t.gateway_port)));
            }
            if !uids.insert(t.jail_uid) {
                return Err(ctor::validation_failed(format!("duplicate jail_uid {}", t.jail_uid)));
            }
        }
        Ok(())
    }
}

pub fn registry_path(config_dir: &Path) -> PathBuf {
    config_dir.join("registry.json")
}

/// `load_registry() → Registry` (spec §4.1). File absence returns a defaulted value.
pub fn load_registry(config_dir: &Path) -> Result<Registry> {
    Ok(store::read_json(registry_path(config_dir))?.unwrap_or_default())
}

/// `save_registry(Registry)` (spec §4.1), 0600.
pub fn save_registry(config_dir: &Path, registry: &Registry) -> Result<()> {
    store::write_atomic(registry_path(config_dir), registry, store::MODE_SECRET_FILE)
}

/// Tenant name validation: lowercase, begins with a letter, `^[a-z][a-z0-9_-]*$`.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let first = chars.next().ok_or_else(|| ctor::validation_failed("tenant name must not be empty"))?;
    if !first.is_ascii_lowercase() {
        return Err(ctor::validation_failed("tenant name must begin with a lowercase letter"));
    }
    if !chars.clone().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        return Err(ctor::validation_failed("tenant name must match ^[a-z][a-z0-9_-]*$"));
    }
    Ok(())
}

/// Address allocation for subnet index `k` (k ≥ 1), over base `B` (spec §3).
///
/// `net = B + 4k`; `host_ip = net+1`; `guest_ip = net+2`; broadcast is `net+3`.
pub fn allocate_subnet(base: Ipv4Addr, k: u32) -> (Ipv4Addr, Ipv4Addr) {
    let base_u32 = u32::from(base);
    let net = base_u32.wrapping_add(4 * k);
    (Ipv4Addr::from(net + 1), Ipv4Addr::from(net + 2))
}

/// The boot-time kernel IP parameter, encoded exactly as spec §3 requires.
pub fn boot_ip_param(guest_ip: Ipv4Addr, host_ip: Ipv4Addr) -> String {
    format!("ip={}::{}:255.255.255.252::eth0:off", guest_ip, host_ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_allocation_matches_spec_example() {
        // domain example 1: base 10.0.0.0, k=1 → host 10.0.0.5, guest 10.0.0.6
        let base: Ipv4Addr = "10.0.0.0".parse().unwrap();
        let (host, guest) = allocate_subnet(base, 1);
        assert_eq!(host, "10.0.0.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(guest, "10.0.0.6".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn subnet_allocation_second_tenant() {
        let base: Ipv4Addr = "10.0.0.0".parse().unwrap();
        let (host, guest) = allocate_subnet(base, 2);
        assert_eq!(host, "10.0.0.9".parse::<Ipv4Addr>().unwrap());
        assert_eq!(guest, "10.0.0.10".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn boot_ip_param_format() {
        let guest: Ipv4Addr = "10.0.0.6".parse().unwrap();
        let host: Ipv4Addr = "10.0.0.5".parse().unwrap();
        assert_eq!(boot_ip_param(guest, host), "ip=10.0.0.6::10.0.0.5:255.255.255.252::eth0:off");
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("alpha").is_ok());
        assert!(validate_name("alpha-2_b").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Alpha").is_err());
        assert!(validate_name("2alpha").is_err());
        assert!(validate_name("alpha!").is_err());
    }

    #[test]
    fn registry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::default();
        save_registry(dir.path(), &reg).unwrap();
        let loaded = load_registry(dir.path()).unwrap();
        assert_eq!(loaded.next_cid, reg.next_cid);
        assert_eq!(loaded.next_subnet_index, reg.next_subnet_index);
    }

    #[test]
    fn duplicate_cid_fails_invariant_check() {
        let mut reg = Registry::default();
        let mk = |name: &str, cid: u32, port: u16, uid: u32| Tenant {
            name: name.into(),
            vm_id: format!("vm-{name}"),
            cid,
            host_ip: "10.0.0.5".parse().unwrap(),
            guest_ip: "10.0.0.6".parse().unwrap(),
            tap_dev: format!("tap-{name}"),
            gateway_port: port,
            overlay_path: "/tmp/o".into(),
            socket_path: "/tmp/s".into(),
            jail_uid: uid,
            agent_token: "t".into(),
            gateway_token: "g".into(),
            created_at: Utc::now(),
            vm_pid: None,
            status: TenantStatus::Active,
            suspend_info: None,
        };
        reg.tenants.push(mk("a", 3, 9000, 10_000));
        reg.tenants.push(mk("b", 3, 9001, 10_001));
        assert!(reg.check_invariants(10_000, 9000).is_err());
    }
}
