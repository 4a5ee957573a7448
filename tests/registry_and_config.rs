//! Integration tests for the registry and host config persistence layer.
//!
//! These exercise the on-disk round trip and the subnet allocation math
//! without any real Firecracker, jailer, or Caddy binary present.

use std::net::Ipv4Addr;

use lobsterd::config::HostConfig;
use lobsterd::registry::{allocate_subnet, load_registry, save_registry, validate_name, Registry, Tenant, TenantStatus};

#[test]
fn fresh_registry_round_trips_with_allocators_intact() {
    let dir = tempfile::tempdir().unwrap();
    let mut reg = Registry::default();
    reg.tenants.push(Tenant {
        name: "alpha".into(),
        vm_id: "vm-alpha".into(),
        cid: reg.next_cid,
        host_ip: "10.0.0.5".parse().unwrap(),
        guest_ip: "10.0.0.6".parse().unwrap(),
        tap_dev: "tap-alpha".into(),
        gateway_port: reg.next_gateway_port,
        overlay_path: "/tmp/alpha.ext4".into(),
        socket_path: "/tmp/alpha.sock".into(),
        jail_uid: reg.next_jail_uid,
        agent_token: "tok".into(),
        gateway_token: "gw".into(),
        created_at: chrono::Utc::now(),
        vm_pid: Some(1234),
        status: TenantStatus::Active,
        suspend_info: None,
    });
    reg.next_cid += 1;
    reg.next_subnet_index += 1;
    reg.next_gateway_port += 1;
    reg.next_jail_uid += 1;

    save_registry(dir.path(), &reg).unwrap();
    let loaded = load_registry(dir.path()).unwrap();

    assert_eq!(loaded.tenants.len(), 1);
    assert!(loaded.contains("alpha"));
    assert_eq!(loaded.next_cid, reg.next_cid);
    assert_eq!(loaded.next_gateway_port, reg.next_gateway_port);
    assert_eq!(loaded.next_jail_uid, reg.next_jail_uid);
    loaded.check_invariants(10_000, 9000).unwrap();
}

#[test]
fn subnet_allocation_steps_by_four_per_tenant() {
    let base: Ipv4Addr = "10.0.0.0".parse().unwrap();
    let mut seen = std::collections::HashSet::new();
    for k in 1..=20u32 {
        let (host, guest) = allocate_subnet(base, k);
        assert!(seen.insert(host));
        assert!(seen.insert(guest));
        assert_eq!(u32::from(guest) - u32::from(host), 1, "guest must be host+1");
    }
}

#[test]
fn tenant_names_reject_uppercase_and_leading_digits() {
    assert!(validate_name("web").is_ok());
    assert!(validate_name("web-2").is_ok());
    assert!(validate_name("Web").is_err());
    assert!(validate_name("2web").is_err());
}

#[test]
fn host_config_defaults_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = HostConfig::default();
    lobsterd::config::save_config(dir.path(), &cfg).unwrap();
    let loaded = lobsterd::config::load_config(dir.path()).unwrap();
    assert_eq!(loaded.network.subnet_base, cfg.network.subnet_base);
    assert_eq!(loaded.defaults.mem_size_mib, cfg.defaults.mem_size_mib);
    assert_eq!(loaded.api.port, cfg.api.port);
}
