//! Molt: check → repair → verify cycle over one or all tenants (spec §4.7
//! "Molt"). Acquires a hold per tenant for the duration of its cycle.

use std::sync::Arc;

use serde::Serialize;

use crate::checks::{self, HealthCheckResult};
use crate::config;
use crate::drivers::proxy::ProxyClient;
use crate::error::{ctor, Result};
use crate::inflight::InFlightSet;
use crate::registry;
use crate::repairs::{self, RepairResult};

#[derive(Debug, Clone, Serialize)]
pub struct MoltReport {
    pub tenant: String,
    pub initial: Vec<HealthCheckResult>,
    pub repairs: Vec<RepairResult>,
    pub r#final: Vec<HealthCheckResult>,
    pub healthy: bool,
}

/// Runs molt for a single tenant: run all checks, repair what's failed,
/// re-run all checks (spec §4.7).
pub async fn molt_one(config_dir: &std::path::Path, inflight: &Arc<InFlightSet>, name: &str) -> Result<MoltReport> {
    let config = config::load_config(config_dir)?;
    let proxy = ProxyClient::new(config.proxy.admin_url.clone());

    let hold = super::hold::acquire(config_dir, inflight, name, config.agent.agent_port).await?;

    let registry = registry::load_registry(config_dir)?;
    let tenant = registry.find(name).ok_or_else(|| ctor::tenant_not_found(name))?.clone();

    let initial = checks::run_all(&tenant, &config, &proxy).await;
    let failed_checks: Vec<String> = initial.iter().filter(|r| r.status != checks::CheckStatus::Ok).map(|r| r.check.clone()).collect();

    let mut repair_results = Vec::new();
    for repair_name in repairs::repairs_to_run(&failed_checks) {
        let result = match repair_name {
            "ensure-gateway-repair" => repairs::ensure_gateway_repair(&tenant, &config).await,
            "net-tap-repair" => repairs::net_tap_repair(&tenant, &config).await,
            "caddy-route-repair" => repairs::caddy_route_repair(&tenant, &config, &proxy).await,
            "vm-process-repair" => super::run_vm_process_repair(config_dir, &tenant, &config).await,
            _ => continue,
        };
        repair_results.push(result);
    }

    let refreshed_registry = registry::load_registry(config_dir)?;
    let refreshed_tenant = refreshed_registry.find(name).cloned().unwrap_or(tenant);
    let r#final = checks::run_all(&refreshed_tenant, &config, &proxy).await;
    let healthy = checks::all_ok(&r#final);

    drop(hold);

    Ok(MoltReport { tenant: name.to_string(), initial, repairs: repair_results, r#final, healthy })
}

/// Runs molt for every `active` tenant (spec CLI `molt` with no name).
pub async fn molt_all(config_dir: &std::path::Path, inflight: &Arc<InFlightSet>) -> Result<Vec<MoltReport>> {
    let registry = registry::load_registry(config_dir)?;
    let names: Vec<String> = registry
        .tenants
        .iter()
        .filter(|t| matches!(t.status, registry::TenantStatus::Active))
        .map(|t| t.name.clone())
        .collect();

    let mut reports = Vec::new();
    for name in names {
        reports.push(molt_one(config_dir, inflight, &name).await?);
    }
    Ok(reports)
}
