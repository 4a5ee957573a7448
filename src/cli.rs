//! Command-line surface (spec §6 "CLI surface"). Every subcommand is a thin
//! wrapper over the same lifecycle/registry/config functions the HTTP API
//! calls; a one-shot CLI invocation scopes its own in-flight set rather than
//! sharing one with a running daemon (spec §9 "Global state").

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config;
use crate::drivers::agent_client::AgentClient;
use crate::drivers::ssh_key::SshKeyPaths;
use crate::error::{ctor, LobsterError, Result};
use crate::inflight::InFlightSet;
use crate::lifecycle;
use crate::registry::{self, TenantStatus};

#[derive(Parser)]
#[command(name = "lobsterd", version, about = "Multi-tenant microVM orchestrator")]
pub struct Cli {
    /// Directory holding config.json and registry.json.
    #[arg(long, global = true, env = "LOBSTERD_CONFIG_DIR", default_value = "/etc/lobsterd")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Scaffold config/registry directories and load the proxy's base config.
    Init {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        yes: bool,
    },
    /// Remove host scaffolding. Destructive; asks for confirmation.
    Uninit {
        #[arg(long)]
        yes: bool,
    },
    /// Allocate resources and boot a new tenant.
    Spawn { name: String },
    /// Tear down a tenant and release its resources.
    Evict {
        name: String,
        #[arg(long)]
        yes: bool,
    },
    /// Run a command over SSH against a tenant's guest.
    Exec {
        name: String,
        cmd: Vec<String>,
    },
    /// Print the effective in-guest gateway config for a tenant.
    Configure { name: String },
    /// Print the static device assignment (drives, net iface) for a tenant.
    Devices { name: String },
    /// Snapshot and stop a tenant's VM.
    Suspend { name: String },
    /// Resume a suspended tenant from its snapshot.
    Resume { name: String },
    /// Check, repair, and re-verify one tenant (or all, if omitted).
    Molt { name: Option<String> },
    /// Archive a tenant's overlay disk.
    Snap {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// Run the watchdog tick loop in the foreground.
    Watch {
        #[arg(long)]
        daemon: bool,
    },
    /// List every tenant with its current health.
    Tank {
        #[arg(long)]
        json: bool,
    },
    /// Print guest or watchdog logs.
    Logs {
        name: Option<String>,
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        watchdog: bool,
    },
    /// Print a tenant's agent bearer token.
    Token { name: String },
    /// Run the watchdog, scheduler, and bearer HTTP API.
    Buoy {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
    },
}

/// Parses argv, dispatches, and maps the result to a process exit code
/// (spec §6: "Exit 0 on success, 1 on any `is_err()` result").
pub async fn run() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("✗ {}", e.message);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<()> {
    let dir = &cli.config_dir;
    match &cli.command {
        Command::Init { domain, yes } => cmd_init(dir, domain.as_deref(), *yes).await,
        Command::Uninit { yes } => cmd_uninit(dir, *yes).await,
        Command::Spawn { name } => cmd_spawn(dir, name).await,
        Command::Evict { name, yes } => cmd_evict(dir, name, *yes).await,
        Command::Exec { name, cmd } => cmd_exec(dir, name, cmd).await,
        Command::Configure { name } => cmd_configure(dir, name).await,
        Command::Devices { name } => cmd_devices(dir, name).await,
        Command::Suspend { name } => cmd_suspend(dir, name).await,
        Command::Resume { name } => cmd_resume(dir, name).await,
        Command::Molt { name } => cmd_molt(dir, name.as_deref()).await,
        Command::Snap { name, json } => cmd_snap(dir, name, *json).await,
        Command::Watch { daemon } => cmd_watch(dir, *daemon).await,
        Command::Tank { json } => cmd_tank(dir, *json).await,
        Command::Logs { name, service, watchdog } => cmd_logs(dir, name.as_deref(), service.as_deref(), *watchdog).await,
        Command::Token { name } => cmd_token(dir, name).await,
        Command::Buoy { port, host } => crate::api::run_buoy(dir.clone(), *port, host.clone()).await,
    }
}

fn confirm(prompt: &str) -> bool {
    use std::io::Write;
    eprint!("{} [y/N] ", prompt);
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

async fn cmd_init(dir: &std::path::Path, domain: Option<&str>, yes: bool) -> Result<()> {
    let path = config::config_path(dir);
    if path.exists() && !yes && !confirm(&format!("{} already exists. Overwrite?", path.display())) {
        return Err(ctor::validation_failed("init cancelled"));
    }

    let mut cfg = config::HostConfig::default();
    if let Some(domain) = domain {
        cfg.proxy.domain = domain.to_string();
    }
    config::save_config(dir, &cfg)?;

    for path in [
        &cfg.paths.overlay_base,
        &cfg.paths.sockets_dir,
        &cfg.paths.kernels_dir,
        &cfg.paths.snapshots_dir,
        &cfg.paths.ssh_dir,
        &cfg.paths.chroot_base,
    ] {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| LobsterError::with_cause(crate::error::ErrorCode::ConfigInvalid, format!("mkdir {}", path.display()), e))?;
    }

    if !registry::registry_path(dir).exists() {
        registry::save_registry(dir, &registry::Registry::default())?;
    }

    let proxy = crate::drivers::proxy::ProxyClient::new(cfg.proxy.admin_url.clone());
    let tls = cfg.proxy.tls_cert_path.as_ref().zip(cfg.proxy.tls_key_path.as_ref());
    let tls = tls.map(|(c, k)| (c.display().to_string(), k.display().to_string()));
    let tls_ref = tls.as_ref().map(|(c, k)| (c.as_str(), k.as_str()));
    if let Err(e) = proxy.load(&crate::drivers::proxy::base_config(&cfg.proxy.domain, tls_ref)).await {
        eprintln!("init: proxy admin API not reachable yet ({}); run `buoy` once it's up", e.message);
    }

    println!("lobsterd initialised at {}", dir.display());
    Ok(())
}

async fn cmd_uninit(dir: &std::path::Path, yes: bool) -> Result<()> {
    if !yes && !confirm(&format!("This removes {} and all tenant registry state. Continue?", dir.display())) {
        return Err(ctor::validation_failed("uninit cancelled"));
    }
    if dir.exists() {
        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| LobsterError::with_cause(crate::error::ErrorCode::ConfigInvalid, format!("remove {}", dir.display()), e))?;
    }
    println!("lobsterd scaffolding removed.");
    Ok(())
}

async fn cmd_spawn(dir: &std::path::Path, name: &str) -> Result<()> {
    let result = lifecycle::spawn::spawn(dir, name).await?;
    println!("spawned '{}' (cid={}, guest_ip={})", result.tenant.name, result.tenant.cid, result.tenant.guest_ip);
    Ok(())
}

async fn cmd_evict(dir: &std::path::Path, name: &str, yes: bool) -> Result<()> {
    if !yes && !confirm(&format!("Evict tenant '{}'? This destroys its overlay disk.", name)) {
        return Err(ctor::validation_failed("evict cancelled"));
    }
    let report = lifecycle::evict::evict(dir, name).await?;
    if report.steps_failed.is_empty() {
        println!("evicted '{}'", name);
    } else {
        println!("evicted '{}' (best-effort steps failed: {})", name, report.steps_failed.join(", "));
    }
    Ok(())
}

/// Not a guest-agent RPC (the agent protocol has none): shells out to the
/// real `ssh` binary against the tenant's provisioned keypair, mirroring
/// how an operator would reach the guest directly (spec §4.2 "SSH driver").
async fn cmd_exec(dir: &std::path::Path, name: &str, cmd: &[String]) -> Result<()> {
    let config = config::load_config(dir)?;
    let reg = registry::load_registry(dir)?;
    let tenant = reg.find(name).ok_or_else(|| ctor::tenant_not_found(name))?;
    let inflight = InFlightSet::new();
    let hold = lifecycle::hold::acquire(dir, &inflight, name, config.agent.agent_port).await?;

    let keys = SshKeyPaths::new(&config.paths.ssh_dir, name);
    let mut args = vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-i".to_string(),
        keys.private_key.display().to_string(),
        format!("root@{}", tenant.guest_ip),
    ];
    args.extend(cmd.iter().cloned());

    let status = tokio::process::Command::new("ssh")
        .args(&args)
        .status()
        .await
        .map_err(|e| ctor::exec_failed(format!("spawn ssh: {}", e)))?;
    drop(hold);

    if !status.success() {
        return Err(ctor::exec_failed(format!("ssh exited with {}", status)));
    }
    Ok(())
}

/// Prints the same gateway config object spawn injects into the guest
/// (spec §4.7 step 11), merged with this tenant's public origin.
async fn cmd_configure(dir: &std::path::Path, name: &str) -> Result<()> {
    let config = config::load_config(dir)?;
    let reg = registry::load_registry(dir)?;
    let tenant = reg.find(name).ok_or_else(|| ctor::tenant_not_found(name))?;

    let public_origin = format!("https://{}.{}", tenant.name, config.proxy.domain);
    let mut gateway_config = serde_json::to_value(&config.gateway_defaults).unwrap_or_default();
    if let Some(origins) = gateway_config.get_mut("allowed_origins").and_then(|v| v.as_array_mut()) {
        origins.push(serde_json::Value::String(public_origin));
    }
    println!("{}", serde_json::to_string_pretty(&gateway_config).unwrap());
    Ok(())
}

/// Reports the static drive/interface layout the VMM API has no way to
/// query back (spec §4.2 "VMM driver": write-only configure/boot API).
async fn cmd_devices(dir: &std::path::Path, name: &str) -> Result<()> {
    let config = config::load_config(dir)?;
    let reg = registry::load_registry(dir)?;
    let tenant = reg.find(name).ok_or_else(|| ctor::tenant_not_found(name))?;

    println!("rootfs: {} (read-only)", config.paths.rootfs_image.display());
    println!("overlay: {} (read-write)", tenant.overlay_path.display());
    println!("net: eth0 -> {} ({} <-> {})", tenant.tap_dev, tenant.host_ip, tenant.guest_ip);
    Ok(())
}

async fn cmd_suspend(dir: &std::path::Path, name: &str) -> Result<()> {
    lifecycle::suspend::suspend(dir, name).await?;
    println!("suspended '{}'", name);
    Ok(())
}

/// Resumes directly, mirroring `hold::acquire`'s own auto-resume path: a
/// bare CLI invocation has no running `Scheduler` to route a wake request
/// through (spec §9 "Global state": one-shot commands scope their own
/// in-flight set).
async fn cmd_resume(dir: &std::path::Path, name: &str) -> Result<()> {
    let inflight = InFlightSet::new();
    let _guard = inflight
        .try_acquire(name)
        .await
        .ok_or_else(|| ctor::lock_failed(format!("tenant {} is already in flight", name)))?;
    lifecycle::resume::resume(dir, name).await?;
    println!("resumed '{}'", name);
    Ok(())
}

async fn cmd_molt(dir: &std::path::Path, name: Option<&str>) -> Result<()> {
    let inflight = InFlightSet::new();
    let reports = match name {
        Some(name) => vec![lifecycle::molt::molt_one(dir, &inflight, name).await?],
        None => lifecycle::molt::molt_all(dir, &inflight).await?,
    };

    let mut unhealthy = Vec::new();
    for report in &reports {
        println!("{}: {}", report.tenant, if report.healthy { "healthy" } else { "unhealthy" });
        for repair in &report.repairs {
            println!("  repair {}: fixed={} actions={:?}", repair.repair, repair.fixed, repair.actions);
        }
        if !report.healthy {
            unhealthy.push(report.tenant.clone());
        }
    }

    if !unhealthy.is_empty() {
        return Err(ctor::unknown(format!("tenant(s) not healthy after molt: {}", unhealthy.join(", "))));
    }
    Ok(())
}

async fn cmd_snap(dir: &std::path::Path, name: &str, json: bool) -> Result<()> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let result = lifecycle::snap::snap(dir, name, now_ms).await?;
    if json {
        println!("{}", serde_json::json!({ "archive_path": result.archive_path.display().to_string() }));
    } else {
        println!("snapped '{}' -> {}", name, result.archive_path.display());
    }
    Ok(())
}

/// Runs the watchdog tick loop in the foreground; `--daemon` additionally
/// runs the idle/wake scheduler so suspended tenants still wake on traffic
/// (spec §4.5, §4.6).
async fn cmd_watch(dir: &std::path::Path, daemon: bool) -> Result<()> {
    let config = config::load_config(dir)?;
    let inflight = InFlightSet::new();
    let events = crate::inflight::EventBus::new();
    let mut event_rx = events.subscribe();
    let proxy = crate::drivers::proxy::ProxyClient::new(config.proxy.admin_url.clone());
    let watchdog = Arc::new(crate::watchdog::Watchdog::new(dir.to_path_buf(), inflight.clone(), events.clone(), proxy));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let watchdog_task = tokio::spawn(watchdog.clone().run(config.watchdog.interval_ms, shutdown_rx.clone()));

    let scheduler_task = if daemon {
        let scheduler = Arc::new(crate::scheduler::Scheduler::new(dir.to_path_buf(), inflight.clone(), events.clone()));
        Some(tokio::spawn(run_scheduler_loop(scheduler, watchdog.clone(), dir.to_path_buf(), shutdown_rx.clone())))
    } else {
        None
    };

    let logger = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            tracing::info!(?event, "watchdog event");
        }
    });

    tokio::signal::ctrl_c().await.map_err(|e| ctor::unknown(format!("signal handler: {}", e)))?;
    let _ = shutdown_tx.send(true);
    let _ = watchdog_task.await;
    if let Some(task) = scheduler_task {
        let _ = task.await;
    }
    logger.abort();
    Ok(())
}

async fn run_scheduler_loop(
    scheduler: Arc<crate::scheduler::Scheduler>,
    watchdog: Arc<crate::watchdog::Watchdog>,
    dir: PathBuf,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let consumer = tokio::spawn(scheduler.clone().run_wake_consumer());
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(5_000));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let config = match config::load_config(&dir) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                let states = watchdog.snapshot_all().await;
                scheduler.tick(&states, config.watchdog.idle_threshold_ms, config.agent.agent_port).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    scheduler.stop_all_sentinels().await;
                    break;
                }
            }
        }
    }
    consumer.abort();
}

async fn cmd_tank(dir: &std::path::Path, json: bool) -> Result<()> {
    let reg = registry::load_registry(dir)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reg.tenants).unwrap());
        return Ok(());
    }
    for tenant in &reg.tenants {
        let status = match tenant.status {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Removing => "removing",
        };
        println!("{:<16} {:<10} cid={:<4} guest_ip={}", tenant.name, status, tenant.cid, tenant.guest_ip);
    }
    Ok(())
}

async fn cmd_logs(dir: &std::path::Path, name: Option<&str>, service: Option<&str>, watchdog: bool) -> Result<()> {
    if watchdog || name.is_none() {
        println!("watchdog/scheduler logs are emitted via `tracing`; run `lobsterd watch` with RUST_LOG set to capture them.");
        return Ok(());
    }
    let name = name.unwrap();
    let config = config::load_config(dir)?;
    let reg = registry::load_registry(dir)?;
    let tenant = reg.find(name).ok_or_else(|| ctor::tenant_not_found(name))?;
    if tenant.is_suspended() {
        return Err(ctor::validation_failed(format!("tenant {} is suspended; resume it to fetch logs", name)));
    }

    let client = AgentClient::new(tenant.guest_ip, config.agent.agent_port, tenant.agent_token.clone());
    let logs = client.get_logs().await?;
    let _ = service;
    println!("{}", logs);
    Ok(())
}

async fn cmd_token(dir: &std::path::Path, name: &str) -> Result<()> {
    let reg = registry::load_registry(dir)?;
    let tenant = reg.find(name).ok_or_else(|| ctor::tenant_not_found(name))?;
    println!("{}", tenant.agent_token);
    Ok(())
}
