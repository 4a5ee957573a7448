//! HTTP API (spec §6 "HTTP API"). Bearer-authenticated CRUD/lifecycle
//! surface over the same registry/lifecycle functions the CLI drives,
//! started by `buoy` alongside the watchdog and idle/wake scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::config;
use crate::drivers::agent_client::AgentClient;
use crate::error::{ctor, LobsterError, Result};
use crate::inflight::InFlightSet;
use crate::lifecycle;
use crate::registry;
use crate::watchdog::Watchdog;

pub struct ApiState {
    pub config_dir: PathBuf,
    pub inflight: Arc<InFlightSet>,
    pub watchdog: Arc<Watchdog>,
    pub started_at: Instant,
}

/// Builds the axum `Router`, splitting protected tenant routes (behind
/// bearer auth) from the unauthenticated `/health` and `/openapi.json`
/// probes (spec §6: "Bearer auth on all routes except /health and
/// /openapi.json").
pub fn router(state: Arc<ApiState>) -> Router {
    let protected = Router::new()
        .route("/tenants", get(list_tenants).post(create_tenant))
        .route("/tenants/:name", delete(delete_tenant))
        .route("/tenants/:name/molt", post(molt_tenant))
        .route("/tenants/:name/snap", post(snap_tenant))
        .route("/tenants/:name/token", get(tenant_token))
        .route("/tenants/:name/logs", get(tenant_logs))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    let public = Router::new()
        .route("/health", get(health))
        .route("/openapi.json", get(openapi));

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_bearer(State(state): State<Arc<ApiState>>, headers: HeaderMap, request: axum::extract::Request, next: Next) -> Response {
    let config = match config::load_config(&state.config_dir) {
        Ok(c) => c,
        Err(e) => return error_response(&e),
    };
    let Some(expected) = &config.api.api_token else {
        return error_response(&ctor::permission_denied("no API token configured; run `buoy` to generate one"));
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided != Some(expected.as_str()) {
        return error_response(&ctor::permission_denied("missing or invalid bearer token"));
    }
    next.run(request).await
}

fn error_response(e: &LobsterError) -> Response {
    (e.code.status(), Json(e.strip())).into_response()
}

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let tenant_count = registry::load_registry(&state.config_dir).map(|r| r.tenants.len()).unwrap_or(0);
    Json(serde_json::json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs(),
        "tenantCount": tenant_count,
    }))
}

/// Minimal OpenAPI 3.1 document covering the routes this router serves.
async fn openapi() -> impl IntoResponse {
    Json(serde_json::json!({
        "openapi": "3.1.0",
        "info": { "title": "lobsterd", "version": env!("CARGO_PKG_VERSION") },
        "paths": {
            "/health": { "get": { "summary": "Liveness and tenant count" } },
            "/tenants": {
                "get": { "summary": "List tenants with health" },
                "post": { "summary": "Spawn a tenant" }
            },
            "/tenants/{name}": { "delete": { "summary": "Evict a tenant" } },
            "/tenants/{name}/molt": { "post": { "summary": "Check, repair, re-verify a tenant" } },
            "/tenants/{name}/snap": { "post": { "summary": "Archive a tenant's overlay disk" } },
            "/tenants/{name}/token": { "get": { "summary": "Fetch a tenant's agent token" } },
            "/tenants/{name}/logs": { "get": { "summary": "Fetch a tenant's guest logs" } }
        }
    }))
}

async fn list_tenants(State(state): State<Arc<ApiState>>) -> Response {
    let registry = match registry::load_registry(&state.config_dir) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    let mut out = Vec::with_capacity(registry.tenants.len());
    for tenant in &registry.tenants {
        let health = state.watchdog.snapshot(&tenant.name).await.map(|s| s.state);
        out.push(serde_json::json!({
            "name": tenant.name,
            "status": tenant.status,
            "guestIp": tenant.guest_ip.to_string(),
            "createdAt": tenant.created_at,
            "health": health,
        }));
    }
    Json(out).into_response()
}

#[derive(Deserialize)]
struct CreateTenantBody {
    name: String,
}

async fn create_tenant(State(state): State<Arc<ApiState>>, Json(body): Json<CreateTenantBody>) -> Response {
    match lifecycle::spawn::spawn(&state.config_dir, &body.name).await {
        Ok(result) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "name": result.tenant.name,
                "status": result.tenant.status,
                "guestIp": result.tenant.guest_ip.to_string(),
            })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn delete_tenant(State(state): State<Arc<ApiState>>, Path(name): Path<String>) -> Response {
    match lifecycle::evict::evict(&state.config_dir, &name).await {
        Ok(_) => Json(serde_json::json!({ "message": format!("tenant {} evicted", name) })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn molt_tenant(State(state): State<Arc<ApiState>>, Path(name): Path<String>) -> Response {
    match lifecycle::molt::molt_one(&state.config_dir, &state.inflight, &name).await {
        Ok(report) => Json(serde_json::json!({
            "tenant": report.tenant,
            "healthy": report.healthy,
            "repairs": report.repairs.iter().map(|r| &r.repair).collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn snap_tenant(State(state): State<Arc<ApiState>>, Path(name): Path<String>) -> Response {
    let now_ms = chrono::Utc::now().timestamp_millis();
    match lifecycle::snap::snap(&state.config_dir, &name, now_ms).await {
        Ok(result) => Json(serde_json::json!({ "archivePath": result.archive_path.display().to_string() })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn tenant_token(State(state): State<Arc<ApiState>>, Path(name): Path<String>) -> Response {
    let registry = match registry::load_registry(&state.config_dir) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    match registry.find(&name) {
        Some(tenant) => Json(serde_json::json!({ "token": tenant.agent_token })).into_response(),
        None => error_response(&ctor::tenant_not_found(&name)),
    }
}

async fn tenant_logs(State(state): State<Arc<ApiState>>, Path(name): Path<String>) -> Response {
    let config = match config::load_config(&state.config_dir) {
        Ok(c) => c,
        Err(e) => return error_response(&e),
    };
    let registry = match registry::load_registry(&state.config_dir) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    let Some(tenant) = registry.find(&name) else {
        return error_response(&ctor::tenant_not_found(&name));
    };
    if tenant.is_suspended() {
        return error_response(&ctor::validation_failed(format!("tenant {} is suspended", name)));
    }

    let client = AgentClient::new(tenant.guest_ip, config.agent.agent_port, tenant.agent_token.clone());
    match client.get_logs().await {
        Ok(logs) => Json(serde_json::json!({ "logs": logs })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Runs the bearer HTTP API alongside the watchdog and idle/wake scheduler
/// (spec §6: "Token auto-generated on first buoy run and persisted to
/// config"). Blocks until SIGINT/SIGTERM.
pub async fn run_buoy(config_dir: PathBuf, port: Option<u16>, host: Option<String>) -> Result<()> {
    let mut config = config::load_config(&config_dir)?;
    if config.api.api_token.is_none() {
        config.api.api_token = Some(lifecycle::random_token());
        config::save_config(&config_dir, &config)?;
        tracing::info!("generated a new API bearer token");
    }
    let bind_port = port.unwrap_or(config.api.port);
    let bind_host = host.unwrap_or_else(|| config.api.host.clone());

    let inflight = InFlightSet::new();
    let events = crate::inflight::EventBus::new();
    let proxy = crate::drivers::proxy::ProxyClient::new(config.proxy.admin_url.clone());
    let watchdog = Arc::new(Watchdog::new(config_dir.clone(), inflight.clone(), events.clone(), proxy));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let watchdog_task = tokio::spawn(watchdog.clone().run(config.watchdog.interval_ms, shutdown_rx.clone()));

    let scheduler = Arc::new(crate::scheduler::Scheduler::new(config_dir.clone(), inflight.clone(), events.clone()));
    let consumer_task = tokio::spawn(scheduler.clone().run_wake_consumer());
    let scheduler_loop = {
        let scheduler = scheduler.clone();
        let watchdog = watchdog.clone();
        let config_dir = config_dir.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(5_000));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let config = match config::load_config(&config_dir) {
                            Ok(c) => c,
                            Err(_) => continue,
                        };
                        let states = watchdog.snapshot_all().await;
                        scheduler.tick(&states, config.watchdog.idle_threshold_ms, config.agent.agent_port).await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            scheduler.stop_all_sentinels().await;
                            break;
                        }
                    }
                }
            }
        })
    };

    let state = Arc::new(ApiState { config_dir, inflight, watchdog, started_at: Instant::now() });
    let app = router(state);
    let addr = format!("{}:{}", bind_host, bind_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ctor::unknown(format!("bind {}: {}", addr, e)))?;
    tracing::info!(%addr, "buoy listening");

    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone())).await;
    });

    tokio::signal::ctrl_c().await.map_err(|e| ctor::unknown(format!("signal handler: {}", e)))?;
    let _ = shutdown_tx.send(true);
    let _ = server.await;
    let _ = watchdog_task.await;
    let _ = scheduler_loop.await;
    consumer_task.abort();
    Ok(())
}

async fn wait_for_shutdown(mut rx: tokio::sync::watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_bearer_extracts_the_token_from_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        let provided = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        assert_eq!(provided, Some("abc123"));
    }
}
