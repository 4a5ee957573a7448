//! Proxy driver: admin-API client for the Caddy-class reverse proxy
//! (spec §4.2 "Proxy driver"). Reworked from the teacher's in-process
//! `proxy.rs` hyper middleware into a `reqwest`-based client against the
//! sidecar's own JSON admin API, since the spec's gateway is an external
//! process rather than something lobsterd terminates HTTP inside of.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::{ctor, Result};

const PROXY_TIMEOUT: Duration = Duration::from_secs(5);
const ROUTES_PATH: &str = "/config/apps/http/servers/lobster/routes";

pub struct ProxyClient {
    base_url: String,
    http: reqwest::Client,
}

impl ProxyClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::builder().timeout(PROXY_TIMEOUT).build().expect("reqwest client"),
        }
    }

    /// `POST /load`, replacing the whole config (used by `init`).
    pub async fn load(&self, config: &Value) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/load", self.base_url))
            .json(config)
            .send()
            .await
            .map_err(|e| ctor::caddy_api_error(format!("POST /load: {}", e)))?;
        ensure_ok(resp).await
    }

    async fn append_route(&self, route: &Value) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, ROUTES_PATH))
            .json(route)
            .send()
            .await
            .map_err(|e| ctor::caddy_api_error(format!("POST {}: {}", ROUTES_PATH, e)))?;
        ensure_ok(resp).await
    }

    /// `DELETE /id/<route-id>`. Missing routes are tolerated (spec §4.2).
    async fn delete_route(&self, route_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(format!("{}/id/{}", self.base_url, route_id))
            .send()
            .await
            .map_err(|e| ctor::caddy_api_error(format!("DELETE /id/{}: {}", route_id, e)))?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(ctor::caddy_api_error(format!("DELETE /id/{} -> {}", route_id, resp.status())))
    }

    /// `GET /config/.../routes`, returning the raw route array.
    pub async fn list_routes(&self) -> Result<Vec<Value>> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, ROUTES_PATH))
            .send()
            .await
            .map_err(|e| ctor::caddy_api_error(format!("GET {}: {}", ROUTES_PATH, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ctor::caddy_api_error(format!("GET {} -> {}", ROUTES_PATH, status)));
        }
        resp.json::<Vec<Value>>().await.map_err(|e| ctor::caddy_api_error(format!("decode routes: {}", e)))
    }

    /// Add both per-tenant routes, WebSocket first so match order selects
    /// it ahead of the plain HTTP route (spec §4.2).
    pub async fn add_tenant_routes(&self, name: &str, domain: &str, guest_ip: std::net::Ipv4Addr) -> Result<()> {
        self.append_route(&ws_route(name, domain, guest_ip)).await?;
        self.append_route(&http_route(name, domain, guest_ip)).await?;
        Ok(())
    }

    /// Two DELETEs by `@id`, tolerating missing routes.
    pub async fn remove_tenant_routes(&self, name: &str) -> Result<()> {
        self.delete_route(&ws_route_id(name)).await?;
        self.delete_route(&http_route_id(name)).await?;
        Ok(())
    }

    /// Used by the `net.caddy-route` check: both route ids present.
    pub async fn has_tenant_routes(&self, name: &str) -> Result<bool> {
        let routes = self.list_routes().await?;
        let ws_id = ws_route_id(name);
        let http_id = http_route_id(name);
        let ids: std::collections::HashSet<&str> =
            routes.iter().filter_map(|r| r.get("@id").and_then(Value::as_str)).collect();
        Ok(ids.contains(ws_id.as_str()) && ids.contains(http_id.as_str()))
    }
}

async fn ensure_ok(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ctor::caddy_api_error(format!("proxy admin API returned {}: {}", status, body)))
}

fn ws_route_id(name: &str) -> String {
    format!("lobster-{}-ws", name)
}

fn http_route_id(name: &str) -> String {
    format!("lobster-{}", name)
}

fn ws_route(name: &str, domain: &str, guest_ip: std::net::Ipv4Addr) -> Value {
    let host = format!("{}.{}", name, domain);
    json!({
        "@id": ws_route_id(name),
        "match": [{
            "host": [host],
            "header": { "Connection": ["*Upgrade*"] },
        }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": format!("{}:9000", guest_ip) }],
            "transport": { "protocol": "http", "dial_timeout": "3s" },
            "load_balancing": { "try_duration": "30s", "try_interval": "500ms" },
        }],
    })
}

fn http_route(name: &str, domain: &str, guest_ip: std::net::Ipv4Addr) -> Value {
    let host = format!("{}.{}", name, domain);
    json!({
        "@id": http_route_id(name),
        "match": [{ "host": [host] }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": format!("{}:9000", guest_ip) }],
            "transport": { "protocol": "http", "dial_timeout": "3s" },
            "load_balancing": { "try_duration": "30s", "try_interval": "500ms" },
            "headers": { "request": { "set": { "Connection": ["close"] } } },
        }],
    })
}

/// The base `lobster` server config written by `init` (spec §4.2): ports
/// 80/443, optional TLS from cert/key paths, else disabled auto-HTTPS redirects.
pub fn base_config(domain: &str, tls: Option<(&str, &str)>) -> Value {
    let mut server = json!({
        "listen": [":80", ":443"],
        "routes": [],
    });

    match tls {
        Some((cert, key)) => {
            server["tls_connection_policies"] = json!([{}]);
            return json!({
                "apps": {
                    "http": { "servers": { "lobster": server } },
                    "tls": {
                        "certificates": { "load_files": [{ "certificate": cert, "key": key }] },
                        "automation": {
                            "policies": [{ "subjects": [format!("*.{}", domain)], "issuers": [] }]
                        }
                    }
                }
            });
        }
        None => {
            server["automatic_https"] = json!({ "disable_redirects": false });
        }
    }

    json!({ "apps": { "http": { "servers": { "lobster": server } } } })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_route_has_expected_id_and_match_order_fields() {
        let r = ws_route("alpha", "lobster.local", "10.0.0.6".parse().unwrap());
        assert_eq!(r["@id"], "lobster-alpha-ws");
        assert_eq!(r["match"][0]["host"][0], "alpha.lobster.local");
    }

    #[test]
    fn http_route_sets_connection_close() {
        let r = http_route("alpha", "lobster.local", "10.0.0.6".parse().unwrap());
        assert_eq!(r["handle"][0]["headers"]["request"]["set"]["Connection"][0], "close");
    }

    #[test]
    fn base_config_without_tls_disables_redirects_flag_present() {
        let cfg = base_config("lobster.local", None);
        assert_eq!(cfg["apps"]["http"]["servers"]["lobster"]["automatic_https"]["disable_redirects"], false);
    }

    #[test]
    fn base_config_with_tls_sets_policies() {
        let cfg = base_config("lobster.local", Some(("/etc/cert.pem", "/etc/key.pem")));
        assert_eq!(cfg["apps"]["tls"]["certificates"]["load_files"][0]["certificate"], "/etc/cert.pem");
    }
}
