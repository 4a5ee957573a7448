//! Agent client: line-delimited JSON over plain TCP to the in-guest control
//! agent (spec §4.2 "Agent client", §6 "Guest agent protocol"). The only
//! permitted interface to the guest. Grounded in the teacher's general
//! request/response-over-socket idiom (`firecracker.rs`'s curl-as-HTTP-client
//! pattern); the framing discipline (explicit timeouts per op, single-line
//! response, size cap) is grounded on the length-prefixed decoder style in
//! `examples/pcwill068-cloud-vm0/crates/vsock-proto`, adapted from binary
//! framing to the spec's newline-delimited JSON.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ctor, Result};

/// Guest-side message size cap (spec §6: "Message size cap 1 MiB").
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

pub const TIMEOUT_HEALTH_PING: Duration = Duration::from_secs(5);
pub const TIMEOUT_INJECT_SECRETS: Duration = Duration::from_secs(5);
pub const TIMEOUT_GET_STATS: Duration = Duration::from_secs(3);
pub const TIMEOUT_GET_ACTIVE_CONNECTIONS: Duration = Duration::from_secs(3);
pub const TIMEOUT_GET_CRON_SCHEDULES: Duration = Duration::from_secs(5);
pub const TIMEOUT_POKE_CRON: Duration = Duration::from_secs(15);
pub const TIMEOUT_POKE_HEARTBEAT: Duration = Duration::from_secs(15);
pub const TIMEOUT_SET_TIME: Duration = Duration::from_secs(3);
pub const TIMEOUT_ENSURE_GATEWAY: Duration = Duration::from_secs(5);
pub const TIMEOUT_GET_LOGS: Duration = Duration::from_secs(5);

pub struct AgentClient {
    guest_ip: Ipv4Addr,
    agent_port: u16,
    token: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InjectSecrets {
    #[serde(rename = "OPENCLAW_CONFIG", skip_serializing_if = "Option::is_none")]
    pub openclaw_config: Option<Value>,
    #[serde(rename = "OPENCLAW_GATEWAY_TOKEN", skip_serializing_if = "Option::is_none")]
    pub openclaw_gateway_token: Option<String>,
    #[serde(rename = "SSH_AUTHORIZED_KEY", skip_serializing_if = "Option::is_none")]
    pub ssh_authorized_key: Option<String>,
}

impl AgentClient {
    pub fn new(guest_ip: Ipv4Addr, agent_port: u16, token: impl Into<String>) -> Self {
        Self { guest_ip, agent_port, token: token.into() }
    }

    async fn call(&self, body: Value, op_timeout: Duration) -> Result<String> {
        timeout(op_timeout, self.call_inner(body))
            .await
            .map_err(|_| ctor::vsock_connect_failed("agent call timed out"))?
    }

    async fn call_inner(&self, mut body: Value) -> Result<String> {
        if let Value::Object(ref mut map) = body {
            map.insert("token".into(), Value::String(self.token.clone()));
        }
        let mut line = serde_json::to_string(&body).map_err(|e| ctor::vsock_connect_failed(format!("encode: {}", e)))?;
        line.push('\n');
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ctor::vsock_connect_failed("request exceeds message size cap"));
        }

        let mut stream = TcpStream::connect((self.guest_ip, self.agent_port))
            .await
            .map_err(|e| ctor::vsock_connect_failed(format!("connect {}:{}: {}", self.guest_ip, self.agent_port, e)))?;
        stream.write_all(line.as_bytes()).await.map_err(|e| ctor::vsock_connect_failed(format!("write: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        reader
            .read_line(&mut response)
            .await
            .map_err(|e| ctor::vsock_connect_failed(format!("read: {}", e)))?;
        if response.is_empty() {
            return Err(ctor::vsock_connect_failed("connection closed with no response"));
        }
        Ok(response.trim_end().to_string())
    }

    async fn call_json(&self, body: Value, op_timeout: Duration) -> Result<Value> {
        let raw = self.call(body, op_timeout).await?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| ctor::vsock_connect_failed(format!("malformed response: {}", e)))?;
        if let Some(err) = value.get("error").and_then(Value::as_str) {
            return Err(ctor::vsock_connect_failed(err.to_string()));
        }
        Ok(value)
    }

    pub async fn health_ping(&self) -> Result<bool> {
        let raw = self.call(serde_json::json!({ "type": "health-ping" }), TIMEOUT_HEALTH_PING).await?;
        Ok(raw == "PONG")
    }

    pub async fn inject_secrets(&self, secrets: InjectSecrets) -> Result<()> {
        let raw = self
            .call(serde_json::json!({ "type": "inject-secrets", "secrets": secrets }), TIMEOUT_INJECT_SECRETS)
            .await?;
        if raw != "ACK" {
            return Err(ctor::vsock_connect_failed(format!("expected ACK, got {}", raw)));
        }
        Ok(())
    }

    pub async fn ensure_gateway(&self) -> Result<Value> {
        self.call_json(serde_json::json!({ "type": "ensure-gateway" }), TIMEOUT_ENSURE_GATEWAY).await
    }

    pub async fn get_stats(&self) -> Result<Value> {
        self.call_json(serde_json::json!({ "type": "get-stats" }), TIMEOUT_GET_STATS).await
    }

    pub async fn get_logs(&self) -> Result<String> {
        self.call(serde_json::json!({ "type": "get-logs" }), TIMEOUT_GET_LOGS).await
    }

    pub async fn set_time(&self, timestamp_ms: i64) -> Result<()> {
        let value = self
            .call_json(serde_json::json!({ "type": "set-time", "timestampMs": timestamp_ms }), TIMEOUT_SET_TIME)
            .await?;
        if value.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(ctor::vsock_connect_failed("set-time did not return ok:true"));
        }
        Ok(())
    }

    pub async fn get_cron_schedules(&self) -> Result<Value> {
        self.call_json(serde_json::json!({ "type": "get-cron-schedules" }), TIMEOUT_GET_CRON_SCHEDULES).await
    }

    pub async fn poke_cron(&self) -> Result<Value> {
        self.call_json(serde_json::json!({ "type": "poke-cron" }), TIMEOUT_POKE_CRON).await
    }

    pub async fn poke_heartbeat(&self) -> Result<Value> {
        self.call_json(serde_json::json!({ "type": "poke-heartbeat" }), TIMEOUT_POKE_HEARTBEAT).await
    }

    pub async fn get_active_connections(&self) -> Result<Value> {
        self.call_json(serde_json::json!({ "type": "get-active-connections" }), TIMEOUT_GET_ACTIVE_CONNECTIONS).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        let raw = self.call(serde_json::json!({ "type": "shutdown" }), TIMEOUT_HEALTH_PING).await?;
        if raw != "ACK" {
            return Err(ctor::vsock_connect_failed(format!("expected ACK, got {}", raw)));
        }
        Ok(())
    }
}

/// Polls until a TCP connection to `guest_ip:port` succeeds or
/// `total_timeout` elapses: 3 s per-attempt timeout, 500 ms between
/// failures (spec §4.2).
pub async fn wait_for_agent(guest_ip: Ipv4Addr, port: u16, total_timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + total_timeout;
    loop {
        let attempt = timeout(Duration::from_secs(3), TcpStream::connect((guest_ip, port))).await;
        if let Ok(Ok(_)) = attempt {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ctor::vsock_connect_failed(format!("agent not reachable at {}:{} within budget", guest_ip, port)));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_secrets_serializes_only_present_fields() {
        let secrets = InjectSecrets { openclaw_gateway_token: Some("tok".into()), ..Default::default() };
        let v = serde_json::to_value(&secrets).unwrap();
        assert_eq!(v.get("OPENCLAW_GATEWAY_TOKEN").unwrap(), "tok");
        assert!(v.get("OPENCLAW_CONFIG").is_none());
        assert!(v.get("SSH_AUTHORIZED_KEY").is_none());
    }

    #[tokio::test]
    async fn wait_for_agent_fails_fast_when_nothing_listens() {
        let ip: Ipv4Addr = "127.0.0.1".parse().unwrap();
        let err = wait_for_agent(ip, 1, Duration::from_millis(800)).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::VsockConnectFailed);
    }
}
