//! Network driver: TAP create/delete, NAT (DNAT/MASQUERADE) add/remove,
//! per-tenant isolation rule set, IP-forwarding enable, custom chain
//! ensure/flush (spec §4.2).
//!
//! Grounded on the teacher's `network.rs` (`create_tap_device`,
//! `delete_tap_device`, the `ip`/`iptables`/`sysctl` exec idiom), extended
//! with the spec's two custom filter chains and per-tenant isolation rules
//! (absent from the teacher, which relied on a single shared FORWARD rule
//! per host interface).

use std::net::Ipv4Addr;

use crate::error::{ctor, Result};
use crate::exec;

/// Guest gateway port is a fixed constant (spec §4.2).
pub const GUEST_GATEWAY_PORT: u16 = 9000;

const CHAIN_INPUT: &str = "LOBSTER-INPUT";
const CHAIN_FORWARD: &str = "LOBSTER-FORWARD";

fn comment(tap: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(s) => format!("lobster:{}:{}", tap, s),
        None => format!("lobster:{}", tap),
    }
}

async fn chain_exists(chain: &str, table: Option<&str>) -> bool {
    let mut args = vec!["-L", chain];
    if let Some(t) = table {
        args = vec!["-t", t, "-L", chain];
    }
    exec::unchecked("iptables", &args).await.success()
}

async fn jump_exists(parent: &str, chain: &str) -> bool {
    let out = exec::unchecked("iptables", &["-C", parent, "-j", chain]).await;
    out.success()
}

/// Create the two custom chains if absent, and insert jumps into the
/// built-in `INPUT`/`FORWARD` chains at position 1 if not already present.
/// Idempotent: calling this N times produces exactly one jump in each chain
/// (spec §8).
pub async fn ensure_chains() -> Result<()> {
    for chain in [CHAIN_INPUT, CHAIN_FORWARD] {
        if !chain_exists(chain, None).await {
            exec::must("iptables", &["-N", chain]).await.map_err(|e| ctor::tap_create_failed(e.message))?;
        }
    }
    if !jump_exists("INPUT", CHAIN_INPUT).await {
        exec::must("iptables", &["-I", "INPUT", "1", "-j", CHAIN_INPUT]).await.map_err(|e| ctor::tap_create_failed(e.message))?;
    }
    if !jump_exists("FORWARD", CHAIN_FORWARD).await {
        exec::must("iptables", &["-I", "FORWARD", "1", "-j", CHAIN_FORWARD]).await.map_err(|e| ctor::tap_create_failed(e.message))?;
    }
    Ok(())
}

/// Create the TAP device, assign the /30 host address, bring it up, disable
/// IPv6 on it, and enable global IP forwarding (spec §4.2 steps 1-4).
pub async fn create_tap(tap: &str, host_ip: Ipv4Addr, prefix_len: u8) -> Result<()> {
    exec::must("ip", &["tuntap", "add", "dev", tap, "mode", "tap"]).await.map_err(|e| ctor::tap_create_failed(e.message))?;
    exec::must("ip", &["addr", "add", &format!("{}/{}", host_ip, prefix_len), "dev", tap])
        .await
        .map_err(|e| ctor::tap_create_failed(e.message))?;
    exec::must("ip", &["link", "set", tap, "up"]).await.map_err(|e| ctor::tap_create_failed(e.message))?;
    exec::unchecked("sysctl", &["-w", &format!("net.ipv6.conf.{}.disable_ipv6=1", tap)]).await;
    exec::unchecked("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await;
    Ok(())
}

pub async fn delete_tap(tap: &str) -> Result<()> {
    let out = exec::unchecked("ip", &["link", "del", tap]).await;
    if !out.success() && !out.stderr.contains("Cannot find device") {
        return Err(ctor::tap_create_failed(format!("delete_tap {}: {}", tap, out.stderr.trim())));
    }
    Ok(())
}

/// Per-tenant NAT rules (spec §4.2 steps 5-7). All-or-nothing with
/// `create_tap`/`add_isolation_rules` at the lifecycle layer; individually
/// idempotent here.
pub async fn add_nat(tap: &str, host_port: u16, guest_ip: Ipv4Addr) -> Result<()> {
    let c = comment(tap, None);
    exec::must(
        "iptables",
        &[
            "-t", "nat", "-A", "PREROUTING",
            "-p", "tcp", "--dport", &host_port.to_string(),
            "!", "-s", "10.0.0.0/8",
            "-j", "DNAT", "--to-destination", &format!("{}:{}", guest_ip, GUEST_GATEWAY_PORT),
            "-m", "comment", "--comment", &c,
        ],
    )
    .await
    .map_err(|e| ctor::tap_create_failed(e.message))?;

    exec::must("iptables", &["-t", "nat", "-A", "POSTROUTING", "-o", tap, "-j", "MASQUERADE", "-m", "comment", "--comment", &c])
        .await
        .map_err(|e| ctor::tap_create_failed(e.message))?;

    exec::must(
        "iptables",
        &[
            "-t", "nat", "-A", "POSTROUTING",
            "-s", &format!("{}/32", guest_ip),
            "!", "-o", tap,
            "-j", "MASQUERADE",
            "-m", "comment", "--comment", &c,
        ],
    )
    .await
    .map_err(|e| ctor::tap_create_failed(e.message))?;

    Ok(())
}

pub async fn remove_nat(tap: &str, host_port: u16, guest_ip: Ipv4Addr) -> Result<()> {
    let c = comment(tap, None);
    exec::unchecked(
        "iptables",
        &[
            "-t", "nat", "-D", "PREROUTING",
            "-p", "tcp", "--dport", &host_port.to_string(),
            "!", "-s", "10.0.0.0/8",
            "-j", "DNAT", "--to-destination", &format!("{}:{}", guest_ip, GUEST_GATEWAY_PORT),
            "-m", "comment", "--comment", &c,
        ],
    )
    .await;
    exec::unchecked("iptables", &["-t", "nat", "-D", "POSTROUTING", "-o", tap, "-j", "MASQUERADE", "-m", "comment", "--comment", &c]).await;
    exec::unchecked(
        "iptables",
        &[
            "-t", "nat", "-D", "POSTROUTING",
            "-s", &format!("{}/32", guest_ip),
            "!", "-o", tap,
            "-j", "MASQUERADE",
            "-m", "comment", "--comment", &c,
        ],
    )
    .await;
    Ok(())
}

/// Per-tenant isolation rules (spec §4.2 "Per-tenant isolation rules").
pub async fn add_isolation_rules(tap: &str) -> Result<()> {
    let run = |chain: &'static str, args: Vec<String>| {
        let args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        async move { exec::must("iptables", &args).await.map_err(|e| ctor::tap_create_failed(e.message)) }
    };

    let host_return = comment(tap, Some("host-return"));
    run(
        CHAIN_INPUT,
        vec![
            "-A".into(), CHAIN_INPUT.into(), "-i".into(), tap.into(),
            "-m".into(), "conntrack".into(), "--ctstate".into(), "ESTABLISHED,RELATED".into(),
            "-j".into(), "ACCEPT".into(),
            "-m".into(), "comment".into(), "--comment".into(), host_return,
        ],
    )
    .await?;

    let block_host = comment(tap, Some("block-host"));
    run(CHAIN_INPUT, vec!["-A".into(), CHAIN_INPUT.into(), "-i".into(), tap.into(), "-j".into(), "DROP".into(), "-m".into(), "comment".into(), "--comment".into(), block_host]).await?;

    let fwd_return = comment(tap, Some("fwd-return"));
    run(
        CHAIN_FORWARD,
        vec![
            "-A".into(), CHAIN_FORWARD.into(), "-o".into(), tap.into(),
            "-m".into(), "conntrack".into(), "--ctstate".into(), "ESTABLISHED,RELATED".into(),
            "-j".into(), "ACCEPT".into(),
            "-m".into(), "comment".into(), "--comment".into(), fwd_return,
        ],
    )
    .await?;

    let fwd_gateway = comment(tap, Some("fwd-gateway"));
    run(
        CHAIN_FORWARD,
        vec![
            "-A".into(), CHAIN_FORWARD.into(), "-o".into(), tap.into(),
            "-p".into(), "tcp".into(), "--dport".into(), GUEST_GATEWAY_PORT.to_string(),
            "-m".into(), "conntrack".into(), "--ctstate".into(), "NEW".into(),
            "-j".into(), "ACCEPT".into(),
            "-m".into(), "comment".into(), "--comment".into(), fwd_gateway,
        ],
    )
    .await?;

    for (i, private_net) in ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "169.254.0.0/16"].iter().enumerate() {
        let c = comment(tap, Some(&format!("drop-private-{}", i)));
        run(
            CHAIN_FORWARD,
            vec![
                "-A".into(), CHAIN_FORWARD.into(), "-o".into(), tap.into(),
                "-d".into(), (*private_net).into(),
                "-j".into(), "DROP".into(),
                "-m".into(), "comment".into(), "--comment".into(), c,
            ],
        )
        .await?;
    }

    let connlimit = comment(tap, Some("connlimit"));
    run(
        CHAIN_FORWARD,
        vec![
            "-A".into(), CHAIN_FORWARD.into(), "-o".into(), tap.into(),
            "-m".into(), "connlimit".into(), "--connlimit-above".into(), "1024".into(), "--connlimit-saddr".into(),
            "-j".into(), "DROP".into(),
            "-m".into(), "comment".into(), "--comment".into(), connlimit,
        ],
    )
    .await?;

    let accept_out = comment(tap, Some("accept-out"));
    run(CHAIN_FORWARD, vec!["-A".into(), CHAIN_FORWARD.into(), "-o".into(), tap.into(), "-j".into(), "ACCEPT".into(), "-m".into(), "comment".into(), "--comment".into(), accept_out]).await?;

    Ok(())
}

/// Reverses each isolation rule with `-D`, ignoring "not found" errors.
pub async fn remove_isolation_rules(tap: &str) -> Result<()> {
    let host_return = comment(tap, Some("host-return"));
    exec::unchecked(
        "iptables",
        &[
            "-D", CHAIN_INPUT, "-i", tap,
            "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED",
            "-j", "ACCEPT", "-m", "comment", "--comment", &host_return,
        ],
    )
    .await;
    let block_host = comment(tap, Some("block-host"));
    exec::unchecked("iptables", &["-D", CHAIN_INPUT, "-i", tap, "-j", "DROP", "-m", "comment", "--comment", &block_host]).await;

    let fwd_return = comment(tap, Some("fwd-return"));
    exec::unchecked(
        "iptables",
        &[
            "-D", CHAIN_FORWARD, "-o", tap,
            "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED",
            "-j", "ACCEPT", "-m", "comment", "--comment", &fwd_return,
        ],
    )
    .await;
    let fwd_gateway = comment(tap, Some("fwd-gateway"));
    exec::unchecked(
        "iptables",
        &[
            "-D", CHAIN_FORWARD, "-o", tap,
            "-p", "tcp", "--dport", &GUEST_GATEWAY_PORT.to_string(),
            "-m", "conntrack", "--ctstate", "NEW",
            "-j", "ACCEPT", "-m", "comment", "--comment", &fwd_gateway,
        ],
    )
    .await;
    for (i, private_net) in ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "169.254.0.0/16"].iter().enumerate() {
        let c = comment(tap, Some(&format!("drop-private-{}", i)));
        exec::unchecked("iptables", &["-D", CHAIN_FORWARD, "-o", tap, "-d", private_net, "-j", "DROP", "-m", "comment", "--comment", &c]).await;
    }
    let connlimit = comment(tap, Some("connlimit"));
    exec::unchecked(
        "iptables",
        &[
            "-D", CHAIN_FORWARD, "-o", tap,
            "-m", "connlimit", "--connlimit-above", "1024", "--connlimit-saddr",
            "-j", "DROP", "-m", "comment", "--comment", &connlimit,
        ],
    )
    .await;
    let accept_out = comment(tap, Some("accept-out"));
    exec::unchecked("iptables", &["-D", CHAIN_FORWARD, "-o", tap, "-j", "ACCEPT", "-m", "comment", "--comment", &accept_out]).await;
    Ok(())
}

/// `ip link show <tap>` exits 0 — used by the `net.tap` check.
pub async fn tap_exists(tap: &str) -> bool {
    exec::unchecked("ip", &["link", "show", tap]).await.success()
}

/// Read the TAP's rx byte counter (used to seed idle detection after resume).
pub async fn tap_rx_bytes(tap: &str) -> u64 {
    let out = exec::unchecked("cat", &[&format!("/sys/class/net/{}/statistics/rx_bytes", tap)]).await;
    out.stdout.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_format() {
        assert_eq!(comment("tap-alpha", None), "lobster:tap-alpha");
        assert_eq!(comment("tap-alpha", Some("drop")), "lobster:tap-alpha:drop");
    }

    #[test]
    fn guest_gateway_port_is_9000() {
        assert_eq!(GUEST_GATEWAY_PORT, 9000);
    }
}
