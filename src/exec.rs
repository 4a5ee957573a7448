//! Exec wrapper (spec §2 item 1, §5 "suspension points").
//!
//! Every external binary invocation goes through here so timeouts and
//! success/unchecked semantics are applied uniformly. Generalizes the
//! teacher's ad hoc `Command::new(cmd).args(args).output()` call sites
//! (`network.rs::run_cmd`, `firecracker.rs::api_put`) into one helper with
//! `tokio::time::timeout`.

use std::time::Duration;

use tokio::process::Command;

use crate::error::{ctor, Result};

/// Default exec timeout (spec §5: "default 30 s for exec").
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout ceiling for heavy install-time execs (mkfs, tar, curl downloads).
pub const HEAVY_EXEC_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

async fn run(cmd: &str, args: &[&str], timeout: Duration) -> Result<ExecOutput> {
    let fut = Command::new(cmd).args(args).output();
    let output = tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ctor::exec_timeout(format!("{} {}", cmd, args.join(" "))))?
        .map_err(|e| ctor::exec_failed(format!("spawn {}: {}", cmd, e)))?;

    Ok(ExecOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// "Must succeed" semantics: non-zero exit is an `EXEC_FAILED` error.
pub async fn must(cmd: &str, args: &[&str]) -> Result<ExecOutput> {
    must_with_timeout(cmd, args, DEFAULT_EXEC_TIMEOUT).await
}

pub async fn must_with_timeout(cmd: &str, args: &[&str], timeout: Duration) -> Result<ExecOutput> {
    let out = run(cmd, args, timeout).await?;
    if !out.success() {
        return Err(ctor::exec_failed(format!(
            "{} {} failed ({}): {}",
            cmd,
            args.join(" "),
            out.status,
            out.stderr.trim()
        )));
    }
    Ok(out)
}

/// "Unchecked" semantics: run and return whatever happened, never erroring on
/// non-zero exit (used for idempotent teardown steps where "not found" is fine).
pub async fn unchecked(cmd: &str, args: &[&str]) -> ExecOutput {
    match run(cmd, args, DEFAULT_EXEC_TIMEOUT).await {
        Ok(out) => out,
        Err(_) => ExecOutput { status: -1, stdout: String::new(), stderr: "exec timed out".into() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn must_succeeds_on_true() {
        let out = must("true", &[]).await.unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn must_fails_on_false() {
        let err = must("false", &[]).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ExecFailed);
    }

    #[tokio::test]
    async fn unchecked_never_errors() {
        let out = unchecked("false", &[]).await;
        assert!(!out.success());
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let err = must_with_timeout("sleep", &["2"], Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ExecTimeout);
    }
}
