//! Snap: a sparse tarball copy of a tenant's overlay disk (spec §4.7
//! "Snap"). Copies the overlay into a temp dir, then `tar --sparse -czf`s
//! it into `./snaps/<ts>-<name>.tar.gz`.

use std::path::PathBuf;

use crate::config;
use crate::error::{ctor, Result};
use crate::exec;
use crate::registry;

pub struct SnapResult {
    pub archive_path: PathBuf,
}

pub async fn snap(config_dir: &std::path::Path, name: &str, now_ms: i64) -> Result<SnapResult> {
    let config = config::load_config(config_dir)?;
    let reg = registry::load_registry(config_dir)?;
    let tenant = reg.find(name).ok_or_else(|| ctor::tenant_not_found(name))?;

    let tmp = tempfile::tempdir().map_err(|e| ctor::exec_failed(format!("tempdir: {}", e)))?;
    let overlay_name = tenant.overlay_path.file_name().and_then(|n| n.to_str()).unwrap_or("overlay.ext4");
    let staged = tmp.path().join(overlay_name);
    tokio::fs::copy(&tenant.overlay_path, &staged)
        .await
        .map_err(|e| ctor::exec_failed(format!("copy overlay for snap: {}", e)))?;

    let snaps_dir = PathBuf::from("./snaps");
    tokio::fs::create_dir_all(&snaps_dir).await.map_err(|e| ctor::exec_failed(format!("mkdir snaps dir: {}", e)))?;
    let archive_path = snaps_dir.join(format!("{}-{}.tar.gz", now_ms, name));

    exec::must_with_timeout(
        "tar",
        &[
            "--sparse",
            "-czf",
            &archive_path.display().to_string(),
            "-C",
            &tmp.path().display().to_string(),
            overlay_name,
        ],
        exec::HEAVY_EXEC_TIMEOUT,
    )
    .await
    .map_err(|e| ctor::exec_failed(format!("tar overlay snapshot: {}", e)))?;

    prune_old_archives(&snaps_dir, name, config.defaults.snapshot_retention).await;

    tracing::info!(tenant = name, archive = %archive_path.display(), "tenant snapped");
    Ok(SnapResult { archive_path })
}

/// Keeps only the `retention` most recent archives for `name` under
/// `snaps_dir` (spec §5 "Snapshot retention: 7"), oldest by filename
/// timestamp prefix first since archive names sort lexically by `<ts>-`.
async fn prune_old_archives(snaps_dir: &std::path::Path, name: &str, retention: u32) {
    let mut entries = match tokio::fs::read_dir(snaps_dir).await {
        Ok(e) => e,
        Err(_) => return,
    };
    let suffix = format!("-{}.tar.gz", name);
    let mut matches = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(file_name) = entry.file_name().to_str() {
            if file_name.ends_with(&suffix) {
                matches.push(entry.path());
            }
        }
    }
    matches.sort();
    let excess = matches.len().saturating_sub(retention as usize);
    for path in matches.into_iter().take(excess) {
        let _ = tokio::fs::remove_file(&path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prune_keeps_only_the_most_recent_n_for_this_tenant() {
        let dir = tempfile::tempdir().unwrap();
        for ts in [100, 200, 300, 400] {
            tokio::fs::write(dir.path().join(format!("{}-alpha.tar.gz", ts)), b"x").await.unwrap();
        }
        tokio::fs::write(dir.path().join("150-beta.tar.gz"), b"x").await.unwrap();

        prune_old_archives(dir.path(), "alpha", 2).await;

        let mut remaining = Vec::new();
        let mut rd = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Ok(Some(entry)) = rd.next_entry().await {
            remaining.push(entry.file_name().to_str().unwrap().to_string());
        }
        remaining.sort();
        assert_eq!(remaining, vec!["150-beta.tar.gz", "300-alpha.tar.gz", "400-alpha.tar.gz"]);
    }
}
