//! Overlay driver: sparse ext4 disk image lifecycle (spec §4.2 "Overlay
//! driver"). Grounded on the teacher's `create_data_volume` exec sequence
//! (`truncate` then `mkfs.ext4`), generalized to the spec's configurable size.

use std::path::Path;

use crate::error::{ctor, Result};
use crate::exec;

/// `truncate -s <N>M <path>` then `mkfs.ext4 -F -q <path>`.
pub async fn create_overlay(path: &Path, size_mb: u32) -> Result<()> {
    exec::must("truncate", &["-s", &format!("{}M", size_mb), &path.display().to_string()])
        .await
        .map_err(|e| ctor::overlay_create_failed(e.message))?;

    exec::must_with_timeout(
        "mkfs.ext4",
        &["-F", "-q", &path.display().to_string()],
        exec::HEAVY_EXEC_TIMEOUT,
    )
    .await
    .map_err(|e| ctor::overlay_create_failed(e.message))?;

    Ok(())
}

pub async fn delete_overlay(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ctor::overlay_create_failed(format!("delete_overlay {}: {}", path.display(), e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_missing_overlay_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.ext4");
        assert!(delete_overlay(&path).await.is_ok());
    }
}
