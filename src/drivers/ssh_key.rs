//! SSH key driver: per-tenant ed25519 keypair for injection into the guest
//! (spec §4.2 "SSH key driver"). Generated via `ssh-keygen` exec rather
//! than `ed25519-dalek` in-process, since the public key must land in
//! OpenSSH `authorized_keys` format for the guest's sshd.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::exec;
use crate::store;

pub struct SshKeyPaths {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

impl SshKeyPaths {
    pub fn new(keys_dir: &Path, name: &str) -> Self {
        let base = keys_dir.join(name);
        Self { private_key: base.clone(), public_key: base.with_extension("pub") }
    }
}

/// Generates a fresh ed25519 keypair at `paths`, 0600 private / 0644 public
/// (spec §4.2). Overwrites any stale keypair from a previous failed spawn.
pub async fn generate(keys_dir: &Path, name: &str) -> Result<SshKeyPaths> {
    store::ensure_dir(keys_dir, store::MODE_CONFIG_DIR)?;
    let paths = SshKeyPaths::new(keys_dir, name);

    let _ = tokio::fs::remove_file(&paths.private_key).await;
    let _ = tokio::fs::remove_file(&paths.public_key).await;

    exec::must(
        "ssh-keygen",
        &[
            "-t",
            "ed25519",
            "-f",
            &paths.private_key.display().to_string(),
            "-N",
            "",
            "-C",
            &format!("lobster-{}", name),
            "-q",
        ],
    )
    .await?;

    tokio::fs::set_permissions(&paths.private_key, std::os::unix::fs::PermissionsExt::from_mode(0o600))
        .await
        .ok();
    tokio::fs::set_permissions(&paths.public_key, std::os::unix::fs::PermissionsExt::from_mode(0o644))
        .await
        .ok();

    Ok(paths)
}

pub async fn read_public_key(paths: &SshKeyPaths) -> Result<String> {
    let contents = tokio::fs::read_to_string(&paths.public_key)
        .await
        .map_err(|e| crate::error::ctor::exec_failed(format!("read public key: {}", e)))?;
    Ok(contents.trim().to_string())
}

/// Removes both key files on evict; missing files are tolerated.
pub async fn remove(paths: &SshKeyPaths) -> Result<()> {
    let _ = tokio::fs::remove_file(&paths.private_key).await;
    let _ = tokio::fs::remove_file(&paths.public_key).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_pub_suffix() {
        let p = SshKeyPaths::new(Path::new("/var/lib/lobsterd/keys"), "alpha");
        assert_eq!(p.private_key, PathBuf::from("/var/lib/lobsterd/keys/alpha"));
        assert_eq!(p.public_key, PathBuf::from("/var/lib/lobsterd/keys/alpha.pub"));
    }

    #[tokio::test]
    async fn remove_missing_keys_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SshKeyPaths::new(dir.path(), "ghost");
        assert!(remove(&paths).await.is_ok());
    }
}
