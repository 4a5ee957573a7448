//! Shared atomic-write discipline for the registry store (spec §4.1).
//!
//! Every on-disk mutation goes through `write_atomic`: marshal to JSON with
//! stable key order (serde's derive order, which is declaration order —
//! never re-sorted), write to `<path>.tmp.<pid>.<uuid>`, then rename over the
//! destination. A crash between write and rename leaves the original file
//! untouched; a crash after rename is indistinguishable from a clean write.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::Serialize;

use crate::error::{ctor, LobsterError, Result};

/// File mode applied to config/registry files (spec §4.1: 0600).
pub const MODE_SECRET_FILE: u32 = 0o600;
/// Mode for the config directory (spec §4.1: 0711).
pub const MODE_CONFIG_DIR: u32 = 0o711;
/// Mode for the TLS cert directory (spec §4.1: 0755).
pub const MODE_CERT_DIR: u32 = 0o755;
/// Mode for the TLS private key (spec §4.1: 0640).
pub const MODE_TLS_KEY: u32 = 0o640;

pub fn ensure_dir(path: impl AsRef<Path>, mode: u32) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path)
        .map_err(|e| LobsterError::with_cause(crate::error::ErrorCode::ConfigInvalid, format!("create_dir_all {}", path.display()), e))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| LobsterError::with_cause(crate::error::ErrorCode::ConfigInvalid, format!("chmod {}", path.display()), e))?;
    Ok(())
}

/// Write `value` to `path` atomically, applying `mode` to the final file.
pub fn write_atomic<T: Serialize>(path: impl AsRef<Path>, value: &T, mode: u32) -> Result<()> {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|e| LobsterError::with_cause(crate::error::ErrorCode::ConfigInvalid, format!("create_dir_all {}", parent.display()), e))?;

    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| LobsterError::with_cause(crate::error::ErrorCode::ConfigInvalid, "serialize", e))?;

    let tmp_name = format!(
        "{}.tmp.{}.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("store"),
        std::process::id(),
        uuid::Uuid::new_v4()
    );
    let tmp_path = parent.join(tmp_name);

    fs::write(&tmp_path, &body)
        .map_err(|e| LobsterError::with_cause(crate::error::ErrorCode::ConfigInvalid, format!("write {}", tmp_path.display()), e))?;
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))
        .map_err(|e| LobsterError::with_cause(crate::error::ErrorCode::ConfigInvalid, "chmod tmp", e))?;
    fs::rename(&tmp_path, path)
        .map_err(|e| LobsterError::with_cause(crate::error::ErrorCode::ConfigInvalid, format!("rename to {}", path.display()), e))?;

    Ok(())
}

/// Load and parse JSON from `path`. Returns `Ok(None)` if the file is absent;
/// a malformed file is `CONFIG_INVALID`.
pub fn read_json<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<Option<T>> {
    let path = path.as_ref();
    match fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| ctor::config_invalid(format!("{}: {}", path.display(), e)))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LobsterError::with_cause(crate::error::ErrorCode::ConfigInvalid, format!("read {}", path.display()), e)),
    }
}
