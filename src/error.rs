//! Crate-wide error taxonomy (spec §7).
//!
//! Every fallible operation in the control plane returns `Result<T, LobsterError>`.
//! `ErrorCode` is the stable, serializable tag the CLI and HTTP API map to exit
//! codes / status codes; `message` is the human string. Neither ever carries a
//! secret (token, key) — see `LobsterError::strip` used at the API boundary.

use axum::http::StatusCode;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ExecFailed,
    ExecTimeout,
    NotRoot,
    NotLinux,
    KvmNotAvailable,
    FirecrackerNotFound,
    JailerNotFound,
    JailerSetupFailed,
    VmBootFailed,
    VsockConnectFailed,
    TapCreateFailed,
    CaddyApiError,
    OverlayCreateFailed,
    SnapshotFailed,
    ResumeFailed,
    SuspendFailed,
    SuspendSkipped,
    ConfigNotFound,
    ConfigInvalid,
    TenantExists,
    TenantNotFound,
    PermissionDenied,
    ValidationFailed,
    LockFailed,
    Unknown,
}

impl ErrorCode {
    /// Error → HTTP status map (spec §6).
    pub fn status(&self) -> StatusCode {
        use ErrorCode::*;
        match self {
            TenantNotFound => StatusCode::NOT_FOUND,
            TenantExists => StatusCode::CONFLICT,
            ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            PermissionDenied | NotRoot => StatusCode::FORBIDDEN,
            LockFailed => StatusCode::SERVICE_UNAVAILABLE,
            VsockConnectFailed | CaddyApiError => StatusCode::BAD_GATEWAY,
            ExecTimeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct LobsterError {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub cause: Option<anyhow::Error>,
}

impl LobsterError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), cause: None }
    }

    pub fn with_cause(code: ErrorCode, message: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self { code, message: message.into(), cause: Some(cause.into()) }
    }

    /// Strip everything but code+message before the error reaches a client.
    pub fn strip(&self) -> StrippedError {
        StrippedError { code: self.code, message: self.message.clone() }
    }
}

#[derive(Debug, Serialize)]
pub struct StrippedError {
    pub code: ErrorCode,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, LobsterError>;

/// Convenience constructors, one per code, used pervasively across drivers.
macro_rules! err_ctor {
    ($name:ident, $code:ident) => {
        pub fn $name(message: impl Into<String>) -> LobsterError {
            LobsterError::new(ErrorCode::$code, message)
        }
    };
}

pub mod ctor {
    use super::{ErrorCode, LobsterError};
    err_ctor!(exec_failed, ExecFailed);
    err_ctor!(exec_timeout, ExecTimeout);
    err_ctor!(not_root, NotRoot);
    err_ctor!(not_linux, NotLinux);
    err_ctor!(kvm_not_available, KvmNotAvailable);
    err_ctor!(firecracker_not_found, FirecrackerNotFound);
    err_ctor!(jailer_not_found, JailerNotFound);
    err_ctor!(jailer_setup_failed, JailerSetupFailed);
    err_ctor!(vm_boot_failed, VmBootFailed);
    err_ctor!(vsock_connect_failed, VsockConnectFailed);
    err_ctor!(tap_create_failed, TapCreateFailed);
    err_ctor!(caddy_api_error, CaddyApiError);
    err_ctor!(overlay_create_failed, OverlayCreateFailed);
    err_ctor!(snapshot_failed, SnapshotFailed);
    err_ctor!(resume_failed, ResumeFailed);
    err_ctor!(suspend_failed, SuspendFailed);
    err_ctor!(suspend_skipped, SuspendSkipped);
    err_ctor!(config_not_found, ConfigNotFound);
    err_ctor!(config_invalid, ConfigInvalid);
    err_ctor!(tenant_exists, TenantExists);
    err_ctor!(tenant_not_found, TenantNotFound);
    err_ctor!(permission_denied, PermissionDenied);
    err_ctor!(validation_failed, ValidationFailed);
    err_ctor!(lock_failed, LockFailed);
    err_ctor!(unknown, Unknown);
}
