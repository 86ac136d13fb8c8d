//! Application lifecycle for the app host
//!
//! Provides the application-level core:
//! - Manifest parsing and entry-point resolution ([`ApplicationData`])
//! - The engine boundary ([`RuntimeHost`], [`EngineEvent`])
//! - The running-application state machine ([`Application`]), including the
//!   suspend handshake with hosted JavaScript
//! - Per-application API permissions
//! - Install/launch/lookup of applications ([`ApplicationService`])

mod application;
mod engine;
mod manifest;
mod permissions;
mod service;

#[cfg(test)]
mod test_support;

pub use application::{Application, ApplicationObserver, ApplicationState};
pub use engine::{EngineEvent, RuntimeHost, RuntimeKind, RuntimeRequest, WindowParams};
pub use ext_events::RuntimeId;
pub use manifest::{ApplicationData, Manifest, ManifestApp, ManifestWindows, MANIFEST_FILE};
pub use permissions::{PermissionType, RuntimePermission, StoredPermission};
pub use service::{ApplicationService, ApplicationServiceObserver, LifecycleConfig};

// ============================================================================
// Error Types
// ============================================================================

/// Error codes for app operations (9200-9219)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorCode {
    /// Failed to launch application (9200)
    LaunchFailed = 9200,
    /// Application is already running (9201)
    AlreadyRunning = 9201,
    /// Application is not installed (9202)
    NotInstalled = 9202,
    /// Application is already installed (9203)
    AlreadyInstalled = 9203,
    /// Manifest missing or unreadable (9204)
    ManifestNotFound = 9204,
    /// Manifest content invalid (9205)
    InvalidManifest = 9205,
    /// Entry point URL invalid (9206)
    InvalidUrl = 9206,
    /// Storage failure (9207)
    Storage = 9207,
    /// Permission table invalid (9208)
    InvalidPermissionTable = 9208,
    /// Application not running (9209)
    NotRunning = 9209,
    /// Engine refused to create a runtime (9210)
    Engine = 9210,
}

impl std::fmt::Display for AppErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as i32)
    }
}

/// Errors that can occur during app operations
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("[{code}] Failed to launch application: {message}")]
    LaunchFailed { code: AppErrorCode, message: String },

    #[error("[{code}] Application is already running: {message}")]
    AlreadyRunning { code: AppErrorCode, message: String },

    #[error("[{code}] Application is not installed: {message}")]
    NotInstalled { code: AppErrorCode, message: String },

    #[error("[{code}] Application is already installed: {message}")]
    AlreadyInstalled { code: AppErrorCode, message: String },

    #[error("[{code}] Manifest not found: {message}")]
    ManifestNotFound { code: AppErrorCode, message: String },

    #[error("[{code}] Invalid manifest: {message}")]
    InvalidManifest { code: AppErrorCode, message: String },

    #[error("[{code}] Invalid URL: {message}")]
    InvalidUrl { code: AppErrorCode, message: String },

    #[error("[{code}] Storage error: {message}")]
    Storage { code: AppErrorCode, message: String },

    #[error("[{code}] Invalid permission table: {message}")]
    InvalidPermissionTable { code: AppErrorCode, message: String },

    #[error("[{code}] Application is not running: {message}")]
    NotRunning { code: AppErrorCode, message: String },

    #[error("[{code}] Engine error: {message}")]
    Engine { code: AppErrorCode, message: String },
}

impl AppError {
    pub fn launch_failed(message: impl Into<String>) -> Self {
        Self::LaunchFailed {
            code: AppErrorCode::LaunchFailed,
            message: message.into(),
        }
    }

    pub fn already_running(message: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            code: AppErrorCode::AlreadyRunning,
            message: message.into(),
        }
    }

    pub fn not_installed(message: impl Into<String>) -> Self {
        Self::NotInstalled {
            code: AppErrorCode::NotInstalled,
            message: message.into(),
        }
    }

    pub fn already_installed(message: impl Into<String>) -> Self {
        Self::AlreadyInstalled {
            code: AppErrorCode::AlreadyInstalled,
            message: message.into(),
        }
    }

    pub fn manifest_not_found(message: impl Into<String>) -> Self {
        Self::ManifestNotFound {
            code: AppErrorCode::ManifestNotFound,
            message: message.into(),
        }
    }

    pub fn invalid_manifest(message: impl Into<String>) -> Self {
        Self::InvalidManifest {
            code: AppErrorCode::InvalidManifest,
            message: message.into(),
        }
    }

    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            code: AppErrorCode::InvalidUrl,
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            code: AppErrorCode::Storage,
            message: message.into(),
        }
    }

    pub fn invalid_permission_table(message: impl Into<String>) -> Self {
        Self::InvalidPermissionTable {
            code: AppErrorCode::InvalidPermissionTable,
            message: message.into(),
        }
    }

    pub fn not_running(message: impl Into<String>) -> Self {
        Self::NotRunning {
            code: AppErrorCode::NotRunning,
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            code: AppErrorCode::Engine,
            message: message.into(),
        }
    }

    /// The structured error code
    pub fn code(&self) -> AppErrorCode {
        match self {
            Self::LaunchFailed { code, .. }
            | Self::AlreadyRunning { code, .. }
            | Self::NotInstalled { code, .. }
            | Self::AlreadyInstalled { code, .. }
            | Self::ManifestNotFound { code, .. }
            | Self::InvalidManifest { code, .. }
            | Self::InvalidUrl { code, .. }
            | Self::Storage { code, .. }
            | Self::InvalidPermissionTable { code, .. }
            | Self::NotRunning { code, .. }
            | Self::Engine { code, .. } => *code,
        }
    }
}

impl From<ext_storage::StorageError> for AppError {
    fn from(e: ext_storage::StorageError) -> Self {
        Self::storage(e.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_manifest(e.to_string())
    }
}

impl From<url::ParseError> for AppError {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_url(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_permission_table(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
