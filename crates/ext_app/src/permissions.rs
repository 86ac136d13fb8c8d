//! Per-application API permissions.
//!
//! Extensions register which permission guards each of their APIs. Decisions
//! live in two layers: session decisions made while the app runs, and
//! persistent decisions seeded from the manifest's `[permissions]` table.

use crate::AppError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// A stored decision for one permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredPermission {
    Allow,
    Deny,
    /// Ask the user. Only meaningful in the persistent layer.
    Prompt,
}

/// Which decision layer to read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionType {
    Session,
    Persistent,
}

/// Outcome of an API access check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimePermission {
    AllowSession,
    DenySession,
    AllowAlways,
    DenyAlways,
    /// No decision could be made (unknown app, unregistered API, prompt)
    Undefined,
}

impl RuntimePermission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::AllowSession | Self::AllowAlways)
    }
}

#[derive(Debug, Deserialize)]
struct PermissionEntry {
    permission_name: String,
    apis: Vec<String>,
}

/// Permission bookkeeping owned by a running application
#[derive(Debug, Default)]
pub(crate) struct PermissionState {
    /// (extension, api) -> permission name
    registered: HashMap<(String, String), String>,
    session: HashMap<String, StoredPermission>,
    persistent: BTreeMap<String, StoredPermission>,
}

impl PermissionState {
    pub fn new(persistent: BTreeMap<String, StoredPermission>) -> Self {
        Self {
            persistent,
            ..Default::default()
        }
    }

    /// Register a table of the form
    /// `[{"permission_name": "echo", "apis": ["add", "remove"]}]`.
    ///
    /// The table is validated as a whole; nothing is registered on error.
    pub fn register(&mut self, extension: &str, table: &str) -> Result<(), AppError> {
        let entries: Vec<PermissionEntry> = serde_json::from_str(table)?;
        if entries.is_empty() {
            return Err(AppError::invalid_permission_table("table is empty"));
        }
        if let Some(entry) = entries.iter().find(|e| e.permission_name.is_empty()) {
            return Err(AppError::invalid_permission_table(format!(
                "entry with apis {:?} has no permission_name",
                entry.apis
            )));
        }

        for entry in entries {
            for api in entry.apis {
                debug!(
                    extension = %extension,
                    permission = %entry.permission_name,
                    api = %api,
                    "Permission registered"
                );
                self.registered
                    .insert((extension.to_string(), api), entry.permission_name.clone());
            }
        }
        Ok(())
    }

    pub fn registered_name(&self, extension: &str, api: &str) -> Option<&str> {
        self.registered
            .get(&(extension.to_string(), api.to_string()))
            .map(String::as_str)
    }

    pub fn get(&self, kind: PermissionType, name: &str) -> Option<StoredPermission> {
        match kind {
            PermissionType::Session => self.session.get(name).copied(),
            PermissionType::Persistent => self.persistent.get(name).copied(),
        }
    }

    /// Store a decision. Session decisions must be allow or deny.
    pub fn set(&mut self, kind: PermissionType, name: &str, perm: StoredPermission) -> bool {
        match kind {
            PermissionType::Session => {
                if perm == StoredPermission::Prompt {
                    return false;
                }
                self.session.insert(name.to_string(), perm);
            }
            PermissionType::Persistent => {
                self.persistent.insert(name.to_string(), perm);
            }
        }
        true
    }

    /// Resolve access for an API: session layer first, then persistent.
    pub fn check(&self, extension: &str, api: &str) -> RuntimePermission {
        let Some(name) = self.registered_name(extension, api) else {
            return RuntimePermission::Undefined;
        };

        match self.get(PermissionType::Session, name) {
            Some(StoredPermission::Allow) => return RuntimePermission::AllowSession,
            Some(StoredPermission::Deny) => return RuntimePermission::DenySession,
            Some(StoredPermission::Prompt) | None => {}
        }

        match self.get(PermissionType::Persistent, name) {
            Some(StoredPermission::Allow) => RuntimePermission::AllowAlways,
            Some(StoredPermission::Deny) => RuntimePermission::DenyAlways,
            // No prompt UI in a headless host
            Some(StoredPermission::Prompt) | None => RuntimePermission::Undefined,
        }
    }
}
