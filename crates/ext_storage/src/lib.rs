//! Persistent application metadata for the app host
//!
//! Provides two things the lifecycle core consumes:
//! - [`EventRegistry`]: which named events a hosted application has registered
//!   handlers for (queried before the suspend handshake)
//! - [`ApplicationStorage`]: SQLite-backed store of installed applications and
//!   their registered events, at `<data_dir>/applications.db`

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

// ============================================================================
// Error Types with Structured Codes
// ============================================================================

/// Error codes for storage operations (9300-9309)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StorageErrorCode {
    /// Generic storage error
    Generic = 9300,
    /// Application not found
    NotFound = 9301,
    /// Serialization error
    SerializationError = 9302,
    /// Database error
    DatabaseError = 9303,
    /// Invalid application id
    InvalidId = 9304,
    /// Application already installed
    AlreadyExists = 9305,
    /// Connection failed
    ConnectionFailed = 9306,
}

/// Custom error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("[{code}] Storage error: {message}")]
    Generic { code: u32, message: String },

    #[error("[{code}] Application not found: {message}")]
    NotFound { code: u32, message: String },

    #[error("[{code}] Serialization error: {message}")]
    SerializationError { code: u32, message: String },

    #[error("[{code}] Database error: {message}")]
    DatabaseError { code: u32, message: String },

    #[error("[{code}] Invalid application id: {message}")]
    InvalidId { code: u32, message: String },

    #[error("[{code}] Application already installed: {message}")]
    AlreadyExists { code: u32, message: String },

    #[error("[{code}] Connection failed: {message}")]
    ConnectionFailed { code: u32, message: String },
}

impl StorageError {
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            code: StorageErrorCode::Generic as u32,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            code: StorageErrorCode::NotFound as u32,
            message: message.into(),
        }
    }

    pub fn serialization_error(message: impl Into<String>) -> Self {
        Self::SerializationError {
            code: StorageErrorCode::SerializationError as u32,
            message: message.into(),
        }
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::DatabaseError {
            code: StorageErrorCode::DatabaseError as u32,
            message: message.into(),
        }
    }

    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::InvalidId {
            code: StorageErrorCode::InvalidId as u32,
            message: message.into(),
        }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            code: StorageErrorCode::AlreadyExists as u32,
            message: message.into(),
        }
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            code: StorageErrorCode::ConnectionFailed as u32,
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        Self::database_error(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization_error(e.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::generic(e.to_string())
    }
}

// ============================================================================
// Event Registry
// ============================================================================

/// Persisted event-registration metadata, keyed by application id.
///
/// The extension layer writes the set of event names the main document has
/// registered handlers for; the lifecycle core reads it to decide whether a
/// suspend handshake is needed at all.
pub trait EventRegistry {
    /// Event names registered for `app_id`. Unknown ids yield an empty set.
    fn get_events(&self, app_id: &str) -> Result<BTreeSet<String>, StorageError>;

    /// Replace the registered event names for `app_id`.
    fn set_events(&self, app_id: &str, events: &BTreeSet<String>) -> Result<(), StorageError>;
}

/// Non-persistent registry, used when no data directory is configured and in tests
#[derive(Debug, Default)]
pub struct MemoryEventRegistry {
    events: RefCell<HashMap<String, BTreeSet<String>>>,
}

impl MemoryEventRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventRegistry for MemoryEventRegistry {
    fn get_events(&self, app_id: &str) -> Result<BTreeSet<String>, StorageError> {
        Ok(self
            .events
            .borrow()
            .get(app_id)
            .cloned()
            .unwrap_or_default())
    }

    fn set_events(&self, app_id: &str, events: &BTreeSet<String>) -> Result<(), StorageError> {
        self.events
            .borrow_mut()
            .insert(app_id.to_string(), events.clone());
        Ok(())
    }
}

// ============================================================================
// Installed Applications
// ============================================================================

/// One installed application as persisted on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledApplication {
    /// Unique application id
    pub id: String,
    /// Package directory the application was installed from
    pub path: PathBuf,
    /// Raw manifest text, re-parsed at launch
    pub manifest: String,
    /// Install timestamp
    pub installed_at: DateTime<Utc>,
}

/// Default database location: `<data_dir>/app-host/applications.db`
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("app-host")
        .join("applications.db")
}

/// SQLite-backed store of installed applications and their registered events
pub struct ApplicationStorage {
    db_path: Option<PathBuf>,
    connection: Mutex<Connection>,
}

impl ApplicationStorage {
    /// Open (or create) the database at `path`, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let connection =
            Connection::open(path).map_err(|e| StorageError::connection_failed(e.to_string()))?;
        Self::init_schema(&connection)?;

        debug!(path = %path.display(), "Opened application storage");

        Ok(Self {
            db_path: Some(path.to_path_buf()),
            connection: Mutex::new(connection),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let connection = Connection::open_in_memory()
            .map_err(|e| StorageError::connection_failed(e.to_string()))?;
        Self::init_schema(&connection)?;
        Ok(Self {
            db_path: None,
            connection: Mutex::new(connection),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StorageError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS applications (
                id TEXT PRIMARY KEY NOT NULL,
                path TEXT NOT NULL,
                manifest TEXT NOT NULL,
                installed_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS app_events (
                id TEXT PRIMARY KEY NOT NULL,
                events TEXT NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            )",
            [],
        )?;

        Ok(())
    }

    /// Path of the backing database, `None` for in-memory stores
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.connection
            .lock()
            .map_err(|_| StorageError::generic("storage connection lock poisoned"))
    }

    /// Persist a newly installed application
    pub fn add_application(&self, app: &InstalledApplication) -> Result<(), StorageError> {
        if app.id.is_empty() {
            return Err(StorageError::invalid_id("Application id cannot be empty"));
        }
        let path = app.path.to_str().ok_or_else(|| {
            StorageError::generic(format!(
                "Application path is not valid UTF-8: {}",
                app.path.display()
            ))
        })?;

        debug!(app_id = %app.id, "storage.add_application");

        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM applications WHERE id = ?)",
            [&app.id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StorageError::already_exists(app.id.clone()));
        }

        conn.execute(
            "INSERT INTO applications (id, path, manifest, installed_at) VALUES (?, ?, ?, ?)",
            rusqlite::params![
                app.id,
                path,
                app.manifest,
                app.installed_at.timestamp()
            ],
        )?;

        Ok(())
    }

    /// Remove an installed application and its registered events
    pub fn remove_application(&self, app_id: &str) -> Result<(), StorageError> {
        debug!(app_id = %app_id, "storage.remove_application");

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM applications WHERE id = ?", [app_id])?;
        tx.execute("DELETE FROM app_events WHERE id = ?", [app_id])?;
        tx.commit()?;

        if removed == 0 {
            return Err(StorageError::not_found(app_id));
        }
        Ok(())
    }

    /// Look up an installed application by id
    pub fn get_application(
        &self,
        app_id: &str,
    ) -> Result<Option<InstalledApplication>, StorageError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, path, manifest, installed_at FROM applications WHERE id = ?",
                [app_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(id, path, manifest, ts)| InstalledApplication {
            id,
            path: PathBuf::from(path),
            manifest,
            installed_at: timestamp_to_utc(ts),
        }))
    }

    /// Whether an application with `app_id` is installed
    pub fn contains(&self, app_id: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM applications WHERE id = ?)",
            [app_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// All installed applications, ordered by id
    pub fn list_applications(&self) -> Result<Vec<InstalledApplication>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, path, manifest, installed_at FROM applications ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(InstalledApplication {
                id: row.get(0)?,
                path: PathBuf::from(row.get::<_, String>(1)?),
                manifest: row.get(2)?,
                installed_at: timestamp_to_utc(row.get(3)?),
            })
        })?;

        let mut apps = Vec::new();
        for row in rows {
            apps.push(row?);
        }
        Ok(apps)
    }
}

impl EventRegistry for ApplicationStorage {
    fn get_events(&self, app_id: &str) -> Result<BTreeSet<String>, StorageError> {
        let conn = self.lock()?;
        let events: Option<String> = conn
            .query_row("SELECT events FROM app_events WHERE id = ?", [app_id], |row| {
                row.get(0)
            })
            .optional()?;

        match events {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(BTreeSet::new()),
        }
    }

    fn set_events(&self, app_id: &str, events: &BTreeSet<String>) -> Result<(), StorageError> {
        if app_id.is_empty() {
            return Err(StorageError::invalid_id("Application id cannot be empty"));
        }

        debug!(app_id = %app_id, count = events.len(), "storage.set_events");

        let json = serde_json::to_string(events)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO app_events (id, events, updated_at) VALUES (?, ?, strftime('%s', 'now'))
             ON CONFLICT(id) DO UPDATE SET events = excluded.events, updated_at = strftime('%s', 'now')",
            rusqlite::params![app_id, json],
        )?;
        Ok(())
    }
}

fn timestamp_to_utc(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================
