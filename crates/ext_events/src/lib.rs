//! Application event routing for the app host
//!
//! Routes named application events (lifecycle events such as `onSuspend` and
//! custom events raised by hosted JavaScript) between the native host and the
//! hosted web content:
//! - [`Event`]: immutable named event with positional JSON arguments
//! - [`EventObserver`]: capability that receives dispatched events
//! - [`ApplicationEventRouter`]: per-application observer lists and lazy queue
//! - [`ApplicationEventManager`]: one router per loaded application
//! - [`EventBridge`]: the JS-facing side (listeners, acks, registrations)
//!
//! Everything here runs on a single coordination thread. Types are `!Send`
//! on purpose and the manager asserts thread affinity in debug builds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

mod bridge;
mod manager;
mod router;

pub use bridge::{BridgeMessage, EventBridge, JsEventForwarder, ToRendererCmd};
pub use manager::ApplicationEventManager;
pub use router::ApplicationEventRouter;

// ============================================================================
// Lifecycle Event Names
// ============================================================================

/// Dispatched once the application's main document has been launched
pub const ON_LAUNCHED: &str = "onLaunched";

/// Dispatched when only the main document remains open
pub const ON_SUSPEND: &str = "onSuspend";

/// Raised by hosted content once it finished handling an event.
/// The first argument is the name of the acknowledged event.
pub const ON_JAVASCRIPT_EVENT_ACK: &str = "onJavaScriptEventAck";

// ============================================================================
// Error Types (9100+ range)
// ============================================================================

/// Error codes for event routing operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventErrorCode {
    /// Renderer channel send error
    ChannelSend = 9100,
    /// Malformed message from hosted content
    InvalidMessage = 9101,
    /// Operation restricted to the main document
    NotMainDocument = 9102,
    /// Event registry failure
    Storage = 9103,
}

/// Custom error type for event routing operations
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("[{code}] Channel send error: {message}")]
    ChannelSend { code: u32, message: String },

    #[error("[{code}] Invalid message: {message}")]
    InvalidMessage { code: u32, message: String },

    #[error("[{code}] Not the main document: {message}")]
    NotMainDocument { code: u32, message: String },

    #[error("[{code}] Event registry error: {message}")]
    Storage { code: u32, message: String },
}

impl EventError {
    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            code: EventErrorCode::ChannelSend as u32,
            message: message.into(),
        }
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            code: EventErrorCode::InvalidMessage as u32,
            message: message.into(),
        }
    }

    pub fn not_main_document(message: impl Into<String>) -> Self {
        Self::NotMainDocument {
            code: EventErrorCode::NotMainDocument as u32,
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            code: EventErrorCode::Storage as u32,
            message: message.into(),
        }
    }
}

impl From<ext_storage::StorageError> for EventError {
    fn from(e: ext_storage::StorageError) -> Self {
        Self::storage(e.to_string())
    }
}

impl From<serde_json::Error> for EventError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_message(e.to_string())
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// Engine-owned handle to one open web-content view (window, tab or
/// background document) belonging to an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuntimeId(pub u64);

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rt-{}", self.0)
    }
}

/// An immutable named event with positional arguments.
///
/// Events are shared by every observer notified for one dispatch, so they are
/// handed out behind an `Arc` and never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    name: String,
    args: Vec<serde_json::Value>,
}

impl Event {
    /// Create a shareable event
    pub fn new(name: impl Into<String>, args: Vec<serde_json::Value>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            args,
        })
    }

    /// Create a shareable event without arguments
    pub fn named(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[serde_json::Value] {
        &self.args
    }
}

/// Something that can receive a dispatched [`Event`] for an application.
///
/// Routers hold observers by `Weak` reference; the creator owns the `Rc` and
/// detaches explicitly (usually through the [`ObserverToken`] returned at
/// attach time) during its own teardown.
pub trait EventObserver {
    fn observe(&self, app_id: &str, event: &Arc<Event>);
}

/// Handle to a single attachment, scoped to the application it was attached
/// under. Detaching by token removes exactly that attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(pub(crate) u64);

impl ObserverToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

// ============================================================================
// Tests
// ============================================================================
