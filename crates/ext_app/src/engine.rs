//! Boundary between the application core and the embedded web engine.
//!
//! Outbound requests go through [`RuntimeHost`]. Everything the engine wants
//! to tell us comes back as an [`EngineEvent`] and is fed to
//! `ApplicationService::handle_engine_event` on the coordination thread.

use crate::AppError;
use ext_events::RuntimeId;
use url::Url;

/// Window geometry for a runtime opened in its own window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParams {
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowParams {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            resizable: true,
        }
    }
}

/// What kind of content view to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Invisible background page driving the application
    MainDocument,
    /// A visible window showing the entry page
    Window(WindowParams),
}

/// Request to open a new runtime for an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeRequest {
    pub app_id: String,
    pub url: Url,
    pub kind: RuntimeKind,
}

/// Outbound engine operations.
///
/// Implementations must not call back into the application core from inside
/// these methods. Runtime creation and removal are reported asynchronously
/// through [`EngineEvent`]s.
pub trait RuntimeHost {
    /// Open a runtime and return its handle
    fn create_runtime(&self, request: RuntimeRequest) -> Result<RuntimeId, AppError>;

    /// Ask the engine to close a runtime. Completion is reported later as
    /// [`EngineEvent::RuntimeRemoved`].
    fn close_runtime(&self, runtime: RuntimeId);

    /// Identifier of the render process hosting `runtime`, if known
    fn render_host_id(&self, runtime: RuntimeId) -> Option<u32> {
        let _ = runtime;
        None
    }
}

/// Notifications raised by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A runtime was opened on behalf of an application
    RuntimeAdded { app_id: String, runtime: RuntimeId },
    /// A runtime was closed
    RuntimeRemoved { runtime: RuntimeId },
    /// A runtime finished loading its document
    DocumentLoaded { runtime: RuntimeId },
    /// The render process hosting an application's main document died
    RenderProcessGone { render_host_id: u32 },
    /// Hosted content asked the application to exit
    ExitRequested { runtime: RuntimeId },
    /// Raw event-bridge message posted by hosted content
    BridgeMessage {
        runtime: RuntimeId,
        payload: serde_json::Value,
    },
}
