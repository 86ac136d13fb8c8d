//! HeadlessEngine - a runtime host without a renderer
//!
//! Every runtime "loads" instantly and lives in its own render process.
//! Engine notifications are queued on an unbounded channel and picked up by
//! the coordination loop, never delivered re-entrantly.

use ext_app::{AppError, EngineEvent, RuntimeHost, RuntimeId, RuntimeKind, RuntimeRequest};
use ext_events::ToRendererCmd;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct HeadlessRuntime {
    app_id: String,
    kind: RuntimeKind,
}

pub struct HeadlessEngine {
    next_id: Cell<u64>,
    runtimes: RefCell<HashMap<RuntimeId, HeadlessRuntime>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl HeadlessEngine {
    pub fn new(events_tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            next_id: Cell::new(0),
            runtimes: RefCell::new(HashMap::new()),
            events_tx,
        }
    }

    pub fn runtime_count(&self) -> usize {
        self.runtimes.borrow().len()
    }

    /// Renderer side of the event bridge. Nothing executes script here, so
    /// events are only logged.
    pub fn deliver(&self, cmd: ToRendererCmd) {
        match cmd {
            ToRendererCmd::DispatchEvent {
                app_id,
                runtime,
                event,
            } => {
                if self.runtimes.borrow().contains_key(&runtime) {
                    debug!(app_id = %app_id, runtime = %runtime, event = %event.name(), args = ?event.args(), "Event for renderer");
                } else {
                    warn!(app_id = %app_id, runtime = %runtime, event = %event.name(), "Event for closed runtime");
                }
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        if self.events_tx.send(event).is_err() {
            warn!("Engine event channel closed");
        }
    }
}

impl RuntimeHost for HeadlessEngine {
    fn create_runtime(&self, request: RuntimeRequest) -> Result<RuntimeId, AppError> {
        let runtime = RuntimeId(self.next_id.get() + 1);
        self.next_id.set(runtime.0);

        info!(app_id = %request.app_id, runtime = %runtime, url = %request.url, kind = ?request.kind, "Opened runtime");
        self.runtimes.borrow_mut().insert(
            runtime,
            HeadlessRuntime {
                app_id: request.app_id.clone(),
                kind: request.kind,
            },
        );

        self.emit(EngineEvent::RuntimeAdded {
            app_id: request.app_id,
            runtime,
        });
        self.emit(EngineEvent::DocumentLoaded { runtime });
        Ok(runtime)
    }

    fn close_runtime(&self, runtime: RuntimeId) {
        let removed = self.runtimes.borrow_mut().remove(&runtime);
        match removed {
            Some(closed) => {
                info!(app_id = %closed.app_id, runtime = %runtime, kind = ?closed.kind, "Closed runtime");
                self.emit(EngineEvent::RuntimeRemoved { runtime });
            }
            None => debug!(runtime = %runtime, "Close requested for unknown runtime"),
        }
    }

    fn render_host_id(&self, runtime: RuntimeId) -> Option<u32> {
        if !self.runtimes.borrow().contains_key(&runtime) {
            return None;
        }
        u32::try_from(runtime.0).ok()
    }
}
