//! EventBridge - the JS-facing half of application event routing
//!
//! Hosted content talks to the host through small JSON messages:
//!
//! ```text
//! { "type": "addListener",    "event": "onSuspend" }
//! { "type": "removeListener", "event": "onSuspend" }
//! { "type": "ack",            "event": "onSuspend" }
//! { "type": "registerEvents", "events": ["onSuspend", "onLaunched"] }
//! { "type": "dispatchEvent",  "event": "custom", "args": [1, 2] }
//! ```
//!
//! Listeners are forwarded back to the renderer as [`ToRendererCmd`] values
//! over an mpsc channel, the same way window IPC reaches the webview.

use crate::{
    ApplicationEventManager, Event, EventError, EventObserver, ObserverToken, RuntimeId,
    ON_JAVASCRIPT_EVENT_ACK,
};
use ext_storage::EventRegistry;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Message from hosted content to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeMessage {
    /// Start forwarding `event` to the sending runtime
    AddListener { event: String },
    /// Stop forwarding `event` to the sending runtime
    RemoveListener { event: String },
    /// The sending runtime finished handling `event`
    Ack { event: String },
    /// Persist the set of events the main document handles
    RegisterEvents { events: Vec<String> },
    /// Raise a custom event for the application
    DispatchEvent {
        event: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
}

/// Command sent from the host to a renderer
#[derive(Debug, Clone)]
pub enum ToRendererCmd {
    DispatchEvent {
        app_id: String,
        runtime: RuntimeId,
        event: Arc<Event>,
    },
}

/// Observer forwarding every event it sees to one runtime's renderer
pub struct JsEventForwarder {
    runtime: RuntimeId,
    to_renderer_tx: mpsc::Sender<ToRendererCmd>,
}

impl JsEventForwarder {
    pub fn new(runtime: RuntimeId, to_renderer_tx: mpsc::Sender<ToRendererCmd>) -> Self {
        Self {
            runtime,
            to_renderer_tx,
        }
    }
}

impl EventObserver for JsEventForwarder {
    fn observe(&self, app_id: &str, event: &Arc<Event>) {
        let cmd = ToRendererCmd::DispatchEvent {
            app_id: app_id.to_string(),
            runtime: self.runtime,
            event: event.clone(),
        };
        if let Err(e) = self.to_renderer_tx.try_send(cmd) {
            warn!(
                app_id = %app_id,
                runtime = %self.runtime,
                event = %event.name(),
                "Dropping event for renderer: {}",
                e
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ListenerKey {
    app_id: String,
    runtime: RuntimeId,
    event: String,
}

struct Listener {
    // Keeps the forwarder alive; the router only holds a Weak.
    _forwarder: Rc<dyn EventObserver>,
    token: ObserverToken,
}

/// Handles messages from hosted content on behalf of the event manager
pub struct EventBridge {
    manager: Rc<ApplicationEventManager>,
    registry: Rc<dyn EventRegistry>,
    to_renderer_tx: mpsc::Sender<ToRendererCmd>,
    listeners: RefCell<HashMap<ListenerKey, Listener>>,
}

impl EventBridge {
    pub fn new(
        manager: Rc<ApplicationEventManager>,
        registry: Rc<dyn EventRegistry>,
        to_renderer_tx: mpsc::Sender<ToRendererCmd>,
    ) -> Self {
        Self {
            manager,
            registry,
            to_renderer_tx,
            listeners: RefCell::new(HashMap::new()),
        }
    }

    /// Parse and handle a raw JSON message from `runtime`
    pub fn handle_json(
        &self,
        app_id: &str,
        runtime: RuntimeId,
        payload: serde_json::Value,
    ) -> Result<(), EventError> {
        let message: BridgeMessage = serde_json::from_value(payload)?;
        self.handle_message(app_id, runtime, message)
    }

    /// Handle a message from `runtime` belonging to `app_id`
    pub fn handle_message(
        &self,
        app_id: &str,
        runtime: RuntimeId,
        message: BridgeMessage,
    ) -> Result<(), EventError> {
        debug!(app_id = %app_id, runtime = %runtime, ?message, "Bridge message");

        match message {
            BridgeMessage::AddListener { event } => {
                self.add_listener(app_id, runtime, event);
                Ok(())
            }
            BridgeMessage::RemoveListener { event } => {
                self.remove_listener(app_id, runtime, &event);
                Ok(())
            }
            BridgeMessage::Ack { event } => {
                self.manager.send_event(
                    app_id,
                    Event::new(ON_JAVASCRIPT_EVENT_ACK, vec![serde_json::Value::String(event)]),
                );
                Ok(())
            }
            BridgeMessage::RegisterEvents { events } => {
                self.register_events(app_id, runtime, events.into_iter().collect())
            }
            BridgeMessage::DispatchEvent { event, args } => {
                if event.is_empty() {
                    return Err(EventError::invalid_message("event name cannot be empty"));
                }
                self.manager.send_event(app_id, Event::new(event, args));
                Ok(())
            }
        }
    }

    fn add_listener(&self, app_id: &str, runtime: RuntimeId, event: String) {
        let key = ListenerKey {
            app_id: app_id.to_string(),
            runtime,
            event,
        };
        if self.listeners.borrow().contains_key(&key) {
            return;
        }

        let forwarder: Rc<dyn EventObserver> = Rc::new(JsEventForwarder::new(
            runtime,
            self.to_renderer_tx.clone(),
        ));
        if let Some(token) = self.manager.attach_observer(app_id, &key.event, &forwarder) {
            self.listeners.borrow_mut().insert(
                key,
                Listener {
                    _forwarder: forwarder,
                    token,
                },
            );
        }
    }

    fn remove_listener(&self, app_id: &str, runtime: RuntimeId, event: &str) {
        let key = ListenerKey {
            app_id: app_id.to_string(),
            runtime,
            event: event.to_string(),
        };
        let removed = self.listeners.borrow_mut().remove(&key);
        if let Some(listener) = removed {
            self.manager.detach_token(app_id, listener.token);
        }
    }

    /// Persist the events the main document handles. Registrations from any
    /// other runtime are rejected.
    fn register_events(
        &self,
        app_id: &str,
        runtime: RuntimeId,
        events: BTreeSet<String>,
    ) -> Result<(), EventError> {
        if self.manager.main_document(app_id) != Some(runtime) {
            return Err(EventError::not_main_document(format!(
                "{} is not the main document of {}",
                runtime, app_id
            )));
        }

        self.registry.set_events(app_id, &events)?;
        self.manager.set_main_events(app_id, events);
        Ok(())
    }

    /// Release every listener owned by `runtime`
    pub fn on_runtime_closed(&self, app_id: &str, runtime: RuntimeId) {
        let released: Vec<Listener> = {
            let mut listeners = self.listeners.borrow_mut();
            let keys: Vec<ListenerKey> = listeners
                .keys()
                .filter(|k| k.app_id == app_id && k.runtime == runtime)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| listeners.remove(k)).collect()
        };
        for listener in released {
            self.manager.detach_token(app_id, listener.token);
        }
    }

    /// Release every listener of `app_id`
    pub fn on_app_unloaded(&self, app_id: &str) {
        let released: Vec<Listener> = {
            let mut listeners = self.listeners.borrow_mut();
            let keys: Vec<ListenerKey> = listeners
                .keys()
                .filter(|k| k.app_id == app_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| listeners.remove(k)).collect()
        };
        for listener in released {
            self.manager.detach_token(app_id, listener.token);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
