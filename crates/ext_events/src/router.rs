//! ApplicationEventRouter - per-application observer lists and lazy event queue
//!
//! A router starts out LOADING: every dispatched event is queued in arrival
//! order. When the main document finishes loading the router becomes LOADED,
//! replays the queue in order, and from then on delivers synchronously to the
//! observers attached for each event name, in attachment order.

use crate::{Event, EventObserver, ObserverToken, RuntimeId};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, trace};

struct ObserverEntry {
    token: ObserverToken,
    observer: Weak<dyn EventObserver>,
}

impl ObserverEntry {
    fn is(&self, observer: &Rc<dyn EventObserver>) -> bool {
        same_observer(&self.observer, observer)
    }
}

/// Identity comparison on the data pointer only; vtable pointers for the same
/// object may differ between codegen units.
fn same_observer(weak: &Weak<dyn EventObserver>, observer: &Rc<dyn EventObserver>) -> bool {
    Weak::as_ptr(weak) as *const () == Rc::as_ptr(observer) as *const ()
}

#[derive(Default)]
struct RouterState {
    main_document_loaded: bool,
    main_document: Option<RuntimeId>,
    observers: BTreeMap<String, Vec<ObserverEntry>>,
    lazy_events: VecDeque<Arc<Event>>,
    main_events: BTreeSet<String>,
    flushing: bool,
    process_gone: bool,
}

/// Owns the per-event observer lists for one application
pub struct ApplicationEventRouter {
    app_id: String,
    next_token: Cell<u64>,
    state: RefCell<RouterState>,
}

impl ApplicationEventRouter {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            next_token: Cell::new(1),
            state: RefCell::new(RouterState::default()),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Whether the main document has finished loading
    pub fn is_loaded(&self) -> bool {
        self.state.borrow().main_document_loaded
    }

    /// Number of events waiting for the main document to load
    pub fn pending_events(&self) -> usize {
        self.state.borrow().lazy_events.len()
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Append `observer` to the list for `event_name`.
    ///
    /// Attaching the same observer twice yields two attachments, and two
    /// notifications per dispatch.
    pub fn attach_observer(
        &self,
        event_name: &str,
        observer: &Rc<dyn EventObserver>,
    ) -> ObserverToken {
        let token = ObserverToken(self.next_token.get());
        self.next_token.set(token.0 + 1);

        self.state
            .borrow_mut()
            .observers
            .entry(event_name.to_string())
            .or_default()
            .push(ObserverEntry {
                token,
                observer: Rc::downgrade(observer),
            });

        debug!(app_id = %self.app_id, event = %event_name, token = token.0, "Observer attached");
        token
    }

    /// Remove every attachment of `observer` under `event_name`.
    /// Detaching an observer that isn't attached is a no-op.
    pub fn detach_observer(&self, event_name: &str, observer: &Rc<dyn EventObserver>) {
        let mut state = self.state.borrow_mut();
        let emptied = match state.observers.get_mut(event_name) {
            Some(list) => {
                list.retain(|entry| !entry.is(observer));
                list.is_empty()
            }
            None => return,
        };
        if emptied {
            state.observers.remove(event_name);
        }
    }

    /// Remove the single attachment identified by `token`.
    /// Returns false if the token was not attached.
    pub fn detach_token(&self, token: ObserverToken) -> bool {
        let mut state = self.state.borrow_mut();
        let mut found: Option<(String, bool)> = None;
        for (name, list) in state.observers.iter_mut() {
            if let Some(pos) = list.iter().position(|entry| entry.token == token) {
                list.remove(pos);
                found = Some((name.clone(), list.is_empty()));
                break;
            }
        }
        match found {
            Some((name, emptied)) => {
                if emptied {
                    state.observers.remove(&name);
                }
                true
            }
            None => false,
        }
    }

    /// Remove `observer` from every event-name list it belongs to
    pub fn detach_observer_everywhere(&self, observer: &Rc<dyn EventObserver>) {
        let mut state = self.state.borrow_mut();
        state.observers.retain(|_, list| {
            list.retain(|entry| !entry.is(observer));
            !list.is_empty()
        });
    }

    /// Forcibly drop every attachment
    pub fn detach_all_observers(&self) {
        self.state.borrow_mut().observers.clear();
    }

    /// Drop attachments whose observer no longer exists. Returns how many.
    pub fn sweep_dangling(&self) -> usize {
        let mut removed = 0;
        let mut state = self.state.borrow_mut();
        state.observers.retain(|_, list| {
            let before = list.len();
            list.retain(|entry| entry.observer.strong_count() > 0);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    pub fn has_observers(&self, event_name: &str) -> bool {
        self.state.borrow().observers.contains_key(event_name)
    }

    pub fn observer_count(&self, event_name: &str) -> usize {
        self.state
            .borrow()
            .observers
            .get(event_name)
            .map_or(0, Vec::len)
    }

    fn is_attached(&self, event_name: &str, token: ObserverToken) -> bool {
        self.state
            .borrow()
            .observers
            .get(event_name)
            .is_some_and(|list| list.iter().any(|entry| entry.token == token))
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Queue `event` while loading, deliver it otherwise
    pub fn dispatch_event(&self, event: Arc<Event>) {
        {
            let mut state = self.state.borrow_mut();
            if !state.main_document_loaded || state.flushing {
                trace!(app_id = %self.app_id, event = %event.name(), "Queued lazy event");
                state.lazy_events.push_back(event);
                return;
            }
        }
        self.deliver(&event);
    }

    /// Invoke every observer attached for the event's name.
    ///
    /// Iterates a snapshot of the list; observers detached by an earlier
    /// callback of this same dispatch are skipped, observers attached during it
    /// are not invoked until the next dispatch.
    fn deliver(&self, event: &Arc<Event>) {
        let snapshot: Vec<(ObserverToken, Weak<dyn EventObserver>)> = {
            let state = self.state.borrow();
            match state.observers.get(event.name()) {
                Some(list) => list
                    .iter()
                    .map(|entry| (entry.token, entry.observer.clone()))
                    .collect(),
                None => {
                    debug!(app_id = %self.app_id, event = %event.name(), "No observers for event");
                    return;
                }
            }
        };

        for (token, weak) in snapshot {
            if !self.is_attached(event.name(), token) {
                continue;
            }
            match weak.upgrade() {
                Some(observer) => observer.observe(&self.app_id, event),
                None => {
                    trace!(app_id = %self.app_id, token = token.0, "Skipping dropped observer")
                }
            }
        }
    }

    // =========================================================================
    // Main Document
    // =========================================================================

    /// Record the content view whose load completion flips the router to LOADED
    pub fn set_main_document(&self, runtime: RuntimeId) {
        self.state.borrow_mut().main_document = Some(runtime);
    }

    pub fn main_document(&self) -> Option<RuntimeId> {
        self.state.borrow().main_document
    }

    /// Engine signal: `runtime` stopped loading. Only the main document counts.
    pub fn did_stop_loading(&self, runtime: RuntimeId) {
        if self.main_document() != Some(runtime) {
            trace!(app_id = %self.app_id, runtime = %runtime, "Ignoring load of non-main runtime");
            return;
        }
        self.on_main_document_loaded();
    }

    /// Transition to LOADED and flush queued events in arrival order.
    ///
    /// Events dispatched by observers during the flush go to the tail of the
    /// (fresh) queue and are delivered after everything queued before them.
    pub fn on_main_document_loaded(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.main_document_loaded || state.process_gone {
                return;
            }
            state.main_document_loaded = true;
            state.flushing = true;
        }

        debug!(app_id = %self.app_id, pending = self.pending_events(), "Main document loaded");

        loop {
            let batch: Vec<Arc<Event>> = {
                let mut state = self.state.borrow_mut();
                if state.lazy_events.is_empty() || !state.main_document_loaded {
                    state.flushing = false;
                    break;
                }
                state.lazy_events.drain(..).collect()
            };

            let mut remaining = batch.into_iter();
            while let Some(event) = remaining.next() {
                if !self.is_loaded() {
                    // Process died mid-flush; keep the rest queued in order.
                    let mut state = self.state.borrow_mut();
                    let rest: Vec<Arc<Event>> = std::iter::once(event).chain(remaining).collect();
                    for queued in rest.into_iter().rev() {
                        state.lazy_events.push_front(queued);
                    }
                    break;
                }
                self.deliver(&event);
            }
        }
    }

    /// Engine signal: the render process hosting this application died.
    /// Clears the loaded flag and force-detaches every observer. The router
    /// never becomes LOADED again; a relaunch gets a fresh router.
    pub fn render_process_gone(&self) {
        let mut state = self.state.borrow_mut();
        state.main_document_loaded = false;
        state.process_gone = true;
        state.observers.clear();
        debug!(app_id = %self.app_id, "Render process gone, observers detached");
    }

    // =========================================================================
    // Main Events
    // =========================================================================

    /// Record which events the main document has registered handlers for
    pub fn set_main_events(&self, events: BTreeSet<String>) {
        self.state.borrow_mut().main_events = events;
    }

    pub fn main_events(&self) -> BTreeSet<String> {
        self.state.borrow().main_events.clone()
    }

    pub fn contains_main_event(&self, event_name: &str) -> bool {
        self.state.borrow().main_events.contains(event_name)
    }
}

// ============================================================================
// Tests
// ============================================================================
