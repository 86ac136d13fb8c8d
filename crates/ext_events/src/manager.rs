//! ApplicationEventManager - the single entry point for application events
//!
//! Owns one [`ApplicationEventRouter`] per loaded application id. Other
//! subsystems (the application lifecycle, the JS event bridge, platform signal
//! bridges) send events, attach and detach observers, and report main document
//! progress through this type only.
//!
//! The manager is constructed by its owner and passed around by `Rc`; it is
//! not a global. All methods must run on the thread that created it.

use crate::{ApplicationEventRouter, Event, EventObserver, ObserverToken, RuntimeId};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, warn};

pub struct ApplicationEventManager {
    thread_id: ThreadId,
    routers: RefCell<HashMap<String, Rc<ApplicationEventRouter>>>,
}

impl Default for ApplicationEventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationEventManager {
    /// Create a manager bound to the current (coordination) thread
    pub fn new() -> Self {
        Self {
            thread_id: thread::current().id(),
            routers: RefCell::new(HashMap::new()),
        }
    }

    fn assert_coordination_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.thread_id,
            "ApplicationEventManager used off its coordination thread"
        );
    }

    /// Router for `app_id`, cloned out so no manager borrow is held while the
    /// router runs observer callbacks.
    pub fn router(&self, app_id: &str) -> Option<Rc<ApplicationEventRouter>> {
        self.routers.borrow().get(app_id).cloned()
    }

    fn router_or_warn(&self, app_id: &str, operation: &str) -> Option<Rc<ApplicationEventRouter>> {
        let router = self.router(app_id);
        if router.is_none() {
            warn!(app_id = %app_id, operation, "Application is not loaded, ignoring");
        }
        router
    }

    /// Whether a router exists for `app_id`
    pub fn is_app_loaded(&self, app_id: &str) -> bool {
        self.assert_coordination_thread();
        self.routers.borrow().contains_key(app_id)
    }

    // =========================================================================
    // Application Lifecycle
    // =========================================================================

    /// Register a fresh router for `app_id`.
    ///
    /// Loading an application twice is a programming error.
    pub fn on_app_loaded(&self, app_id: &str) {
        self.assert_coordination_thread();
        let mut routers = self.routers.borrow_mut();
        if routers.contains_key(app_id) {
            error!(app_id = %app_id, "Event router already exists for application");
            debug_assert!(false, "on_app_loaded called twice for {}", app_id);
            return;
        }
        routers.insert(
            app_id.to_string(),
            Rc::new(ApplicationEventRouter::new(app_id)),
        );
        debug!(app_id = %app_id, "Event router created");
    }

    /// Drop the router for `app_id`.
    ///
    /// Unloading an application that was never loaded is a programming error.
    pub fn on_app_unloaded(&self, app_id: &str) {
        self.assert_coordination_thread();
        if self.routers.borrow_mut().remove(app_id).is_none() {
            error!(app_id = %app_id, "No event router to remove for application");
            debug_assert!(false, "on_app_unloaded without on_app_loaded for {}", app_id);
            return;
        }
        debug!(app_id = %app_id, "Event router removed");
    }

    // =========================================================================
    // Events & Observers
    // =========================================================================

    /// Dispatch `event` to the application's router. Events for applications
    /// that aren't loaded are dropped with a warning.
    pub fn send_event(&self, app_id: &str, event: Arc<Event>) {
        self.assert_coordination_thread();
        if let Some(router) = self.router_or_warn(app_id, "send_event") {
            router.dispatch_event(event);
        }
    }

    /// Attach `observer` for `event_name` under `app_id`.
    /// Returns `None` (and warns) when the application isn't loaded.
    pub fn attach_observer(
        &self,
        app_id: &str,
        event_name: &str,
        observer: &Rc<dyn EventObserver>,
    ) -> Option<ObserverToken> {
        self.assert_coordination_thread();
        self.router_or_warn(app_id, "attach_observer")
            .map(|router| router.attach_observer(event_name, observer))
    }

    /// Detach every attachment of `observer` for `event_name` under `app_id`
    pub fn detach_observer(
        &self,
        app_id: &str,
        event_name: &str,
        observer: &Rc<dyn EventObserver>,
    ) {
        self.assert_coordination_thread();
        if let Some(router) = self.router_or_warn(app_id, "detach_observer") {
            router.detach_observer(event_name, observer);
        }
    }

    /// Detach the attachment identified by `token` under `app_id`.
    /// Silently does nothing if the application or token is gone.
    pub fn detach_token(&self, app_id: &str, token: ObserverToken) -> bool {
        self.assert_coordination_thread();
        match self.router(app_id) {
            Some(router) => router.detach_token(token),
            None => {
                debug!(app_id = %app_id, token = token.id(), "Router gone, token already released");
                false
            }
        }
    }

    /// Remove `observer` from every list of every registered router
    pub fn detach_observer_everywhere(&self, observer: &Rc<dyn EventObserver>) {
        self.assert_coordination_thread();
        let routers: Vec<Rc<ApplicationEventRouter>> =
            self.routers.borrow().values().cloned().collect();
        for router in routers {
            router.detach_observer_everywhere(observer);
        }
    }

    /// Drop attachments whose observers no longer exist, across all routers
    pub fn sweep_dangling(&self) -> usize {
        self.assert_coordination_thread();
        let routers: Vec<Rc<ApplicationEventRouter>> =
            self.routers.borrow().values().cloned().collect();
        let removed: usize = routers.iter().map(|r| r.sweep_dangling()).sum();
        if removed > 0 {
            debug!(removed, "Swept dangling observer entries");
        }
        removed
    }

    // =========================================================================
    // Main Document
    // =========================================================================

    /// Start watching `runtime` as the content whose load completion moves the
    /// application's router from LOADING to LOADED
    pub fn on_main_document_created(&self, app_id: &str, runtime: RuntimeId) {
        self.assert_coordination_thread();
        if let Some(router) = self.router_or_warn(app_id, "on_main_document_created") {
            router.set_main_document(runtime);
        }
    }

    /// The content view registered as main document, if any
    pub fn main_document(&self, app_id: &str) -> Option<RuntimeId> {
        self.assert_coordination_thread();
        self.router(app_id).and_then(|router| router.main_document())
    }

    /// Engine signal: `runtime` stopped loading
    pub fn on_document_loaded(&self, app_id: &str, runtime: RuntimeId) {
        self.assert_coordination_thread();
        if let Some(router) = self.router(app_id) {
            router.did_stop_loading(runtime);
        }
    }

    /// Engine signal: the application's render process died
    pub fn on_render_process_gone(&self, app_id: &str) {
        self.assert_coordination_thread();
        if let Some(router) = self.router_or_warn(app_id, "on_render_process_gone") {
            router.render_process_gone();
        }
    }

    /// Record the events the main document has registered handlers for
    pub fn set_main_events(&self, app_id: &str, events: BTreeSet<String>) {
        self.assert_coordination_thread();
        if let Some(router) = self.router_or_warn(app_id, "set_main_events") {
            router.set_main_events(events);
        }
    }

    pub fn main_events(&self, app_id: &str) -> BTreeSet<String> {
        self.assert_coordination_thread();
        self.router(app_id)
            .map(|router| router.main_events())
            .unwrap_or_default()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::RecordingObserver;
    use pretty_assertions::assert_eq;

    fn loaded_manager(app_ids: &[&str]) -> ApplicationEventManager {
        let manager = ApplicationEventManager::new();
        for (i, app_id) in app_ids.iter().enumerate() {
            manager.on_app_loaded(app_id);
            let main = RuntimeId(i as u64 + 1);
            manager.on_main_document_created(app_id, main);
            manager.on_document_loaded(app_id, main);
        }
        manager
    }

    #[test]
    fn test_send_event_to_unloaded_app_is_dropped() {
        let manager = ApplicationEventManager::new();
        let observer = Rc::new(RecordingObserver::default());
        let dyn_obs: Rc<dyn EventObserver> = observer.clone();

        assert!(manager.attach_observer("ghost", "foo", &dyn_obs).is_none());
        manager.send_event("ghost", Event::named("foo"));
        manager.detach_observer("ghost", "foo", &dyn_obs);
        assert!(!manager.detach_token("ghost", ObserverToken(1)));
        assert_eq!(observer.count(), 0);
    }

    #[test]
    fn test_example_scenario() {
        let manager = ApplicationEventManager::new();
        manager.on_app_loaded("app1");
        manager.on_main_document_created("app1", RuntimeId(1));

        manager.send_event("app1", Event::new("foo", vec![]));

        let observer = Rc::new(RecordingObserver::default());
        let dyn_obs: Rc<dyn EventObserver> = observer.clone();
        manager.attach_observer("app1", "foo", &dyn_obs).unwrap();
        assert_eq!(observer.count(), 0);

        manager.on_document_loaded("app1", RuntimeId(1));

        let seen = observer.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "app1");
        assert_eq!(seen[0].1.name(), "foo");
    }

    #[test]
    fn test_events_are_routed_per_application() {
        let manager = loaded_manager(&["app1", "app2"]);
        let first = Rc::new(RecordingObserver::default());
        let second = Rc::new(RecordingObserver::default());
        let first_dyn: Rc<dyn EventObserver> = first.clone();
        let second_dyn: Rc<dyn EventObserver> = second.clone();
        manager.attach_observer("app1", "foo", &first_dyn);
        manager.attach_observer("app2", "foo", &second_dyn);

        manager.send_event("app2", Event::named("foo"));
        assert_eq!(first.count(), 0);
        assert_eq!(second.count(), 1);
        assert_eq!(second.seen.borrow()[0].0, "app2");
    }

    #[test]
    fn test_global_detach_spans_routers() {
        let manager = loaded_manager(&["app1", "app2"]);
        let observer = Rc::new(RecordingObserver::default());
        let dyn_obs: Rc<dyn EventObserver> = observer.clone();
        manager.attach_observer("app1", "foo", &dyn_obs);
        manager.attach_observer("app1", "bar", &dyn_obs);
        manager.attach_observer("app2", "foo", &dyn_obs);

        manager.detach_observer_everywhere(&dyn_obs);

        manager.send_event("app1", Event::named("foo"));
        manager.send_event("app1", Event::named("bar"));
        manager.send_event("app2", Event::named("foo"));
        assert_eq!(observer.count(), 0);
    }

    #[test]
    fn test_unload_drops_router() {
        let manager = loaded_manager(&["app1"]);
        assert!(manager.is_app_loaded("app1"));
        manager.on_app_unloaded("app1");
        assert!(!manager.is_app_loaded("app1"));
        assert!(manager.main_document("app1").is_none());

        // A relaunch gets a fresh LOADING router.
        manager.on_app_loaded("app1");
        assert!(!manager.router("app1").unwrap().is_loaded());
    }

    #[test]
    #[should_panic(expected = "on_app_loaded called twice")]
    #[cfg(debug_assertions)]
    fn test_double_load_asserts() {
        let manager = ApplicationEventManager::new();
        manager.on_app_loaded("app1");
        manager.on_app_loaded("app1");
    }

    #[test]
    #[should_panic(expected = "on_app_unloaded without on_app_loaded")]
    #[cfg(debug_assertions)]
    fn test_unload_without_load_asserts() {
        let manager = ApplicationEventManager::new();
        manager.on_app_unloaded("app1");
    }

    #[test]
    fn test_render_process_gone_detaches() {
        let manager = loaded_manager(&["app1"]);
        let observer = Rc::new(RecordingObserver::default());
        let dyn_obs: Rc<dyn EventObserver> = observer.clone();
        manager.attach_observer("app1", "foo", &dyn_obs);

        manager.on_render_process_gone("app1");
        manager.send_event("app1", Event::named("foo"));
        assert_eq!(observer.count(), 0);
    }

    #[test]
    fn test_sweep_dangling_across_routers() {
        let manager = loaded_manager(&["app1", "app2"]);
        {
            let short_lived: Rc<dyn EventObserver> = Rc::new(RecordingObserver::default());
            manager.attach_observer("app1", "foo", &short_lived);
            manager.attach_observer("app2", "bar", &short_lived);
        }
        assert_eq!(manager.sweep_dangling(), 2);
        assert_eq!(manager.sweep_dangling(), 0);
    }

    #[test]
    fn test_main_events_round_trip() {
        let manager = loaded_manager(&["app1"]);
        assert!(manager.main_events("app1").is_empty());
        manager.set_main_events("app1", ["onSuspend".to_string()].into_iter().collect());
        assert!(manager.main_events("app1").contains("onSuspend"));
        assert!(manager.main_events("missing").is_empty());
    }
}
