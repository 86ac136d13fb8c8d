//! A running application and its lifecycle.
//!
//! An application is ACTIVE while it has runtimes open. When every runtime
//! other than the main document has closed, it enters SUSPENDING: if the main
//! document registered an `onSuspend` handler, that event is dispatched and
//! the main document is closed once hosted content acknowledges it.
//! Otherwise the main document is closed right away. When the last runtime
//! is gone the application is TERMINATED and its observer is told once.

use crate::engine::{RuntimeHost, RuntimeKind, RuntimeRequest};
use crate::manifest::ApplicationData;
use crate::permissions::{PermissionState, PermissionType, RuntimePermission, StoredPermission};
use crate::AppError;
use ext_events::{
    ApplicationEventManager, Event, EventObserver, ObserverToken, RuntimeId,
    ON_JAVASCRIPT_EVENT_ACK, ON_LAUNCHED, ON_SUSPEND,
};
use ext_storage::EventRegistry;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    /// Constructed, not launched yet
    Created,
    /// Opening the main document or entry page
    Launching,
    Active,
    /// Only the main document is left and it is being shut down
    Suspending,
    Terminated,
}

/// Receives the termination notification of an [`Application`]
pub trait ApplicationObserver {
    fn on_application_terminated(&self, app: &Application);
}

/// Waits for hosted content to acknowledge `onSuspend`, then closes the main
/// document. Attached for `onJavaScriptEventAck` only while suspending.
struct FinishEventObserver {
    app: Weak<Application>,
}

impl EventObserver for FinishEventObserver {
    fn observe(&self, app_id: &str, event: &Arc<Event>) {
        if event.name() != ON_JAVASCRIPT_EVENT_ACK {
            return;
        }
        let acked = event.args().first().and_then(|arg| arg.as_str());
        if acked != Some(ON_SUSPEND) {
            debug!(app_id = %app_id, acked = ?acked, "Ignoring ack while suspending");
            return;
        }

        match self.app.upgrade() {
            Some(app) => {
                debug!(app_id = %app_id, "onSuspend acknowledged");
                app.close_main_document();
            }
            None => warn!(app_id = %app_id, "onSuspend acknowledged after application was dropped"),
        }
    }
}

struct PendingSuspend {
    // The router holds the observer weakly
    _observer: Rc<dyn EventObserver>,
    token: ObserverToken,
}

struct Inner {
    state: ApplicationState,
    runtimes: BTreeSet<RuntimeId>,
    main_runtime: Option<RuntimeId>,
    render_host_id: Option<u32>,
    pending_suspend: Option<PendingSuspend>,
    suspend_started: Option<Instant>,
}

enum AfterRemoval {
    Nothing,
    /// The main document went away mid-handshake
    Abandon(PendingSuspend),
    Suspend,
    Terminate(Option<PendingSuspend>),
}

pub struct Application {
    data: ApplicationData,
    engine: Rc<dyn RuntimeHost>,
    events: Rc<ApplicationEventManager>,
    registry: Rc<dyn EventRegistry>,
    observer: RefCell<Option<Weak<dyn ApplicationObserver>>>,
    inner: RefCell<Inner>,
    permissions: RefCell<PermissionState>,
    weak_self: Weak<Application>,
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Application")
            .field("id", &self.id())
            .field("state", &inner.state)
            .field("runtimes", &inner.runtimes)
            .field("main_runtime", &inner.main_runtime)
            .finish()
    }
}

impl Application {
    pub fn new(
        data: ApplicationData,
        engine: Rc<dyn RuntimeHost>,
        events: Rc<ApplicationEventManager>,
        registry: Rc<dyn EventRegistry>,
    ) -> Rc<Self> {
        let permissions = PermissionState::new(data.manifest().permissions.clone());
        Rc::new_cyclic(|weak_self| Self {
            data,
            engine,
            events,
            registry,
            observer: RefCell::new(None),
            inner: RefCell::new(Inner {
                state: ApplicationState::Created,
                runtimes: BTreeSet::new(),
                main_runtime: None,
                render_host_id: None,
                pending_suspend: None,
                suspend_started: None,
            }),
            permissions: RefCell::new(permissions),
            weak_self: weak_self.clone(),
        })
    }

    /// Set the observer told about termination
    pub fn set_observer(&self, observer: Weak<dyn ApplicationObserver>) {
        *self.observer.borrow_mut() = Some(observer);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> &str {
        self.data.id()
    }

    pub fn data(&self) -> &ApplicationData {
        &self.data
    }

    pub fn state(&self) -> ApplicationState {
        self.inner.borrow().state
    }

    /// Open runtimes in id order
    pub fn runtimes(&self) -> Vec<RuntimeId> {
        self.inner.borrow().runtimes.iter().copied().collect()
    }

    pub fn has_runtime(&self, runtime: RuntimeId) -> bool {
        self.inner.borrow().runtimes.contains(&runtime)
    }

    pub fn main_runtime(&self) -> Option<RuntimeId> {
        self.inner.borrow().main_runtime
    }

    /// Render process hosting the runtime opened at launch
    pub fn render_host_id(&self) -> Option<u32> {
        self.inner.borrow().render_host_id
    }

    /// How long the suspend handshake has been running
    pub fn suspend_elapsed(&self, now: Instant) -> Option<Duration> {
        let inner = self.inner.borrow();
        match inner.state {
            ApplicationState::Suspending => inner
                .suspend_started
                .map(|started| now.saturating_duration_since(started)),
            _ => None,
        }
    }

    // =========================================================================
    // Launch
    // =========================================================================

    /// Open the main document, or the entry page when the manifest declares
    /// no main document. Returns false if already launched or nothing could
    /// be opened.
    pub fn launch(&self) -> bool {
        let state = self.state();
        if state != ApplicationState::Created {
            error!(app_id = %self.id(), state = ?state, "Application already launched");
            return false;
        }

        self.inner.borrow_mut().state = ApplicationState::Launching;
        let launched = match self.data.main_document_url() {
            Some(Ok(url)) => self.run_main_document(url),
            Some(Err(e)) => {
                error!(app_id = %self.id(), error = %e, "Invalid main document URL");
                false
            }
            None => self.run_from_local_path(),
        };

        if launched {
            self.inner.borrow_mut().state = ApplicationState::Active;
            info!(app_id = %self.id(), name = %self.data.name(), "Application launched");
        } else {
            self.inner.borrow_mut().state = ApplicationState::Created;
        }
        launched
    }

    fn run_main_document(&self, url: Url) -> bool {
        let runtime = match self.open_runtime(url, RuntimeKind::MainDocument) {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(app_id = %self.id(), error = %e, "Failed to open main document");
                return false;
            }
        };

        self.inner.borrow_mut().main_runtime = Some(runtime);
        self.events.on_main_document_created(self.id(), runtime);
        // Queued until the main document finishes loading
        self.events.send_event(self.id(), Event::named(ON_LAUNCHED));
        true
    }

    fn run_from_local_path(&self) -> bool {
        let Some(url) = self.data.entry_page_url() else {
            error!(app_id = %self.id(), "No entry page found");
            return false;
        };

        match self.open_runtime(url, RuntimeKind::Window(self.data.window_params())) {
            Ok(runtime) => {
                // The entry page gates event delivery but takes no part in
                // the suspend handshake.
                self.events.on_main_document_created(self.id(), runtime);
                true
            }
            Err(e) => {
                error!(app_id = %self.id(), error = %e, "Failed to open entry page");
                false
            }
        }
    }

    fn open_runtime(&self, url: Url, kind: RuntimeKind) -> Result<RuntimeId, AppError> {
        debug!(app_id = %self.id(), url = %url, kind = ?kind, "Opening runtime");
        let runtime = self.engine.create_runtime(RuntimeRequest {
            app_id: self.id().to_string(),
            url,
            kind,
        })?;
        let render_host_id = self.engine.render_host_id(runtime);

        let mut inner = self.inner.borrow_mut();
        inner.runtimes.insert(runtime);
        inner.render_host_id = render_host_id;
        Ok(runtime)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Ask the engine to close every runtime except the main document
    pub fn close(&self) {
        let secondary: Vec<RuntimeId> = {
            let inner = self.inner.borrow();
            inner
                .runtimes
                .iter()
                .copied()
                .filter(|runtime| Some(*runtime) != inner.main_runtime)
                .collect()
        };
        for runtime in secondary {
            self.engine.close_runtime(runtime);
        }
    }

    /// Exit request from hosted content or the host: close secondary runtimes,
    /// or start suspending if only the main document is left.
    pub fn terminate(&self) {
        let (state, has_secondary, has_main) = {
            let inner = self.inner.borrow();
            let secondary = inner
                .runtimes
                .iter()
                .any(|runtime| Some(*runtime) != inner.main_runtime);
            (inner.state, secondary, inner.main_runtime.is_some())
        };

        if state != ApplicationState::Active {
            debug!(app_id = %self.id(), state = ?state, "terminate ignored");
            return;
        }
        info!(app_id = %self.id(), "Terminating application");

        if has_secondary {
            self.close();
        } else if has_main {
            self.begin_suspend();
        }
    }

    /// Close the main document if the suspend handshake has run for at least
    /// `timeout`. Returns true when the main document was closed.
    pub fn expire_suspend(&self, now: Instant, timeout: Duration) -> bool {
        let expired = self.main_runtime().is_some()
            && self
                .suspend_elapsed(now)
                .is_some_and(|elapsed| elapsed >= timeout);
        if expired {
            warn!(app_id = %self.id(), timeout_ms = timeout.as_millis() as u64, "Suspend handshake timed out");
            self.close_main_document();
        }
        expired
    }

    // =========================================================================
    // Engine Notifications
    // =========================================================================

    pub fn on_runtime_added(&self, runtime: RuntimeId) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == ApplicationState::Terminated {
            warn!(app_id = %self.id(), runtime = %runtime, "Runtime added to terminated application");
            return;
        }
        if inner.runtimes.insert(runtime) {
            debug!(app_id = %self.id(), runtime = %runtime, count = inner.runtimes.len(), "Runtime added");
        }
    }

    pub fn on_runtime_removed(&self, runtime: RuntimeId) {
        let after = {
            let mut inner = self.inner.borrow_mut();
            if !inner.runtimes.remove(&runtime) {
                warn!(app_id = %self.id(), runtime = %runtime, "Unknown runtime removed");
                return;
            }
            debug!(app_id = %self.id(), runtime = %runtime, remaining = inner.runtimes.len(), "Runtime removed");

            let mut abandoned = None;
            if inner.main_runtime == Some(runtime) {
                inner.main_runtime = None;
                abandoned = inner.pending_suspend.take();
            }

            if inner.runtimes.is_empty() {
                abandoned = abandoned.or(inner.pending_suspend.take());
                inner.state = ApplicationState::Terminated;
                inner.suspend_started = None;
                AfterRemoval::Terminate(abandoned)
            } else if let Some(pending) = abandoned {
                AfterRemoval::Abandon(pending)
            } else if inner.state == ApplicationState::Active
                && inner.main_runtime.is_some()
                && inner.runtimes.len() == 1
            {
                AfterRemoval::Suspend
            } else {
                AfterRemoval::Nothing
            }
        };

        match after {
            AfterRemoval::Nothing => {}
            AfterRemoval::Abandon(pending) => {
                debug!(app_id = %self.id(), "Main document removed while suspending");
                self.events.detach_token(self.id(), pending.token);
            }
            AfterRemoval::Suspend => self.begin_suspend(),
            AfterRemoval::Terminate(pending) => {
                if let Some(pending) = pending {
                    self.events.detach_token(self.id(), pending.token);
                }
                info!(app_id = %self.id(), "Application terminated");
                let observer = self.observer.borrow().as_ref().and_then(Weak::upgrade);
                if let Some(observer) = observer {
                    observer.on_application_terminated(self);
                }
            }
        }
    }

    /// The render process died. Any pending handshake is abandoned; the
    /// router has already dropped its observers.
    pub fn on_render_process_gone(&self) {
        if self.inner.borrow_mut().pending_suspend.take().is_some() {
            warn!(app_id = %self.id(), "Render process gone during suspend handshake");
        }
    }

    fn begin_suspend(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.state = ApplicationState::Suspending;
            inner.suspend_started = Some(Instant::now());
        }
        info!(app_id = %self.id(), "Suspending application");

        let has_handler = match self.registry.get_events(self.id()) {
            Ok(events) => events.contains(ON_SUSPEND),
            Err(e) => {
                warn!(app_id = %self.id(), error = %e, "Failed to read registered events");
                false
            }
        };
        if !has_handler {
            debug!(app_id = %self.id(), "No onSuspend handler registered");
            self.close_main_document();
            return;
        }

        let observer: Rc<dyn EventObserver> = Rc::new(FinishEventObserver {
            app: self.weak_self.clone(),
        });
        let Some(token) = self
            .events
            .attach_observer(self.id(), ON_JAVASCRIPT_EVENT_ACK, &observer)
        else {
            self.close_main_document();
            return;
        };
        self.inner.borrow_mut().pending_suspend = Some(PendingSuspend {
            _observer: observer,
            token,
        });

        self.events.send_event(self.id(), Event::named(ON_SUSPEND));
    }

    /// Release the finish observer and ask the engine to close the main
    /// document. The application terminates once the engine reports it gone.
    pub(crate) fn close_main_document(&self) {
        let (main, pending) = {
            let mut inner = self.inner.borrow_mut();
            (inner.main_runtime.take(), inner.pending_suspend.take())
        };

        if let Some(pending) = pending {
            self.events.detach_token(self.id(), pending.token);
        }

        match main {
            Some(runtime) => {
                debug!(app_id = %self.id(), runtime = %runtime, "Closing main document");
                self.engine.close_runtime(runtime);
            }
            None => {
                error!(app_id = %self.id(), "close_main_document without a main document");
                debug_assert!(false, "close_main_document without a main document");
            }
        }
    }

    // =========================================================================
    // Permissions
    // =========================================================================

    pub fn register_permissions(&self, extension: &str, table: &str) -> Result<(), AppError> {
        self.permissions.borrow_mut().register(extension, table)
    }

    pub fn registered_permission_name(&self, extension: &str, api: &str) -> Option<String> {
        self.permissions
            .borrow()
            .registered_name(extension, api)
            .map(str::to_string)
    }

    pub fn get_permission(&self, kind: PermissionType, name: &str) -> Option<StoredPermission> {
        self.permissions.borrow().get(kind, name)
    }

    pub fn set_permission(&self, kind: PermissionType, name: &str, perm: StoredPermission) -> bool {
        self.permissions.borrow_mut().set(kind, name, perm)
    }

    pub fn check_api_access(&self, extension: &str, api: &str) -> RuntimePermission {
        self.permissions.borrow().check(extension, api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        engine: Rc<FakeEngine>,
        events: Rc<ApplicationEventManager>,
        registry: Rc<ext_storage::MemoryEventRegistry>,
        terminations: Rc<TerminationCounter>,
        app: Rc<Application>,
    }

    fn fixture(data: ApplicationData) -> Fixture {
        let engine = Rc::new(FakeEngine::default());
        let events = Rc::new(ApplicationEventManager::new());
        let registry = Rc::new(ext_storage::MemoryEventRegistry::new());
        events.on_app_loaded(data.id());

        let host: Rc<dyn RuntimeHost> = engine.clone();
        let store: Rc<dyn EventRegistry> = registry.clone();
        let app = Application::new(data, host, events.clone(), store);

        let terminations = Rc::new(TerminationCounter::default());
        let weak = Rc::downgrade(&terminations);
        app.set_observer(weak);

        Fixture {
            engine,
            events,
            registry,
            terminations,
            app,
        }
    }

    fn with_suspend_handler(f: &Fixture) {
        let events: BTreeSet<String> = [ON_SUSPEND.to_string()].into_iter().collect();
        f.registry.set_events(APP_ID, &events).unwrap();
    }

    fn ack(f: &Fixture, acked: &str) {
        f.events
            .send_event(APP_ID, Event::new(ON_JAVASCRIPT_EVENT_ACK, vec![json!(acked)]));
    }

    #[test]
    fn test_launch_main_document() {
        let f = fixture(main_document_data());
        assert!(f.app.launch());
        assert_eq!(f.app.state(), ApplicationState::Active);

        let created = f.engine.created.borrow();
        assert_eq!(created.len(), 1);
        let (runtime, request) = &created[0];
        assert_eq!(request.kind, RuntimeKind::MainDocument);
        assert_eq!(request.url.as_str(), "app://com.example.demo/main.html");
        assert_eq!(f.app.main_runtime(), Some(*runtime));
        assert_eq!(f.app.runtimes(), vec![*runtime]);
        assert_eq!(f.events.main_document(APP_ID), Some(*runtime));
        assert_eq!(f.app.render_host_id(), Some(100 + runtime.0 as u32));
    }

    #[test]
    fn test_launch_twice_fails() {
        let f = fixture(main_document_data());
        assert!(f.app.launch());
        assert!(!f.app.launch());
        assert_eq!(f.engine.created.borrow().len(), 1);
    }

    #[test]
    fn test_launch_queues_on_launched() {
        let f = fixture(main_document_data());
        let recorder = Rc::new(NameRecorder::default());
        let observer: Rc<dyn EventObserver> = recorder.clone();
        f.events.attach_observer(APP_ID, ON_LAUNCHED, &observer);

        assert!(f.app.launch());
        assert!(recorder.names().is_empty());

        let main = f.app.main_runtime().unwrap();
        f.events.on_document_loaded(APP_ID, main);
        assert_eq!(recorder.names(), vec![ON_LAUNCHED.to_string()]);
    }

    #[test]
    fn test_launch_falls_back_to_entry_page() {
        let f = fixture(local_path_data());
        assert!(f.app.launch());

        let created = f.engine.created.borrow();
        assert_eq!(created.len(), 1);
        assert!(matches!(created[0].1.kind, RuntimeKind::Window(_)));
        assert_eq!(created[0].1.url.as_str(), "app://com.example.demo/ui/index.html");
        assert_eq!(f.app.main_runtime(), None);
        assert_eq!(f.events.main_document(APP_ID), Some(created[0].0));
    }

    #[test]
    fn test_launch_without_entry_point_fails() {
        let dir = tempfile::tempdir().unwrap();
        let data = ApplicationData::from_source(dir.path(), manifest("")).unwrap();
        let f = fixture(data);
        assert!(!f.app.launch());
        assert_eq!(f.app.state(), ApplicationState::Created);
        assert!(f.engine.created.borrow().is_empty());
    }

    #[test]
    fn test_launch_invalid_main_document_fails() {
        let data =
            ApplicationData::from_source("/tmp", manifest("main_document = \"data:text/html,x\"\nlocal_path = \"index.html\""))
                .unwrap();
        let f = fixture(data);
        assert!(!f.app.launch());
        assert!(f.engine.created.borrow().is_empty());
    }

    #[test]
    fn test_launch_engine_refusal_fails() {
        let f = fixture(main_document_data());
        f.engine.fail_create.set(true);
        assert!(!f.app.launch());
        assert!(f.app.runtimes().is_empty());
    }

    #[test]
    fn test_suspend_without_handler_closes_main_document() {
        let f = fixture(main_document_data());
        f.app.launch();
        let main = f.app.main_runtime().unwrap();

        f.app.on_runtime_added(RuntimeId(50));
        f.app.on_runtime_added(RuntimeId(51));
        f.app.on_runtime_removed(RuntimeId(50));
        assert_eq!(f.app.state(), ApplicationState::Active);
        assert!(f.engine.closed.borrow().is_empty());

        f.app.on_runtime_removed(RuntimeId(51));
        assert_eq!(f.app.state(), ApplicationState::Suspending);
        assert_eq!(*f.engine.closed.borrow(), vec![main]);
        assert_eq!(f.app.main_runtime(), None);
        assert_eq!(f.terminations.count(), 0);

        f.app.on_runtime_removed(main);
        assert_eq!(f.app.state(), ApplicationState::Terminated);
        assert_eq!(f.terminations.count(), 1);
    }

    #[test]
    fn test_suspend_handshake() {
        let f = fixture(main_document_data());
        with_suspend_handler(&f);
        f.app.launch();
        let main = f.app.main_runtime().unwrap();
        f.events.on_document_loaded(APP_ID, main);

        let recorder = Rc::new(NameRecorder::default());
        let observer: Rc<dyn EventObserver> = recorder.clone();
        f.events.attach_observer(APP_ID, ON_SUSPEND, &observer);

        f.app.on_runtime_added(RuntimeId(50));
        f.app.on_runtime_removed(RuntimeId(50));
        assert_eq!(f.app.state(), ApplicationState::Suspending);
        assert_eq!(recorder.names(), vec![ON_SUSPEND.to_string()]);
        assert!(f.engine.closed.borrow().is_empty());

        // Acks for other events don't finish the handshake
        ack(&f, ON_LAUNCHED);
        assert!(f.engine.closed.borrow().is_empty());

        ack(&f, ON_SUSPEND);
        assert_eq!(*f.engine.closed.borrow(), vec![main]);

        // Observer is released after the first matching ack
        ack(&f, ON_SUSPEND);
        assert_eq!(f.engine.closed.borrow().len(), 1);
        assert!(!f
            .events
            .router(APP_ID)
            .unwrap()
            .has_observers(ON_JAVASCRIPT_EVENT_ACK));

        f.app.on_runtime_removed(main);
        assert_eq!(f.app.state(), ApplicationState::Terminated);
        assert_eq!(f.terminations.count(), 1);
    }

    #[test]
    fn test_main_document_removed_mid_handshake() {
        let f = fixture(main_document_data());
        with_suspend_handler(&f);
        f.app.launch();
        let main = f.app.main_runtime().unwrap();
        f.events.on_document_loaded(APP_ID, main);

        f.app.on_runtime_added(RuntimeId(50));
        f.app.on_runtime_removed(RuntimeId(50));
        assert_eq!(f.app.state(), ApplicationState::Suspending);

        f.app.on_runtime_added(RuntimeId(60));
        f.app.on_runtime_removed(main);
        assert_eq!(f.app.state(), ApplicationState::Suspending);
        assert_eq!(f.app.main_runtime(), None);
        assert!(!f
            .events
            .router(APP_ID)
            .unwrap()
            .has_observers(ON_JAVASCRIPT_EVENT_ACK));

        // A late ack has nothing left to close
        ack(&f, ON_SUSPEND);
        assert!(f.engine.closed.borrow().is_empty());

        f.app.on_runtime_removed(RuntimeId(60));
        assert_eq!(f.app.state(), ApplicationState::Terminated);
        assert_eq!(f.terminations.count(), 1);
    }

    #[test]
    fn test_debug_shows_id_and_state() {
        let f = fixture(main_document_data());
        let debug = format!("{:?}", f.app);
        assert!(debug.contains(APP_ID));
        assert!(debug.contains("Created"));
    }

    #[test]
    fn test_onsuspend_waits_for_main_document_load() {
        let f = fixture(main_document_data());
        with_suspend_handler(&f);
        f.app.launch();
        let main = f.app.main_runtime().unwrap();

        let recorder = Rc::new(NameRecorder::default());
        let observer: Rc<dyn EventObserver> = recorder.clone();
        f.events.attach_observer(APP_ID, ON_SUSPEND, &observer);
        f.events.attach_observer(APP_ID, ON_LAUNCHED, &observer);

        f.app.terminate();
        assert_eq!(f.app.state(), ApplicationState::Suspending);
        assert!(recorder.names().is_empty());

        f.events.on_document_loaded(APP_ID, main);
        assert_eq!(
            recorder.names(),
            vec![ON_LAUNCHED.to_string(), ON_SUSPEND.to_string()]
        );
    }

    #[test]
    fn test_main_document_crash_terminates() {
        let f = fixture(main_document_data());
        f.app.launch();
        let main = f.app.main_runtime().unwrap();

        f.app.on_runtime_removed(main);
        assert_eq!(f.app.state(), ApplicationState::Terminated);
        assert_eq!(f.terminations.count(), 1);
        assert!(f.engine.closed.borrow().is_empty());

        // Late notifications are ignored
        f.app.on_runtime_removed(main);
        f.app.on_runtime_added(RuntimeId(9));
        assert_eq!(f.terminations.count(), 1);
        assert!(f.app.runtimes().is_empty());
    }

    #[test]
    fn test_secondary_runtimes_survive_main_crash() {
        let f = fixture(main_document_data());
        f.app.launch();
        let main = f.app.main_runtime().unwrap();
        f.app.on_runtime_added(RuntimeId(50));

        f.app.on_runtime_removed(main);
        assert_eq!(f.app.state(), ApplicationState::Active);
        assert_eq!(f.app.main_runtime(), None);

        f.app.on_runtime_removed(RuntimeId(50));
        assert_eq!(f.app.state(), ApplicationState::Terminated);
        assert_eq!(f.terminations.count(), 1);
    }

    #[test]
    fn test_unknown_runtime_removal_ignored() {
        let f = fixture(main_document_data());
        f.app.launch();
        f.app.on_runtime_removed(RuntimeId(999));
        assert_eq!(f.app.state(), ApplicationState::Active);
        assert_eq!(f.app.runtimes().len(), 1);
    }

    #[test]
    fn test_runtime_added_is_idempotent() {
        let f = fixture(main_document_data());
        f.app.launch();
        let main = f.app.main_runtime().unwrap();
        f.app.on_runtime_added(main);
        assert_eq!(f.app.runtimes(), vec![main]);
    }

    #[test]
    fn test_terminate_closes_secondary_runtimes() {
        let f = fixture(main_document_data());
        f.app.launch();
        f.app.on_runtime_added(RuntimeId(50));
        f.app.on_runtime_added(RuntimeId(51));

        f.app.terminate();
        assert_eq!(
            *f.engine.closed.borrow(),
            vec![RuntimeId(50), RuntimeId(51)]
        );
        assert_eq!(f.app.state(), ApplicationState::Active);
    }

    #[test]
    fn test_terminate_entry_page_application() {
        let f = fixture(local_path_data());
        f.app.launch();
        let entry = f.app.runtimes()[0];

        f.app.terminate();
        assert_eq!(*f.engine.closed.borrow(), vec![entry]);

        f.app.on_runtime_removed(entry);
        assert_eq!(f.app.state(), ApplicationState::Terminated);
        assert_eq!(f.terminations.count(), 1);
    }

    #[test]
    fn test_terminate_before_launch_is_ignored() {
        let f = fixture(main_document_data());
        f.app.terminate();
        assert_eq!(f.app.state(), ApplicationState::Created);
    }

    #[test]
    fn test_expire_suspend() {
        let f = fixture(main_document_data());
        with_suspend_handler(&f);
        f.app.launch();
        let main = f.app.main_runtime().unwrap();
        let timeout = Duration::from_secs(5);

        assert!(!f.app.expire_suspend(Instant::now(), timeout));

        f.app.terminate();
        assert_eq!(f.app.state(), ApplicationState::Suspending);
        assert!(!f.app.expire_suspend(Instant::now(), timeout));
        assert!(f.engine.closed.borrow().is_empty());

        let later = Instant::now() + timeout;
        assert!(f.app.expire_suspend(later, timeout));
        assert_eq!(*f.engine.closed.borrow(), vec![main]);

        // Already closing
        assert!(!f.app.expire_suspend(later, timeout));
    }

    #[test]
    fn test_render_process_gone_abandons_handshake() {
        let f = fixture(main_document_data());
        with_suspend_handler(&f);
        f.app.launch();
        let main = f.app.main_runtime().unwrap();
        f.events.on_document_loaded(APP_ID, main);

        f.app.terminate();
        f.events.on_render_process_gone(APP_ID);
        f.app.on_render_process_gone();

        ack(&f, ON_SUSPEND);
        assert!(f.engine.closed.borrow().is_empty());
        assert_eq!(f.app.state(), ApplicationState::Suspending);

        f.app.on_runtime_removed(main);
        assert_eq!(f.app.state(), ApplicationState::Terminated);
    }

    #[test]
    fn test_permissions() {
        let data = ApplicationData::from_source(
            "/tmp",
            format!("{}\n[permissions]\necho = \"deny\"\n", manifest("main_document = \"main.html\"")),
        )
        .unwrap();
        let f = fixture(data);
        f.app
            .register_permissions("ext.echo", r#"[{"permission_name":"echo","apis":["ping"]}]"#)
            .unwrap();

        assert_eq!(
            f.app.registered_permission_name("ext.echo", "ping").as_deref(),
            Some("echo")
        );
        assert_eq!(f.app.check_api_access("ext.echo", "ping"), RuntimePermission::DenyAlways);

        assert!(f.app.set_permission(PermissionType::Session, "echo", StoredPermission::Allow));
        assert_eq!(
            f.app.get_permission(PermissionType::Session, "echo"),
            Some(StoredPermission::Allow)
        );
        assert_eq!(f.app.check_api_access("ext.echo", "ping"), RuntimePermission::AllowSession);
    }
}
