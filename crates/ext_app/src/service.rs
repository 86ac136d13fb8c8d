//! ApplicationService - installs, launches and tracks running applications
//!
//! The service owns every running [`Application`], routes engine
//! notifications to the application they belong to, and keeps the event
//! manager's per-application routers in step with application lifetimes.

use crate::application::{Application, ApplicationObserver};
use crate::engine::{EngineEvent, RuntimeHost};
use crate::manifest::ApplicationData;
use crate::permissions::RuntimePermission;
use crate::AppError;
use chrono::Utc;
use ext_events::{ApplicationEventManager, EventBridge, RuntimeId};
use ext_storage::{ApplicationStorage, EventRegistry, InstalledApplication};
use serde::Deserialize;
use std::cell::RefCell;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// `[lifecycle]` settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Close the main document if `onSuspend` isn't acknowledged within this
    /// many seconds. Unset means wait forever.
    pub suspend_timeout_secs: Option<u64>,
}

impl LifecycleConfig {
    pub fn suspend_timeout(&self) -> Option<Duration> {
        self.suspend_timeout_secs.map(Duration::from_secs)
    }
}

/// Observer of service-level events. All methods default to no-ops.
pub trait ApplicationServiceObserver {
    fn did_install_application(&self, _app_id: &str) {}

    fn did_uninstall_application(&self, _app_id: &str) {}

    fn did_launch_application(&self, _app: &Application) {}

    /// Called once per application, right before the service drops it
    fn will_destroy_application(&self, _app: &Application) {}
}

pub struct ApplicationService {
    storage: Rc<ApplicationStorage>,
    events: Rc<ApplicationEventManager>,
    engine: Rc<dyn RuntimeHost>,
    bridge: Option<Rc<EventBridge>>,
    config: LifecycleConfig,
    applications: RefCell<Vec<Rc<Application>>>,
    observers: RefCell<Vec<Weak<dyn ApplicationServiceObserver>>>,
    weak_self: Weak<ApplicationService>,
}

impl ApplicationService {
    pub fn new(
        storage: Rc<ApplicationStorage>,
        events: Rc<ApplicationEventManager>,
        engine: Rc<dyn RuntimeHost>,
        bridge: Option<Rc<EventBridge>>,
        config: LifecycleConfig,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            storage,
            events,
            engine,
            bridge,
            config,
            applications: RefCell::new(Vec::new()),
            observers: RefCell::new(Vec::new()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn events(&self) -> &Rc<ApplicationEventManager> {
        &self.events
    }

    pub fn add_observer(&self, observer: &Rc<dyn ApplicationServiceObserver>) {
        self.observers.borrow_mut().push(Rc::downgrade(observer));
    }

    pub fn remove_observer(&self, observer: &Rc<dyn ApplicationServiceObserver>) {
        let target = Rc::downgrade(observer);
        self.observers
            .borrow_mut()
            .retain(|weak| weak.strong_count() > 0 && !Weak::ptr_eq(weak, &target));
    }

    fn notify(&self, f: impl Fn(&dyn ApplicationServiceObserver)) {
        let observers: Vec<Rc<dyn ApplicationServiceObserver>> = self
            .observers
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            f(observer.as_ref());
        }
    }

    // =========================================================================
    // Installation
    // =========================================================================

    /// Validate the package at `path` and record it. Returns the app id.
    pub fn install(&self, path: &Path) -> Result<String, AppError> {
        let data = ApplicationData::from_dir(path)?;
        let app_id = data.id().to_string();

        if self.storage.contains(&app_id)? {
            return Err(AppError::already_installed(app_id));
        }

        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.storage.add_application(&InstalledApplication {
            id: app_id.clone(),
            path,
            manifest: data.manifest_source().to_string(),
            installed_at: Utc::now(),
        })?;

        info!(app_id = %app_id, name = %data.name(), version = %data.version(), "Application installed");
        self.notify(|o| o.did_install_application(&app_id));
        Ok(app_id)
    }

    /// Forget an installed application. Refused while it is running.
    pub fn uninstall(&self, app_id: &str) -> Result<(), AppError> {
        if self.get_application_by_id(app_id).is_some() {
            return Err(AppError::already_running(format!(
                "{} must be closed before uninstalling",
                app_id
            )));
        }
        if !self.storage.contains(app_id)? {
            return Err(AppError::not_installed(app_id));
        }

        self.storage.remove_application(app_id)?;
        info!(app_id = %app_id, "Application uninstalled");
        self.notify(|o| o.did_uninstall_application(app_id));
        Ok(())
    }

    pub fn installed_applications(&self) -> Result<Vec<InstalledApplication>, AppError> {
        Ok(self.storage.list_applications()?)
    }

    // =========================================================================
    // Launch
    // =========================================================================

    /// Launch an installed application
    pub fn launch(&self, app_id: &str) -> Result<Rc<Application>, AppError> {
        if self.get_application_by_id(app_id).is_some() {
            return Err(AppError::already_running(app_id));
        }
        let record = self
            .storage
            .get_application(app_id)?
            .ok_or_else(|| AppError::not_installed(app_id))?;
        self.launch_data(ApplicationData::from_installed(&record)?)
    }

    /// Launch the package at `path` without installing it
    pub fn launch_from_path(&self, path: &Path) -> Result<Rc<Application>, AppError> {
        self.launch_data(ApplicationData::from_dir(path)?)
    }

    pub fn launch_data(&self, data: ApplicationData) -> Result<Rc<Application>, AppError> {
        let app_id = data.id().to_string();
        if self.get_application_by_id(&app_id).is_some() {
            return Err(AppError::already_running(app_id));
        }

        let registry: Rc<dyn EventRegistry> = self.storage.clone();
        let app = Application::new(data, self.engine.clone(), self.events.clone(), registry);
        let observer: Weak<dyn ApplicationObserver> = self.weak_self.clone();
        app.set_observer(observer);

        self.events.on_app_loaded(&app_id);
        self.applications.borrow_mut().push(app.clone());

        if !app.launch() {
            self.applications
                .borrow_mut()
                .retain(|running| !Rc::ptr_eq(running, &app));
            self.events.on_app_unloaded(&app_id);
            return Err(AppError::launch_failed(app_id));
        }

        self.notify(|o| o.did_launch_application(&app));
        Ok(app)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn get_application_by_id(&self, app_id: &str) -> Option<Rc<Application>> {
        self.applications
            .borrow()
            .iter()
            .find(|app| app.id() == app_id)
            .cloned()
    }

    pub fn get_application_by_runtime(&self, runtime: RuntimeId) -> Option<Rc<Application>> {
        self.applications
            .borrow()
            .iter()
            .find(|app| app.has_runtime(runtime))
            .cloned()
    }

    pub fn get_application_by_render_host_id(&self, render_host_id: u32) -> Option<Rc<Application>> {
        self.applications
            .borrow()
            .iter()
            .find(|app| app.render_host_id() == Some(render_host_id))
            .cloned()
    }

    /// Running applications in launch order
    pub fn active_applications(&self) -> Vec<Rc<Application>> {
        self.applications.borrow().clone()
    }

    /// Most recently launched running application
    pub fn active_application(&self) -> Option<Rc<Application>> {
        self.applications.borrow().last().cloned()
    }

    pub fn is_running(&self, app_id: &str) -> bool {
        self.get_application_by_id(app_id).is_some()
    }

    pub fn running_count(&self) -> usize {
        self.applications.borrow().len()
    }

    // =========================================================================
    // Engine Notifications
    // =========================================================================

    pub fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::RuntimeAdded { app_id, runtime } => {
                match self.get_application_by_id(&app_id) {
                    Some(app) => app.on_runtime_added(runtime),
                    None => warn!(app_id = %app_id, runtime = %runtime, "Runtime added for unknown application"),
                }
            }
            EngineEvent::RuntimeRemoved { runtime } => {
                let Some(app) = self.get_application_by_runtime(runtime) else {
                    debug!(runtime = %runtime, "Runtime removed for no running application");
                    return;
                };
                if let Some(bridge) = &self.bridge {
                    bridge.on_runtime_closed(app.id(), runtime);
                }
                app.on_runtime_removed(runtime);
            }
            EngineEvent::DocumentLoaded { runtime } => {
                if let Some(app) = self.get_application_by_runtime(runtime) {
                    self.events.on_document_loaded(app.id(), runtime);
                }
            }
            EngineEvent::RenderProcessGone { render_host_id } => {
                match self.get_application_by_render_host_id(render_host_id) {
                    Some(app) => {
                        warn!(app_id = %app.id(), render_host_id, "Render process gone");
                        self.events.on_render_process_gone(app.id());
                        app.on_render_process_gone();
                    }
                    None => debug!(render_host_id, "Render process gone for no running application"),
                }
            }
            EngineEvent::ExitRequested { runtime } => match self.get_application_by_runtime(runtime) {
                Some(app) => app.terminate(),
                None => warn!(runtime = %runtime, "Exit requested by unknown runtime"),
            },
            EngineEvent::BridgeMessage { runtime, payload } => {
                let Some(app) = self.get_application_by_runtime(runtime) else {
                    warn!(runtime = %runtime, "Bridge message from unknown runtime");
                    return;
                };
                let Some(bridge) = &self.bridge else {
                    warn!(app_id = %app.id(), "Bridge message without an event bridge");
                    return;
                };
                if let Err(e) = bridge.handle_json(app.id(), runtime, payload) {
                    warn!(app_id = %app.id(), runtime = %runtime, error = %e, "Rejected bridge message");
                }
            }
        }
    }

    /// Ask every running application to exit
    pub fn terminate_all(&self) {
        for app in self.active_applications() {
            app.terminate();
        }
    }

    /// Close main documents whose suspend handshake outlived the configured
    /// timeout. Returns how many were closed.
    pub fn expire_stalled_suspends(&self, now: Instant) -> usize {
        let Some(timeout) = self.config.suspend_timeout() else {
            return 0;
        };
        self.active_applications()
            .iter()
            .filter(|app| app.expire_suspend(now, timeout))
            .count()
    }

    // =========================================================================
    // Permissions
    // =========================================================================

    pub fn register_permissions(
        &self,
        app_id: &str,
        extension: &str,
        table: &str,
    ) -> Result<(), AppError> {
        let app = self
            .get_application_by_id(app_id)
            .ok_or_else(|| AppError::not_running(app_id))?;
        app.register_permissions(extension, table)
    }

    pub fn check_api_access(&self, app_id: &str, extension: &str, api: &str) -> RuntimePermission {
        let Some(app) = self.get_application_by_id(app_id) else {
            error!(app_id = %app_id, "No running application for access check");
            return RuntimePermission::Undefined;
        };
        let permission = app.check_api_access(extension, api);
        debug!(app_id = %app_id, extension = %extension, api = %api, ?permission, "API access check");
        permission
    }
}

impl ApplicationObserver for ApplicationService {
    fn on_application_terminated(&self, app: &Application) {
        let removed = {
            let mut applications = self.applications.borrow_mut();
            applications
                .iter()
                .position(|running| std::ptr::eq(running.as_ref(), app))
                .map(|pos| applications.remove(pos))
        };
        let Some(removed) = removed else {
            warn!(app_id = %app.id(), "Terminated application was not running");
            return;
        };

        self.notify(|o| o.will_destroy_application(&removed));
        if let Some(bridge) = &self.bridge {
            bridge.on_app_unloaded(removed.id());
        }
        self.events.on_app_unloaded(removed.id());
        info!(app_id = %removed.id(), remaining = self.running_count(), "Application closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ApplicationState;
    use crate::manifest::MANIFEST_FILE;
    use crate::test_support::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct ServiceLog {
        entries: RefCell<Vec<String>>,
    }

    impl ServiceLog {
        fn entries(&self) -> Vec<String> {
            self.entries.borrow().clone()
        }
    }

    impl ApplicationServiceObserver for ServiceLog {
        fn did_install_application(&self, app_id: &str) {
            self.entries.borrow_mut().push(format!("install {}", app_id));
        }

        fn did_uninstall_application(&self, app_id: &str) {
            self.entries.borrow_mut().push(format!("uninstall {}", app_id));
        }

        fn did_launch_application(&self, app: &Application) {
            self.entries.borrow_mut().push(format!("launch {}", app.id()));
        }

        fn will_destroy_application(&self, app: &Application) {
            self.entries.borrow_mut().push(format!("destroy {}", app.id()));
        }
    }

    struct Fixture {
        engine: Rc<FakeEngine>,
        log: Rc<ServiceLog>,
        service: Rc<ApplicationService>,
        _log_handle: Rc<dyn ApplicationServiceObserver>,
    }

    fn fixture(config: LifecycleConfig) -> Fixture {
        let engine = Rc::new(FakeEngine::default());
        let storage = Rc::new(ApplicationStorage::open_in_memory().unwrap());
        let events = Rc::new(ApplicationEventManager::new());
        let host: Rc<dyn RuntimeHost> = engine.clone();
        let service = ApplicationService::new(storage, events, host, None, config);

        let log = Rc::new(ServiceLog::default());
        let handle: Rc<dyn ApplicationServiceObserver> = log.clone();
        service.add_observer(&handle);

        Fixture {
            engine,
            log,
            service,
            _log_handle: handle,
        }
    }

    fn package(extra_app_lines: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), manifest(extra_app_lines)).unwrap();
        dir
    }

    #[test]
    fn test_install_and_list() {
        let f = fixture(LifecycleConfig::default());
        let dir = package("main_document = \"main.html\"");

        let app_id = f.service.install(dir.path()).unwrap();
        assert_eq!(app_id, APP_ID);

        let installed = f.service.installed_applications().unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].id, APP_ID);
        assert_eq!(f.log.entries(), vec![format!("install {}", APP_ID)]);
    }

    #[test]
    fn test_install_twice_fails() {
        let f = fixture(LifecycleConfig::default());
        let dir = package("");
        f.service.install(dir.path()).unwrap();
        let err = f.service.install(dir.path()).unwrap_err();
        assert_eq!(err.code(), crate::AppErrorCode::AlreadyInstalled);
    }

    #[test]
    fn test_install_invalid_package() {
        let f = fixture(LifecycleConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let err = f.service.install(dir.path()).unwrap_err();
        assert_eq!(err.code(), crate::AppErrorCode::ManifestNotFound);
        assert!(f.log.entries().is_empty());
    }

    #[test]
    fn test_launch_installed() {
        let f = fixture(LifecycleConfig::default());
        let dir = package("main_document = \"main.html\"");
        f.service.install(dir.path()).unwrap();

        let app = f.service.launch(APP_ID).unwrap();
        assert_eq!(app.state(), ApplicationState::Active);
        assert!(f.service.is_running(APP_ID));
        assert!(f.service.events().is_app_loaded(APP_ID));
        assert_eq!(f.service.running_count(), 1);
        assert!(Rc::ptr_eq(&f.service.active_application().unwrap(), &app));

        let err = f.service.launch(APP_ID).unwrap_err();
        assert_eq!(err.code(), crate::AppErrorCode::AlreadyRunning);
        assert_eq!(f.engine.created.borrow().len(), 1);
    }

    #[test]
    fn test_launch_not_installed() {
        let f = fixture(LifecycleConfig::default());
        let err = f.service.launch("com.missing").unwrap_err();
        assert_eq!(err.code(), crate::AppErrorCode::NotInstalled);
    }

    #[test]
    fn test_failed_launch_is_discarded() {
        let f = fixture(LifecycleConfig::default());
        let dir = package("");
        let err = f.service.launch_from_path(dir.path()).unwrap_err();
        assert_eq!(err.code(), crate::AppErrorCode::LaunchFailed);
        assert!(!f.service.is_running(APP_ID));
        assert!(!f.service.events().is_app_loaded(APP_ID));
        assert!(f.log.entries().is_empty());
    }

    #[test]
    fn test_lookups() {
        let f = fixture(LifecycleConfig::default());
        let app = f.service.launch_data(main_document_data()).unwrap();
        let main = app.main_runtime().unwrap();

        f.service.handle_engine_event(EngineEvent::RuntimeAdded {
            app_id: APP_ID.to_string(),
            runtime: RuntimeId(40),
        });

        let by_runtime = f.service.get_application_by_runtime(RuntimeId(40)).unwrap();
        assert!(Rc::ptr_eq(&by_runtime, &app));
        let by_host = f
            .service
            .get_application_by_render_host_id(100 + main.0 as u32)
            .unwrap();
        assert!(Rc::ptr_eq(&by_host, &app));
        assert!(f.service.get_application_by_runtime(RuntimeId(41)).is_none());
        assert!(f.service.get_application_by_id("com.other").is_none());
    }

    #[test]
    fn test_engine_events_drive_termination() {
        let f = fixture(LifecycleConfig::default());
        let app = f.service.launch_data(main_document_data()).unwrap();
        let main = app.main_runtime().unwrap();

        f.service.handle_engine_event(EngineEvent::RuntimeAdded {
            app_id: APP_ID.to_string(),
            runtime: RuntimeId(40),
        });
        f.service
            .handle_engine_event(EngineEvent::DocumentLoaded { runtime: main });
        assert!(f.service.events().router(APP_ID).unwrap().is_loaded());

        f.service
            .handle_engine_event(EngineEvent::RuntimeRemoved { runtime: RuntimeId(40) });
        assert_eq!(app.state(), ApplicationState::Suspending);
        assert_eq!(*f.engine.closed.borrow(), vec![main]);

        f.service
            .handle_engine_event(EngineEvent::RuntimeRemoved { runtime: main });
        assert_eq!(app.state(), ApplicationState::Terminated);
        assert!(!f.service.is_running(APP_ID));
        assert!(!f.service.events().is_app_loaded(APP_ID));
        assert_eq!(
            f.log.entries(),
            vec![format!("launch {}", APP_ID), format!("destroy {}", APP_ID)]
        );

        // The same app can be launched again
        f.service.launch_data(main_document_data()).unwrap();
        assert!(f.service.is_running(APP_ID));
    }

    #[test]
    fn test_uninstall() {
        let f = fixture(LifecycleConfig::default());
        let dir = package("main_document = \"main.html\"");
        f.service.install(dir.path()).unwrap();
        let app = f.service.launch(APP_ID).unwrap();

        let err = f.service.uninstall(APP_ID).unwrap_err();
        assert_eq!(err.code(), crate::AppErrorCode::AlreadyRunning);

        let main = app.main_runtime().unwrap();
        f.service
            .handle_engine_event(EngineEvent::RuntimeRemoved { runtime: main });
        f.service.uninstall(APP_ID).unwrap();
        assert!(f.service.installed_applications().unwrap().is_empty());

        let err = f.service.uninstall(APP_ID).unwrap_err();
        assert_eq!(err.code(), crate::AppErrorCode::NotInstalled);
        assert!(f
            .log
            .entries()
            .contains(&format!("uninstall {}", APP_ID)));
    }

    #[test]
    fn test_exit_request_terminates() {
        let f = fixture(LifecycleConfig::default());
        let app = f.service.launch_data(local_path_data()).unwrap();
        let entry = app.runtimes()[0];

        f.service
            .handle_engine_event(EngineEvent::ExitRequested { runtime: entry });
        assert_eq!(*f.engine.closed.borrow(), vec![entry]);
    }

    #[test]
    fn test_terminate_all() {
        let f = fixture(LifecycleConfig::default());
        let app = f.service.launch_data(main_document_data()).unwrap();
        f.service.terminate_all();
        assert_eq!(app.state(), ApplicationState::Suspending);
        assert_eq!(f.engine.closed.borrow().len(), 1);
    }

    #[test]
    fn test_expire_stalled_suspends() {
        let disabled = fixture(LifecycleConfig::default());
        assert_eq!(disabled.service.expire_stalled_suspends(Instant::now()), 0);

        let f = fixture(LifecycleConfig {
            suspend_timeout_secs: Some(2),
        });
        let app = f.service.launch_data(main_document_data()).unwrap();
        let events: std::collections::BTreeSet<String> =
            [ext_events::ON_SUSPEND.to_string()].into_iter().collect();
        f.service.storage.set_events(APP_ID, &events).unwrap();

        app.terminate();
        assert_eq!(app.state(), ApplicationState::Suspending);
        assert!(f.engine.closed.borrow().is_empty());

        assert_eq!(f.service.expire_stalled_suspends(Instant::now()), 0);
        let later = Instant::now() + Duration::from_secs(3);
        assert_eq!(f.service.expire_stalled_suspends(later), 1);
        assert_eq!(f.engine.closed.borrow().len(), 1);
    }

    #[test]
    fn test_render_process_gone() {
        let f = fixture(LifecycleConfig::default());
        let app = f.service.launch_data(main_document_data()).unwrap();
        let main = app.main_runtime().unwrap();
        f.service
            .handle_engine_event(EngineEvent::DocumentLoaded { runtime: main });

        f.service.handle_engine_event(EngineEvent::RenderProcessGone {
            render_host_id: app.render_host_id().unwrap(),
        });
        let router = f.service.events().router(APP_ID).unwrap();
        assert!(!router.is_loaded());
        assert!(f.service.is_running(APP_ID));
    }

    #[test]
    fn test_permissions() {
        let f = fixture(LifecycleConfig::default());
        assert_eq!(
            f.service.check_api_access(APP_ID, "ext", "api"),
            RuntimePermission::Undefined
        );
        let err = f
            .service
            .register_permissions(APP_ID, "ext", "[]")
            .unwrap_err();
        assert_eq!(err.code(), crate::AppErrorCode::NotRunning);

        let data = ApplicationData::from_source(
            "/tmp/demo",
            format!(
                "{}\n[permissions]\nnet = \"allow\"\n",
                manifest("main_document = \"main.html\"")
            ),
        )
        .unwrap();
        f.service.launch_data(data).unwrap();
        f.service
            .register_permissions(APP_ID, "ext", r#"[{"permission_name":"net","apis":["fetch"]}]"#)
            .unwrap();
        assert_eq!(
            f.service.check_api_access(APP_ID, "ext", "fetch"),
            RuntimePermission::AllowAlways
        );
        assert_eq!(
            f.service.check_api_access(APP_ID, "ext", "other"),
            RuntimePermission::Undefined
        );
    }

    #[test]
    fn test_removed_observer_not_notified() {
        let f = fixture(LifecycleConfig::default());
        f.service.remove_observer(&f._log_handle);
        f.service.launch_data(main_document_data()).unwrap();
        assert!(f.log.entries().is_empty());
    }
}
