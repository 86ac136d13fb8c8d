//! Fakes shared by the unit tests

use crate::application::{Application, ApplicationObserver};
use crate::engine::{RuntimeHost, RuntimeRequest};
use crate::manifest::ApplicationData;
use crate::AppError;
use ext_events::{Event, EventObserver, RuntimeId};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

pub const APP_ID: &str = "com.example.demo";

/// Manifest for [`APP_ID`] with extra lines appended to the `[app]` table
pub fn manifest(extra_app_lines: &str) -> String {
    format!(
        "[app]\nname = \"Demo\"\nidentifier = \"{}\"\nversion = \"1.0.0\"\n{}\n",
        APP_ID, extra_app_lines
    )
}

pub fn main_document_data() -> ApplicationData {
    ApplicationData::from_source("/tmp/demo", manifest("main_document = \"main.html\"")).unwrap()
}

pub fn local_path_data() -> ApplicationData {
    ApplicationData::from_source("/tmp/demo", manifest("local_path = \"ui/index.html\"")).unwrap()
}

/// Engine recording every request; runtime ids start at 1
#[derive(Default)]
pub struct FakeEngine {
    next_id: Cell<u64>,
    pub created: RefCell<Vec<(RuntimeId, RuntimeRequest)>>,
    pub closed: RefCell<Vec<RuntimeId>>,
    pub fail_create: Cell<bool>,
}

impl RuntimeHost for FakeEngine {
    fn create_runtime(&self, request: RuntimeRequest) -> Result<RuntimeId, AppError> {
        if self.fail_create.get() {
            return Err(AppError::engine("refused"));
        }
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        let runtime = RuntimeId(id);
        self.created.borrow_mut().push((runtime, request));
        Ok(runtime)
    }

    fn close_runtime(&self, runtime: RuntimeId) {
        self.closed.borrow_mut().push(runtime);
    }

    fn render_host_id(&self, runtime: RuntimeId) -> Option<u32> {
        Some(100 + runtime.0 as u32)
    }
}

#[derive(Default)]
pub struct TerminationCounter {
    terminated: RefCell<Vec<String>>,
}

impl TerminationCounter {
    pub fn count(&self) -> usize {
        self.terminated.borrow().len()
    }
}

impl ApplicationObserver for TerminationCounter {
    fn on_application_terminated(&self, app: &Application) {
        self.terminated.borrow_mut().push(app.id().to_string());
    }
}

#[derive(Default)]
pub struct NameRecorder {
    names: RefCell<Vec<String>>,
}

impl NameRecorder {
    pub fn names(&self) -> Vec<String> {
        self.names.borrow().clone()
    }
}

impl EventObserver for NameRecorder {
    fn observe(&self, _app_id: &str, event: &Arc<Event>) {
        self.names.borrow_mut().push(event.name().to_string());
    }
}
