//! Wiring of storage, event routing, engine and service, plus the
//! coordination loop that drives them.

use crate::config::HostConfig;
use crate::engine::HeadlessEngine;
use ext_app::{ApplicationService, EngineEvent, RuntimeHost};
use ext_events::{ApplicationEventManager, EventBridge, ToRendererCmd};
use ext_storage::{ApplicationStorage, EventRegistry};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// How often stalled suspend handshakes are checked
const SUSPEND_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the host-to-renderer channel
const RENDERER_CHANNEL_CAPACITY: usize = 256;

pub struct Host {
    service: Rc<ApplicationService>,
    engine: Rc<HeadlessEngine>,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    renderer_rx: mpsc::Receiver<ToRendererCmd>,
}

impl Host {
    pub fn new(storage: Rc<ApplicationStorage>, config: &HostConfig) -> Self {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (renderer_tx, renderer_rx) = mpsc::channel(RENDERER_CHANNEL_CAPACITY);

        let engine = Rc::new(HeadlessEngine::new(engine_tx));
        let events = Rc::new(ApplicationEventManager::new());
        let registry: Rc<dyn EventRegistry> = storage.clone();
        let bridge = Rc::new(EventBridge::new(events.clone(), registry, renderer_tx));

        let runtime_host: Rc<dyn RuntimeHost> = engine.clone();
        let service = ApplicationService::new(
            storage,
            events,
            runtime_host,
            Some(bridge),
            config.lifecycle.clone(),
        );

        Self {
            service,
            engine,
            engine_rx,
            renderer_rx,
        }
    }

    pub fn service(&self) -> &Rc<ApplicationService> {
        &self.service
    }

    /// Handle every engine event queued so far
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.engine_rx.try_recv() {
            self.service.handle_engine_event(event);
            handled += 1;
        }
        handled
    }

    /// Drive running applications until none is left. Ctrl-C asks every
    /// application to exit.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(SUSPEND_CHECK_INTERVAL);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;

        while self.service.running_count() > 0 {
            tokio::select! {
                Some(event) = self.engine_rx.recv() => {
                    self.service.handle_engine_event(event);
                }
                Some(cmd) = self.renderer_rx.recv() => {
                    self.engine.deliver(cmd);
                }
                _ = ticker.tick() => {
                    let expired = self.service.expire_stalled_suspends(Instant::now());
                    if expired > 0 {
                        debug!(expired, "Closed stalled main documents");
                    }
                }
                result = &mut ctrl_c, if !interrupted => {
                    result?;
                    interrupted = true;
                    info!(running = self.service.running_count(), "Interrupted, terminating applications");
                    self.service.terminate_all();
                }
            }
        }

        info!(open_runtimes = self.engine.runtime_count(), "No application running");
        Ok(())
    }
}
