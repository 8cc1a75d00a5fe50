//! Test data builders for sessions and handlers

use std::sync::{Arc, Mutex};
use taskrun_rs::config::SessionConfig;
use taskrun_rs::device::{MockDeviceBackend, MockDeviceHandle};
use taskrun_rs::handler::{HandlerContext, HandlerFactory, HandlerPlugin, NoopHandlerFactory};
use taskrun_rs::sink::MemorySink;
use taskrun_rs::types::Batch;
use taskrun_rs::{DeviceIdentity, SessionController, TaskDefinition};

/// Hook names in call order, shared between a handler and its test
pub type HookLog = Arc<Mutex<Vec<String>>>;

/// Closure run from `on_data`
pub type DataAction =
    Box<dyn FnMut(&Batch, &mut HandlerContext<'_>) -> anyhow::Result<()> + Send>;

/// Identity with two states, a print-only task and variables `A` and `B`
pub fn two_variable_identity() -> DeviceIdentity {
    DeviceIdentity::new("two_vars")
        .with_state(1, "LED_on")
        .with_state(2, "LED_off")
        .with_event(3, "poke")
        .with_analog(7, "temp")
        .with_variable("A", "0")
        .with_variable("B", "False")
}

pub fn two_variable_task() -> TaskDefinition {
    TaskDefinition::new("two_vars", "states = ['LED_on', 'LED_off']\nv.A = 0\nv.B = False\n")
}

/// Handler that records every hook call and optionally runs an action on data
pub struct RecordingHandler {
    log: HookLog,
    on_data: Option<DataAction>,
}

impl RecordingHandler {
    pub fn new(log: HookLog) -> Self {
        Self { log, on_data: None }
    }

    pub fn with_data_action(mut self, action: DataAction) -> Self {
        self.on_data = Some(action);
        self
    }

    fn record(&self, hook: impl Into<String>) {
        if let Ok(mut log) = self.log.lock() {
            log.push(hook.into());
        }
    }
}

impl HandlerPlugin for RecordingHandler {
    fn on_load(&mut self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        self.record("on_load");
        Ok(())
    }

    fn on_run_start(&mut self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        self.record("on_run_start");
        Ok(())
    }

    fn on_run_stop(&mut self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        self.record("on_run_stop");
        Ok(())
    }

    fn on_data(&mut self, batch: &Batch, ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        self.record(format!("on_data({})", batch.len()));
        match self.on_data.as_mut() {
            Some(action) => action(batch, ctx),
            None => Ok(()),
        }
    }

    fn on_tick(&mut self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        self.record("on_tick");
        Ok(())
    }

    fn on_peer_message(
        &mut self,
        from: &str,
        message: &str,
        _ctx: &mut HandlerContext<'_>,
    ) -> anyhow::Result<()> {
        self.record(format!("on_peer_message({}, {})", from, message));
        Ok(())
    }
}

/// A controller wired to a simulated board and an in-memory log
pub struct TestSession {
    pub controller: SessionController,
    pub device: MockDeviceHandle,
    pub sink: Arc<MemorySink>,
}

/// Builder for [`TestSession`]s
pub struct SessionBuilder {
    device: MockDeviceBackend,
    factory: Arc<dyn HandlerFactory>,
    config: SessionConfig,
}

impl SessionBuilder {
    /// A blinker board with no-op handlers and no stop delay
    pub fn new() -> Self {
        Self {
            device: MockDeviceBackend::blinker(),
            factory: Arc::new(NoopHandlerFactory),
            config: SessionConfig {
                stop_drain_delay_ms: 0,
                tick_interval_ms: 1,
                refresh_interval_ms: 20,
                ..Default::default()
            },
        }
    }

    pub fn device(mut self, device: MockDeviceBackend) -> Self {
        self.device = device;
        self
    }

    pub fn task(mut self, identity: DeviceIdentity) -> Self {
        self.device = self.device.with_task(identity);
        self
    }

    pub fn factory(mut self, factory: Arc<dyn HandlerFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Every upload gets a fresh [`RecordingHandler`] writing to `log`
    pub fn recording(self, log: HookLog) -> Self {
        let factory = move |_task: &TaskDefinition| -> taskrun_rs::Result<Box<dyn HandlerPlugin>> {
            Ok(Box::new(RecordingHandler::new(log.clone())))
        };
        self.factory(Arc::new(factory))
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> TestSession {
        let device = self.device.handle();
        let sink = Arc::new(MemorySink::new());
        let controller = SessionController::new(
            Box::new(self.device),
            self.factory,
            sink.clone(),
            self.config,
        );
        TestSession {
            controller,
            device,
            sink,
        }
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of a hook log
pub fn hooks(log: &HookLog) -> Vec<String> {
    log.lock().map(|l| l.clone()).unwrap_or_default()
}
