//! Session controller
//!
//! Owns one board's lifecycle and the per-tick read/classify/deliver cycle.
//! All operations are synchronous and must be called from one thread; the
//! [`SessionWorker`](super::SessionWorker) provides that thread.
//!
//! # Tick
//!
//! While running, each [`SessionController::tick`] call:
//!
//! 1. applies requests queued by experiment peers
//! 2. reads every pending frame from the device
//! 3. classifies them into one [`Batch`]
//! 4. delivers the batch to the handler's `on_data` (even when empty)
//! 5. calls the handler's `on_tick`
//!
//! A frame that cannot be classified stops the run. A read failure is
//! treated as the device having gone away: the run is stopped without
//! sending a stop command.
//!
//! # Stop
//!
//! Stopping sends the stop command (unless the device already failed),
//! waits briefly on a normal stop, drains the last frames to `on_data`,
//! applies any peer requests still queued, then calls `on_run_stop`.
//! Requests left in the inbox when the handler is replaced by an upload or
//! dropped by a disconnect are reported as discarded.

use crate::config::SessionConfig;
use crate::device::DeviceLink;
use crate::dispatch::DispatchPipeline;
use crate::error::{Result, TaskRunError};
use crate::experiment::{ExperimentContext, PeerRequestKind};
use crate::handler::{HandlerContext, HandlerEnv, HandlerFactory, HandlerInstance, HandlerPlugin};
use crate::session::SessionState;
use crate::sink::{LogSink, SharedSink};
use crate::task::{Fingerprint, TaskDefinition};
use crate::types::{Batch, DeviceIdentity, RunStats, VariableValue};
use std::sync::Arc;

/// Result of comparing the uploaded task against its file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFreshness {
    /// No task is uploaded
    NotUploaded,
    /// The file still matches what was uploaded
    Fresh,
    /// The file changed after upload; a re-upload is needed
    Stale {
        uploaded: Fingerprint,
        current: Fingerprint,
    },
    /// The file can no longer be read
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    /// Operator stop: send stop, wait, drain
    Normal,
    /// Error stop with a responsive device: send stop, drain
    Forced,
    /// The device itself failed: no stop command
    DeviceFault,
}

/// Drives one device through connect, upload, run and stop
pub struct SessionController {
    link: Box<dyn DeviceLink>,
    factory: Arc<dyn HandlerFactory>,
    sink: SharedSink,
    config: SessionConfig,
    state: SessionState,
    port: Option<String>,
    identity: Arc<DeviceIdentity>,
    pipeline: DispatchPipeline,
    task: Option<TaskDefinition>,
    handler: Option<HandlerInstance>,
    stats: RunStats,
    stale_reported: bool,
}

impl SessionController {
    pub fn new(
        link: Box<dyn DeviceLink>,
        factory: Arc<dyn HandlerFactory>,
        sink: SharedSink,
        config: SessionConfig,
    ) -> Self {
        let identity = Arc::new(DeviceIdentity::default());
        Self {
            link,
            factory,
            sink,
            config,
            state: SessionState::Disconnected,
            port: None,
            pipeline: DispatchPipeline::new(identity.clone()),
            identity,
            task: None,
            handler: None,
            stats: RunStats::default(),
            stale_reported: false,
        }
    }

    // ==================== Accessors ====================

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identity of the uploaded task (empty before upload)
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Fingerprint of the uploaded task
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.state.fingerprint()
    }

    pub fn task(&self) -> Option<&TaskDefinition> {
        self.task.as_ref()
    }

    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    pub fn handler(&self) -> Option<&HandlerInstance> {
        self.handler.as_ref()
    }

    pub fn handler_mut(&mut self) -> Option<&mut HandlerInstance> {
        self.handler.as_mut()
    }

    // ==================== Lifecycle ====================

    /// Open the device on `port`
    pub fn connect(&mut self, port: &str) -> Result<()> {
        if self.state != SessionState::Disconnected {
            return Err(self.invalid("connect"));
        }

        self.sink.write_line(&format!("Connecting to board on {}", port));
        match self.link.connect(port) {
            Ok(identity) => {
                self.set_identity(identity);
                self.port = Some(port.to_string());
                self.state = SessionState::Connected;
                self.sink.write_line("Connected");
                tracing::info!("Connected to {}", port);
                Ok(())
            }
            Err(e) => {
                let e = e.with_context(format!("Unable to connect to {}", port));
                self.report(&e);
                Err(e)
            }
        }
    }

    /// Release the device; stops a running task first
    ///
    /// Always ends Disconnected, even when the stop fails.
    pub fn disconnect(&mut self) {
        if self.state.is_running() {
            // failures are reported inside
            let _ = self.stop_with(StopMode::Forced);
        }
        if self.state.is_connected() {
            self.link.disconnect();
            self.sink.write_line("Disconnected");
            tracing::info!("Disconnected from {}", self.port.as_deref().unwrap_or("?"));
        }

        self.discard_peer_requests("disconnect");
        self.handler = None;
        self.task = None;
        self.port = None;
        self.stale_reported = false;
        self.set_identity(DeviceIdentity::default());
        self.state = SessionState::Disconnected;
    }

    /// Upload a task and create its handler
    ///
    /// Allowed from Connected or Uploaded. On failure the session keeps its
    /// previous state, identity, task and handler.
    pub fn upload_task(&mut self, task: &TaskDefinition) -> Result<()> {
        if !matches!(
            self.state,
            SessionState::Connected | SessionState::Uploaded { .. }
        ) {
            return Err(self.invalid("upload task"));
        }

        let same_task = self.task.as_ref().map(|t| t.name == task.name) == Some(true);
        self.sink
            .write_line(if same_task { "Resetting task.." } else { "Uploading.." });

        let plugin = match self.factory.create(task) {
            Ok(plugin) => plugin,
            Err(e) => {
                let e = e.with_context(format!("Could not create handler for {}", task.name));
                self.report(&e);
                return Err(e);
            }
        };

        let fingerprint = task.fingerprint();
        let mut identity = match self.link.upload_task(fingerprint, task) {
            Ok(identity) => identity,
            Err(e) => {
                let e = e.with_context("Upload failed.");
                self.report(&e);
                return Err(e);
            }
        };
        if identity.task_name.is_empty() {
            identity.task_name = task.name.clone();
        }

        self.discard_peer_requests("re-upload");
        self.set_identity(identity);
        self.task = Some(task.clone());
        self.handler = Some(HandlerInstance::new(plugin));
        self.stale_reported = false;
        self.state = SessionState::Uploaded { fingerprint };
        self.sink.write_line(&format!("Uploaded : {}", task.name));
        tracing::info!("Uploaded task {} ({})", task.name, fingerprint);

        self.invoke_hook("on_load", |plugin, ctx| plugin.on_load(ctx));
        Ok(())
    }

    /// Compare the uploaded fingerprint with the task file as it is now
    ///
    /// Never re-uploads. A mismatch is written to the log once per upload.
    pub fn check_task_freshness(&mut self) -> Result<TaskFreshness> {
        if self.state.is_running() {
            return Err(self.invalid("check task freshness"));
        }
        let (Some(task), Some(uploaded)) = (&self.task, self.state.fingerprint()) else {
            return Ok(TaskFreshness::NotUploaded);
        };

        let freshness = match task.current_fingerprint() {
            None => TaskFreshness::Unavailable,
            Some(current) if current == uploaded => TaskFreshness::Fresh,
            Some(current) => TaskFreshness::Stale { uploaded, current },
        };

        if matches!(freshness, TaskFreshness::Stale { .. }) && !self.stale_reported {
            self.sink.write_line(&format!(
                "Task file {} has changed since upload, re-upload required",
                task.name
            ));
            tracing::warn!("Stale upload of {}", task.name);
            self.stale_reported = true;
        }
        Ok(freshness)
    }

    /// Start the uploaded task
    ///
    /// `experiment` binds the handler to an experiment subject if the
    /// coordinator has not already done so. When the experiment requires
    /// peers, the start is refused until they are wired.
    pub fn start_run(&mut self, experiment: Option<ExperimentContext>) -> Result<()> {
        let fingerprint = match self.state {
            SessionState::Uploaded { fingerprint } => fingerprint,
            _ => return Err(self.invalid("start run")),
        };

        let Some(handler) = self.handler.as_mut() else {
            return Err(self.invalid("start run"));
        };
        if let Some(context) = experiment {
            handler.bind_experiment(context)?;
        }
        if handler.awaiting_peers() {
            return Err(TaskRunError::PeerOrdering(
                "experiment requires peers to be wired before the run starts".to_string(),
            ));
        }

        if let Err(e) = self.link.start_run() {
            let e = e.with_context("Unable to start run");
            self.report(&e);
            return Err(e);
        }

        self.stats.reset();
        self.sink.write_line(&format!(
            "\nRun started at: {}\n",
            chrono::Local::now().format("%Y/%m/%d %H:%M:%S")
        ));
        tracing::info!("Run started");

        self.invoke_hook("on_run_start", |plugin, ctx| plugin.on_run_start(ctx));
        self.state = SessionState::Running { fingerprint };
        Ok(())
    }

    /// Perform one read/classify/deliver cycle
    ///
    /// Returns the delivered batch. A [`TaskRunError::RuntimeData`] or a
    /// device read failure ends the run before the error is returned.
    pub fn tick(&mut self) -> Result<Batch> {
        if !self.state.is_running() {
            return Err(self.invalid("tick"));
        }
        self.stats.ticks += 1;
        self.apply_peer_requests();

        let frames = match self.link.read_pending_frames() {
            Ok(frames) => frames,
            Err(e) => {
                let e = e.with_context("Error during framework run");
                self.report(&e);
                let _ = self.stop_with(StopMode::DeviceFault);
                return Err(e);
            }
        };
        self.stats.frames_received += frames.len() as u64;

        let batch = match self.pipeline.ingest(&frames) {
            Ok(batch) => batch,
            Err(data) => {
                let e = TaskRunError::RuntimeData(data);
                self.report(&e);
                let _ = self.stop_with(StopMode::Forced);
                return Err(e);
            }
        };

        self.deliver(&batch);
        self.invoke_hook("on_tick", |plugin, ctx| plugin.on_tick(ctx));
        Ok(batch)
    }

    /// Stop the run
    ///
    /// `forced` skips the drain delay and makes a stop while not running a
    /// no-op instead of an error.
    pub fn stop(&mut self, forced: bool) -> Result<()> {
        if !self.state.is_running() {
            if forced {
                return Ok(());
            }
            return Err(self.invalid("stop"));
        }
        self.stop_with(if forced {
            StopMode::Forced
        } else {
            StopMode::Normal
        })
    }

    /// Set a task variable on the device
    ///
    /// Undeclared names fail with [`TaskRunError::UnknownVariable`] and
    /// nothing is sent.
    pub fn set_variable(&mut self, name: &str, value: impl Into<VariableValue>) -> Result<()> {
        if !self.state.has_task() {
            return Err(self.invalid("set variable"));
        }
        forward_set_variable(
            &mut *self.link,
            &self.identity,
            &*self.sink,
            &mut self.stats,
            name,
            &value.into(),
        )
    }

    /// Check the device is still reachable while not running
    ///
    /// A lost device moves the session to Disconnected. Returns whether the
    /// session is still connected.
    pub fn check_connection(&mut self) -> bool {
        if !self.state.is_connected() {
            return false;
        }
        if self.link.is_connected() {
            return true;
        }

        let e = TaskRunError::Connection("Device connection lost".to_string());
        self.report(&e);
        self.disconnect();
        false
    }

    // ==================== Internals ====================

    fn stop_with(&mut self, mode: StopMode) -> Result<()> {
        let Some(fingerprint) = self.state.fingerprint() else {
            return Ok(());
        };
        let mut result = Ok(());

        if mode != StopMode::DeviceFault {
            if let Err(e) = self.link.stop_run() {
                let e = e.with_context("Unable to stop run");
                self.report(&e);
                result = Err(e);
            }
            if mode == StopMode::Normal && self.config.stop_drain_delay_ms > 0 {
                std::thread::sleep(self.config.stop_drain_delay());
            }
        }

        match self.link.read_pending_frames() {
            Ok(frames) if !frames.is_empty() => {
                self.stats.frames_received += frames.len() as u64;
                match self.pipeline.ingest(&frames) {
                    Ok(batch) => self.deliver(&batch),
                    Err(data) => self.report(&TaskRunError::RuntimeData(data)),
                }
            }
            Ok(_) => {}
            Err(e) => self.report(&e.with_context("Final drain failed")),
        }

        // requests peers queued during the final tick or their own stop
        self.apply_peer_requests();
        self.invoke_hook("on_run_stop", |plugin, ctx| plugin.on_run_stop(ctx));
        self.state = SessionState::Uploaded { fingerprint };
        self.sink.write_line("Run stopped");
        tracing::info!(
            "Run stopped ({:?}) after {} ticks, {} records",
            mode,
            self.stats.ticks,
            self.stats.total_records()
        );
        result
    }

    fn deliver(&mut self, batch: &Batch) {
        self.stats.record_batch(batch);
        if self.config.echo_prints {
            for print in &batch.prints {
                self.sink.write_line(&format!("{} {}", print.time, print.text));
            }
        }

        let Some(handler) = self.handler.as_mut() else {
            return;
        };
        let env = HandlerEnv {
            link: &mut *self.link,
            identity: &self.identity,
            sink: &*self.sink,
            stats: &mut self.stats,
        };
        self.pipeline.deliver(batch, handler, env);
    }

    fn invoke_hook<F>(&mut self, hook: &'static str, f: F) -> bool
    where
        F: FnOnce(&mut dyn HandlerPlugin, &mut HandlerContext<'_>) -> anyhow::Result<()>,
    {
        let Some(handler) = self.handler.as_mut() else {
            return true;
        };
        let env = HandlerEnv {
            link: &mut *self.link,
            identity: &self.identity,
            sink: &*self.sink,
            stats: &mut self.stats,
        };
        handler.invoke(hook, env, f)
    }

    fn apply_peer_requests(&mut self) {
        let Some(handler) = self.handler.as_mut() else {
            return;
        };
        for request in handler.drain_peer_requests() {
            tracing::debug!("Peer request from {}: {:?}", request.from, request.kind);
            match request.kind {
                PeerRequestKind::SetVariable { name, value } => {
                    // soft failure, already reported
                    let _ = forward_set_variable(
                        &mut *self.link,
                        &self.identity,
                        &*self.sink,
                        &mut self.stats,
                        &name,
                        &value,
                    );
                }
                PeerRequestKind::Message(message) => {
                    let env = HandlerEnv {
                        link: &mut *self.link,
                        identity: &self.identity,
                        sink: &*self.sink,
                        stats: &mut self.stats,
                    };
                    let from = request.from;
                    handler.invoke("on_peer_message", env, |plugin, ctx| {
                        plugin.on_peer_message(&from, &message, ctx)
                    });
                }
            }
        }
    }

    /// Report requests that will never be applied because the handler goes away
    fn discard_peer_requests(&self, reason: &str) {
        let Some(handler) = self.handler.as_ref() else {
            return;
        };
        for request in handler.drain_peer_requests() {
            let line = format!(
                "Discarded request from {} on {}: {}",
                request.from, reason, request.kind
            );
            tracing::warn!("{}", line);
            self.sink.write_line(&line);
        }
    }

    fn set_identity(&mut self, identity: DeviceIdentity) {
        self.identity = Arc::new(identity);
        self.pipeline.set_identity(self.identity.clone());
    }

    fn invalid(&self, operation: &'static str) -> TaskRunError {
        TaskRunError::InvalidTransition {
            operation,
            state: self.state,
        }
    }

    fn report(&self, err: &TaskRunError) {
        tracing::error!("{}", err);
        self.sink.write_line(&err.to_string());
    }
}

/// Check a variable is declared and forward it to the device
///
/// Shared by the controller, handler contexts and peer requests so all
/// three apply the same rule.
pub(crate) fn forward_set_variable(
    link: &mut dyn DeviceLink,
    identity: &DeviceIdentity,
    sink: &dyn LogSink,
    stats: &mut RunStats,
    name: &str,
    value: &VariableValue,
) -> Result<()> {
    if !identity.declares_variable(name) {
        stats.unknown_variable_errors += 1;
        let err = TaskRunError::UnknownVariable {
            name: name.to_string(),
            task: identity.task_name.clone(),
        };
        tracing::warn!("{}", err);
        sink.write_line(&err.to_string());
        return Err(err);
    }

    if let Err(e) = link.set_variable(name, value) {
        let e = e.with_context(format!("Unable to set variable {}", name));
        tracing::error!("{}", e);
        sink.write_line(&e.to_string());
        return Err(e);
    }
    stats.variables_set += 1;
    tracing::debug!("Set variable {} = {}", name, value);
    Ok(())
}
