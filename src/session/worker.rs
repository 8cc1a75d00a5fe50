//! Session worker thread
//!
//! Drives a [`SessionController`] from a dedicated thread and talks to the
//! caller through crossbeam channels.
//!
//! # Cadence
//!
//! The worker has two mutually exclusive cadences:
//!
//! - **Running**: one [`SessionController::tick`] per `tick_interval_ms`
//! - **Idle**: one housekeeping pass per `refresh_interval_ms`, which checks
//!   the uploaded task for out-of-band edits and the device for connectivity
//!
//! Commands are processed on every loop iteration in both cadences.

use crate::config::SessionConfig;
use crate::experiment::ExperimentContext;
use crate::session::{SessionController, SessionState, TaskFreshness};
use crate::task::{Fingerprint, TaskDefinition};
use crate::types::{Batch, RunStats, VariableValue};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Interval between stats messages while running
const STATS_INTERVAL: Duration = Duration::from_millis(500);

/// Commands sent to the worker
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Connect(String),
    Disconnect,
    Upload(TaskDefinition),
    StartRun(Option<ExperimentContext>),
    StopRun,
    SetVariable { name: String, value: VariableValue },
    Shutdown,
}

/// Messages sent from the worker
#[derive(Debug, Clone)]
pub enum SessionMessage {
    /// The session moved to a new state
    StateChanged(SessionState),
    /// An operation failed
    Error(String),
    /// Records delivered during one tick (empty batches are not sent)
    Batch(Batch),
    /// The uploaded task file changed on disk
    TaskStale {
        uploaded: Fingerprint,
        current: Fingerprint,
    },
    /// Run counters
    Stats(RunStats),
    /// The worker has exited
    Shutdown,
}

/// Caller-side handle to a [`SessionWorker`]
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Receiver for worker messages
    pub receiver: Receiver<SessionMessage>,
    /// Sender for commands to the worker
    pub command_sender: Sender<SessionCommand>,
    state: Arc<RwLock<SessionState>>,
}

impl SessionHandle {
    /// Last state published by the worker
    pub fn state(&self) -> SessionState {
        self.state.read().map(|s| *s).unwrap_or_default()
    }

    /// Try to receive a message without blocking
    pub fn try_recv(&self) -> Option<SessionMessage> {
        self.receiver.try_recv().ok()
    }

    /// Wait up to `timeout` for a message
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionMessage> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Receive all pending messages
    pub fn drain(&self) -> Vec<SessionMessage> {
        self.receiver.try_iter().collect()
    }

    /// Send a command to the worker
    pub fn send_command(&self, cmd: SessionCommand) -> bool {
        self.command_sender.send(cmd).is_ok()
    }

    pub fn connect(&self, port: impl Into<String>) {
        let _ = self.command_sender.send(SessionCommand::Connect(port.into()));
    }

    pub fn disconnect(&self) {
        let _ = self.command_sender.send(SessionCommand::Disconnect);
    }

    pub fn upload(&self, task: TaskDefinition) {
        let _ = self.command_sender.send(SessionCommand::Upload(task));
    }

    pub fn start_run(&self, experiment: Option<ExperimentContext>) {
        let _ = self
            .command_sender
            .send(SessionCommand::StartRun(experiment));
    }

    pub fn stop_run(&self) {
        let _ = self.command_sender.send(SessionCommand::StopRun);
    }

    pub fn set_variable(&self, name: impl Into<String>, value: impl Into<VariableValue>) {
        let _ = self.command_sender.send(SessionCommand::SetVariable {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        let _ = self.command_sender.send(SessionCommand::Shutdown);
    }

    /// Wait until the worker publishes a state matching `pred`
    pub fn wait_for_state<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&SessionState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred(&self.state()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        pred(&self.state())
    }
}

/// Runs a session controller on its own thread
pub struct SessionWorker {
    controller: SessionController,
    command_rx: Receiver<SessionCommand>,
    message_tx: Sender<SessionMessage>,
    running: Arc<AtomicBool>,
    shared_state: Arc<RwLock<SessionState>>,
    tick_interval: Duration,
    refresh_interval: Duration,
    last_loop_time: Instant,
    last_refresh_time: Instant,
    last_stats_time: Instant,
    dropped_messages: u64,
}

impl SessionWorker {
    /// Create a worker and its handle
    pub fn new(controller: SessionController) -> (Self, SessionHandle) {
        let config: SessionConfig = controller.config().clone();
        let (cmd_tx, cmd_rx) = bounded(config.channel_buffer_size);
        // bounded for backpressure, batches are dropped if nobody reads them
        let (msg_tx, msg_rx) = bounded(config.channel_buffer_size);
        let shared_state = Arc::new(RwLock::new(controller.state()));

        let worker = Self {
            controller,
            command_rx: cmd_rx,
            message_tx: msg_tx,
            running: Arc::new(AtomicBool::new(true)),
            shared_state: shared_state.clone(),
            tick_interval: config.tick_interval(),
            refresh_interval: config.refresh_interval(),
            last_loop_time: Instant::now(),
            last_refresh_time: Instant::now(),
            last_stats_time: Instant::now(),
            dropped_messages: 0,
        };

        let handle = SessionHandle {
            receiver: msg_rx,
            command_sender: cmd_tx,
            state: shared_state,
        };

        (worker, handle)
    }

    /// Flag that keeps the loop alive; clearing it stops the worker
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Messages dropped because the message channel was full
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages
    }

    /// Run the worker on a new thread
    pub fn spawn(mut self) -> std::io::Result<JoinHandle<SessionController>> {
        std::thread::Builder::new()
            .name("session-worker".to_string())
            .spawn(move || {
                self.run();
                self.controller
            })
    }

    /// Run the worker loop until shutdown
    pub fn run(&mut self) {
        tracing::info!("Session worker started");

        while self.running.load(Ordering::SeqCst) {
            self.process_commands();

            if self.controller.state().is_running() {
                self.tick();
            } else if self.last_refresh_time.elapsed() >= self.refresh_interval {
                self.housekeeping();
                self.last_refresh_time = Instant::now();
            }

            self.rate_limit();
        }

        // Cleanup
        self.controller.disconnect();
        self.publish_state();

        let _ = self.message_tx.send(SessionMessage::Shutdown);
        tracing::info!("Session worker stopped");
    }

    fn process_commands(&mut self) {
        loop {
            match self.command_rx.try_recv() {
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        tracing::debug!("Session command: {:?}", cmd);
        let result = match cmd {
            SessionCommand::Connect(port) => self.controller.connect(&port),
            SessionCommand::Disconnect => {
                self.controller.disconnect();
                Ok(())
            }
            SessionCommand::Upload(task) => self.controller.upload_task(&task),
            SessionCommand::StartRun(experiment) => {
                let result = self.controller.start_run(experiment);
                self.last_stats_time = Instant::now();
                result
            }
            SessionCommand::StopRun => self.controller.stop(false),
            SessionCommand::SetVariable { name, value } => {
                self.controller.set_variable(&name, value)
            }
            SessionCommand::Shutdown => {
                self.running.store(false, Ordering::SeqCst);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.try_send_message(SessionMessage::Error(e.to_string()));
        }
        self.publish_state();
    }

    fn tick(&mut self) {
        match self.controller.tick() {
            Ok(batch) => {
                if !batch.is_empty() {
                    self.try_send_message(SessionMessage::Batch(batch));
                }
                if self.last_stats_time.elapsed() >= STATS_INTERVAL {
                    let stats = self.controller.stats().clone();
                    self.try_send_message(SessionMessage::Stats(stats));
                    self.last_stats_time = Instant::now();
                }
            }
            Err(e) => {
                self.try_send_message(SessionMessage::Error(e.to_string()));
                self.publish_state();
            }
        }
    }

    fn housekeeping(&mut self) {
        if self.controller.state().has_task() {
            if let Ok(TaskFreshness::Stale { uploaded, current }) =
                self.controller.check_task_freshness()
            {
                self.try_send_message(SessionMessage::TaskStale { uploaded, current });
            }
        }
        if self.controller.state().is_connected() && !self.controller.check_connection() {
            self.try_send_message(SessionMessage::Error(
                "Device connection lost".to_string(),
            ));
            self.publish_state();
        }
    }

    fn rate_limit(&mut self) {
        let elapsed = self.last_loop_time.elapsed();
        if elapsed < self.tick_interval {
            std::thread::sleep(self.tick_interval - elapsed);
        }
        self.last_loop_time = Instant::now();
    }

    fn publish_state(&mut self) {
        let state = self.controller.state();
        let changed = match self.shared_state.write() {
            Ok(mut shared) => {
                let changed = *shared != state;
                *shared = state;
                changed
            }
            Err(_) => true,
        };
        if changed {
            self.try_send_message(SessionMessage::StateChanged(state));
        }
    }

    /// Try to send a message, tracking dropped messages if the queue is full
    fn try_send_message(&mut self, msg: SessionMessage) {
        if self.message_tx.try_send(msg).is_err() {
            self.dropped_messages += 1;
        }
    }
}
