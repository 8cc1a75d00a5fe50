//! Drives every session of an experiment from one loop
//!
//! Sessions are ticked in subject order on the caller's thread, so peer
//! requests queued during one subject's tick are applied by the target at
//! its next tick.

use crate::error::{Result, TaskRunError};
use crate::experiment::{ExperimentContext, ExperimentCoordinator, ExperimentInfo};
use crate::handler::HandlerInstance;
use crate::session::{SessionController, SessionState};
use crate::task::TaskDefinition;
use crate::types::Batch;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// All sessions of one experiment plus their coordinator
pub struct ExperimentRunner {
    info: Arc<ExperimentInfo>,
    coordinator: ExperimentCoordinator,
    sessions: Vec<SessionController>,
}

impl ExperimentRunner {
    /// Pair sessions with subjects, in order
    pub fn new(info: ExperimentInfo, sessions: Vec<SessionController>) -> Result<Self> {
        if sessions.len() != info.subjects.len() {
            return Err(TaskRunError::Config(format!(
                "experiment {} has {} subjects but {} sessions",
                info.name,
                info.subjects.len(),
                sessions.len()
            )));
        }
        let info = Arc::new(info);
        Ok(Self {
            coordinator: ExperimentCoordinator::new(info.clone()),
            info,
            sessions,
        })
    }

    pub fn info(&self) -> &Arc<ExperimentInfo> {
        &self.info
    }

    pub fn coordinator(&self) -> &ExperimentCoordinator {
        &self.coordinator
    }

    pub fn sessions(&self) -> &[SessionController] {
        &self.sessions
    }

    /// Session of a subject
    pub fn session(&self, subject: &str) -> Option<&SessionController> {
        let index = self.info.subjects.iter().position(|s| s == subject)?;
        self.sessions.get(index)
    }

    pub fn session_mut(&mut self, subject: &str) -> Option<&mut SessionController> {
        let index = self.info.subjects.iter().position(|s| s == subject)?;
        self.sessions.get_mut(index)
    }

    /// Whether any session is running
    pub fn any_running(&self) -> bool {
        self.sessions.iter().any(|s| s.state().is_running())
    }

    /// Connect every session to its port
    ///
    /// Every session is attempted; the first failure is returned.
    pub fn connect_all(&mut self, ports: &[String]) -> Result<()> {
        if ports.len() != self.sessions.len() {
            return Err(TaskRunError::Config(format!(
                "{} ports given for {} subjects",
                ports.len(),
                self.sessions.len()
            )));
        }
        let mut first_error = None;
        for (session, port) in self.sessions.iter_mut().zip(ports) {
            if let Err(e) = session.connect(port) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Upload the same task to every session
    ///
    /// New handler instances are created, so any earlier wiring is dropped.
    pub fn upload_all(&mut self, task: &TaskDefinition) -> Result<()> {
        self.coordinator.reset();
        let mut first_error = None;
        for session in &mut self.sessions {
            if let Err(e) = session.upload_task(task) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Run both wiring phases over every session's handler
    pub fn wire(&mut self) -> Result<()> {
        if let Some((index, session)) = self
            .sessions
            .iter()
            .enumerate()
            .find(|(_, s)| !matches!(s.state(), SessionState::Uploaded { .. }))
        {
            return Err(TaskRunError::PeerOrdering(format!(
                "subject {} is {}, every session must be Uploaded before wiring",
                self.info.subjects[index],
                session.state()
            )));
        }

        let mut handlers: Vec<&mut HandlerInstance> = self
            .sessions
            .iter_mut()
            .filter_map(|s| s.handler_mut())
            .collect();
        self.coordinator.register_all(&mut handlers)?;
        self.coordinator.wire_peers(&mut handlers)?;
        Ok(())
    }

    /// Wire peers, then start every session
    ///
    /// If any start fails, sessions already started are stopped again.
    pub fn start_all(&mut self) -> Result<()> {
        self.wire()?;

        for index in 0..self.sessions.len() {
            let context = ExperimentContext::new(self.info.clone(), index)?;
            if let Err(e) = self.sessions[index].start_run(Some(context)) {
                tracing::error!(
                    "Start failed for subject {}: {}",
                    self.info.subjects[index],
                    e
                );
                for started in &mut self.sessions[..index] {
                    let _ = started.stop(true);
                }
                return Err(e);
            }
        }
        tracing::info!(
            "Experiment {} started with {} subjects",
            self.info.name,
            self.sessions.len()
        );
        Ok(())
    }

    /// Tick every running session once, in subject order
    ///
    /// A failure in one session does not affect the others.
    pub fn tick_all(&mut self) -> Vec<(String, Result<Batch>)> {
        let mut results = Vec::new();
        for (index, session) in self.sessions.iter_mut().enumerate() {
            if session.state().is_running() {
                results.push((self.info.subjects[index].clone(), session.tick()));
            }
        }
        results
    }

    /// Tick until every session has stopped or `running` is cleared
    pub fn run_until(&mut self, running: &AtomicBool, interval: Duration) {
        let mut last = Instant::now();
        while running.load(Ordering::SeqCst) && self.any_running() {
            for (subject, result) in self.tick_all() {
                if let Err(e) = result {
                    tracing::warn!("Subject {} left the run: {}", subject, e);
                }
            }
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
            last = Instant::now();
        }
    }

    /// Stop every running session
    pub fn stop_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for session in &mut self.sessions {
            if session.state().is_running() {
                if let Err(e) = session.stop(false) {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn disconnect_all(&mut self) {
        for session in &mut self.sessions {
            session.disconnect();
        }
        self.coordinator.reset();
    }
}
