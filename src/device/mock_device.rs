//! Mock Device Implementation for Testing
//!
//! This module provides a simulated board that can be used for testing
//! sessions without real hardware. It plays back queued frames, generates
//! frames from configurable patterns and records everything the host asks
//! of it.
//!
//! # Features
//!
//! - **Task registry**: Tasks are "compiled" by looking up a registered identity by name
//! - **Queued frames**: Push exact frames for the next read
//! - **Pattern-based generation**: Produce state changes, prints and analog samples while running
//! - **Failure injection**: Make the next call of a given operation fail
//! - **Inspection**: A cloneable [`MockDeviceHandle`] sees every call the session made
//!
//! # Frame Patterns
//!
//! - [`MockFramePattern::Cycle`] - Step through digital IDs at a fixed period
//! - [`MockFramePattern::Sine`] - One analog sample per read from a sine wave
//! - [`MockFramePattern::Print`] - A print line at a fixed period
//!
//! # Example
//!
//! ```ignore
//! use taskrun_rs::device::{MockDeviceBackend, MockFailure};
//!
//! let device = MockDeviceBackend::blinker();
//! let handle = device.handle();
//!
//! // hand `device` to a SessionController, then inspect:
//! handle.fail_next(MockFailure::SetVariable, "board busy");
//! assert_eq!(handle.start_calls(), 1);
//! ```
//!
//! # Enabling
//!
//! The mock device is available when the `mock-device` feature is enabled
//! (on by default).

use crate::error::{Result, TaskRunError};
use crate::task::{Fingerprint, TaskDefinition};
use crate::types::{DeviceIdentity, DeviceTime, RawFrame, VariableValue};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::link_trait::DeviceLink;

/// Default device time that passes between two reads
pub const DEFAULT_MS_PER_READ: DeviceTime = 10;

/// Pattern for generating frames while running
#[derive(Debug, Clone, PartialEq)]
pub enum MockFramePattern {
    /// Emit the next digital ID every `period` device ticks, wrapping around
    Cycle { ids: Vec<u32>, period: DeviceTime },
    /// Emit one analog sample per read
    Sine {
        channel: u32,
        frequency: f64,
        amplitude: f64,
        offset: f64,
    },
    /// Emit `text` every `period` device ticks
    Print { text: String, period: DeviceTime },
}

/// Operation a failure can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockFailure {
    Connect,
    Upload,
    StartRun,
    StopRun,
    Read,
    SetVariable,
}

#[derive(Debug, Clone)]
struct PatternState {
    pattern: MockFramePattern,
    position: usize,
}

impl PatternState {
    /// Frames for the device-time window `(from, to]`
    fn generate(&mut self, from: DeviceTime, to: DeviceTime, out: &mut Vec<RawFrame>) {
        match &self.pattern {
            MockFramePattern::Cycle { ids, period } => {
                if ids.is_empty() || *period == 0 {
                    return;
                }
                let mut t = (from / period + 1) * period;
                while t <= to {
                    out.push(RawFrame::Digital {
                        time: t,
                        id: ids[self.position % ids.len()],
                    });
                    self.position += 1;
                    t += period;
                }
            }
            MockFramePattern::Sine {
                channel,
                frequency,
                amplitude,
                offset,
            } => {
                let secs = to as f64 / 1000.0;
                out.push(RawFrame::Analog {
                    channel: *channel,
                    time: to,
                    value: offset
                        + amplitude * (2.0 * std::f64::consts::PI * frequency * secs).sin(),
                });
            }
            MockFramePattern::Print { text, period } => {
                if *period == 0 {
                    return;
                }
                let mut t = (from / period + 1) * period;
                while t <= to {
                    out.push(RawFrame::Print {
                        time: t,
                        text: text.clone(),
                    });
                    t += period;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    port: Option<String>,
    accepted_ports: Option<HashSet<String>>,
    tasks: HashMap<String, DeviceIdentity>,
    uploaded: Option<(String, Fingerprint)>,
    running: bool,
    clock: DeviceTime,
    ms_per_read: DeviceTime,
    queued: VecDeque<RawFrame>,
    patterns: Vec<PatternState>,
    failures: HashMap<MockFailure, String>,
    variables: HashMap<String, VariableValue>,
    set_variable_calls: Vec<(String, VariableValue)>,
    upload_calls: usize,
    transfers: usize,
    start_calls: usize,
    stop_calls: usize,
    read_calls: usize,
}

impl MockState {
    fn take_failure(&mut self, op: MockFailure) -> Option<String> {
        self.failures.remove(&op)
    }

    fn require_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(TaskRunError::Connection("mock device not connected".to_string()))
        }
    }
}

fn lock(state: &Mutex<MockState>) -> Result<MutexGuard<'_, MockState>> {
    state
        .lock()
        .map_err(|_| TaskRunError::Protocol("mock device state poisoned".to_string()))
}

/// Simulated board implementing [`DeviceLink`]
#[derive(Debug, Clone)]
pub struct MockDeviceBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockDeviceBackend {
    /// Create a mock device with no registered tasks
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                ms_per_read: DEFAULT_MS_PER_READ,
                ..Default::default()
            })),
        }
    }

    /// A device that knows the `blinker` task and cycles its LED states
    pub fn blinker() -> Self {
        Self::new()
            .with_task(blinker_identity())
            .with_pattern(MockFramePattern::Cycle {
                ids: vec![1, 2],
                period: 500,
            })
    }

    /// Register a task the device can "compile"
    pub fn with_task(self, identity: DeviceIdentity) -> Self {
        self.handle().register_task(identity);
        self
    }

    /// Add a frame pattern used while running
    pub fn with_pattern(self, pattern: MockFramePattern) -> Self {
        self.handle().add_pattern(pattern);
        self
    }

    /// Only accept connections on these ports
    pub fn with_ports<I, S>(self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut state) = self.state.lock() {
            state.accepted_ports = Some(ports.into_iter().map(Into::into).collect());
        }
        self
    }

    /// Set how much device time passes per read
    pub fn with_ms_per_read(self, ms: DeviceTime) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.ms_per_read = ms;
        }
        self
    }

    /// Inspection handle sharing this device's state
    pub fn handle(&self) -> MockDeviceHandle {
        MockDeviceHandle {
            state: self.state.clone(),
        }
    }
}

impl Default for MockDeviceBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of the demo `blinker` task
pub fn blinker_identity() -> DeviceIdentity {
    DeviceIdentity::new("blinker")
        .with_state(1, "LED_on")
        .with_state(2, "LED_off")
        .with_variable("LED_n", "1")
}

impl DeviceLink for MockDeviceBackend {
    fn connect(&mut self, port: &str) -> Result<DeviceIdentity> {
        let mut state = lock(&self.state)?;
        if let Some(message) = state.take_failure(MockFailure::Connect) {
            return Err(TaskRunError::Connection(message));
        }
        if let Some(ports) = &state.accepted_ports {
            if !ports.contains(port) {
                return Err(TaskRunError::Connection(format!(
                    "could not open port {}",
                    port
                )));
            }
        }
        state.connected = true;
        state.port = Some(port.to_string());
        tracing::debug!("Mock device connected on {}", port);

        let identity = state
            .uploaded
            .as_ref()
            .and_then(|(name, _)| state.tasks.get(name).cloned())
            .unwrap_or_default();
        Ok(identity)
    }

    fn disconnect(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.connected = false;
            state.running = false;
            state.port = None;
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().map(|s| s.connected).unwrap_or(false)
    }

    fn upload_task(&mut self, fingerprint: Fingerprint, task: &TaskDefinition) -> Result<DeviceIdentity> {
        let mut state = lock(&self.state)?;
        state.require_connected()?;
        state.upload_calls += 1;
        if let Some(message) = state.take_failure(MockFailure::Upload) {
            return Err(TaskRunError::Protocol(message));
        }

        let mut identity = state.tasks.get(&task.name).cloned().ok_or_else(|| {
            TaskRunError::Protocol(format!("Unable to import task {}", task.name))
        })?;
        identity.task_name = task.name.clone();

        let already_held = state
            .uploaded
            .as_ref()
            .map(|(_, fp)| *fp == fingerprint)
            .unwrap_or(false);
        if !already_held {
            state.transfers += 1;
        }

        state.uploaded = Some((task.name.clone(), fingerprint));
        state.running = false;
        state.queued.clear();
        state.variables = identity
            .variables
            .iter()
            .map(|(name, initial)| (name.clone(), VariableValue::Text(initial.clone())))
            .collect();
        Ok(identity)
    }

    fn start_run(&mut self) -> Result<()> {
        let mut state = lock(&self.state)?;
        state.require_connected()?;
        state.start_calls += 1;
        if let Some(message) = state.take_failure(MockFailure::StartRun) {
            return Err(TaskRunError::Protocol(message));
        }
        if state.uploaded.is_none() {
            return Err(TaskRunError::Protocol("no task uploaded".to_string()));
        }
        state.running = true;
        state.clock = 0;
        for pattern in &mut state.patterns {
            pattern.position = 0;
        }
        Ok(())
    }

    fn stop_run(&mut self) -> Result<()> {
        let mut state = lock(&self.state)?;
        state.require_connected()?;
        state.stop_calls += 1;
        if let Some(message) = state.take_failure(MockFailure::StopRun) {
            return Err(TaskRunError::Protocol(message));
        }
        state.running = false;
        Ok(())
    }

    fn read_pending_frames(&mut self) -> Result<Vec<RawFrame>> {
        let mut state = lock(&self.state)?;
        state.require_connected()?;
        state.read_calls += 1;
        if let Some(message) = state.take_failure(MockFailure::Read) {
            return Err(TaskRunError::Connection(message));
        }

        let mut frames: Vec<RawFrame> = state.queued.drain(..).collect();
        if state.running {
            let from = state.clock;
            let to = from + state.ms_per_read;
            state.clock = to;
            for pattern in &mut state.patterns {
                pattern.generate(from, to, &mut frames);
            }
        }
        Ok(frames)
    }

    fn set_variable(&mut self, name: &str, value: &VariableValue) -> Result<()> {
        let mut state = lock(&self.state)?;
        state.require_connected()?;
        if let Some(message) = state.take_failure(MockFailure::SetVariable) {
            return Err(TaskRunError::Protocol(message));
        }
        state
            .set_variable_calls
            .push((name.to_string(), value.clone()));
        state.variables.insert(name.to_string(), value.clone());
        Ok(())
    }
}

/// Cloneable view into a [`MockDeviceBackend`]
#[derive(Debug, Clone)]
pub struct MockDeviceHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockDeviceHandle {
    fn with_state<T: Default>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        self.state.lock().map(|mut s| f(&mut s)).unwrap_or_default()
    }

    /// Register a task the device can "compile"
    pub fn register_task(&self, identity: DeviceIdentity) {
        self.with_state(|s| {
            s.tasks.insert(identity.task_name.clone(), identity);
        })
    }

    pub fn add_pattern(&self, pattern: MockFramePattern) {
        self.with_state(|s| s.patterns.push(PatternState { pattern, position: 0 }))
    }

    pub fn clear_patterns(&self) {
        self.with_state(|s| s.patterns.clear())
    }

    /// Queue a frame for the next read
    pub fn push_frame(&self, frame: RawFrame) {
        self.with_state(|s| s.queued.push_back(frame))
    }

    pub fn push_frames(&self, frames: impl IntoIterator<Item = RawFrame>) {
        self.with_state(|s| s.queued.extend(frames))
    }

    /// Make the next call of `op` fail with `message`
    pub fn fail_next(&self, op: MockFailure, message: impl Into<String>) {
        let message = message.into();
        self.with_state(|s| {
            s.failures.insert(op, message);
        })
    }

    /// Simulate the cable being pulled
    pub fn unplug(&self) {
        self.with_state(|s| {
            s.connected = false;
            s.running = false;
        })
    }

    pub fn is_connected(&self) -> bool {
        self.with_state(|s| s.connected)
    }

    pub fn is_running(&self) -> bool {
        self.with_state(|s| s.running)
    }

    pub fn port(&self) -> Option<String> {
        self.with_state(|s| s.port.clone())
    }

    /// Name and fingerprint of the task the device holds
    pub fn uploaded_task(&self) -> Option<(String, Fingerprint)> {
        self.with_state(|s| s.uploaded.clone())
    }

    /// Every forwarded set-variable call, in order
    pub fn set_variable_calls(&self) -> Vec<(String, VariableValue)> {
        self.with_state(|s| s.set_variable_calls.clone())
    }

    /// Current value of a variable on the device
    pub fn variable(&self, name: &str) -> Option<VariableValue> {
        self.with_state(|s| s.variables.get(name).cloned())
    }

    pub fn upload_calls(&self) -> usize {
        self.with_state(|s| s.upload_calls)
    }

    /// Uploads that actually transferred a new task
    pub fn transfers(&self) -> usize {
        self.with_state(|s| s.transfers)
    }

    pub fn start_calls(&self) -> usize {
        self.with_state(|s| s.start_calls)
    }

    pub fn stop_calls(&self) -> usize {
        self.with_state(|s| s.stop_calls)
    }

    pub fn read_calls(&self) -> usize {
        self.with_state(|s| s.read_calls)
    }

    /// Device time of the last read
    pub fn clock(&self) -> DeviceTime {
        self.with_state(|s| s.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskDefinition {
        TaskDefinition::new("blinker", "states = ['LED_on', 'LED_off']")
    }

    #[test]
    fn test_mock_device_connect() {
        let mut device = MockDeviceBackend::new().with_ports(["COM1"]);
        assert!(!device.is_connected());
        assert!(device.connect("COM2").is_err());

        let identity = device.connect("COM1").unwrap();
        assert!(identity.is_empty());
        assert!(device.is_connected());

        device.disconnect();
        assert!(!device.is_connected());
    }

    #[test]
    fn test_upload_unknown_task_is_protocol_error() {
        let mut device = MockDeviceBackend::blinker();
        device.connect("COM1").unwrap();
        let other = TaskDefinition::new("reversal_learning", "");
        assert!(matches!(
            device.upload_task(other.fingerprint(), &other),
            Err(TaskRunError::Protocol(_))
        ));
    }

    #[test]
    fn test_upload_skips_transfer_of_identical_task() {
        let mut device = MockDeviceBackend::blinker();
        let handle = device.handle();
        device.connect("COM1").unwrap();

        let t = task();
        let identity = device.upload_task(t.fingerprint(), &t).unwrap();
        assert!(identity.is_state("LED_off"));
        device.upload_task(t.fingerprint(), &t).unwrap();

        assert_eq!(handle.upload_calls(), 2);
        assert_eq!(handle.transfers(), 1);
    }

    #[test]
    fn test_cycle_pattern() {
        let mut device = MockDeviceBackend::new()
            .with_task(blinker_identity())
            .with_pattern(MockFramePattern::Cycle {
                ids: vec![1, 2],
                period: 20,
            })
            .with_ms_per_read(50);
        device.connect("COM1").unwrap();
        let t = task();
        device.upload_task(t.fingerprint(), &t).unwrap();

        // not running, nothing generated
        assert!(device.read_pending_frames().unwrap().is_empty());

        device.start_run().unwrap();
        let frames = device.read_pending_frames().unwrap();
        assert_eq!(
            frames,
            vec![
                RawFrame::Digital { time: 20, id: 1 },
                RawFrame::Digital { time: 40, id: 2 },
            ]
        );
        let frames = device.read_pending_frames().unwrap();
        assert_eq!(frames[0], RawFrame::Digital { time: 60, id: 1 });
    }

    #[test]
    fn test_queued_frames_and_failures() {
        let mut device = MockDeviceBackend::blinker();
        let handle = device.handle();
        device.connect("COM1").unwrap();

        handle.push_frame(RawFrame::Print {
            time: 1,
            text: "hello".into(),
        });
        handle.fail_next(MockFailure::Read, "cable");
        assert!(device.read_pending_frames().is_err());
        assert_eq!(device.read_pending_frames().unwrap().len(), 1);
        assert!(device.read_pending_frames().unwrap().is_empty());
    }

    #[test]
    fn test_set_variable_is_recorded() {
        let mut device = MockDeviceBackend::blinker();
        let handle = device.handle();
        device.connect("COM1").unwrap();
        device.set_variable("LED_n", &VariableValue::Int(3)).unwrap();

        assert_eq!(
            handle.set_variable_calls(),
            vec![("LED_n".to_string(), VariableValue::Int(3))]
        );
        assert_eq!(handle.variable("LED_n"), Some(VariableValue::Int(3)));
    }

    #[test]
    fn test_unplug() {
        let mut device = MockDeviceBackend::blinker();
        device.connect("COM1").unwrap();
        device.handle().unplug();
        assert!(!device.is_connected());
        assert!(matches!(
            device.read_pending_frames(),
            Err(TaskRunError::Connection(_))
        ));
    }

    #[test]
    fn test_sine_pattern_one_sample_per_read() {
        let mut state = PatternState {
            pattern: MockFramePattern::Sine {
                channel: 1,
                frequency: 1.0,
                amplitude: 2.0,
                offset: 5.0,
            },
            position: 0,
        };
        let mut frames = Vec::new();
        state.generate(0, 250, &mut frames);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            RawFrame::Analog { value, time, .. } => {
                assert_eq!(*time, 250);
                assert!((value - 7.0).abs() < 1e-9);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
