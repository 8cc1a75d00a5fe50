//! Core data types for the task runner
//!
//! This module contains the data structures that flow between the device
//! link, the frame classifier and handler plugins.
//!
//! # Main Types
//!
//! - [`DeviceIdentity`] - Name/kind tables for the currently uploaded task
//! - [`RawFrame`] - A decoded unit of device output (print, digital, analog)
//! - [`ClassifiedRecord`] - A frame resolved against the identity
//! - [`Batch`] - Records observed during one polling tick, bucketed by kind
//! - [`VariableValue`] - A value that can be written to a task variable
//! - [`RunStats`] - Counters for the current run
//!
//! # Batch ordering
//!
//! Records keep their input order within a kind. Ordering across kinds is
//! not preserved: a print and a state change from the same tick land in
//! different sequences and their relative order is lost.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Device clock ticks, monotonically non-decreasing within one run
pub type DeviceTime = u64;

/// Name and kind tables for the task currently uploaded to a device
///
/// Replaced wholesale on every upload. A freshly connected device has an
/// empty identity until a task is uploaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Name of the uploaded task (empty before upload)
    #[serde(default)]
    pub task_name: String,
    /// Device-local digital ID to state/event name
    #[serde(default)]
    pub id_to_name: HashMap<u32, String>,
    /// Names in `id_to_name` that denote states rather than events
    #[serde(default)]
    pub states: HashSet<String>,
    /// Analog channel ID to channel name
    #[serde(default)]
    pub id_to_analog: HashMap<u32, String>,
    /// Declared task variables and their initial value as reported by the device
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl DeviceIdentity {
    /// Create an empty identity for a named task
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            ..Default::default()
        }
    }

    /// Declare a state with its digital ID
    pub fn with_state(mut self, id: u32, name: impl Into<String>) -> Self {
        let name = name.into();
        self.states.insert(name.clone());
        self.id_to_name.insert(id, name);
        self
    }

    /// Declare an event with its digital ID
    pub fn with_event(mut self, id: u32, name: impl Into<String>) -> Self {
        self.id_to_name.insert(id, name.into());
        self
    }

    /// Declare an analog input channel
    pub fn with_analog(mut self, id: u32, name: impl Into<String>) -> Self {
        self.id_to_analog.insert(id, name.into());
        self
    }

    /// Declare a task variable
    pub fn with_variable(mut self, name: impl Into<String>, initial: impl Into<String>) -> Self {
        self.variables.insert(name.into(), initial.into());
        self
    }

    /// Whether no task has been uploaded
    pub fn is_empty(&self) -> bool {
        self.task_name.is_empty() && self.id_to_name.is_empty() && self.variables.is_empty()
    }

    /// Whether `name` is a declared task variable
    pub fn declares_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Whether `name` is a state (as opposed to an event)
    pub fn is_state(&self, name: &str) -> bool {
        self.states.contains(name)
    }
}

/// One decoded unit of output received from the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawFrame {
    /// A line printed by the task
    Print { time: DeviceTime, text: String },
    /// A state transition or event, by device-local ID
    Digital { time: DeviceTime, id: u32 },
    /// An analog sample
    Analog {
        channel: u32,
        time: DeviceTime,
        value: f64,
    },
}

impl RawFrame {
    /// Device time carried by the frame
    pub fn time(&self) -> DeviceTime {
        match self {
            RawFrame::Print { time, .. }
            | RawFrame::Digital { time, .. }
            | RawFrame::Analog { time, .. } => *time,
        }
    }
}

/// Entry into a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub name: String,
    pub time: DeviceTime,
}

/// A discrete event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,
    pub time: DeviceTime,
}

/// A printed line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintRecord {
    pub text: String,
    pub time: DeviceTime,
}

/// An analog sample with its resolved channel name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogRecord {
    pub channel: String,
    pub time: DeviceTime,
    pub value: f64,
}

/// A frame resolved against a [`DeviceIdentity`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClassifiedRecord {
    State(StateRecord),
    Event(EventRecord),
    Print(PrintRecord),
    Analog(AnalogRecord),
}

impl ClassifiedRecord {
    /// Device time carried by the record
    pub fn time(&self) -> DeviceTime {
        match self {
            ClassifiedRecord::State(r) => r.time,
            ClassifiedRecord::Event(r) => r.time,
            ClassifiedRecord::Print(r) => r.time,
            ClassifiedRecord::Analog(r) => r.time,
        }
    }
}

/// Records observed during one polling tick, bucketed by kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub states: Vec<StateRecord>,
    pub events: Vec<EventRecord>,
    pub prints: Vec<PrintRecord>,
    pub analog: Vec<AnalogRecord>,
}

impl Batch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to the sequence for its kind
    pub fn push(&mut self, record: ClassifiedRecord) {
        match record {
            ClassifiedRecord::State(r) => self.states.push(r),
            ClassifiedRecord::Event(r) => self.events.push(r),
            ClassifiedRecord::Print(r) => self.prints.push(r),
            ClassifiedRecord::Analog(r) => self.analog.push(r),
        }
    }

    /// Total number of records across all kinds
    pub fn len(&self) -> usize {
        self.states.len() + self.events.len() + self.prints.len() + self.analog.len()
    }

    /// Whether every sequence is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Value written to a task variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Task files are Python, so values are sent as Python literals.
            VariableValue::Bool(true) => write!(f, "True"),
            VariableValue::Bool(false) => write!(f, "False"),
            VariableValue::Int(v) => write!(f, "{}", v),
            VariableValue::Float(v) => write!(f, "{:?}", v),
            VariableValue::Text(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<bool> for VariableValue {
    fn from(v: bool) -> Self {
        VariableValue::Bool(v)
    }
}

impl From<i64> for VariableValue {
    fn from(v: i64) -> Self {
        VariableValue::Int(v)
    }
}

impl From<i32> for VariableValue {
    fn from(v: i32) -> Self {
        VariableValue::Int(v as i64)
    }
}

impl From<f64> for VariableValue {
    fn from(v: f64) -> Self {
        VariableValue::Float(v)
    }
}

impl From<&str> for VariableValue {
    fn from(v: &str) -> Self {
        VariableValue::Text(v.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(v: String) -> Self {
        VariableValue::Text(v)
    }
}

impl VariableValue {
    /// Parse a literal typed by an operator
    ///
    /// Accepts Python or Rust booleans, integers and floats. Anything else,
    /// with surrounding quotes removed, is text.
    pub fn parse_literal(input: &str) -> Self {
        let input = input.trim();
        match input {
            "True" | "true" => return VariableValue::Bool(true),
            "False" | "false" => return VariableValue::Bool(false),
            _ => {}
        }
        if let Ok(v) = input.parse::<i64>() {
            return VariableValue::Int(v);
        }
        if let Ok(v) = input.parse::<f64>() {
            return VariableValue::Float(v);
        }
        let unquoted = input
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| input.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
            .unwrap_or(input);
        VariableValue::Text(unquoted.to_string())
    }
}

/// Counters for the current run, reset on every run start
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    /// Number of ticks performed
    pub ticks: u64,
    /// Raw frames read from the device
    pub frames_received: u64,
    pub states: u64,
    pub events: u64,
    pub prints: u64,
    pub analog_samples: u64,
    /// Handler hook calls that returned an error or panicked
    pub handler_faults: u64,
    /// Set-variable requests for undeclared names
    pub unknown_variable_errors: u64,
    /// Set-variable requests forwarded to the device
    pub variables_set: u64,
}

impl RunStats {
    /// Count the records of a delivered batch
    pub fn record_batch(&mut self, batch: &Batch) {
        self.states += batch.states.len() as u64;
        self.events += batch.events.len() as u64;
        self.prints += batch.prints.len() as u64;
        self.analog_samples += batch.analog.len() as u64;
    }

    /// Total records delivered to the handler
    pub fn total_records(&self) -> u64 {
        self.states + self.events + self.prints + self.analog_samples
    }

    /// Reset all counters
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
