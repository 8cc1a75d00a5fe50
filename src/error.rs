//! Error handling for the task runner
//!
//! This module defines the error taxonomy shared by the session controller,
//! the frame classifier and device links, plus a Result alias for use
//! throughout the crate.
//!
//! # Taxonomy
//!
//! - [`TaskRunError::Connection`] - device unreachable, session stays Disconnected
//! - [`TaskRunError::Protocol`] - device rejected upload/start/stop/set-variable
//! - [`TaskRunError::UnknownVariable`] - soft, logged only
//! - [`TaskRunError::RuntimeData`] - malformed frame, fatal to the current run
//! - [`TaskRunError::HandlerFault`] - plugin code failed, isolated per call

use crate::classifier::DataError;
use crate::session::SessionState;
use thiserror::Error;

/// Main error type for task runner operations
#[derive(Error, Debug)]
pub enum TaskRunError {
    /// The device could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The device rejected a request (upload, start, stop, set-variable)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A handler tried to set a variable the task does not declare
    #[error("Variable {name} not defined in task file {task} so cannot be set")]
    UnknownVariable { name: String, task: String },

    /// A frame could not be decoded against the current device identity
    #[error("Runtime data error: {0}")]
    RuntimeData(#[from] DataError),

    /// Handler plugin code returned an error or panicked
    #[error("Handler fault in {hook}: {message}")]
    HandlerFault { hook: &'static str, message: String },

    /// An operation was called from a state that does not allow it
    #[error("Cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: SessionState,
    },

    /// Peer lookup attempted before every experiment instance was wired
    #[error("Peer ordering error: {0}")]
    PeerOrdering(String),

    /// No experiment peer with the requested subject
    #[error("No peer with subject {0}")]
    UnknownPeer(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to Rhai script compilation or execution
    #[error("Script error: {0}")]
    Script(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<TaskRunError>,
    },
}

/// Coarse classification used when reporting errors to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connection,
    Protocol,
    UnknownVariable,
    RuntimeData,
    HandlerFault,
    /// Illegal call ordering by the caller
    Usage,
    Internal,
}

impl TaskRunError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        TaskRunError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a script error from a Rhai error
    pub fn from_rhai_error(err: Box<rhai::EvalAltResult>) -> Self {
        TaskRunError::Script(err.to_string())
    }

    /// Category of the innermost error
    pub fn category(&self) -> ErrorCategory {
        match self {
            TaskRunError::Connection(_) => ErrorCategory::Connection,
            TaskRunError::Protocol(_) => ErrorCategory::Protocol,
            TaskRunError::UnknownVariable { .. } => ErrorCategory::UnknownVariable,
            TaskRunError::RuntimeData(_) => ErrorCategory::RuntimeData,
            TaskRunError::HandlerFault { .. } => ErrorCategory::HandlerFault,
            TaskRunError::InvalidTransition { .. }
            | TaskRunError::PeerOrdering(_)
            | TaskRunError::UnknownPeer(_) => ErrorCategory::Usage,
            TaskRunError::WithContext { source, .. } => source.category(),
            TaskRunError::Config(_)
            | TaskRunError::Script(_)
            | TaskRunError::Channel(_)
            | TaskRunError::Io(_) => ErrorCategory::Internal,
        }
    }

    /// Whether this error ends the current run
    pub fn is_fatal_to_run(&self) -> bool {
        self.category() == ErrorCategory::RuntimeData
    }
}

/// Result type alias for task runner operations
pub type Result<T> = std::result::Result<T, TaskRunError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, Box<rhai::EvalAltResult>> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| TaskRunError::from_rhai_error(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| TaskRunError::from_rhai_error(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TaskRunError::UnknownVariable {
            name: "C".to_string(),
            task: "blinker".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Variable C not defined in task file blinker so cannot be set"
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = TaskRunError::Protocol("compile failed".to_string());
        let with_ctx = err.with_context("Upload failed");
        assert!(with_ctx.to_string().contains("Upload failed"));
        assert_eq!(with_ctx.category(), ErrorCategory::Protocol);
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = TaskRunError::InvalidTransition {
            operation: "upload task",
            state: SessionState::Disconnected,
        };
        assert_eq!(err.to_string(), "Cannot upload task while Disconnected");
        assert_eq!(err.category(), ErrorCategory::Usage);
    }

    #[test]
    fn test_only_runtime_data_is_fatal() {
        let data = TaskRunError::RuntimeData(DataError::UnknownDigitalId { id: 9, time: 10 });
        assert!(data.is_fatal_to_run());
        assert!(!TaskRunError::Protocol("x".into()).is_fatal_to_run());
        assert!(!TaskRunError::Connection("x".into()).is_fatal_to_run());
    }
}
