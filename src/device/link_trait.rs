//! DeviceLink trait for a unified board interface
//!
//! This module provides the common trait for board connections, enabling
//! both real transports and simulated boards for testing.

use crate::error::Result;
use crate::task::{Fingerprint, TaskDefinition};
use crate::types::{DeviceIdentity, RawFrame, VariableValue};

/// Unified interface to a board running the state-machine framework
///
/// Implementations must be `Send` so a session can be driven from a worker
/// thread.
///
/// # Example
///
/// ```ignore
/// fn upload(link: &mut dyn DeviceLink, task: &TaskDefinition) -> Result<DeviceIdentity> {
///     link.upload_task(task.fingerprint(), task)
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait DeviceLink: Send {
    /// Open the connection to the board on `port`
    ///
    /// Returns the identity currently known for the board, which is empty
    /// until a task has been uploaded.
    fn connect(&mut self, port: &str) -> Result<DeviceIdentity>;

    /// Release the board
    fn disconnect(&mut self);

    /// Check whether the board is still reachable
    fn is_connected(&self) -> bool;

    /// Transfer (if needed) and set up a task
    ///
    /// The fingerprint lets the board skip the transfer when it already
    /// holds identical source. On success returns the identity of the new
    /// state machine.
    fn upload_task(&mut self, fingerprint: Fingerprint, task: &TaskDefinition) -> Result<DeviceIdentity>;

    /// Start the uploaded state machine
    fn start_run(&mut self) -> Result<()>;

    /// Stop the running state machine
    fn stop_run(&mut self) -> Result<()>;

    /// Return every frame received since the last call without blocking
    ///
    /// Returns an empty vector when nothing is pending.
    fn read_pending_frames(&mut self) -> Result<Vec<RawFrame>>;

    /// Set a task variable on the board
    fn set_variable(&mut self, name: &str, value: &VariableValue) -> Result<()>;
}
