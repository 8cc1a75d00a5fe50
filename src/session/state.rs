//! Session lifecycle states

use crate::task::Fingerprint;
use std::fmt;

/// Where a session is in its lifecycle
///
/// ```text
/// Disconnected --connect--> Connected --upload--> Uploaded --start--> Running
///      ^                                            ^  |                 |
///      |                                            +--+ (re-upload)     |
///      +------------------- disconnect (any state) -+<------ stop -------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connected,
    /// A task is uploaded and ready to run
    Uploaded { fingerprint: Fingerprint },
    /// The uploaded task is running on the device
    Running { fingerprint: Fingerprint },
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running { .. })
    }

    /// Whether a task is uploaded (running or not)
    pub fn has_task(&self) -> bool {
        matches!(
            self,
            SessionState::Uploaded { .. } | SessionState::Running { .. }
        )
    }

    /// Fingerprint of the uploaded task
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        match self {
            SessionState::Uploaded { fingerprint } | SessionState::Running { fingerprint } => {
                Some(*fingerprint)
            }
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connected => "Connected",
            SessionState::Uploaded { .. } => "Uploaded",
            SessionState::Running { .. } => "Running",
        };
        f.write_str(name)
    }
}
