//! Device link layer
//!
//! The session controller talks to a board exclusively through the
//! [`DeviceLink`] trait. The byte-level transport (serial framing, the
//! board's REPL protocol, file transfer) lives behind implementations of
//! this trait and is not part of this crate.
//!
//! # Components
//!
//! - [`DeviceLink`] - Unified interface to a board running the task framework
//! - [`MockDeviceBackend`] - Simulated board for testing without hardware (feature-gated)
//!
//! # Error classification
//!
//! Implementations report failures as [`TaskRunError::Connection`] when
//! the board cannot be reached and [`TaskRunError::Protocol`] when it is
//! reachable but rejects the request.
//!
//! [`TaskRunError::Connection`]: crate::error::TaskRunError::Connection
//! [`TaskRunError::Protocol`]: crate::error::TaskRunError::Protocol

pub mod link_trait;
#[cfg(feature = "mock-device")]
pub mod mock_device;

pub use link_trait::DeviceLink;

#[cfg(test)]
pub use link_trait::MockDeviceLink;

#[cfg(feature = "mock-device")]
pub use mock_device::{
    blinker_identity, MockDeviceBackend, MockDeviceHandle, MockFailure, MockFramePattern,
};
