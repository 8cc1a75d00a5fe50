//! Session control
//!
//! A session is one host-side connection to one board. The
//! [`SessionController`] owns the lifecycle (connect, upload, run, stop)
//! and the per-tick read/classify/deliver cycle. [`SessionWorker`] drives a
//! controller from a background thread and exposes it through a
//! [`SessionHandle`].
//!
//! # Threading
//!
//! ```text
//! caller thread                       worker thread
//! SessionHandle --SessionCommand-->   SessionWorker
//!               <--SessionMessage--     └─ SessionController
//!                                            ├─ DeviceLink
//!                                            ├─ DispatchPipeline
//!                                            └─ HandlerInstance
//! ```

pub mod controller;
pub mod state;
pub mod worker;

pub use controller::{SessionController, TaskFreshness};
pub use state::SessionState;
pub use worker::{SessionCommand, SessionHandle, SessionMessage, SessionWorker};
