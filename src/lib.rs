//! # TaskRun-RS: Host-side session runner for behavioural tasks
//!
//! Drives microcontroller boards running a state-machine task framework.
//! Each board is one session: connect, upload a task definition, run it,
//! and stream the classified state, event, print and analog records into a
//! user-supplied handler plugin once per tick.
//!
//! ## Architecture
//!
//! - **Device**: The [`DeviceLink`] trait hides the board's serial protocol
//! - **Session**: [`SessionController`] owns the lifecycle; [`SessionWorker`]
//!   drives it from its own thread
//! - **Dispatch**: [`FrameClassifier`] and [`DispatchPipeline`] turn raw frames
//!   into one [`Batch`] per tick
//! - **Handlers**: [`HandlerPlugin`] hooks, written in Rust or as Rhai scripts
//! - **Experiments**: [`ExperimentCoordinator`] wires handlers of several
//!   sessions together so they can address each other by subject
//!
//! ## Configuration
//!
//! The application config is stored in the platform-appropriate data
//! directory under `dev.taskrun.taskrun-rs`:
//!
//! - **Linux**: `~/.local/share/dev.taskrun.taskrun-rs/`
//! - **macOS**: `~/Library/Application Support/dev.taskrun.taskrun-rs/`
//! - **Windows**: `%APPDATA%\dev.taskrun.taskrun-rs\`
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use taskrun_rs::{
//!     config::AppConfig,
//!     device::MockDeviceBackend,
//!     handler::ScriptHandlerFactory,
//!     sink::TracingSink,
//!     SessionController, TaskDefinition,
//! };
//!
//! fn main() -> taskrun_rs::Result<()> {
//!     let config = AppConfig::load_or_default();
//!     let mut session = SessionController::new(
//!         Box::new(MockDeviceBackend::blinker()),
//!         Arc::new(ScriptHandlerFactory::new(&config.handlers_dir)),
//!         Arc::new(TracingSink),
//!         config.session.clone(),
//!     );
//!
//!     session.connect("/dev/ttyACM0")?;
//!     session.upload_task(&TaskDefinition::load("tasks/blinker.py")?)?;
//!     session.start_run(None)?;
//!     for _ in 0..100 {
//!         session.tick()?;
//!     }
//!     session.stop(false)
//! }
//! ```

pub mod classifier;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod experiment;
pub mod handler;
pub mod session;
pub mod sink;
pub mod task;
pub mod types;

// Re-export commonly used types
pub use classifier::{DataError, FrameClassifier};
pub use config::{AppConfig, ExperimentConfig, SessionConfig};
pub use device::DeviceLink;
pub use dispatch::DispatchPipeline;
pub use error::{Result, TaskRunError};
pub use experiment::{ExperimentContext, ExperimentCoordinator, ExperimentInfo, ExperimentRunner};
pub use handler::{HandlerContext, HandlerFactory, HandlerInstance, HandlerPlugin};
pub use session::{SessionController, SessionHandle, SessionState, SessionWorker, TaskFreshness};
pub use task::{Fingerprint, TaskDefinition};
pub use types::{Batch, ClassifiedRecord, DeviceIdentity, RawFrame, VariableValue};
