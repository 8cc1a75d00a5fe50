//! Handler plugins
//!
//! A handler is user code that reacts to a session's data. It implements
//! [`HandlerPlugin`], overriding only the hooks it cares about; every hook
//! defaults to doing nothing.
//!
//! Hooks receive a [`HandlerContext`] through which they can set task
//! variables, write to the operator log and, when the session is part of an
//! experiment, reach their peers.
//!
//! The session wraps each plugin in a [`HandlerInstance`]. The instance owns
//! the experiment binding and the peer inbox, and isolates failures: a hook
//! that returns an error or panics is logged as a handler fault and the
//! session carries on.
//!
//! # Factories
//!
//! A fresh plugin is created for every upload by a [`HandlerFactory`]. The
//! stock factories are [`NoopHandlerFactory`] and
//! [`script::ScriptHandlerFactory`], which loads a Rhai script named after
//! the task.

pub mod script;

use crate::device::DeviceLink;
use crate::error::{Result, TaskRunError};
use crate::experiment::{
    ExperimentBinding, ExperimentContext, PeerHandle, PeerRegistry, PeerRequest, PeerRequestKind,
};
use crate::session::controller::forward_set_variable;
use crate::sink::LogSink;
use crate::task::TaskDefinition;
use crate::types::{Batch, DeviceIdentity, RunStats, VariableValue};
use crossbeam_channel::{Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};

pub use script::{ScriptHandler, ScriptHandlerFactory};

/// Capacity of each instance's peer inbox
pub const PEER_INBOX_CAPACITY: usize = 256;

/// User code reacting to a session's lifecycle and data
///
/// All hooks default to a no-op. An `Err` or a panic from any hook is
/// reported as a handler fault and does not interrupt the session.
pub trait HandlerPlugin: Send {
    /// Called once after a task has been uploaded
    fn on_load(&mut self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when a run starts, before the first tick
    fn on_run_start(&mut self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when a run stops, after the final drain
    fn on_run_stop(&mut self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called exactly once per tick with the records read during that tick
    fn on_data(&mut self, _batch: &Batch, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once per tick after `on_data`
    fn on_tick(&mut self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when a peer in the same experiment sent a message
    fn on_peer_message(
        &mut self,
        _from: &str,
        _message: &str,
        _ctx: &mut HandlerContext<'_>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handler that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl HandlerPlugin for NoopHandler {}

/// Session resources a hook may use, borrowed for one hook call
pub struct HandlerEnv<'a> {
    pub link: &'a mut dyn DeviceLink,
    pub identity: &'a DeviceIdentity,
    pub sink: &'a dyn LogSink,
    pub stats: &'a mut RunStats,
}

/// What a hook can do to its session
pub struct HandlerContext<'a> {
    link: &'a mut dyn DeviceLink,
    identity: &'a DeviceIdentity,
    sink: &'a dyn LogSink,
    stats: &'a mut RunStats,
    experiment: Option<&'a ExperimentBinding>,
}

impl<'a> HandlerContext<'a> {
    /// Identity of the uploaded task
    pub fn identity(&self) -> &DeviceIdentity {
        self.identity
    }

    /// Counters of the current run
    pub fn stats(&self) -> &RunStats {
        &*self.stats
    }

    /// Set a task variable on this session's device
    ///
    /// Returns whether the value was forwarded. An undeclared name is soft:
    /// it is logged and counted, nothing is sent, and `Ok(false)` comes
    /// back. Only a device failure is an error.
    pub fn set_variable(&mut self, name: &str, value: impl Into<VariableValue>) -> Result<bool> {
        match forward_set_variable(
            &mut *self.link,
            self.identity,
            self.sink,
            &mut *self.stats,
            name,
            &value.into(),
        ) {
            Ok(()) => Ok(true),
            Err(TaskRunError::UnknownVariable { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write a line to the operator log
    pub fn log(&self, line: &str) {
        self.sink.write_line(line);
    }

    /// Experiment context, if this session belongs to one
    pub fn experiment(&self) -> Option<&ExperimentContext> {
        self.experiment.map(|b| b.context())
    }

    /// Subject identity within the experiment
    pub fn subject(&self) -> Option<&str> {
        self.experiment().map(|c| c.subject())
    }

    /// Find the handle of another instance in the same experiment
    pub fn lookup_peer(&self, subject: &str) -> Result<&PeerHandle> {
        let binding = self.experiment.ok_or_else(|| {
            TaskRunError::PeerOrdering("session is not part of an experiment".to_string())
        })?;
        binding.peers().lookup(subject)
    }

    /// Ask a peer's session to set one of its variables
    pub fn peer_set_variable(
        &self,
        subject: &str,
        name: &str,
        value: impl Into<VariableValue>,
    ) -> Result<()> {
        let from = self.subject().unwrap_or_default().to_string();
        self.lookup_peer(subject)?.send(PeerRequest {
            from,
            kind: PeerRequestKind::SetVariable {
                name: name.to_string(),
                value: value.into(),
            },
        })
    }

    /// Send a message to a peer's handler
    pub fn notify_peer(&self, subject: &str, message: &str) -> Result<()> {
        let from = self.subject().unwrap_or_default().to_string();
        self.lookup_peer(subject)?.send(PeerRequest {
            from,
            kind: PeerRequestKind::Message(message.to_string()),
        })
    }
}

/// A plugin bound to one session
pub struct HandlerInstance {
    plugin: Box<dyn HandlerPlugin>,
    experiment: Option<ExperimentBinding>,
    inbox_tx: Sender<PeerRequest>,
    inbox_rx: Receiver<PeerRequest>,
    faults: u64,
}

impl HandlerInstance {
    pub fn new(plugin: Box<dyn HandlerPlugin>) -> Self {
        let (inbox_tx, inbox_rx) = crossbeam_channel::bounded(PEER_INBOX_CAPACITY);
        Self {
            plugin,
            experiment: None,
            inbox_tx,
            inbox_rx,
            faults: 0,
        }
    }

    /// Run one hook with failures isolated
    ///
    /// Returns `false` if the hook returned an error or panicked. The fault
    /// is logged, counted and written to the operator log.
    pub fn invoke<F>(&mut self, hook: &'static str, env: HandlerEnv<'_>, f: F) -> bool
    where
        F: FnOnce(&mut dyn HandlerPlugin, &mut HandlerContext<'_>) -> anyhow::Result<()>,
    {
        let mut ctx = HandlerContext {
            link: env.link,
            identity: env.identity,
            sink: env.sink,
            stats: env.stats,
            experiment: self.experiment.as_ref(),
        };
        let plugin = self.plugin.as_mut();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(plugin, &mut ctx)));
        let message = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => panic_message(payload.as_ref()),
        };

        let err = TaskRunError::HandlerFault { hook, message };
        tracing::error!("{}", err);
        ctx.sink.write_line(&err.to_string());
        ctx.stats.handler_faults += 1;
        self.faults += 1;
        false
    }

    /// Hook failures over the lifetime of this instance
    pub fn fault_count(&self) -> u64 {
        self.faults
    }

    /// Bind to an experiment with an empty, unwired peer registry
    ///
    /// Binding again to the same experiment slot is a no-op; binding to a
    /// different one is an ordering error.
    pub fn bind_experiment(&mut self, context: ExperimentContext) -> Result<()> {
        if let Some(existing) = &self.experiment {
            if existing.context().same_slot(&context) {
                return Ok(());
            }
            return Err(TaskRunError::PeerOrdering(format!(
                "handler already bound to subject {} of experiment {}",
                existing.context().subject(),
                existing.context().info().name
            )));
        }
        self.experiment = Some(ExperimentBinding::new(context));
        Ok(())
    }

    /// Install the peer registry once every instance is bound
    pub fn wire_peers(&mut self, registry: PeerRegistry) -> Result<()> {
        let binding = self.experiment.as_mut().ok_or_else(|| {
            TaskRunError::PeerOrdering("wire_peers called before register_all".to_string())
        })?;
        binding.set_peers(registry);
        Ok(())
    }

    /// Experiment this instance belongs to
    pub fn experiment(&self) -> Option<&ExperimentContext> {
        self.experiment.as_ref().map(|b| b.context())
    }

    /// Whether the experiment requires wired peers and they are not wired yet
    pub fn awaiting_peers(&self) -> bool {
        self.experiment
            .as_ref()
            .map(|b| b.context().info().requires_peers && !b.peers().is_wired())
            .unwrap_or(false)
    }

    pub fn peers_wired(&self) -> bool {
        self.experiment
            .as_ref()
            .map(|b| b.peers().is_wired())
            .unwrap_or(false)
    }

    /// Find another instance in the same experiment
    pub fn lookup_peer(&self, subject: &str) -> Result<&PeerHandle> {
        self.experiment
            .as_ref()
            .ok_or_else(|| {
                TaskRunError::PeerOrdering("session is not part of an experiment".to_string())
            })?
            .peers()
            .lookup(subject)
    }

    /// Handle other instances use to reach this one
    pub fn peer_handle(&self) -> Result<PeerHandle> {
        let context = self.experiment().ok_or_else(|| {
            TaskRunError::PeerOrdering("handler has no experiment subject yet".to_string())
        })?;
        Ok(PeerHandle::new(
            context.subject(),
            context.index(),
            self.inbox_tx.clone(),
        ))
    }

    /// Take every request peers queued since the last call
    pub fn drain_peer_requests(&self) -> Vec<PeerRequest> {
        self.inbox_rx.try_iter().collect()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Creates a fresh plugin for each upload
pub trait HandlerFactory: Send + Sync {
    fn create(&self, task: &TaskDefinition) -> Result<Box<dyn HandlerPlugin>>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&TaskDefinition) -> Result<Box<dyn HandlerPlugin>> + Send + Sync,
{
    fn create(&self, task: &TaskDefinition) -> Result<Box<dyn HandlerPlugin>> {
        self(task)
    }
}

/// Factory producing [`NoopHandler`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandlerFactory;

impl HandlerFactory for NoopHandlerFactory {
    fn create(&self, _task: &TaskDefinition) -> Result<Box<dyn HandlerPlugin>> {
        Ok(Box::new(NoopHandler))
    }
}

/// Owned pieces for building a [`HandlerEnv`] in unit tests
#[cfg(test)]
pub(crate) struct TestContextParts {
    pub link: crate::device::MockDeviceLink,
    pub identity: DeviceIdentity,
    pub sink: crate::sink::MemorySink,
    pub stats: RunStats,
}

#[cfg(test)]
impl TestContextParts {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            link: crate::device::MockDeviceLink::new(),
            identity,
            sink: crate::sink::MemorySink::new(),
            stats: RunStats::default(),
        }
    }

    pub fn env(&mut self) -> HandlerEnv<'_> {
        HandlerEnv {
            link: &mut self.link,
            identity: &self.identity,
            sink: &self.sink,
            stats: &mut self.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ExperimentInfo;
    use std::sync::Arc;

    struct Failing;

    impl HandlerPlugin for Failing {
        fn on_load(&mut self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("bad load")
        }

        fn on_tick(&mut self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
            panic!("tick exploded")
        }
    }

    #[derive(Default)]
    struct Setter {
        forwarded: Vec<bool>,
    }

    impl HandlerPlugin for Setter {
        fn on_data(&mut self, _batch: &Batch, ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
            let forwarded = ctx.set_variable("A", 3)?;
            self.forwarded.push(forwarded);
            Ok(())
        }
    }

    #[test]
    fn test_default_hooks_are_noops() {
        let mut instance = HandlerInstance::new(Box::new(NoopHandler));
        let mut parts = TestContextParts::new(DeviceIdentity::default());

        assert!(instance.invoke("on_load", parts.env(), |p, ctx| p.on_load(ctx)));
        assert!(instance.invoke("on_data", parts.env(), |p, ctx| p.on_data(&Batch::new(), ctx)));
        assert!(instance.invoke("on_peer_message", parts.env(), |p, ctx| {
            p.on_peer_message("s2", "hi", ctx)
        }));
        assert_eq!(parts.stats.handler_faults, 0);
        assert!(parts.sink.lines().is_empty());
    }

    #[test]
    fn test_errors_and_panics_are_isolated() {
        let mut instance = HandlerInstance::new(Box::new(Failing));
        let mut parts = TestContextParts::new(DeviceIdentity::default());

        assert!(!instance.invoke("on_load", parts.env(), |p, ctx| p.on_load(ctx)));
        assert!(!instance.invoke("on_tick", parts.env(), |p, ctx| p.on_tick(ctx)));
        // later hooks still run
        assert!(instance.invoke("on_run_stop", parts.env(), |p, ctx| p.on_run_stop(ctx)));

        assert_eq!(parts.stats.handler_faults, 2);
        assert_eq!(instance.fault_count(), 2);
        assert!(parts.sink.contains("Handler fault in on_load: bad load"));
        assert!(parts.sink.contains("tick exploded"));
    }

    #[test]
    fn test_set_variable_forwards_declared_name() {
        let mut instance = HandlerInstance::new(Box::new(Setter::default()));
        let mut parts = TestContextParts::new(DeviceIdentity::new("t").with_variable("A", "0"));
        parts
            .link
            .expect_set_variable()
            .withf(|name, value| name == "A" && *value == VariableValue::Int(3))
            .times(1)
            .returning(|_, _| Ok(()));

        assert!(instance.invoke("on_data", parts.env(), |p, ctx| p.on_data(&Batch::new(), ctx)));
        assert_eq!(parts.stats.variables_set, 1);
    }

    #[test]
    fn test_set_variable_unknown_name_is_soft_for_the_hook() {
        let mut setter = Setter::default();
        let mut parts = TestContextParts::new(DeviceIdentity::new("t"));
        parts.link.expect_set_variable().times(0);
        let env = parts.env();
        let mut ctx = HandlerContext {
            link: env.link,
            identity: env.identity,
            sink: env.sink,
            stats: env.stats,
            experiment: None,
        };

        // `?` on an undeclared name does not abort the hook
        assert!(setter.on_data(&Batch::new(), &mut ctx).is_ok());
        assert_eq!(setter.forwarded, vec![false]);
        assert_eq!(parts.stats.unknown_variable_errors, 1);
        assert_eq!(parts.stats.handler_faults, 0);
        assert!(parts.sink.contains("Variable A not defined in task file t"));
    }

    #[test]
    fn test_set_variable_device_failure_is_a_fault_for_the_hook() {
        let mut instance = HandlerInstance::new(Box::new(Setter::default()));
        let mut parts = TestContextParts::new(DeviceIdentity::new("t").with_variable("A", "0"));
        parts
            .link
            .expect_set_variable()
            .times(1)
            .returning(|_, _| Err(TaskRunError::Protocol("rejected".into())));

        assert!(!instance.invoke("on_data", parts.env(), |p, ctx| p.on_data(&Batch::new(), ctx)));
        assert_eq!(parts.stats.handler_faults, 1);
        assert_eq!(parts.stats.variables_set, 0);
    }

    #[test]
    fn test_lookup_before_wiring_is_ordering_error() {
        let info = Arc::new(ExperimentInfo::new("exp", vec!["s1".into(), "s2".into()]));
        let mut instance = HandlerInstance::new(Box::new(NoopHandler));

        assert!(matches!(
            instance.lookup_peer("s2"),
            Err(TaskRunError::PeerOrdering(_))
        ));

        instance
            .bind_experiment(ExperimentContext::new(info.clone(), 0).unwrap())
            .unwrap();
        assert!(matches!(
            instance.lookup_peer("s2"),
            Err(TaskRunError::PeerOrdering(_))
        ));

        // same slot again is fine, a different slot is not
        assert!(instance
            .bind_experiment(ExperimentContext::new(info.clone(), 0).unwrap())
            .is_ok());
        assert!(instance
            .bind_experiment(ExperimentContext::new(info, 1).unwrap())
            .is_err());
    }

    #[test]
    fn test_closure_factory() {
        let factory = |task: &TaskDefinition| -> Result<Box<dyn HandlerPlugin>> {
            if task.name == "broken" {
                Err(TaskRunError::Script("no handler".into()))
            } else {
                Ok(Box::new(NoopHandler))
            }
        };
        assert!(factory.create(&TaskDefinition::new("ok", "")).is_ok());
        assert!(factory.create(&TaskDefinition::new("broken", "")).is_err());
        assert!(NoopHandlerFactory.create(&TaskDefinition::new("x", "")).is_ok());
    }
}
