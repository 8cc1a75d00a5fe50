//! Multi-subject experiments
//!
//! An experiment runs several sessions side by side, one per subject. Each
//! session's handler is told which experiment it belongs to and, once every
//! handler has been told, gets handles to all of its peers.
//!
//! Wiring happens in two phases driven by [`ExperimentCoordinator`]:
//!
//! 1. [`ExperimentCoordinator::register_all`] binds every handler to its
//!    subject with an empty peer registry.
//! 2. [`ExperimentCoordinator::wire_peers`] gives every handler the handles
//!    of all the others.
//!
//! A peer lookup before phase 2 has completed is a
//! [`TaskRunError::PeerOrdering`] error. Peer handles are channel senders
//! into the peer's inbox; requests are applied by the peer's own session at
//! the start of its next tick, so instances never hold references to each
//! other.

pub mod runner;

use crate::error::{Result, TaskRunError};
use crate::handler::HandlerInstance;
use crate::types::VariableValue;
use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub use runner::ExperimentRunner;

/// Description of an experiment shared by all of its sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub name: String,
    /// Subject identities, one per session, in session order
    pub subjects: Vec<String>,
    /// Refuse to start a session until its peers are wired
    #[serde(default)]
    pub requires_peers: bool,
}

impl ExperimentInfo {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            requires_peers: false,
        }
    }

    pub fn requiring_peers(mut self) -> Self {
        self.requires_peers = true;
        self
    }
}

/// One session's place in an experiment
#[derive(Debug, Clone)]
pub struct ExperimentContext {
    info: Arc<ExperimentInfo>,
    index: usize,
}

impl ExperimentContext {
    /// Context for the subject at `index`
    pub fn new(info: Arc<ExperimentInfo>, index: usize) -> Result<Self> {
        if index >= info.subjects.len() {
            return Err(TaskRunError::Config(format!(
                "experiment {} has {} subjects, no index {}",
                info.name,
                info.subjects.len(),
                index
            )));
        }
        Ok(Self { info, index })
    }

    pub fn info(&self) -> &ExperimentInfo {
        &self.info
    }

    pub fn shared_info(&self) -> &Arc<ExperimentInfo> {
        &self.info
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn subject(&self) -> &str {
        &self.info.subjects[self.index]
    }

    /// Whether both contexts denote the same subject of the same experiment
    pub fn same_slot(&self, other: &ExperimentContext) -> bool {
        Arc::ptr_eq(&self.info, &other.info) && self.index == other.index
    }
}

/// A request one instance queues for a peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRequest {
    /// Subject of the sender
    pub from: String,
    pub kind: PeerRequestKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerRequestKind {
    /// Set a variable on the peer's device
    SetVariable { name: String, value: VariableValue },
    /// Deliver a message to the peer's `on_peer_message` hook
    Message(String),
}

impl std::fmt::Display for PeerRequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRequestKind::SetVariable { name, value } => write!(f, "set {} = {}", name, value),
            PeerRequestKind::Message(message) => write!(f, "message {:?}", message),
        }
    }
}

/// Handle to another instance in the same experiment
#[derive(Debug, Clone)]
pub struct PeerHandle {
    subject: String,
    index: usize,
    inbox: Sender<PeerRequest>,
}

impl PeerHandle {
    pub fn new(subject: impl Into<String>, index: usize, inbox: Sender<PeerRequest>) -> Self {
        Self {
            subject: subject.into(),
            index,
            inbox,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Queue a request in the peer's inbox
    pub fn send(&self, request: PeerRequest) -> Result<()> {
        self.inbox.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => {
                TaskRunError::Channel(format!("peer inbox of {} is full", self.subject))
            }
            TrySendError::Disconnected(_) => {
                TaskRunError::Channel(format!("peer {} is no longer running", self.subject))
            }
        })
    }
}

/// Handles to every other instance, keyed by subject
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerHandle>,
    wired: bool,
}

impl PeerRegistry {
    /// A registry that has not been wired yet
    pub fn unwired() -> Self {
        Self::default()
    }

    /// A wired registry holding `peers`
    pub fn wired(peers: impl IntoIterator<Item = PeerHandle>) -> Self {
        Self {
            peers: peers
                .into_iter()
                .map(|p| (p.subject.clone(), p))
                .collect(),
            wired: true,
        }
    }

    pub fn is_wired(&self) -> bool {
        self.wired
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Find a peer by subject
    pub fn lookup(&self, subject: &str) -> Result<&PeerHandle> {
        if !self.wired {
            return Err(TaskRunError::PeerOrdering(format!(
                "lookup of peer {} before peers were wired",
                subject
            )));
        }
        self.peers
            .get(subject)
            .ok_or_else(|| TaskRunError::UnknownPeer(subject.to_string()))
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }
}

/// An instance's experiment context and its view of the peers
#[derive(Debug, Clone)]
pub struct ExperimentBinding {
    context: ExperimentContext,
    peers: PeerRegistry,
}

impl ExperimentBinding {
    pub fn new(context: ExperimentContext) -> Self {
        Self {
            context,
            peers: PeerRegistry::unwired(),
        }
    }

    pub fn context(&self) -> &ExperimentContext {
        &self.context
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub(crate) fn set_peers(&mut self, peers: PeerRegistry) {
        self.peers = peers;
    }
}

/// Progress of the two-phase wiring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    Unregistered,
    Registered,
    Wired,
}

/// Drives the two-phase wiring of an experiment's handler instances
#[derive(Debug)]
pub struct ExperimentCoordinator {
    info: Arc<ExperimentInfo>,
    phase: CoordinatorPhase,
}

impl ExperimentCoordinator {
    pub fn new(info: Arc<ExperimentInfo>) -> Self {
        Self {
            info,
            phase: CoordinatorPhase::Unregistered,
        }
    }

    pub fn info(&self) -> &Arc<ExperimentInfo> {
        &self.info
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.phase
    }

    /// Phase 1: bind every instance to its subject
    ///
    /// `instances` must be in subject order. Every instance gets the shared
    /// experiment info, its own subject and an empty peer registry.
    pub fn register_all(&mut self, instances: &mut [&mut HandlerInstance]) -> Result<()> {
        self.check_count(instances.len())?;
        for (index, instance) in instances.iter_mut().enumerate() {
            let context = ExperimentContext::new(self.info.clone(), index)?;
            instance.bind_experiment(context)?;
        }
        self.phase = CoordinatorPhase::Registered;
        tracing::debug!(
            "Registered {} instances for experiment {}",
            instances.len(),
            self.info.name
        );
        Ok(())
    }

    /// Phase 2: give every instance handles to all the others
    pub fn wire_peers(&mut self, instances: &mut [&mut HandlerInstance]) -> Result<()> {
        if self.phase == CoordinatorPhase::Unregistered {
            return Err(TaskRunError::PeerOrdering(
                "wire_peers called before register_all".to_string(),
            ));
        }
        self.check_count(instances.len())?;

        let handles = instances
            .iter()
            .map(|i| i.peer_handle())
            .collect::<Result<Vec<_>>>()?;

        for instance in instances.iter_mut() {
            let own = instance.experiment().map(|c| c.index());
            let others = handles.iter().filter(|h| Some(h.index) != own).cloned();
            instance.wire_peers(PeerRegistry::wired(others))?;
        }
        self.phase = CoordinatorPhase::Wired;
        tracing::debug!("Wired peers for experiment {}", self.info.name);
        Ok(())
    }

    /// Forget wiring, e.g. after instances were replaced by a new upload
    pub fn reset(&mut self) {
        self.phase = CoordinatorPhase::Unregistered;
    }

    fn check_count(&self, count: usize) -> Result<()> {
        if count != self.info.subjects.len() {
            return Err(TaskRunError::Config(format!(
                "experiment {} has {} subjects but {} handler instances were given",
                self.info.name,
                self.info.subjects.len(),
                count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoopHandler;

    fn info() -> Arc<ExperimentInfo> {
        Arc::new(ExperimentInfo::new(
            "pair",
            vec!["m1".to_string(), "m2".to_string(), "m3".to_string()],
        ))
    }

    fn instances(n: usize) -> Vec<HandlerInstance> {
        (0..n)
            .map(|_| HandlerInstance::new(Box::new(NoopHandler)))
            .collect()
    }

    #[test]
    fn test_register_all_assigns_subjects_and_empty_registry() {
        let mut owned = instances(3);
        let mut refs: Vec<&mut HandlerInstance> = owned.iter_mut().collect();
        let mut coordinator = ExperimentCoordinator::new(info());
        coordinator.register_all(&mut refs).unwrap();

        for (i, instance) in owned.iter().enumerate() {
            let ctx = instance.experiment().unwrap();
            assert_eq!(ctx.index(), i);
            assert_eq!(ctx.info().name, "pair");
            assert!(!instance.peers_wired());
            assert!(matches!(
                instance.lookup_peer("m1"),
                Err(TaskRunError::PeerOrdering(_))
            ));
        }
        assert_eq!(owned[1].experiment().unwrap().subject(), "m2");
        assert_eq!(coordinator.phase(), CoordinatorPhase::Registered);
    }

    #[test]
    fn test_wire_peers_gives_every_other_instance() {
        let mut owned = instances(3);
        let mut coordinator = ExperimentCoordinator::new(info());
        {
            let mut refs: Vec<&mut HandlerInstance> = owned.iter_mut().collect();
            coordinator.register_all(&mut refs).unwrap();
            coordinator.wire_peers(&mut refs).unwrap();
        }

        let first = &owned[0];
        assert_eq!(first.lookup_peer("m2").unwrap().index(), 1);
        assert_eq!(first.lookup_peer("m3").unwrap().subject(), "m3");
        assert!(matches!(
            first.lookup_peer("m1"),
            Err(TaskRunError::UnknownPeer(_))
        ));
        assert_eq!(coordinator.phase(), CoordinatorPhase::Wired);
    }

    #[test]
    fn test_wire_peers_excludes_self_in_any_order() {
        let mut owned = instances(3);
        let mut coordinator = ExperimentCoordinator::new(info());
        {
            let mut refs: Vec<&mut HandlerInstance> = owned.iter_mut().collect();
            coordinator.register_all(&mut refs).unwrap();
            refs.reverse();
            coordinator.wire_peers(&mut refs).unwrap();
        }

        for (i, instance) in owned.iter().enumerate() {
            for (j, subject) in ["m1", "m2", "m3"].iter().enumerate() {
                let peer = instance.lookup_peer(subject);
                if i == j {
                    assert!(matches!(peer, Err(TaskRunError::UnknownPeer(_))));
                } else {
                    assert_eq!(peer.unwrap().index(), j);
                }
            }
        }
    }

    #[test]
    fn test_wire_before_register_is_rejected() {
        let mut owned = instances(3);
        let mut refs: Vec<&mut HandlerInstance> = owned.iter_mut().collect();
        let mut coordinator = ExperimentCoordinator::new(info());
        assert!(matches!(
            coordinator.wire_peers(&mut refs),
            Err(TaskRunError::PeerOrdering(_))
        ));
    }

    #[test]
    fn test_count_mismatch_is_rejected() {
        let mut owned = instances(2);
        let mut refs: Vec<&mut HandlerInstance> = owned.iter_mut().collect();
        let mut coordinator = ExperimentCoordinator::new(info());
        assert!(matches!(
            coordinator.register_all(&mut refs),
            Err(TaskRunError::Config(_))
        ));
    }

    #[test]
    fn test_peer_requests_reach_the_inbox() {
        let mut owned = instances(3);
        let mut coordinator = ExperimentCoordinator::new(info());
        {
            let mut refs: Vec<&mut HandlerInstance> = owned.iter_mut().collect();
            coordinator.register_all(&mut refs).unwrap();
            coordinator.wire_peers(&mut refs).unwrap();
        }

        owned[0]
            .lookup_peer("m3")
            .unwrap()
            .send(PeerRequest {
                from: "m1".into(),
                kind: PeerRequestKind::Message("reward".into()),
            })
            .unwrap();

        let received = owned[2].drain_peer_requests();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].from, "m1");
        assert!(owned[1].drain_peer_requests().is_empty());
    }

    #[test]
    fn test_context_index_bounds() {
        assert!(ExperimentContext::new(info(), 3).is_err());
    }
}
