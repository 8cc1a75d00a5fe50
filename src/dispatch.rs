//! Dispatch pipeline
//!
//! Collects the frames read during one tick into a [`Batch`] and hands it to
//! the active handler. A batch is delivered on every tick, even when empty,
//! so handlers see a steady cadence without special-casing idle ticks.
//!
//! Ingest is all-or-nothing: the first frame that fails to classify aborts
//! the batch with a [`DataError`] and nothing from it is delivered.

use crate::classifier::{DataError, FrameClassifier};
use crate::handler::{HandlerEnv, HandlerInstance};
use crate::types::{Batch, DeviceIdentity, RawFrame};
use std::sync::Arc;

/// Classifies raw frames and delivers batches to a handler
#[derive(Debug, Clone, Default)]
pub struct DispatchPipeline {
    classifier: FrameClassifier,
}

impl DispatchPipeline {
    /// Create a pipeline for an identity
    pub fn new(identity: Arc<DeviceIdentity>) -> Self {
        Self {
            classifier: FrameClassifier::new(identity),
        }
    }

    /// Replace the identity after a new upload
    pub fn set_identity(&mut self, identity: Arc<DeviceIdentity>) {
        self.classifier.set_identity(identity);
    }

    /// The classifier used for ingest
    pub fn classifier(&self) -> &FrameClassifier {
        &self.classifier
    }

    /// Classify every frame into one batch, preserving order within each kind
    pub fn ingest<'a, I>(&self, frames: I) -> Result<Batch, DataError>
    where
        I: IntoIterator<Item = &'a RawFrame>,
    {
        let mut batch = Batch::new();
        for frame in frames {
            batch.push(self.classifier.classify(frame)?);
        }
        Ok(batch)
    }

    /// Call the handler's `on_data` hook exactly once with `batch`
    ///
    /// Handler failures are isolated by [`HandlerInstance::invoke`]; the
    /// pipeline itself cannot fail here.
    pub fn deliver(&self, batch: &Batch, handler: &mut HandlerInstance, env: HandlerEnv<'_>) {
        tracing::trace!("Delivering batch of {} records", batch.len());
        handler.invoke("on_data", env, |plugin, ctx| plugin.on_data(batch, ctx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerContext, HandlerPlugin, TestContextParts};

    #[derive(Default)]
    struct CountingHandler {
        calls: std::sync::Arc<std::sync::Mutex<Vec<usize>>>,
    }

    impl HandlerPlugin for CountingHandler {
        fn on_data(&mut self, batch: &Batch, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(batch.len());
            Ok(())
        }
    }

    fn pipeline() -> DispatchPipeline {
        DispatchPipeline::new(Arc::new(
            DeviceIdentity::new("t")
                .with_state(1, "ITI")
                .with_state(2, "trial")
                .with_event(3, "poke")
                .with_analog(1, "lick"),
        ))
    }

    #[test]
    fn test_ingest_empty() {
        let batch = pipeline().ingest(std::iter::empty()).unwrap();
        assert!(batch.states.is_empty());
        assert!(batch.events.is_empty());
        assert!(batch.prints.is_empty());
        assert!(batch.analog.is_empty());
    }

    #[test]
    fn test_ingest_preserves_intra_kind_order() {
        let frames = vec![
            RawFrame::Digital { time: 1, id: 2 },
            RawFrame::Print { time: 2, text: "a".into() },
            RawFrame::Digital { time: 3, id: 3 },
            RawFrame::Digital { time: 4, id: 1 },
            RawFrame::Print { time: 5, text: "b".into() },
            RawFrame::Analog { channel: 1, time: 6, value: 0.5 },
        ];
        let batch = pipeline().ingest(&frames).unwrap();

        let states: Vec<_> = batch.states.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(states, vec!["trial", "ITI"]);
        let prints: Vec<_> = batch.prints.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(prints, vec!["a", "b"]);
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.analog[0].channel, "lick");
    }

    #[test]
    fn test_ingest_fails_on_unknown_frame() {
        let frames = vec![
            RawFrame::Digital { time: 1, id: 1 },
            RawFrame::Digital { time: 2, id: 42 },
        ];
        assert_eq!(
            pipeline().ingest(&frames),
            Err(DataError::UnknownDigitalId { id: 42, time: 2 })
        );
    }

    #[test]
    fn test_deliver_calls_on_data_once_for_empty_batch() {
        let handler = CountingHandler::default();
        let calls = handler.calls.clone();
        let mut instance = HandlerInstance::new(Box::new(handler));
        let mut parts = TestContextParts::new(DeviceIdentity::default());

        let pipeline = pipeline();
        let batch = pipeline.ingest(std::iter::empty()).unwrap();
        pipeline.deliver(&batch, &mut instance, parts.env());

        assert_eq!(*calls.lock().unwrap(), vec![0]);
    }
}
