//! Frame classification
//!
//! Turns [`RawFrame`]s into [`ClassifiedRecord`]s using the name tables of the
//! task currently uploaded. Classification is a pure function of the frame
//! and the identity: it never looks at earlier frames, so each frame can be
//! classified (and tested) on its own.
//!
//! A digital frame always resolves to exactly one of state or event. An ID
//! or analog channel the identity does not know is a [`DataError`], which
//! the session treats as fatal to the run.

use crate::types::{
    AnalogRecord, ClassifiedRecord, DeviceIdentity, DeviceTime, EventRecord, PrintRecord,
    RawFrame, StateRecord,
};
use std::sync::Arc;
use thiserror::Error;

/// A frame that cannot be resolved against the current identity
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("unrecognised digital ID {id} at t={time}")]
    UnknownDigitalId { id: u32, time: DeviceTime },

    #[error("unrecognised analog channel {channel} at t={time}")]
    UnknownAnalogChannel { channel: u32, time: DeviceTime },
}

/// Classifies frames against a fixed [`DeviceIdentity`]
#[derive(Debug, Clone, Default)]
pub struct FrameClassifier {
    identity: Arc<DeviceIdentity>,
}

impl FrameClassifier {
    /// Create a classifier for an identity
    pub fn new(identity: Arc<DeviceIdentity>) -> Self {
        Self { identity }
    }

    /// Replace the identity after a new upload
    pub fn set_identity(&mut self, identity: Arc<DeviceIdentity>) {
        self.identity = identity;
    }

    /// The identity frames are resolved against
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Classify one frame
    pub fn classify(&self, frame: &RawFrame) -> Result<ClassifiedRecord, DataError> {
        classify(frame, &self.identity)
    }
}

/// Classify one frame against an identity
pub fn classify(frame: &RawFrame, identity: &DeviceIdentity) -> Result<ClassifiedRecord, DataError> {
    match frame {
        RawFrame::Print { time, text } => Ok(ClassifiedRecord::Print(PrintRecord {
            text: text.clone(),
            time: *time,
        })),
        RawFrame::Digital { time, id } => {
            let name = identity
                .id_to_name
                .get(id)
                .ok_or(DataError::UnknownDigitalId { id: *id, time: *time })?;
            if identity.is_state(name) {
                Ok(ClassifiedRecord::State(StateRecord {
                    name: name.clone(),
                    time: *time,
                }))
            } else {
                Ok(ClassifiedRecord::Event(EventRecord {
                    name: name.clone(),
                    time: *time,
                }))
            }
        }
        RawFrame::Analog {
            channel,
            time,
            value,
        } => {
            let name = identity
                .id_to_analog
                .get(channel)
                .ok_or(DataError::UnknownAnalogChannel {
                    channel: *channel,
                    time: *time,
                })?;
            Ok(ClassifiedRecord::Analog(AnalogRecord {
                channel: name.clone(),
                time: *time,
                value: *value,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_identity() -> DeviceIdentity {
        DeviceIdentity::new("test")
            .with_state(5, "LED_off")
            .with_event(6, "poke_left")
            .with_analog(2, "temp")
    }

    #[test]
    fn test_digital_state_and_event() {
        let identity = test_identity();

        assert_eq!(
            classify(&RawFrame::Digital { time: 1000, id: 5 }, &identity).unwrap(),
            ClassifiedRecord::State(StateRecord {
                name: "LED_off".into(),
                time: 1000
            })
        );
        assert_eq!(
            classify(&RawFrame::Digital { time: 1001, id: 6 }, &identity).unwrap(),
            ClassifiedRecord::Event(EventRecord {
                name: "poke_left".into(),
                time: 1001
            })
        );
    }

    #[test]
    fn test_print_frame() {
        let frame = RawFrame::Print {
            time: 1234,
            text: "trial 1 start".into(),
        };
        assert_eq!(
            classify(&frame, &test_identity()).unwrap(),
            ClassifiedRecord::Print(PrintRecord {
                text: "trial 1 start".into(),
                time: 1234
            })
        );
    }

    #[test]
    fn test_analog_frame() {
        let frame = RawFrame::Analog {
            channel: 2,
            time: 5000,
            value: 37.5,
        };
        assert_eq!(
            classify(&frame, &test_identity()).unwrap(),
            ClassifiedRecord::Analog(AnalogRecord {
                channel: "temp".into(),
                time: 5000,
                value: 37.5
            })
        );
    }

    #[test]
    fn test_unknown_ids_are_errors() {
        let identity = test_identity();
        assert_eq!(
            classify(&RawFrame::Digital { time: 7, id: 99 }, &identity),
            Err(DataError::UnknownDigitalId { id: 99, time: 7 })
        );
        assert_eq!(
            classify(
                &RawFrame::Analog {
                    channel: 3,
                    time: 8,
                    value: 0.0
                },
                &identity
            ),
            Err(DataError::UnknownAnalogChannel { channel: 3, time: 8 })
        );
    }

    #[test]
    fn test_empty_identity_rejects_digital() {
        let classifier = FrameClassifier::default();
        assert!(classifier
            .classify(&RawFrame::Digital { time: 0, id: 1 })
            .is_err());
        assert!(classifier
            .classify(&RawFrame::Print {
                time: 0,
                text: "ok".into()
            })
            .is_ok());
    }

    #[test]
    fn test_set_identity_replaces_tables() {
        let mut classifier = FrameClassifier::new(Arc::new(test_identity()));
        classifier.set_identity(Arc::new(DeviceIdentity::new("other").with_event(5, "tone")));
        assert!(matches!(
            classifier.classify(&RawFrame::Digital { time: 1, id: 5 }),
            Ok(ClassifiedRecord::Event(_))
        ));
    }

    fn arb_frame() -> impl Strategy<Value = RawFrame> {
        prop_oneof![
            (0u64..100_000, "[a-z ]{0,12}").prop_map(|(time, text)| RawFrame::Print { time, text }),
            (0u64..100_000, 0u32..12).prop_map(|(time, id)| RawFrame::Digital { time, id }),
            (0u32..4, 0u64..100_000, -100.0f64..100.0)
                .prop_map(|(channel, time, value)| RawFrame::Analog { channel, time, value }),
        ]
    }

    proptest! {
        #[test]
        fn test_classification_is_deterministic(frame in arb_frame()) {
            let identity = test_identity();
            let first = classify(&frame, &identity);
            let second = classify(&frame, &identity);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn test_known_digital_is_state_xor_event(id in prop::sample::select(vec![5u32, 6]), time in 0u64..1_000_000) {
            let identity = test_identity();
            let record = classify(&RawFrame::Digital { time, id }, &identity).unwrap();
            let is_state = matches!(record, ClassifiedRecord::State(_));
            let is_event = matches!(record, ClassifiedRecord::Event(_));
            prop_assert!(is_state ^ is_event);
            prop_assert_eq!(record.time(), time);
        }

        #[test]
        fn test_result_independent_of_history(frames in prop::collection::vec(arb_frame(), 0..20), probe in arb_frame()) {
            let identity = test_identity();
            let classifier = FrameClassifier::new(Arc::new(identity.clone()));
            let alone = classifier.classify(&probe);
            for f in &frames {
                let _ = classifier.classify(f);
            }
            prop_assert_eq!(classifier.classify(&probe), alone);
        }
    }
}
