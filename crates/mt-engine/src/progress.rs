//! Session progress events.
//!
//! A [`TuningSession`](crate::TuningSession) optionally publishes one event
//! per notable step on a channel supplied by the caller. Events are
//! informational; a disconnected receiver never affects the session.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use mt_types::{Assignment, FailureStage, Score, Verdict};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    SessionStarted {
        session_id: Uuid,
        strategy: String,
        parameters: usize,
        at: DateTime<Utc>,
    },
    TrialFinished {
        number: usize,
        assignment: Assignment,
        verdict: Verdict,
        score: Score,
        cached: bool,
    },
    NewBest {
        number: usize,
        assignment: Assignment,
        score: Score,
    },
    RetryScheduled {
        assignment: Assignment,
        attempt: u32,
        stage: FailureStage,
        reason: String,
    },
    SessionFinished {
        session_id: Uuid,
        iterations: usize,
        best_score: Option<Score>,
        at: DateTime<Utc>,
    },
}

/// Sending half of the progress stream.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<Sender<ProgressEvent>>,
}

impl ProgressReporter {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // receiver gone: nobody is listening
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_reach_the_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let reporter = ProgressReporter::new(tx);
        reporter.emit(ProgressEvent::NewBest {
            number: 3,
            assignment: Assignment::new().with("ALIGNMENT", 16),
            score: Score::new(0.8),
        });
        match rx.try_recv().unwrap() {
            ProgressEvent::NewBest { number, score, .. } => {
                assert_eq!(number, 3);
                assert_eq!(score, Score::new(0.8));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let reporter = ProgressReporter::new(tx);
        reporter.emit(ProgressEvent::SessionFinished {
            session_id: Uuid::new_v4(),
            iterations: 0,
            best_score: None,
            at: Utc::now(),
        });
        assert!(!ProgressReporter::disabled().is_enabled());
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = ProgressEvent::RetryScheduled {
            assignment: Assignment::new().with("COALESCE", true),
            attempt: 1,
            stage: FailureStage::Build,
            reason: "scratch storage unavailable".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "retry_scheduled");
        assert_eq!(json["stage"], "build");
    }
}
