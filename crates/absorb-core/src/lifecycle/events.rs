//! Governance events and the external sink seam.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CapabilityId, LifecycleState};
use crate::obs;
use crate::policy::{Decision, Facts};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Transition {
        capability_id: CapabilityId,
        from: LifecycleState,
        to: LifecycleState,
        reason: String,
        facts: Facts,
        at: DateTime<Utc>,
    },
    /// Evaluator verdict consulted while in canary or live monitoring.
    CanaryDecision {
        capability_id: CapabilityId,
        state: LifecycleState,
        verdict: String,
        facts: Facts,
        at: DateTime<Utc>,
    },
    PolicyDecision {
        capability_id: CapabilityId,
        decision: Decision,
        allowed: bool,
        facts: Facts,
        at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn capability_id(&self) -> &CapabilityId {
        match self {
            LifecycleEvent::Transition { capability_id, .. }
            | LifecycleEvent::CanaryDecision { capability_id, .. }
            | LifecycleEvent::PolicyDecision { capability_id, .. } => capability_id,
        }
    }
}

/// Destination for governance events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LifecycleEvent);
}

/// Forwards events to `tracing` through [`crate::obs`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Transition {
                capability_id,
                from,
                to,
                reason,
                facts,
                ..
            } => obs::emit_transition(capability_id, *from, *to, reason, facts),
            LifecycleEvent::CanaryDecision {
                capability_id,
                state,
                verdict,
                facts,
                ..
            } => obs::emit_canary_decision(capability_id, *state, verdict, facts),
            LifecycleEvent::PolicyDecision {
                capability_id,
                decision,
                allowed,
                facts,
                ..
            } => obs::emit_policy_decision(capability_id, *decision, *allowed, facts),
        }
    }
}

/// Keeps every event in memory. Intended for tests and audits.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `(from, to)` pairs of every transition for `id`, in order.
    pub fn transitions(&self, id: &CapabilityId) -> Vec<(LifecycleState, LifecycleState)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LifecycleEvent::Transition {
                    capability_id,
                    from,
                    to,
                    ..
                } if &capability_id == id => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Fan out to several sinks.
pub struct MultiSink(pub Vec<std::sync::Arc<dyn EventSink>>);

impl EventSink for MultiSink {
    fn emit(&self, event: &LifecycleEvent) {
        for sink in &self.0 {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_filters_transitions_by_capability() {
        let sink = RecordingEventSink::new();
        let a = CapabilityId::from("a");
        let b = CapabilityId::from("b");
        for (id, from, to) in [
            (&a, LifecycleState::Discovered, LifecycleState::ShadowTrial),
            (&b, LifecycleState::Discovered, LifecycleState::ShadowTrial),
            (&a, LifecycleState::ShadowTrial, LifecycleState::Quarantined),
        ] {
            sink.emit(&LifecycleEvent::Transition {
                capability_id: id.clone(),
                from,
                to,
                reason: "test".to_string(),
                facts: Facts::new(),
                at: Utc::now(),
            });
        }
        assert_eq!(
            sink.transitions(&a),
            vec![
                (LifecycleState::Discovered, LifecycleState::ShadowTrial),
                (LifecycleState::ShadowTrial, LifecycleState::Quarantined),
            ]
        );
    }

    #[test]
    fn event_serializes_with_tag() {
        let event = LifecycleEvent::PolicyDecision {
            capability_id: CapabilityId::from("a"),
            decision: Decision::AllowAutoAdopt,
            allowed: false,
            facts: Facts::new().with_bool("canary_passed", false),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "policy_decision");
        assert_eq!(json["decision"], "allow_auto_adopt");
    }
}
