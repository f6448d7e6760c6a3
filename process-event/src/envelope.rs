//! Envelope (`process_id`, `seq`, `ts`) applied to every published event.
//! [`EnvelopeState`] hands out sequence numbers; the bus holds one per process.

use serde::{Deserialize, Serialize};

use crate::event::ProcessEvent;

/// Envelope fields carried by every message on a process stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Process id; constant within a stream.
    pub process_id: String,
    /// Per-process sequence number; strictly increasing, gap-free in
    /// published order.
    pub seq: u64,
    /// Publish timestamp, RFC 3339.
    pub ts: String,
}

/// One enveloped event: what a stream consumer actually receives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessEventEnvelope {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(flatten)]
    pub event: ProcessEvent,
}

/// Sequence state for one process: next `seq` to assign.
///
/// The caller supplies timestamps so this crate stays clock-free; the core's
/// bus stamps events at publish time.
pub struct EnvelopeState {
    process_id: String,
    next_seq: u64,
}

impl EnvelopeState {
    pub fn new(process_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            next_seq: 0,
        }
    }

    /// Sequence number the next published event will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Wraps an event with the next envelope and advances the sequence.
    pub fn envelop(&mut self, event: ProcessEvent, ts: impl Into<String>) -> ProcessEventEnvelope {
        let envelope = Envelope {
            process_id: self.process_id.clone(),
            seq: self.next_seq,
            ts: ts.into(),
        };
        self.next_seq += 1;
        ProcessEventEnvelope { envelope, event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Phase, ProcessEvent};

    #[test]
    fn seq_is_contiguous_and_monotonic() {
        let mut state = EnvelopeState::new("proc-1");
        for expected in 0..5u64 {
            let e = state.envelop(
                ProcessEvent::PhaseUpdate {
                    phase: Phase::Planning,
                    warning: None,
                },
                "2026-01-01T00:00:00Z",
            );
            assert_eq!(e.envelope.seq, expected);
            assert_eq!(e.envelope.process_id, "proc-1");
        }
        assert_eq!(state.next_seq(), 5);
    }

    #[test]
    fn envelope_fields_flatten_into_wire_object() {
        let mut state = EnvelopeState::new("proc-9");
        let e = state.envelop(ProcessEvent::PlanCancelled, "2026-01-01T00:00:00Z");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "plan_cancelled");
        assert_eq!(v["process_id"], "proc-9");
        assert_eq!(v["seq"], 0);
        assert_eq!(v["ts"], "2026-01-01T00:00:00Z");
    }
}
