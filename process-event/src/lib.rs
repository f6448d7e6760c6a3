//! Process stream protocol: typed events + envelope.
//!
//! One process (a single user query execution) emits an ordered stream of
//! [`ProcessEvent`]s. The envelope ([`Envelope`]: `process_id`, `seq`, `ts`)
//! is applied by [`EnvelopeState`] when an event is published; `seq` is
//! strictly increasing and gap-free within a process.
//!
//! This crate owns only the wire shape; buffering, collapse and delivery
//! live in the core crate's event bus.

mod envelope;
mod event;

pub use envelope::{Envelope, EnvelopeState, ProcessEventEnvelope};
pub use event::{
    DisplayType, FormattedResponse, Phase, PlanStatusPayload, PlannedStepInfo, ProcessEvent,
    RateLimitInfo, ResultMetadata, StepStatus, StepStatusUpdate, TableHeader,
};
