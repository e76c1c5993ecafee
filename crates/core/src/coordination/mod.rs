//! In-process coordination primitives wrapped around dispatch.
//!
//! - [`CompletionAggregator`]: fires a parent's process message once all its
//!   children of a tracked topic have settled.
//! - [`AdmissionGate`]: bounds concurrently running children per parent.
//!
//! Both keep their bookkeeping behind a state trait so the in-memory default
//! can be swapped for a durable one.

mod aggregator;
mod gate;
mod state;

pub use aggregator::{CompletionAggregator, FanIn, TrackedTopic};
pub use gate::{AdmissionGate, ConcurrencyLimit, GatePermit};
pub use state::{
    Admission, AdmissionState, EntryStatus, InMemoryAdmission, InMemoryMembership,
    MembershipState,
};
