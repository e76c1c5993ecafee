//! Orchestration algorithms shared by every workflow: fan-out, single-step
//! continuation, child completion and idempotent resumption.

mod progress;
mod workflow;

pub use progress::{Phase, PhaseProgress};
pub use workflow::{Orchestrator, Resume};
