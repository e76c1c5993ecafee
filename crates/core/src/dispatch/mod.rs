//! Per-worker dispatch: typed topic handlers and the router that drives a
//! task through validation, coordination and failure recording.

mod error;
mod registry;
mod router;

pub use error::{DispatchError, ExternalError};
pub use registry::{RouteTable, TopicHandler, Validate};
pub use router::{DispatchOutcome, Router};
