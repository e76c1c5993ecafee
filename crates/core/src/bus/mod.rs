//! Message bus abstraction and the in-process transport.

mod local;
mod types;

pub use local::LocalBus;
pub use types::*;
