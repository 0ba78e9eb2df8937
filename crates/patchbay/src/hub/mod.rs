//! Hub side: connection arbitration and multiplexed call issuing.

mod arbiter;
mod mux;

pub use arbiter::{Hub, HubError};
pub use mux::RequestMux;
