//! Satellite side: reconnect loop, generation guard, session lease.

mod connector;
mod generation;
mod lease;

pub use connector::{Connector, ConnectorEvent};
pub use generation::GenerationCounter;
pub use lease::{FsSessionLease, MemorySessionLease, SessionLease};
