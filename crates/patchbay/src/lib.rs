//! patchbay: keeps exactly one valid RPC channel alive between a host
//! process that periodically tears down its own runtime and a companion
//! worker process that stays up.
//!
//! Hub side (worker process): accepts connections, rejects stale ones,
//! multiplexes request/response calls over the single live channel.
//! Satellite side (host process): reconnect loop, generation guard and
//! session lease so old copies of itself stop instead of competing for
//! the socket, and a main-thread dispatcher for handler execution.

pub mod config;
pub mod dispatch;
pub mod hub;
pub mod logging;
pub mod registry;
pub mod satellite;

pub use config::BridgeConfig;
pub use dispatch::MainThreadQueue;
pub use hub::{Hub, HubError, RequestMux};
pub use registry::{Handler, HandlerRegistry};
pub use satellite::{
    Connector, ConnectorEvent, FsSessionLease, GenerationCounter, MemorySessionLease, SessionLease,
};
