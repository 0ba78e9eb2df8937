//! Wire protocol and line framing shared by the patchbay hub and satellite.

pub mod codec;
pub mod message;

pub use codec::{LineCodec, MAX_LINE_LEN};
pub use message::{ContentItem, Hello, Message, ResultEnvelope};
