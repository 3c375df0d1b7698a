//! Stream reply state machine for channels whose only low-latency reply
//! path is a server-initiated refresh callback carrying a stream id
//! (WeWork-bot style).
//!
//! Reply semantics are inverted on such platforms: the agent writes into a
//! session buffer, the platform polls for the current buffer. The settle
//! delay keeps a just-finished stream open long enough for trailing image
//! sends from the same turn to attach to the final reply.

pub mod error;
pub mod outbound;
pub mod registry;
pub mod types;

pub use error::StreamError;
pub use outbound::{apply_outgoing, WriteOutcome};
pub use registry::StreamRegistry;
pub use types::{RefreshReply, StreamImage, StreamSettings};
