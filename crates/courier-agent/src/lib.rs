//! Agent runtime: the LLM endpoint pool with failover and sticky recovery,
//! the wire-dialect clients, the tool layer, the guardrail, and the
//! iterative turn loop.

pub mod endpoint;
pub mod error;
pub mod guard;
pub mod pool;
pub mod protocol;
pub mod ralph;
pub mod split;
pub mod tools;
pub mod turn;
pub mod wire;

pub use endpoint::{EndpointKind, LlmEndpoint};
pub use error::{AgentError, PoolError, WireError};
pub use pool::{EndpointPool, PoolConfig};
pub use protocol::{
    ChatMessage, ChatRole, ContentBlock, MessagesRequest, MessagesResponse, StopReason, ToolCall,
    ToolDefinition, Usage,
};
pub use turn::{HookSignal, NullHook, TurnHook, TurnOutcome, TurnRequest};
