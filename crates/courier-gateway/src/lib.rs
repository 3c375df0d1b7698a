//! Message gateway: cross-channel intake, per-conversation serialization,
//! the interrupt scheduler, media preprocessing, progress batching, daily
//! report delivery, and the out-of-band system command interceptor.

pub mod commands;
pub mod error;
pub mod gateway;
pub mod interrupt;
pub mod media;
pub mod progress;
pub mod report;

pub use error::GatewayError;
pub use gateway::MessageGateway;
pub use interrupt::{InterruptMessage, InterruptPriority, InterruptQueue};
