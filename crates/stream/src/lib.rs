//! Event stream and invalidation channel abstractions.
//!
//! The [`EventProducer`]/[`EventConsumer`] pair models an append-only,
//! partition-ordered log with at-least-once delivery. The
//! [`InvalidationChannel`] broadcasts credential mutations to every
//! authorizer instance.

pub mod error;
pub mod invalidation;
pub mod log;
pub mod memory;

pub use error::StreamError;
pub use invalidation::{
    BroadcastInvalidationChannel, InvalidationAction, InvalidationChannel, InvalidationMessage,
    InvalidationSubscription,
};
pub use log::{EventConsumer, EventProducer, Receipt, StreamRecord};
pub use memory::{MemoryEventStream, MemoryStreamConfig};
