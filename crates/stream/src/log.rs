use async_trait::async_trait;

use crate::error::StreamError;

/// Identifies one delivered record for acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub partition: usize,
    pub offset: u64,
}

/// A record handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub receipt: Receipt,
    pub partition_key: String,
    pub payload: Vec<u8>,
    /// How many times this record has been delivered, this delivery included.
    pub delivery_attempt: u32,
}

/// Producer side of the event stream.
#[async_trait]
pub trait EventProducer: Send + Sync {
    /// Append one record. Records with the same `partition_key` keep their
    /// relative order.
    async fn append(&self, partition_key: &str, payload: Vec<u8>) -> Result<Receipt, StreamError>;
}

/// Consumer side of the event stream.
///
/// Delivery is at-least-once: a polled record that is not acknowledged
/// becomes visible again after the backend's visibility timeout.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Take up to `max` visible records.
    async fn poll(&self, max: usize) -> Result<Vec<StreamRecord>, StreamError>;

    /// Acknowledge processed records so they are never redelivered.
    async fn ack(&self, receipts: &[Receipt]) -> Result<(), StreamError>;
}
