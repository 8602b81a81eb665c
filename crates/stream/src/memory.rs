use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::warn;

use crate::error::StreamError;
use crate::log::{EventConsumer, EventProducer, Receipt, StreamRecord};

/// Tuning for [`MemoryEventStream`].
#[derive(Debug, Clone)]
pub struct MemoryStreamConfig {
    pub partitions: usize,
    /// How long a polled, unacknowledged record stays hidden.
    pub visibility_timeout: Duration,
    /// Records retained per partition; the oldest are dropped beyond this.
    pub retention_per_partition: usize,
    pub max_payload_bytes: usize,
}

impl Default for MemoryStreamConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            visibility_timeout: Duration::from_secs(30),
            retention_per_partition: 100_000,
            max_payload_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug)]
struct Slot {
    offset: u64,
    partition_key: String,
    payload: Vec<u8>,
    hidden_until: Option<Instant>,
    deliveries: u32,
}

impl Slot {
    fn is_visible(&self, now: Instant) -> bool {
        self.hidden_until.is_none_or(|until| now >= until)
    }
}

#[derive(Debug, Default)]
struct Partition {
    slots: VecDeque<Slot>,
    next_offset: u64,
}

/// In-process partitioned log with at-least-once delivery.
///
/// Each partition keeps records in append order. Polling hides records for
/// the visibility timeout; acknowledged records are removed, the rest
/// reappear and are redelivered.
#[derive(Debug)]
pub struct MemoryEventStream {
    config: MemoryStreamConfig,
    partitions: Vec<Mutex<Partition>>,
    cursor: AtomicU64,
    expired: AtomicU64,
}

impl Default for MemoryEventStream {
    fn default() -> Self {
        Self::new(MemoryStreamConfig::default())
    }
}

impl MemoryEventStream {
    pub fn new(config: MemoryStreamConfig) -> Self {
        let count = config.partitions.max(1);
        Self {
            partitions: (0..count).map(|_| Mutex::new(Partition::default())).collect(),
            config,
            cursor: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Partition index for `key`. Stable across processes.
    pub fn partition_for(&self, key: &str) -> usize {
        let digest = Sha256::digest(key.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let n = self.partitions.len() as u64;
        usize::try_from(u64::from_be_bytes(head) % n).unwrap_or(0)
    }

    /// Records not yet acknowledged, across all partitions.
    pub fn backlog(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().slots.len()).sum()
    }

    /// Records dropped by retention before being acknowledged.
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventProducer for MemoryEventStream {
    async fn append(&self, partition_key: &str, payload: Vec<u8>) -> Result<Receipt, StreamError> {
        if payload.len() > self.config.max_payload_bytes {
            return Err(StreamError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_bytes,
            });
        }
        let index = self.partition_for(partition_key);
        let mut partition = self.partitions[index].lock();
        let offset = partition.next_offset;
        partition.next_offset += 1;
        partition.slots.push_back(Slot {
            offset,
            partition_key: partition_key.to_owned(),
            payload,
            hidden_until: None,
            deliveries: 0,
        });
        if partition.slots.len() > self.config.retention_per_partition {
            if let Some(dropped) = partition.slots.pop_front() {
                self.expired.fetch_add(1, Ordering::Relaxed);
                warn!(
                    partition = index,
                    offset = dropped.offset,
                    "retention exceeded, dropping oldest record"
                );
            }
        }
        Ok(Receipt {
            partition: index,
            offset,
        })
    }
}

#[async_trait]
impl EventConsumer for MemoryEventStream {
    async fn poll(&self, max: usize) -> Result<Vec<StreamRecord>, StreamError> {
        let now = Instant::now();
        let hidden_until = now + self.config.visibility_timeout;
        let count = self.partitions.len();
        // Rotate the starting partition so no partition starves.
        let start = usize::try_from(self.cursor.fetch_add(1, Ordering::Relaxed) % count as u64)
            .unwrap_or(0);

        let mut out = Vec::with_capacity(max);
        for step in 0..count {
            if out.len() >= max {
                break;
            }
            let index = (start + step) % count;
            let mut partition = self.partitions[index].lock();
            for slot in partition.slots.iter_mut().filter(|s| s.is_visible(now)) {
                if out.len() >= max {
                    break;
                }
                slot.hidden_until = Some(hidden_until);
                slot.deliveries += 1;
                out.push(StreamRecord {
                    receipt: Receipt {
                        partition: index,
                        offset: slot.offset,
                    },
                    partition_key: slot.partition_key.clone(),
                    payload: slot.payload.clone(),
                    delivery_attempt: slot.deliveries,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, receipts: &[Receipt]) -> Result<(), StreamError> {
        for receipt in receipts {
            let Some(partition) = self.partitions.get(receipt.partition) else {
                continue;
            };
            let mut partition = partition.lock();
            if let Ok(pos) = partition
                .slots
                .binary_search_by_key(&receipt.offset, |s| s.offset)
            {
                partition.slots.remove(pos);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> MemoryEventStream {
        MemoryEventStream::new(MemoryStreamConfig {
            partitions: 3,
            visibility_timeout: Duration::from_secs(10),
            retention_per_partition: 5,
            max_payload_bytes: 16,
        })
    }

    #[tokio::test]
    async fn same_key_keeps_order() {
        let s = stream();
        for i in 0..3u8 {
            s.append("ada", vec![i]).await.unwrap();
        }
        let records = s.poll(10).await.unwrap();
        let payloads: Vec<u8> = records.iter().map(|r| r.payload[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2]);
        assert!(records.iter().all(|r| r.partition_key == "ada"));
    }

    #[tokio::test]
    async fn acked_records_are_not_redelivered() {
        let s = stream();
        s.append("ada", b"a".to_vec()).await.unwrap();
        let records = s.poll(10).await.unwrap();
        assert_eq!(records.len(), 1);
        s.ack(&[records[0].receipt]).await.unwrap();
        assert_eq!(s.backlog(), 0);
        assert!(s.poll(10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_records_reappear_after_visibility_timeout() {
        let s = stream();
        s.append("ada", b"a".to_vec()).await.unwrap();
        let first = s.poll(10).await.unwrap();
        assert_eq!(first[0].delivery_attempt, 1);
        assert!(s.poll(10).await.unwrap().is_empty(), "hidden while in flight");

        tokio::time::advance(Duration::from_secs(11)).await;

        let again = s.poll(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receipt, first[0].receipt);
        assert_eq!(again[0].delivery_attempt, 2);
    }

    #[tokio::test]
    async fn poll_respects_max() {
        let s = stream();
        for key in ["a", "b", "c", "d"] {
            s.append(key, b"x".to_vec()).await.unwrap();
        }
        assert_eq!(s.poll(3).await.unwrap().len(), 3);
        assert_eq!(s.poll(3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retention_drops_oldest() {
        let s = stream();
        for i in 0..7u8 {
            s.append("ada", vec![i]).await.unwrap();
        }
        assert_eq!(s.expired(), 2);
        let records = s.poll(10).await.unwrap();
        assert_eq!(records[0].payload, vec![2]);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let s = stream();
        let err = s.append("ada", vec![0; 17]).await.unwrap_err();
        assert!(matches!(err, StreamError::PayloadTooLarge { size: 17, max: 16 }));
    }

    #[test]
    fn partitioning_is_stable() {
        let s = stream();
        assert_eq!(s.partition_for("ada@example.com"), s.partition_for("ada@example.com"));
        assert!(s.partition_for("anonymous") < 3);
    }
}
