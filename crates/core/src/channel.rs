//! Bounded in-memory channel between the poll loop and a type's worker.
//!
//! One writer (the poll loop that demultiplexed the record) and one reader
//! (the worker task) per channel. Watermark decisions are made by the
//! callers; the channel only reports its fill level and enforces the
//! full-mode policy.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::broker::ConsumedRecord;
use crate::config::FullMode;

/// What happened to a pushed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    /// Stored, evicting the oldest buffered record.
    DroppedOldest,
    /// Discarded because the channel was full.
    DroppedNewest,
}

pub struct TypeChannel {
    queue: Mutex<VecDeque<ConsumedRecord>>,
    capacity: usize,
    high_water: usize,
    low_water: usize,
    full_mode: FullMode,
    readable: Notify,
    writable: Notify,
}

impl TypeChannel {
    pub fn new(capacity: usize, high_ratio: f64, low_ratio: f64, full_mode: FullMode) -> Self {
        let (high_water, low_water) = watermarks(capacity, high_ratio, low_ratio);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            high_water,
            low_water,
            full_mode,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn low_water(&self) -> usize {
        self.low_water
    }

    pub async fn push(&self, record: ConsumedRecord) -> PushOutcome {
        match self.full_mode {
            FullMode::Wait => {
                let mut record = record;
                loop {
                    let notified = self.writable.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    {
                        let mut queue = self.queue.lock();
                        if queue.len() < self.capacity {
                            queue.push_back(record);
                            drop(queue);
                            self.readable.notify_one();
                            return PushOutcome::Stored;
                        }
                    }
                    notified.await;
                    record = match self.try_reclaim(record) {
                        Ok(outcome) => return outcome,
                        Err(record) => record,
                    };
                }
            }
            FullMode::DropOldest => {
                let outcome = {
                    let mut queue = self.queue.lock();
                    if queue.len() >= self.capacity {
                        queue.pop_front();
                        queue.push_back(record);
                        PushOutcome::DroppedOldest
                    } else {
                        queue.push_back(record);
                        PushOutcome::Stored
                    }
                };
                self.readable.notify_one();
                outcome
            }
            FullMode::DropNewest => {
                let mut queue = self.queue.lock();
                if queue.len() >= self.capacity {
                    PushOutcome::DroppedNewest
                } else {
                    queue.push_back(record);
                    drop(queue);
                    self.readable.notify_one();
                    PushOutcome::Stored
                }
            }
        }
    }

    fn try_reclaim(&self, record: ConsumedRecord) -> Result<PushOutcome, ConsumedRecord> {
        let mut queue = self.queue.lock();
        if queue.len() < self.capacity {
            queue.push_back(record);
            drop(queue);
            self.readable.notify_one();
            Ok(PushOutcome::Stored)
        } else {
            Err(record)
        }
    }

    pub async fn pop(&self) -> ConsumedRecord {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queue = self.queue.lock();
                if let Some(record) = queue.pop_front() {
                    drop(queue);
                    self.writable.notify_one();
                    return record;
                }
            }
            notified.await;
        }
    }
}

/// `high = ceil(cap * high_ratio)`, `low = ceil(cap * low_ratio)`.
pub fn watermarks(capacity: usize, high_ratio: f64, low_ratio: f64) -> (usize, usize) {
    let high = ((capacity as f64) * high_ratio).ceil() as usize;
    let low = ((capacity as f64) * low_ratio).ceil() as usize;
    (high.min(capacity), low.min(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn record(offset: i64) -> ConsumedRecord {
        ConsumedRecord {
            topic: "orders".to_string(),
            partition: 0,
            offset,
            key: None,
            payload: vec![1],
            headers: HeaderMap::new(),
        }
    }

    #[test]
    fn watermark_math_uses_ceiling() {
        assert_eq!(watermarks(10, 0.8, 0.5), (8, 5));
        assert_eq!(watermarks(10, 0.75, 0.33), (8, 4));
        assert_eq!(watermarks(1, 1.0, 0.5), (1, 1));
    }

    #[tokio::test]
    async fn drop_oldest_evicts_the_front() {
        let channel = TypeChannel::new(2, 1.0, 0.5, FullMode::DropOldest);
        assert_eq!(channel.push(record(1)).await, PushOutcome::Stored);
        assert_eq!(channel.push(record(2)).await, PushOutcome::Stored);
        assert_eq!(channel.push(record(3)).await, PushOutcome::DroppedOldest);

        assert_eq!(channel.pop().await.offset, 2);
        assert_eq!(channel.pop().await.offset, 3);
    }

    #[tokio::test]
    async fn drop_newest_discards_the_incoming_record() {
        let channel = TypeChannel::new(2, 1.0, 0.5, FullMode::DropNewest);
        channel.push(record(1)).await;
        channel.push(record(2)).await;
        assert_eq!(channel.push(record(3)).await, PushOutcome::DroppedNewest);

        assert_eq!(channel.pop().await.offset, 1);
        assert_eq!(channel.len(), 1);
    }

    #[tokio::test]
    async fn wait_mode_blocks_until_a_slot_frees() {
        let channel = Arc::new(TypeChannel::new(1, 1.0, 0.5, FullMode::Wait));
        channel.push(record(1)).await;

        let writer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.push(record(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        assert_eq!(channel.pop().await.offset, 1);
        assert_eq!(writer.await.unwrap(), PushOutcome::Stored);
        assert_eq!(channel.pop().await.offset, 2);
    }

    #[tokio::test]
    async fn count_never_exceeds_capacity() {
        let channel = TypeChannel::new(3, 0.8, 0.4, FullMode::DropNewest);
        for i in 0..10 {
            channel.push(record(i)).await;
        }
        assert!(channel.len() <= 3);
    }
}
