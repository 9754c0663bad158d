//! Bounded outbound telemetry queue.
//!
//! Producers (frame sends, decoded inverter frames, log lines) enqueue
//! messages; the broker side drains them highest priority first whenever a
//! session is available. When the backlog is full, a new message only gets in
//! by beating the current lowest-priority member, which is evicted.

use alloc::collections::BTreeMap;
use serde::{Deserialize, Serialize};

/// Periodic field updates.
pub const PRIORITY_TELEMETRY: i32 = 0;
/// Diagnostic log lines.
pub const PRIORITY_LOG: i32 = 10;
/// Identity announcements on connect.
pub const PRIORITY_INFO: i32 = 20;
/// Availability announcement.
pub const PRIORITY_AVAILABILITY: i32 = 100;

pub const LOG_TOPIC: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTelemetryMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
    pub priority: i32,
}

impl QueuedTelemetryMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, retain: bool, priority: i32) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
            priority,
        }
    }

    pub fn telemetry(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(topic, payload, false, PRIORITY_TELEMETRY)
    }

    pub fn log(line: impl Into<String>) -> Self {
        Self::new(LOG_TOPIC, line, false, PRIORITY_LOG)
    }
}

/// What happened to an enqueued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Accepted after evicting the lowest-priority message.
    Evicted,
    /// Queue full and the message did not outrank anything.
    Dropped,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueStats {
    pub total_enqueued: u32,
    pub total_dequeued: u32,
    pub total_evicted: u32,
    pub total_dropped: u32,
}

/// Ordering key: priority first, then insertion sequence so equal priorities
/// never collide in the map.
type QueueKey = (i32, u64);

#[derive(Debug)]
pub struct TelemetryQueue {
    messages: BTreeMap<QueueKey, QueuedTelemetryMessage>,
    capacity: usize,
    next_sequence: u64,
    stats: QueueStats,
}

impl TelemetryQueue {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "telemetry queue capacity must be non-zero");
        Self {
            messages: BTreeMap::new(),
            capacity,
            next_sequence: 0,
            stats: QueueStats::default(),
        }
    }

    pub fn enqueue(&mut self, message: QueuedTelemetryMessage) -> EnqueueOutcome {
        let mut outcome = EnqueueOutcome::Accepted;

        if self.messages.len() >= self.capacity {
            let lowest = self.messages.keys().next().map(|&(priority, _)| priority);
            match lowest {
                Some(lowest) if message.priority > lowest => {
                    self.messages.pop_first();
                    self.stats.total_evicted += 1;
                    outcome = EnqueueOutcome::Evicted;
                }
                _ => {
                    self.stats.total_dropped += 1;
                    return EnqueueOutcome::Dropped;
                }
            }
        }

        let key = (message.priority, self.next_sequence);
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.messages.insert(key, message);
        self.stats.total_enqueued += 1;

        debug_assert!(
            self.messages.len() <= self.capacity,
            "Telemetry queue length {} exceeds capacity {}",
            self.messages.len(),
            self.capacity
        );

        outcome
    }

    /// Remove and return the most urgent message. Equal priorities leave in
    /// arrival order.
    pub fn dequeue_highest(&mut self) -> Option<QueuedTelemetryMessage> {
        let key = self.highest_key()?;
        let message = self.messages.remove(&key)?;
        self.stats.total_dequeued += 1;
        Some(message)
    }

    pub fn peek_highest(&self) -> Option<&QueuedTelemetryMessage> {
        self.highest_key().and_then(|key| self.messages.get(&key))
    }

    fn highest_key(&self) -> Option<QueueKey> {
        let &(priority, _) = self.messages.keys().next_back()?;
        self.messages.range((priority, 0)..).next().map(|(&key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Messages in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedTelemetryMessage> {
        let mut entries: alloc::vec::Vec<_> = self.messages.iter().collect();
        entries.sort_by_key(|&(&(priority, sequence), _)| (core::cmp::Reverse(priority), sequence));
        entries.into_iter().map(|(_, message)| message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, priority: i32) -> QueuedTelemetryMessage {
        QueuedTelemetryMessage::new(topic, "1.00", false, priority)
    }

    #[test]
    fn test_dequeue_order_is_highest_first() {
        let mut queue = TelemetryQueue::new(8);
        queue.enqueue(msg("a", 0));
        queue.enqueue(msg("b", 100));
        queue.enqueue(msg("c", 10));

        assert_eq!(queue.dequeue_highest().unwrap().topic, "b");
        assert_eq!(queue.dequeue_highest().unwrap().topic, "c");
        assert_eq!(queue.dequeue_highest().unwrap().topic, "a");
        assert!(queue.dequeue_highest().is_none());
    }

    #[test]
    fn test_full_queue_drops_equal_priority() {
        let mut queue = TelemetryQueue::new(2);
        assert_eq!(queue.enqueue(msg("a", 0)), EnqueueOutcome::Accepted);
        assert_eq!(queue.enqueue(msg("b", 0)), EnqueueOutcome::Accepted);
        assert_eq!(queue.enqueue(msg("c", 0)), EnqueueOutcome::Dropped);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get_stats().total_dropped, 1);
    }

    #[test]
    fn test_full_queue_evicts_lowest() {
        let mut queue = TelemetryQueue::new(2);
        queue.enqueue(msg("low", 0));
        queue.enqueue(msg("mid", 5));
        assert_eq!(queue.enqueue(msg("high", 10)), EnqueueOutcome::Evicted);

        let topics: alloc::vec::Vec<_> = queue.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, ["high", "mid"]);
        assert_eq!(queue.get_stats().total_evicted, 1);
    }

    #[test]
    fn test_capacity_keeps_highest_priorities() {
        let capacity = 5;
        let mut queue = TelemetryQueue::new(capacity);
        let priorities = [3, 9, 1, 7, 7, 0, 12, 4, 9, 2, 11, 5];
        for (i, &priority) in priorities.iter().enumerate() {
            queue.enqueue(msg(&format!("m{i}"), priority));
            assert!(queue.len() <= capacity);
        }

        let mut expected = priorities.to_vec();
        expected.sort_unstable_by(|a, b| b.cmp(a));
        expected.truncate(capacity);

        let mut kept = alloc::vec::Vec::new();
        while let Some(message) = queue.dequeue_highest() {
            kept.push(message.priority);
        }
        assert_eq!(kept, expected);
    }

    #[test]
    fn test_equal_priorities_leave_in_arrival_order() {
        let mut queue = TelemetryQueue::new(8);
        queue.enqueue(msg("first", 0));
        queue.enqueue(msg("log", 10));
        queue.enqueue(msg("second", 0));

        let order: alloc::vec::Vec<_> = queue.iter().map(|m| m.topic.clone()).collect();
        assert_eq!(order, ["log", "first", "second"]);
        assert_eq!(queue.dequeue_highest().unwrap().topic, "log");
        assert_eq!(queue.dequeue_highest().unwrap().topic, "first");
        assert_eq!(queue.dequeue_highest().unwrap().topic, "second");
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut queue = TelemetryQueue::new(4);
        queue.enqueue(QueuedTelemetryMessage::log("hello"));
        assert_eq!(queue.peek_highest().unwrap().topic, LOG_TOPIC);
        assert_eq!(queue.len(), 1);
    }
}
