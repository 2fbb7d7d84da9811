//! QoS in-flight tracking and packet-ID allocation
//!
//! Publishes with QoS > 0 get a 16-bit packet ID and an in-flight entry
//! that lives until the broker acknowledges it, it is retried out, or the
//! session ends. The allocator is monotonic, wraps 65535 back to 1, never
//! returns 0, and never reuses an ID while its prior allocation remains
//! in flight.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::McpgateError;

/// One unacknowledged QoS > 0 publish.
#[derive(Debug, Clone)]
pub struct InflightMessage {
    /// Non-zero packet ID.
    pub packet_id: u16,
    /// Destination topic.
    pub topic: String,
    /// Publish payload, carried verbatim.
    pub payload: Bytes,
    /// QoS level (1 or 2).
    pub qos: u8,
    /// Retain flag.
    pub retain: bool,
    /// When the most recent transmission happened.
    pub sent_at: Instant,
    /// Wall-clock transmission time, for session persistence.
    pub sent_unix_ms: u64,
    /// Transmissions beyond the first.
    pub retry_count: u32,
}

/// A message pulled out by [`InflightTracker::take_due`] for
/// retransmission.
#[derive(Debug, Clone)]
pub struct RetryMessage {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
    pub retry_count: u32,
}

/// Tracks in-flight publishes and allocates packet IDs.
#[derive(Debug)]
pub struct InflightTracker {
    last_packet_id: u16,
    entries: BTreeMap<u16, InflightMessage>,
    /// Publish order, oldest first; broker acks retire in this order.
    order: VecDeque<u16>,
    max_inflight: usize,
}

impl InflightTracker {
    /// Tracker with an empty window.
    pub fn new(max_inflight: usize) -> Self {
        Self {
            last_packet_id: 0,
            entries: BTreeMap::new(),
            order: VecDeque::new(),
            max_inflight: max_inflight.max(1),
        }
    }

    /// Restore the allocator position from a persisted session.
    pub fn set_last_packet_id(&mut self, last: u16) {
        self.last_packet_id = last;
    }

    /// Most recently allocated packet ID (0 before any allocation).
    pub fn last_packet_id(&self) -> u16 {
        self.last_packet_id
    }

    /// Allocate the next free packet ID.
    ///
    /// # Errors
    ///
    /// [`McpgateError::Transport`] when the in-flight window is full.
    pub fn allocate(&mut self) -> Result<u16, McpgateError> {
        if self.entries.len() >= self.max_inflight {
            return Err(McpgateError::Transport(format!(
                "in-flight window full ({} messages)",
                self.entries.len()
            )));
        }
        // The window cap is far below 65535, so a free ID always exists
        // within one wrap.
        let mut candidate = self.last_packet_id;
        for _ in 0..=u16::MAX {
            candidate = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if !self.entries.contains_key(&candidate) {
                self.last_packet_id = candidate;
                return Ok(candidate);
            }
        }
        Err(McpgateError::Internal(
            "no free packet id despite open window".to_string(),
        ))
    }

    /// Record a transmitted message under its packet ID.
    pub fn insert(&mut self, message: InflightMessage) {
        self.order.push_back(message.packet_id);
        self.entries.insert(message.packet_id, message);
    }

    /// Retire the oldest in-flight entry (broker acks arrive in publish
    /// order on a single connection).
    pub fn ack_oldest(&mut self) -> Option<InflightMessage> {
        while let Some(packet_id) = self.order.pop_front() {
            if let Some(message) = self.entries.remove(&packet_id) {
                return Some(message);
            }
            // Entry was already retired out-of-band (retry expiry); keep
            // popping until a live one appears.
        }
        None
    }

    /// Remove a specific entry (failed enqueue, explicit ack).
    pub fn remove(&mut self, packet_id: u16) -> Option<InflightMessage> {
        self.entries.remove(&packet_id)
    }

    /// Split entries older than `interval` into retryable ones (retry
    /// count bumped, timestamps refreshed) and permanently expired ones
    /// (removed from the window).
    pub fn take_due(
        &mut self,
        interval: Duration,
        max_retries: u32,
        now_unix_ms: u64,
    ) -> (Vec<RetryMessage>, Vec<u16>) {
        let mut retryable = Vec::new();
        let mut expired = Vec::new();

        let due: Vec<u16> = self
            .entries
            .values()
            .filter(|m| m.sent_at.elapsed() >= interval)
            .map(|m| m.packet_id)
            .collect();

        for packet_id in due {
            let Some(message) = self.entries.get_mut(&packet_id) else {
                continue;
            };
            if message.retry_count >= max_retries {
                self.entries.remove(&packet_id);
                expired.push(packet_id);
            } else {
                message.retry_count += 1;
                message.sent_at = Instant::now();
                message.sent_unix_ms = now_unix_ms;
                retryable.push(RetryMessage {
                    packet_id: message.packet_id,
                    topic: message.topic.clone(),
                    payload: message.payload.clone(),
                    qos: message.qos,
                    retain: message.retain,
                    retry_count: message.retry_count,
                });
            }
        }

        (retryable, expired)
    }

    /// Snapshot of all live entries, oldest allocation first.
    pub fn snapshot(&self) -> Vec<InflightMessage> {
        self.entries.values().cloned().collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entry is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when `packet_id` is currently in flight.
    pub fn contains(&self, packet_id: u16) -> bool {
        self.entries.contains_key(&packet_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(packet_id: u16) -> InflightMessage {
        InflightMessage {
            packet_id,
            topic: "mcp/request/c1".to_string(),
            payload: Bytes::from_static(b"{}"),
            qos: 1,
            retain: false,
            sent_at: Instant::now(),
            sent_unix_ms: 0,
            retry_count: 0,
        }
    }

    #[test]
    fn test_allocate_never_returns_zero() {
        let mut tracker = InflightTracker::new(4);
        tracker.set_last_packet_id(u16::MAX);
        let id = tracker.allocate().unwrap();
        assert_eq!(id, 1, "wrap past 65535 lands on 1, never 0");
    }

    #[test]
    fn test_allocate_monotonic() {
        let mut tracker = InflightTracker::new(8);
        let a = tracker.allocate().unwrap();
        let b = tracker.allocate().unwrap();
        let c = tracker.allocate().unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(tracker.last_packet_id(), 3);
    }

    #[test]
    fn test_allocate_skips_inflight_ids() {
        let mut tracker = InflightTracker::new(8);
        let id = tracker.allocate().unwrap();
        tracker.insert(message(id));
        tracker.set_last_packet_id(0);
        // ID 1 is still in flight; the allocator must step over it.
        let next = tracker.allocate().unwrap();
        assert_ne!(next, id);
        assert_eq!(next, 2);
    }

    #[test]
    fn test_window_cap_rejects_allocation() {
        let mut tracker = InflightTracker::new(2);
        for _ in 0..2 {
            let id = tracker.allocate().unwrap();
            tracker.insert(message(id));
        }
        let err = tracker.allocate().unwrap_err();
        assert!(matches!(err, McpgateError::Transport(_)));
        // Retiring one reopens the window.
        tracker.ack_oldest().unwrap();
        assert!(tracker.allocate().is_ok());
    }

    #[test]
    fn test_ack_oldest_retires_in_publish_order() {
        let mut tracker = InflightTracker::new(8);
        for _ in 0..3 {
            let id = tracker.allocate().unwrap();
            tracker.insert(message(id));
        }
        assert_eq!(tracker.ack_oldest().unwrap().packet_id, 1);
        assert_eq!(tracker.ack_oldest().unwrap().packet_id, 2);
        assert_eq!(tracker.ack_oldest().unwrap().packet_id, 3);
        assert!(tracker.ack_oldest().is_none());
    }

    #[test]
    fn test_ack_skips_entries_already_expired() {
        let mut tracker = InflightTracker::new(8);
        let first = tracker.allocate().unwrap();
        tracker.insert(message(first));
        let second = tracker.allocate().unwrap();
        tracker.insert(message(second));

        tracker.remove(first);
        // The ack for the removed entry falls through to the next live one.
        assert_eq!(tracker.ack_oldest().unwrap().packet_id, second);
    }

    #[test]
    fn test_take_due_retries_then_expires() {
        let mut tracker = InflightTracker::new(8);
        let id = tracker.allocate().unwrap();
        let mut m = message(id);
        m.sent_at = Instant::now() - Duration::from_secs(10);
        tracker.insert(m);

        let (retry, expired) = tracker.take_due(Duration::from_secs(1), 1, 123);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].retry_count, 1);
        assert!(expired.is_empty());
        assert!(tracker.contains(id));

        // Force the entry overdue again; it has exhausted its retries.
        if let Some(entry) = tracker.entries.get_mut(&id) {
            entry.sent_at = Instant::now() - Duration::from_secs(10);
        }
        let (retry, expired) = tracker.take_due(Duration::from_secs(1), 1, 456);
        assert!(retry.is_empty());
        assert_eq!(expired, vec![id]);
        assert!(!tracker.contains(id));
    }

    #[test]
    fn test_fresh_entries_are_not_due() {
        let mut tracker = InflightTracker::new(8);
        let id = tracker.allocate().unwrap();
        tracker.insert(message(id));
        let (retry, expired) = tracker.take_due(Duration::from_secs(60), 3, 0);
        assert!(retry.is_empty() && expired.is_empty());
    }
}
