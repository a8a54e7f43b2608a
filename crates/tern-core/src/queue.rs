// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use tern_model::{ContentPart, QueuedMessage};

/// The queue refused a message.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("message queue is full (capacity {capacity})")]
    Full { capacity: usize },
}

/// Per-session bounded FIFO of user messages awaiting a busy session.
///
/// The busy gate itself lives in the session runtime; the queue only
/// enforces capacity and ordering.
pub struct MessageQueue {
    inner: Mutex<VecDeque<QueuedMessage>>,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(VecDeque::new()), capacity }
    }

    /// Append a message; returns it with its 0-based queue position.
    pub fn enqueue(&self, content: Vec<ContentPart>) -> Result<(QueuedMessage, usize), QueueError> {
        let mut q = self.inner.lock().expect("queue poisoned");
        if q.len() >= self.capacity {
            return Err(QueueError::Full { capacity: self.capacity });
        }
        let msg = QueuedMessage::new(content);
        q.push_back(msg.clone());
        Ok((msg, q.len() - 1))
    }

    /// Remove and return everything, in arrival order.
    pub fn drain(&self) -> Vec<QueuedMessage> {
        self.inner.lock().expect("queue poisoned").drain(..).collect()
    }

    pub fn list(&self) -> Vec<QueuedMessage> {
        self.inner.lock().expect("queue poisoned").iter().cloned().collect()
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut q = self.inner.lock().expect("queue poisoned");
        let before = q.len();
        q.retain(|m| m.id != id);
        q.len() != before
    }

    /// Empty the queue, returning how many messages were dropped.
    pub fn clear(&self) -> usize {
        let mut q = self.inner.lock().expect("queue poisoned");
        let n = q.len();
        q.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Vec<ContentPart> {
        vec![ContentPart::text(s)]
    }

    #[test]
    fn enqueue_reports_position() {
        let q = MessageQueue::new(10);
        let (_, p0) = q.enqueue(text("a")).unwrap();
        let (_, p1) = q.enqueue(text("b")).unwrap();
        assert_eq!((p0, p1), (0, 1));
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let q = MessageQueue::new(10);
        q.enqueue(text("first")).unwrap();
        q.enqueue(text("second")).unwrap();
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].content, text("first"));
        assert_eq!(drained[1].content, text("second"));
        assert!(q.is_empty());
    }

    #[test]
    fn capacity_is_enforced() {
        let q = MessageQueue::new(1);
        q.enqueue(text("a")).unwrap();
        assert!(matches!(q.enqueue(text("b")), Err(QueueError::Full { capacity: 1 })));
    }

    #[test]
    fn remove_then_length_unchanged_from_start() {
        let q = MessageQueue::new(10);
        let baseline = q.len();
        let (msg, _) = q.enqueue(text("transient")).unwrap();
        assert!(q.remove(&msg.id));
        assert_eq!(q.len(), baseline);
    }

    #[test]
    fn remove_unknown_id_is_false() {
        let q = MessageQueue::new(10);
        q.enqueue(text("a")).unwrap();
        assert!(!q.remove("no-such-id"));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn clear_reports_dropped_count() {
        let q = MessageQueue::new(10);
        q.enqueue(text("a")).unwrap();
        q.enqueue(text("b")).unwrap();
        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
    }
}
