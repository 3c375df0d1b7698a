//! Per-session interrupt queue: messages arriving while a turn is running,
//! ordered by priority then arrival.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use courier_channels::UnifiedMessage;

/// How an interrupt cuts into a running turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterruptPriority {
    /// Queued silently; processed as a fresh turn after the current one.
    Normal = 0,
    /// Picked up by the agent's stop hook at the next iteration boundary.
    High = 1,
    /// The in-flight LLM call is additionally cancelled.
    Urgent = 2,
}

/// A message waiting to overtake or follow the running turn.
#[derive(Debug)]
pub struct InterruptMessage {
    pub message: UnifiedMessage,
    pub priority: InterruptPriority,
    pub queued_at: Instant,
    /// Monotonic arrival counter — the tiebreak within a priority class
    /// (strictly ordered even when two arrivals share an instant).
    seq: u64,
}

impl PartialEq for InterruptMessage {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for InterruptMessage {}

impl Ord for InterruptMessage {
    /// Max-heap order: higher priority first, earlier arrival first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for InterruptMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue for one session key.
#[derive(Default)]
pub struct InterruptQueue {
    heap: BinaryHeap<InterruptMessage>,
    next_seq: u64,
}

impl InterruptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: UnifiedMessage, priority: InterruptPriority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(InterruptMessage {
            message,
            priority,
            queued_at: Instant::now(),
            seq,
        });
    }

    /// Highest-priority, earliest-arrival message.
    pub fn pop(&mut self) -> Option<InterruptMessage> {
        self.heap.pop()
    }

    /// Pop only if the head is at least `min` priority.
    pub fn pop_at_least(&mut self, min: InterruptPriority) -> Option<InterruptMessage> {
        if self.heap.peek().is_some_and(|head| head.priority >= min) {
            self.heap.pop()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_channels::MessageContent;

    fn msg(text: &str) -> UnifiedMessage {
        UnifiedMessage::new("telegram", "m", "u", "c", MessageContent::text_only(text))
    }

    #[test]
    fn drains_by_priority_then_arrival() {
        let mut queue = InterruptQueue::new();
        queue.push(msg("n1"), InterruptPriority::Normal);
        queue.push(msg("h1"), InterruptPriority::High);
        queue.push(msg("n2"), InterruptPriority::Normal);
        queue.push(msg("u1"), InterruptPriority::Urgent);
        queue.push(msg("h2"), InterruptPriority::High);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|im| im.message.text().to_string())
            .collect();
        assert_eq!(order, vec!["u1", "h1", "h2", "n1", "n2"]);
    }

    #[test]
    fn same_priority_preserves_arrival_order() {
        let mut queue = InterruptQueue::new();
        for i in 0..10 {
            queue.push(msg(&format!("m{i}")), InterruptPriority::High);
        }
        for i in 0..10 {
            assert_eq!(queue.pop().unwrap().message.text(), format!("m{i}"));
        }
    }

    #[test]
    fn pop_at_least_skips_lower_priorities() {
        let mut queue = InterruptQueue::new();
        queue.push(msg("normal"), InterruptPriority::Normal);
        assert!(queue.pop_at_least(InterruptPriority::High).is_none());
        assert_eq!(queue.len(), 1);

        queue.push(msg("high"), InterruptPriority::High);
        let popped = queue.pop_at_least(InterruptPriority::High).unwrap();
        assert_eq!(popped.message.text(), "high");
        // the normal one stays for the post-turn drain
        assert_eq!(queue.len(), 1);
    }
}
