//! Five FIFO queues, one per priority tier, feeding a single dispatcher.

use std::collections::VecDeque;

use super::message::{Message, Priority, PRIORITY_TIERS};

#[derive(Debug, Default)]
pub struct PriorityQueueSet {
    queues: [VecDeque<Message>; PRIORITY_TIERS],
}

impl PriorityQueueSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.queues[message.priority.index()].push_back(message);
    }

    /// Pop the oldest message from the highest-priority non-empty tier.
    pub fn pop_highest(&mut self) -> Option<Message> {
        self.queues.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn depth(&self, priority: Priority) -> usize {
        self.queues[priority.index()].len()
    }

    pub fn depths(&self) -> [usize; PRIORITY_TIERS] {
        let mut out = [0; PRIORITY_TIERS];
        for (i, queue) in self.queues.iter().enumerate() {
            out[i] = queue.len();
        }
        out
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(event_type: &str, priority: Priority) -> Message {
        Message::new(event_type, serde_json::Value::Null).with_priority(priority)
    }

    #[test]
    fn test_pop_respects_priority_over_enqueue_order() {
        let mut queues = PriorityQueueSet::new();
        queues.push(msg("a", Priority::Low));
        queues.push(msg("b", Priority::Critical));
        queues.push(msg("c", Priority::Normal));

        assert_eq!(queues.pop_highest().unwrap().event_type, "b");
        assert_eq!(queues.pop_highest().unwrap().event_type, "c");
        assert_eq!(queues.pop_highest().unwrap().event_type, "a");
        assert!(queues.pop_highest().is_none());
    }

    #[test]
    fn test_fifo_within_tier() {
        let mut queues = PriorityQueueSet::new();
        for i in 0..5 {
            queues.push(msg(&format!("m{}", i), Priority::High));
        }
        for i in 0..5 {
            assert_eq!(queues.pop_highest().unwrap().event_type, format!("m{}", i));
        }
    }

    #[test]
    fn test_depths() {
        let mut queues = PriorityQueueSet::new();
        queues.push(msg("a", Priority::Deferred));
        queues.push(msg("b", Priority::Deferred));
        queues.push(msg("c", Priority::Critical));

        assert_eq!(queues.depth(Priority::Deferred), 2);
        assert_eq!(queues.depth(Priority::Critical), 1);
        assert_eq!(queues.len(), 3);
        assert_eq!(queues.depths(), [1, 0, 0, 0, 2]);
    }
}
