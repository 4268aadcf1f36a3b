use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::request::{DownloadRequest, RequestId};

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: RequestId,
    pub priority: i32,
    pub seq: u64,
}

impl QueueItem {
    pub fn new(id: RequestId, priority: i32, seq: u64) -> Self {
        Self { id, priority, seq }
    }

    pub fn for_request(request: &DownloadRequest) -> Self {
        Self::new(request.id, request.priority, request.seq)
    }
}

impl Eq for QueueItem {}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq && self.id == other.id
    }
}

// Max-heap: higher priority first, then lower seq (earlier admission).
impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| self.id.as_u128().cmp(&other.id.as_u128()))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending dispatch order. Entries may go stale (cancelled or re-admitted
/// requests); the dispatcher re-checks each popped item against the table.
#[derive(Debug, Default)]
pub struct RequestQueue {
    heap: BinaryHeap<QueueItem>,
}

impl RequestQueue {
    pub fn push(&mut self, item: QueueItem) {
        self.heap.push(item);
    }

    pub fn pop(&mut self) -> Option<QueueItem> {
        self.heap.pop()
    }

    pub fn remove(&mut self, id: &RequestId) {
        self.heap.retain(|item| &item.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn item(n: u128, priority: i32, seq: u64) -> QueueItem {
        QueueItem::new(Uuid::from_u128(n), priority, seq)
    }

    #[test]
    fn priority_then_fifo() {
        let mut queue = RequestQueue::default();
        queue.push(item(1, 1, 0));
        queue.push(item(2, 5, 1));
        queue.push(item(3, 1, 2));

        let order: Vec<u128> = std::iter::from_fn(|| queue.pop())
            .map(|item| item.id.as_u128())
            .collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn remove_drops_only_that_request() {
        let mut queue = RequestQueue::default();
        queue.push(item(1, 0, 0));
        queue.push(item(2, 9, 1));
        queue.push(item(3, 0, 2));
        queue.remove(&Uuid::from_u128(3));

        let ids: Vec<u128> = std::iter::from_fn(|| queue.pop())
            .map(|item| item.id.as_u128())
            .collect();
        assert_eq!(ids, vec![2, 1]);
    }
}
