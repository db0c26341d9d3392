//! Cache-resident value records. These cross the wire through the
//! backing cache's own serialization discipline, so every record has a
//! stable field ordering and derives `Serialize`/`Deserialize`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The next *unreserved* global id for a sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceValue {
    pub next: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicLongValue {
    pub v: i64,
}

/// Invariant: `0 <= count <= initial_count`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatchValue {
    pub count: i32,
    pub initial_count: i32,
    pub auto_delete: bool,
}

impl LatchValue {
    pub fn new(initial_count: i32, auto_delete: bool) -> Self {
        Self {
            count: initial_count,
            initial_count,
            auto_delete,
        }
    }

    /// `count_down` never goes below zero; returns the new count.
    pub fn count_down(&self, by: i32) -> i32 {
        (self.count - by).max(0)
    }
}

/// Invariant: `tail >= head >= 0`; `empty <=> head == tail`;
/// `size = tail - head`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHeader {
    pub id: Uuid,
    pub capacity: i32,
    pub collocated: bool,
    pub head: i64,
    pub tail: i64,
    pub removed: bool,
}

impl QueueHeader {
    pub fn fresh(capacity: i32, collocated: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            capacity,
            collocated,
            head: 0,
            tail: 0,
            removed: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn size(&self) -> i64 {
        self.tail - self.head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_count_down_floors_at_zero() {
        let v = LatchValue::new(2, true);
        assert_eq!(v.count_down(1), 1);
        assert_eq!(v.count_down(5), 0);
    }

    #[test]
    fn queue_header_size_and_empty() {
        let mut h = QueueHeader::fresh(16, true);
        assert!(h.is_empty());
        assert_eq!(h.size(), 0);
        h.tail = 3;
        assert!(!h.is_empty());
        assert_eq!(h.size(), 3);
    }
}
