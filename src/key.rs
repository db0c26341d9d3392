//! Cache keys. `InternalKey` addresses every scalar primitive
//! (counter, reference, stamped reference, sequence, latch); `QueueHeaderKey`
//! is a distinct type so queue headers never collide with scalar primitives
//! stored in the same cache. Both hash and compare solely on `name`.

use std::hash::{Hash, Hasher};

#[derive(Clone, Debug, Eq)]
pub struct InternalKey {
    pub name: String,
}

impl InternalKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PartialEq for InternalKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Hash for InternalKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

#[derive(Clone, Debug, Eq)]
pub struct QueueHeaderKey {
    pub name: String,
}

impl QueueHeaderKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PartialEq for QueueHeaderKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Hash for QueueHeaderKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}
