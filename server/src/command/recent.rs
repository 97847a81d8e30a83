use std::collections::VecDeque;

pub const DEFAULT_RECENT_UIDS: usize = 10;

/// Fixed-capacity window of recently seen command uids for one client.
#[derive(Debug, Clone)]
pub struct RecentUids {
    capacity: usize,
    uids: VecDeque<u32>,
}

impl Default for RecentUids {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_UIDS)
    }
}

impl RecentUids {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            uids: VecDeque::with_capacity(capacity),
        }
    }

    /// Records `uid` and returns true, or returns false if it is still in the
    /// window. Inserting into a full window evicts the oldest uid.
    pub fn insert(&mut self, uid: u32) -> bool {
        if self.uids.contains(&uid) {
            return false;
        }
        if self.uids.len() == self.capacity {
            self.uids.pop_front();
        }
        self.uids.push_back(uid);
        true
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.uids.contains(&uid)
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }
}
