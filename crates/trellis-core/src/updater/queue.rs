//! Debounce queue for file-change events.
//!
//! Editors save in bursts. The queue keeps only the latest change per path
//! and releases a path once it has been quiet for the debounce period, in
//! the order paths first arrived.

use std::time::{Duration, Instant};

use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Write(Vec<u8>),
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyUpdate {
    pub path: String,
    pub change: FileChange,
    /// Events folded into this update.
    pub coalesced: usize,
}

#[derive(Debug)]
struct Pending {
    change: FileChange,
    last_seen: Instant,
    events: usize,
}

#[derive(Debug)]
pub struct UpdateQueue {
    debounce: Duration,
    pending: IndexMap<String, Pending>,
}

impl UpdateQueue {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: IndexMap::new(),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn push(&mut self, path: &str, change: FileChange) {
        self.push_at(path, change, Instant::now());
    }

    /// Record a change seen at `now`. A path already waiting keeps its place
    /// in line but restarts its quiet period.
    pub fn push_at(&mut self, path: &str, change: FileChange, now: Instant) {
        match self.pending.get_mut(path) {
            Some(pending) => {
                pending.change = change;
                pending.last_seen = now;
                pending.events += 1;
            }
            None => {
                self.pending.insert(
                    path.to_string(),
                    Pending {
                        change,
                        last_seen: now,
                        events: 1,
                    },
                );
            }
        }
    }

    pub fn drain_ready(&mut self) -> Vec<ReadyUpdate> {
        self.drain_ready_at(Instant::now())
    }

    /// Remove and return every path quiet since `now - debounce`.
    pub fn drain_ready_at(&mut self, now: Instant) -> Vec<ReadyUpdate> {
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) >= self.debounce)
            .map(|(path, _)| path.clone())
            .collect();
        ready
            .into_iter()
            .filter_map(|path| {
                let pending = self.pending.shift_remove(&path)?;
                Some(ReadyUpdate {
                    path,
                    change: pending.change,
                    coalesced: pending.events,
                })
            })
            .collect()
    }

    /// Everything still waiting, ready or not.
    pub fn flush(&mut self) -> Vec<ReadyUpdate> {
        self.pending
            .drain(..)
            .map(|(path, pending)| ReadyUpdate {
                path,
                change: pending.change,
                coalesced: pending.events,
            })
            .collect()
    }

    /// When the next path becomes ready, if any is waiting.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.last_seen + self.debounce)
            .min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bursts_collapse_to_latest_content() {
        let start = Instant::now();
        let mut queue = UpdateQueue::new(Duration::from_millis(300));
        queue.push_at("a.py", FileChange::Write(b"v1".to_vec()), start);
        queue.push_at("a.py", FileChange::Write(b"v2".to_vec()), start + Duration::from_millis(100));
        queue.push_at("a.py", FileChange::Write(b"v3".to_vec()), start + Duration::from_millis(200));

        assert!(queue.drain_ready_at(start + Duration::from_millis(400)).is_empty());
        let ready = queue.drain_ready_at(start + Duration::from_millis(500));
        assert_eq!(
            ready,
            vec![ReadyUpdate {
                path: "a.py".into(),
                change: FileChange::Write(b"v3".to_vec()),
                coalesced: 3,
            }]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_release_order_follows_first_arrival() {
        let start = Instant::now();
        let mut queue = UpdateQueue::new(Duration::from_millis(100));
        queue.push_at("b.py", FileChange::Write(b"b".to_vec()), start);
        queue.push_at("a.py", FileChange::Remove, start + Duration::from_millis(10));
        queue.push_at("b.py", FileChange::Write(b"b2".to_vec()), start + Duration::from_millis(20));

        assert_eq!(queue.next_ready_at(), Some(start + Duration::from_millis(110)));
        let ready = queue.drain_ready_at(start + Duration::from_millis(200));
        let paths: Vec<&str> = ready.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["b.py", "a.py"]);
    }

    #[test]
    fn test_flush_releases_everything() {
        let mut queue = UpdateQueue::new(Duration::from_secs(60));
        queue.push("a.py", FileChange::Remove);
        queue.push("b.py", FileChange::Write(Vec::new()));
        assert_eq!(queue.flush().len(), 2);
        assert!(queue.next_ready_at().is_none());
    }
}
