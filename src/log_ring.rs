use std::collections::VecDeque;
use tokio::sync::mpsc::UnboundedSender;

pub const DEFAULT_MAX_ENTRIES: usize = 32;

pub type SubscriberId = u64;

/// Bounded backlog of formatted log lines with live subscribers.
///
/// Subscribers are plain channel senders. `attach` replays the backlog into
/// the sender before registering it, so a subscriber sees every line exactly
/// once and in order. Delivery happens inside `log`, on the owner's task.
#[derive(Debug)]
pub struct LogRing {
    max_entries: usize,
    entries: VecDeque<String>,
    subscribers: Vec<(SubscriberId, UnboundedSender<String>)>,
    next_id: SubscriberId,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl LogRing {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            max_entries,
            entries: VecDeque::with_capacity(max_entries),
            subscribers: Vec::new(),
            next_id: 1,
        }
    }

    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.entries.push_back(line.clone());
        if self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
        // Receivers that hung up are pruned here
        self.subscribers.retain(|(_, tx)| tx.send(line.clone()).is_ok());
    }

    pub fn attach(&mut self, subscriber: UnboundedSender<String>) -> SubscriberId {
        for line in &self.entries {
            if subscriber.send(line.clone()).is_err() {
                break;
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, subscriber));
        id
    }

    pub fn detach(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn detach_all(&mut self) {
        self.subscribers.clear();
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
