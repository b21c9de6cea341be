use hashbrown::HashMap;

/// One session-modifying request together with the canonical outcome that
/// was delivered to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: u64,
    pub payload: Vec<u8>,
    pub ok: bool,
    pub error_code: u16,
}

impl HistoryEntry {
    pub fn matches(&self, ok: bool, error_code: u16) -> bool {
        self.ok == ok && self.error_code == error_code
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Debug, Default)]
struct SubscriberState {
    position: usize,
    current_id: u64,
}

/// Ordered log of session-modifying requests, owned by the client session.
/// Each backend holds a subscriber cursor; all subscribers see the same
/// ordered stream.
#[derive(Debug, Default)]
pub struct History {
    entries: Vec<HistoryEntry>,
    subscribers: HashMap<SubscriberId, SubscriberState>,
    next_subscriber: u64,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Attach a new subscriber at the head of the log. Everything recorded
    /// so far is pending for it; a backend attached at session start sees an
    /// empty log and replays nothing.
    pub fn subscribe(&mut self) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        self.subscribers.insert(id, SubscriberState::default());
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) {
        self.subscribers.remove(&id);
    }

    /// Record a completed session-modifying response. A subscriber whose
    /// backend is currently executing exactly this request saw it live, not
    /// as a replay, so its cursor moves past the new entry.
    pub fn add(&mut self, entry: HistoryEntry) {
        let index = self.entries.len();
        let id = entry.id;
        self.entries.push(entry);
        for state in self.subscribers.values_mut() {
            if state.current_id == id && state.position == index {
                state.position = index + 1;
            }
        }
    }

    /// Entries the subscriber has not yet seen, in order.
    pub fn pending(&self, id: SubscriberId) -> &[HistoryEntry] {
        match self.subscribers.get(&id) {
            Some(state) => &self.entries[state.position.min(self.entries.len())..],
            None => &[],
        }
    }

    /// Mark which request the subscriber's backend is currently executing.
    pub fn set_current(&mut self, id: SubscriberId, request_id: u64) {
        if let Some(state) = self.subscribers.get_mut(&id) {
            state.current_id = request_id;
        }
    }

    /// Verify the backend's response against the recorded one and advance
    /// the cursor. `None` when the current request is not in the log;
    /// `Some(false)` on divergence.
    pub fn record_response(&mut self, id: SubscriberId, ok: bool, error_code: u16) -> Option<bool> {
        let state = self.subscribers.get_mut(&id)?;
        let entry = self.entries.get(state.position)?;
        if entry.id != state.current_id {
            return None;
        }
        let matched = entry.matches(ok, error_code);
        state.position += 1;
        Some(matched)
    }

    /// Erase the entry for `request_id` (e.g. its COM_STMT_CLOSE arrived),
    /// unless a subscriber has not yet replayed it.
    pub fn erase(&mut self, request_id: u64) -> bool {
        let Some(index) = self.entries.iter().position(|e| e.id == request_id) else {
            return false;
        };
        if self.subscribers.values().any(|s| s.position <= index) {
            return false;
        }
        self.entries.remove(index);
        for state in self.subscribers.values_mut() {
            if state.position > index {
                state.position -= 1;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, ok: bool) -> HistoryEntry {
        HistoryEntry {
            id,
            payload: vec![0x03, b'x'],
            ok,
            error_code: if ok { 0 } else { 1064 },
        }
    }

    #[test]
    fn test_fresh_subscriber_has_nothing_pending() {
        let mut history = History::new();
        let sub = history.subscribe();
        assert!(history.pending(sub).is_empty());
    }

    #[test]
    fn test_reuse_subscriber_replays_everything() {
        let mut history = History::new();
        history.add(entry(1, true));
        history.add(entry(2, true));
        let sub = history.subscribe();
        assert_eq!(history.pending(sub).len(), 2);

        history.set_current(sub, 1);
        assert_eq!(history.record_response(sub, true, 0), Some(true));
        history.set_current(sub, 2);
        assert_eq!(history.record_response(sub, true, 0), Some(true));
        assert!(history.pending(sub).is_empty());
    }

    #[test]
    fn test_divergent_response_is_flagged() {
        let mut history = History::new();
        history.add(entry(1, true));
        let sub = history.subscribe();
        history.set_current(sub, 1);
        assert_eq!(history.record_response(sub, false, 1064), Some(false));
    }

    #[test]
    fn test_all_subscribers_see_the_same_stream() {
        let mut history = History::new();
        history.add(entry(1, true));
        history.add(entry(2, false));
        let a = history.subscribe();
        let b = history.subscribe();
        assert_eq!(history.pending(a), history.pending(b));
    }

    #[test]
    fn test_erase_respects_lagging_subscribers() {
        let mut history = History::new();
        history.add(entry(1, true));
        history.add(entry(2, true));
        let fast = history.subscribe();
        history.set_current(fast, 1);
        history.record_response(fast, true, 0);
        history.set_current(fast, 2);
        history.record_response(fast, true, 0);

        let slow = history.subscribe();
        assert!(!history.erase(1)); // slow has not replayed it yet
        history.set_current(slow, 1);
        history.record_response(slow, true, 0);
        assert!(history.erase(1));
        // positions shifted so the remaining entry is still correct
        assert_eq!(history.pending(slow), &[entry(2, true)][..]);
        assert!(history.pending(fast).is_empty());
    }
}
