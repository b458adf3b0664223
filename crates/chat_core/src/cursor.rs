use std::collections::HashMap;

use shared::domain::{ConversationId, Cursor};

/// Identifies one paginated list tracked by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListKey {
    Conversations,
    OlderMessages(ConversationId),
}

#[derive(Debug)]
struct ListState {
    next: Option<Cursor>,
    has_more: bool,
    in_flight: bool,
}

impl Default for ListState {
    fn default() -> Self {
        // A list starts with no cursor and is assumed to have a first page.
        Self {
            next: None,
            has_more: true,
            in_flight: false,
        }
    }
}

/// Forward-cursor tracker for paginated lists. An empty continuation pins a
/// list as exhausted until it is explicitly reset (conversation switch or
/// re-authentication), and at most one fetch per list key may be in flight:
/// duplicate triggers are refused rather than queued.
#[derive(Debug, Default)]
pub struct CursorStore {
    lists: HashMap<ListKey, ListState>,
}

impl CursorStore {
    /// Claim the next fetch for `key`. Returns the cursor to request with
    /// (`None` inside the `Some` means "first page"), or `None` when the list
    /// is exhausted or a fetch is already in flight.
    pub fn begin_fetch(&mut self, key: ListKey) -> Option<Option<Cursor>> {
        let state = self.lists.entry(key).or_default();
        if !state.has_more || state.in_flight {
            return None;
        }
        state.in_flight = true;
        Some(state.next.clone())
    }

    /// Record a completed fetch. An absent continuation token exhausts the
    /// list permanently until `reset`.
    pub fn complete_fetch(&mut self, key: &ListKey, next: Option<Cursor>) {
        if let Some(state) = self.lists.get_mut(key) {
            state.in_flight = false;
            state.has_more = next.is_some();
            state.next = next;
        }
    }

    /// Release the in-flight claim without consuming the cursor, so the next
    /// trigger retries the same page.
    pub fn abort_fetch(&mut self, key: &ListKey) {
        if let Some(state) = self.lists.get_mut(key) {
            state.in_flight = false;
        }
    }

    pub fn reset(&mut self, key: &ListKey) {
        self.lists.remove(key);
    }

    pub fn has_more(&self, key: &ListKey) -> bool {
        self.lists.get(key).map_or(true, |state| state.has_more)
    }

    pub fn in_flight(&self, key: &ListKey) -> bool {
        self.lists.get(key).is_some_and(|state| state.in_flight)
    }
}
