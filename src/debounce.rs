use crate::models::{EventKind, EventMask, RelationName};
use std::collections::HashMap;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy)]
struct OpenWindow {
    id: u64,
    kinds: EventMask,
    coalesced: usize,
}

/// A window that closed; `kinds` is every event kind seen while it was open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredWindow {
    pub kinds: EventMask,
    pub coalesced: usize,
}

/// Per-relation fixed-window coalescing. The window opens on the first
/// notification and is not extended by later ones; the caller owns the timer
/// and reports expiry back through [`Debouncer::fire`].
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    next_window_id: u64,
    open: HashMap<RelationName, OpenWindow>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            next_window_id: 0,
            open: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records a notification. Returns the id of a freshly opened window when
    /// the caller must start a timer for it.
    pub fn notify(&mut self, relation: &RelationName, kind: EventKind) -> Option<u64> {
        if let Some(window) = self.open.get_mut(relation) {
            window.kinds = window.kinds.with(kind);
            window.coalesced += 1;
            return None;
        }

        self.next_window_id += 1;
        let id = self.next_window_id;
        self.open.insert(
            relation.clone(),
            OpenWindow {
                id,
                kinds: kind.into(),
                coalesced: 1,
            },
        );
        Some(id)
    }

    /// Closes the window if `window_id` is still the open one for `relation`.
    pub fn fire(&mut self, relation: &RelationName, window_id: u64) -> Option<FiredWindow> {
        match self.open.get(relation) {
            Some(window) if window.id == window_id => {
                let window = self.open.remove(relation)?;
                Some(FiredWindow {
                    kinds: window.kinds,
                    coalesced: window.coalesced,
                })
            }
            _ => None,
        }
    }

    pub fn clear(&mut self, relation: &RelationName) {
        self.open.remove(relation);
    }

    pub fn clear_all(&mut self) {
        self.open.clear();
    }

    pub fn is_open(&self, relation: &RelationName) -> bool {
        self.open.contains_key(relation)
    }
}
