use std::collections::{BTreeSet, HashMap};

use crate::variable::{ObserverId, VarId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOutcome {
    pub first: bool,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwatchOutcome {
    pub last: bool,
    pub count: usize,
}

#[derive(Debug, Default)]
pub struct WatchTally {
    watchers: HashMap<VarId, BTreeSet<ObserverId>>,
}

impl WatchTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `observer` to the variable's watchers. Watching twice from the
    /// same observer does not count twice.
    pub fn watch(&mut self, id: VarId, observer: &ObserverId) -> WatchOutcome {
        let set = self.watchers.entry(id).or_default();
        let was_empty = set.is_empty();
        set.insert(observer.clone());

        WatchOutcome {
            first: was_empty,
            count: set.len(),
        }
    }

    pub fn unwatch(&mut self, id: VarId, observer: &ObserverId) -> UnwatchOutcome {
        let Some(set) = self.watchers.get_mut(&id) else {
            return UnwatchOutcome {
                last: false,
                count: 0,
            };
        };

        let removed = set.remove(observer);
        let count = set.len();
        if count == 0 {
            self.watchers.remove(&id);
        }

        UnwatchOutcome {
            last: removed && count == 0,
            count,
        }
    }

    pub fn unwatch_all(&mut self, observer: &ObserverId) -> Vec<VarId> {
        let mut released = Vec::new();

        self.watchers.retain(|id, set| {
            if set.remove(observer) && set.is_empty() {
                released.push(*id);
            }
            !set.is_empty()
        });

        released.sort_unstable();
        released
    }

    pub fn forget(&mut self, id: VarId) -> Vec<ObserverId> {
        self.watchers
            .remove(&id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, id: VarId) -> usize {
        self.watchers.get(&id).map_or(0, BTreeSet::len)
    }

    pub fn watchers(&self, id: VarId) -> Vec<ObserverId> {
        self.watchers
            .get(&id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_watching(&self, id: VarId, observer: &ObserverId) -> bool {
        self.watchers
            .get(&id)
            .is_some_and(|set| set.contains(observer))
    }
}
