use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Named events a run reports. Aggregation and formatting happen elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    ItemsProcessed,
    ItemsAdded,
    ColumnsSet,
    TransitionBlocked,
    SprintAssigned,
    SprintRemoved,
    SprintSkipped,
    AssigneesAdded,
    AssigneesRemoved,
    AssigneesUnchanged,
    LinkedIssuesUpdated,
    MutationsFailed,
    RetriesAttempted,
    RetriesExhausted,
    PreflightSkipped,
    ItemErrors,
}

impl Counter {
    pub fn as_str(self) -> &'static str {
        match self {
            Counter::ItemsProcessed => "items_processed",
            Counter::ItemsAdded => "items_added",
            Counter::ColumnsSet => "columns_set",
            Counter::TransitionBlocked => "transition_blocked",
            Counter::SprintAssigned => "sprint_assigned",
            Counter::SprintRemoved => "sprint_removed",
            Counter::SprintSkipped => "sprint_skipped",
            Counter::AssigneesAdded => "assignees_added",
            Counter::AssigneesRemoved => "assignees_removed",
            Counter::AssigneesUnchanged => "assignees_unchanged",
            Counter::LinkedIssuesUpdated => "linked_issues_updated",
            Counter::MutationsFailed => "mutations_failed",
            Counter::RetriesAttempted => "retries_attempted",
            Counter::RetriesExhausted => "retries_exhausted",
            Counter::PreflightSkipped => "preflight_skipped",
            Counter::ItemErrors => "item_errors",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Counters {
    counts: BTreeMap<Counter, u64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&mut self, counter: Counter, by: u64) {
        if by == 0 {
            return;
        }
        tracing::debug!(counter = counter.as_str(), by, "counter");
        *self.counts.entry(counter).or_insert(0) += by;
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counts.get(&counter).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &Counters) {
        for (counter, n) in &other.counts {
            self.add(*counter, *n);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Counter, u64)> + '_ {
        self.counts.iter().map(|(c, n)| (*c, *n))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
