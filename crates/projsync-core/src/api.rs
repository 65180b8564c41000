//! Seams to the outside world: the board API and the clock.

use crate::error::Result;
use crate::sprint::Iteration;
use crate::types::{BoardField, BoardPlacement, ItemKind, StatusField, WorkItem, WorkItemRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Snapshot queries
// ---------------------------------------------------------------------------

/// Which items a bulk snapshot returns.
///
/// `kinds` narrows the result. `author`, `assignee` and `repositories` widen
/// it: an item matching any one of them is admitted. With none of the three
/// set, every item of an admitted kind is returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFilter {
    #[serde(default)]
    pub kinds: Vec<ItemKind>,
    /// Items authored by this login.
    #[serde(default)]
    pub author: Option<String>,
    /// Items assigned to this login.
    #[serde(default)]
    pub assignee: Option<String>,
    /// Items in any of these `owner/name` repositories.
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Applied by the host's search; snapshots carry no update time.
    #[serde(default)]
    pub updated_since: Option<DateTime<Utc>>,
}

impl SnapshotFilter {
    pub fn admits(&self, item: &WorkItem) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&item.kind) {
            return false;
        }
        let widened = self.author.is_some() || self.assignee.is_some() || !self.repositories.is_empty();
        if !widened {
            return true;
        }
        let by_author = self
            .author
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(&item.author));
        let by_assignee = self
            .assignee
            .as_deref()
            .is_some_and(|a| item.assignees.iter().any(|x| x.eq_ignore_ascii_case(a)));
        let by_repo = self
            .repositories
            .iter()
            .any(|r| r.eq_ignore_ascii_case(&item.repository));
        by_author || by_assignee || by_repo
    }
}

// ---------------------------------------------------------------------------
// Board fields
// ---------------------------------------------------------------------------

/// The board's iteration field with its active and completed iterations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SprintField {
    pub id: String,
    #[serde(default)]
    pub active: Vec<Iteration>,
    #[serde(default)]
    pub completed: Vec<Iteration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Column,
    Sprint,
    Assignees,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::Column => "column",
            FieldKind::Sprint => "sprint",
            FieldKind::Assignees => "assignees",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationOp {
    SetColumn { field_id: String, option_id: String },
    SetIteration { field_id: String, iteration_id: String },
    ClearField { field_id: String },
    AddAssignees { logins: Vec<String> },
    RemoveAssignees { logins: Vec<String> },
}

impl MutationOp {
    pub fn kind(&self) -> FieldKind {
        match self {
            MutationOp::SetColumn { .. } => FieldKind::Column,
            MutationOp::SetIteration { .. } | MutationOp::ClearField { .. } => FieldKind::Sprint,
            MutationOp::AddAssignees { .. } | MutationOp::RemoveAssignees { .. } => {
                FieldKind::Assignees
            }
        }
    }
}

/// One aliased sub-operation of a multi-operation request.
///
/// `target_id` is the project item id for field writes and the issue / pull
/// request node id for assignee writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMutation {
    pub alias: String,
    pub target_id: String,
    pub op: MutationOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResult {
    pub alias: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl MutationResult {
    pub fn ok(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            error: None,
        }
    }

    pub fn failed(alias: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            error: Some(error.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

// ---------------------------------------------------------------------------
// BoardApi
// ---------------------------------------------------------------------------

/// Everything the reconciliation core needs from the board host.
pub trait BoardApi {
    fn fetch_snapshot(&self, filter: &SnapshotFilter) -> Result<Vec<WorkItem>>;

    fn fetch_item(&self, item: &WorkItemRef) -> Result<WorkItem>;

    /// The item's placement on the board, or `None` if it is not on it.
    fn find_placement(&self, content_id: &str) -> Result<Option<BoardPlacement>>;

    /// Add the issue/pull request to the board, returning the project item id.
    fn add_to_board(&self, content_id: &str) -> Result<String>;

    /// Read one field of a project item: the column name or the iteration id.
    fn read_field(&self, project_item_id: &str, field: BoardField) -> Result<Option<String>>;

    /// Live assignee logins of an issue or pull request.
    fn read_assignees(&self, content_id: &str) -> Result<Vec<String>>;

    fn status_field(&self, name: &str) -> Result<StatusField>;

    fn sprint_field(&self, name: &str) -> Result<SprintField>;

    /// Execute all mutations in a single request. Per-alias failures are
    /// reported in the results; `Err` means the request as a whole failed.
    fn execute_batch(&self, mutations: &[FieldMutation]) -> Result<Vec<MutationResult>>;

    fn rate_limit_status(&self) -> Result<RateLimitStatus>;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock frozen at one instant. Sleeps return immediately and are recorded.
#[derive(Debug)]
pub struct FixedClock {
    now: DateTime<Utc>,
    slept: RefCell<Vec<Duration>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            slept: RefCell::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}
