use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ItemKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    PullRequest,
    Issue,
}

impl ItemKind {
    pub fn all() -> &'static [ItemKind] {
        &[ItemKind::PullRequest, ItemKind::Issue]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::PullRequest => "pull_request",
            ItemKind::Issue => "issue",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemKind {
    type Err = crate::error::SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pull_request" | "pullrequest" | "pr" => Ok(ItemKind::PullRequest),
            "issue" => Ok(ItemKind::Issue),
            other => Err(crate::error::SyncError::InvalidConfig(format!(
                "unknown item kind '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ItemState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Open,
    Closed,
    Merged,
}

impl ItemState {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Open => "open",
            ItemState::Closed => "closed",
            ItemState::Merged => "merged",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemState {
    type Err = crate::error::SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(ItemState::Open),
            "closed" => Ok(ItemState::Closed),
            "merged" => Ok(ItemState::Merged),
            other => Err(crate::error::SyncError::InvalidConfig(format!(
                "unknown item state '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemRef {
    pub id: String,
    pub repository: String,
    pub number: u64,
}

/// Point-in-time snapshot of an issue or pull request.
///
/// Snapshots are never patched after a write; callers re-fetch instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub kind: ItemKind,
    /// GraphQL node id of the issue or pull request.
    pub id: String,
    pub number: u64,
    /// `owner/name`
    pub repository: String,
    pub author: String,
    #[serde(default)]
    pub assignees: Vec<String>,
    pub state: ItemState,
    #[serde(default)]
    pub linked_issues: Vec<WorkItemRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Short human label, e.g. `bcgov/quickstart#42`.
    pub fn label(&self) -> String {
        format!("{}#{}", self.repository, self.number)
    }

    pub fn to_ref(&self) -> WorkItemRef {
        WorkItemRef {
            id: self.id.clone(),
            repository: self.repository.clone(),
            number: self.number,
        }
    }

    /// When the item left the open state: merge time for pull requests,
    /// close time otherwise.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self.kind {
            ItemKind::PullRequest => self.merged_at.or(self.closed_at),
            ItemKind::Issue => self.closed_at,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ItemState::Open
    }
}

// ---------------------------------------------------------------------------
// BoardPlacement
// ---------------------------------------------------------------------------

/// The board-side state of one item: the part this crate reconciles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardPlacement {
    pub project_item_id: String,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub sprint_id: Option<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
}

// ---------------------------------------------------------------------------
// BoardField
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardField {
    Column,
    Sprint,
}

impl BoardField {
    pub fn as_str(self) -> &'static str {
        match self {
            BoardField::Column => "column",
            BoardField::Sprint => "sprint",
        }
    }
}

impl fmt::Display for BoardField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-select option of the board's status field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnOption {
    pub id: String,
    pub name: String,
}

/// The board's status field and the options it offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusField {
    pub id: String,
    pub options: Vec<ColumnOption>,
}
