//! Work items from GitHub webhook / workflow event payloads.

use crate::error::{Result, SyncError};
use crate::types::{ItemKind, ItemState, WorkItem, WorkItemRef};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;

static CLOSING_RE: OnceLock<Regex> = OnceLock::new();

fn closing_re() -> &'static Regex {
    CLOSING_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\s*:?\s+(?:([\w.-]+/[\w.-]+))?#(\d+)\b",
        )
        .unwrap()
    })
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    pull_request: Option<Subject>,
    #[serde(default)]
    issue: Option<Subject>,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Subject {
    node_id: String,
    number: u64,
    state: String,
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    assignees: Vec<User>,
    #[serde(default)]
    body: Option<String>,
    /// Present on an `issue` that is really a pull request.
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

/// Issues a pull request body claims to close, e.g. `Fixes #12` or
/// `closes bcgov/other#4`. Duplicates are dropped.
pub fn closing_references(body: &str, repository: &str) -> Vec<WorkItemRef> {
    let mut refs: Vec<WorkItemRef> = Vec::new();
    for caps in closing_re().captures_iter(body) {
        let Ok(number) = caps[2].parse::<u64>() else {
            continue;
        };
        let repo = caps
            .get(1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| repository.to_string());
        if refs
            .iter()
            .any(|r| r.number == number && r.repository.eq_ignore_ascii_case(&repo))
        {
            continue;
        }
        refs.push(WorkItemRef {
            id: String::new(),
            repository: repo,
            number,
        });
    }
    refs
}

pub fn parse_event(json: &str) -> Result<WorkItem> {
    let payload: Payload =
        serde_json::from_str(json).map_err(|e| SyncError::InvalidEvent(e.to_string()))?;
    let repository = payload.repository.full_name;
    let (subject, mut kind) = match (payload.pull_request, payload.issue) {
        (Some(pr), _) => (pr, ItemKind::PullRequest),
        (None, Some(issue)) => (issue, ItemKind::Issue),
        (None, None) => {
            return Err(SyncError::InvalidEvent(
                "payload has neither pull_request nor issue".to_string(),
            ))
        }
    };
    if kind == ItemKind::Issue && subject.pull_request.is_some() {
        kind = ItemKind::PullRequest;
    }

    let state = match subject.state.to_ascii_lowercase().as_str() {
        "open" => ItemState::Open,
        "closed" if subject.merged || subject.merged_at.is_some() => ItemState::Merged,
        "closed" => ItemState::Closed,
        other => return Err(SyncError::InvalidEvent(format!("unknown state '{other}'"))),
    };
    let linked_issues = match (kind, subject.body.as_deref()) {
        (ItemKind::PullRequest, Some(body)) => closing_references(body, &repository),
        _ => Vec::new(),
    };

    Ok(WorkItem {
        kind,
        id: subject.node_id,
        number: subject.number,
        repository,
        author: subject
            .user
            .map(|u| u.login)
            .unwrap_or_else(|| "ghost".to_string()),
        assignees: subject.assignees.into_iter().map(|u| u.login).collect(),
        state,
        linked_issues,
        closed_at: subject.closed_at,
        merged_at: subject.merged_at,
    })
}

/// Read the payload at `path`, typically `$GITHUB_EVENT_PATH`.
pub fn load_event(path: &Path) -> Result<WorkItem> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| SyncError::InvalidEvent(format!("{}: {e}", path.display())))?;
    parse_event(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MERGED_PR: &str = r#"{
        "action": "closed",
        "pull_request": {
            "node_id": "PR_kwDO",
            "number": 42,
            "state": "closed",
            "merged": true,
            "merged_at": "2024-06-12T10:00:00Z",
            "closed_at": "2024-06-12T10:00:00Z",
            "user": { "login": "DerekRoberts" },
            "assignees": [{ "login": "mishraomp" }],
            "body": "Adds caching.\n\nFixes #7, closes bcgov/quickstart#3 and fixes #7 again"
        },
        "repository": { "full_name": "bcgov/nr-nerds" }
    }"#;

    #[test]
    fn merged_pull_request_with_closing_keywords() {
        let item = parse_event(MERGED_PR).unwrap();
        assert_eq!(item.kind, ItemKind::PullRequest);
        assert_eq!(item.state, ItemState::Merged);
        assert_eq!(item.author, "DerekRoberts");
        assert_eq!(item.assignees, vec!["mishraomp".to_string()]);
        let linked: Vec<(String, u64)> = item
            .linked_issues
            .iter()
            .map(|r| (r.repository.clone(), r.number))
            .collect();
        assert_eq!(
            linked,
            vec![
                ("bcgov/nr-nerds".to_string(), 7),
                ("bcgov/quickstart".to_string(), 3)
            ]
        );
    }

    #[test]
    fn closed_issue() {
        let json = r#"{
            "issue": {
                "node_id": "I_kwDO", "number": 9, "state": "closed",
                "closed_at": "2024-06-13T00:00:00Z", "user": { "login": "octocat" }
            },
            "repository": { "full_name": "bcgov/nr-nerds" }
        }"#;
        let item = parse_event(json).unwrap();
        assert_eq!(item.kind, ItemKind::Issue);
        assert_eq!(item.state, ItemState::Closed);
        assert!(item.linked_issues.is_empty());
    }

    #[test]
    fn comment_on_pull_request_is_a_pull_request() {
        let json = r#"{
            "issue": {
                "node_id": "PR_x", "number": 5, "state": "open",
                "user": { "login": "octocat" }, "pull_request": { "url": "https://example.invalid" }
            },
            "repository": { "full_name": "bcgov/nr-nerds" }
        }"#;
        assert_eq!(parse_event(json).unwrap().kind, ItemKind::PullRequest);
    }

    #[test]
    fn push_payload_is_rejected() {
        let err = parse_event(r#"{"ref":"main","repository":{"full_name":"a/b"}}"#).unwrap_err();
        assert!(matches!(err, SyncError::InvalidEvent(_)));
    }

    #[test]
    fn plain_mentions_are_not_closing_references() {
        assert!(closing_references("See #12 and relates to #4", "a/b").is_empty());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(&path, MERGED_PR).unwrap();
        assert_eq!(load_event(&path).unwrap().number, 42);
    }
}
