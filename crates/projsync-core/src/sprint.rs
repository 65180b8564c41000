//! Sprint (iteration) resolution.
//!
//! Eligible columns other than Done follow the *current* iteration. Done is
//! strict about history: a completed item belongs to the iteration that was
//! running when it completed, or the next one to start after a coverage gap,
//! and is never moved into the current iteration by default.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub title: String,
    pub start_date: NaiveDate,
    pub duration_days: u32,
}

impl Iteration {
    pub fn starts_at(&self) -> DateTime<Utc> {
        self.start_date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_default()
    }

    /// Exclusive end of the window.
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.starts_at() + Duration::days(i64::from(self.duration_days))
    }

    /// Half-open window check: `[start, start + duration)`.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.starts_at() && at < self.ends_at()
    }

    fn overlaps(&self, other: &Iteration) -> bool {
        self.starts_at() < other.ends_at() && other.starts_at() < self.ends_at()
    }
}

// ---------------------------------------------------------------------------
// IterationSet
// ---------------------------------------------------------------------------

/// All iterations of one board, ordered by start date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationSet {
    iterations: Vec<Iteration>,
    overlaps: Vec<(String, String)>,
}

impl IterationSet {
    /// Merge the board's active and completed iterations. Duplicate ids keep
    /// the active copy. Overlapping windows are recorded and logged.
    pub fn merge(active: Vec<Iteration>, completed: Vec<Iteration>) -> Self {
        let mut by_id: BTreeMap<String, Iteration> = BTreeMap::new();
        for it in completed.into_iter().chain(active) {
            by_id.insert(it.id.clone(), it);
        }
        let mut iterations: Vec<Iteration> = by_id.into_values().collect();
        iterations.sort_by(|a, b| a.start_date.cmp(&b.start_date).then(a.id.cmp(&b.id)));

        let mut overlaps = Vec::new();
        for (i, a) in iterations.iter().enumerate() {
            for b in iterations.iter().skip(i + 1) {
                if b.starts_at() >= a.ends_at() {
                    break;
                }
                if a.overlaps(b) {
                    tracing::error!(
                        first = %a.title,
                        second = %b.title,
                        "iterations overlap; resolution inside the overlap is undefined"
                    );
                    overlaps.push((a.id.clone(), b.id.clone()));
                }
            }
        }

        Self {
            iterations,
            overlaps,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Iteration> {
        self.iterations.iter()
    }

    pub fn len(&self) -> usize {
        self.iterations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }

    pub fn overlaps(&self) -> &[(String, String)] {
        &self.overlaps
    }

    pub fn get(&self, id: &str) -> Option<&Iteration> {
        self.iterations.iter().find(|it| it.id == id)
    }

    /// Every iteration whose window contains `at`. More than one means the
    /// source data overlaps.
    pub fn containing(&self, at: DateTime<Utc>) -> Vec<&Iteration> {
        self.iterations.iter().filter(|it| it.contains(at)).collect()
    }

    /// The earliest iteration starting strictly after `at`.
    pub fn next_after(&self, at: DateTime<Utc>) -> Option<&Iteration> {
        self.iterations.iter().find(|it| it.starts_at() > at)
    }
}

// ---------------------------------------------------------------------------
// SprintColumns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SprintColumns {
    #[serde(default = "default_eligible")]
    pub eligible: Vec<String>,
    #[serde(default = "default_inactive")]
    pub inactive: Vec<String>,
    #[serde(default = "default_done")]
    pub done: String,
}

fn default_eligible() -> Vec<String> {
    ["Next", "Active", "Done", "Waiting"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_inactive() -> Vec<String> {
    ["New", "Parked", "Backlog"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_done() -> String {
    "Done".to_string()
}

impl Default for SprintColumns {
    fn default() -> Self {
        Self {
            eligible: default_eligible(),
            inactive: default_inactive(),
            done: default_done(),
        }
    }
}

impl SprintColumns {
    pub fn is_eligible(&self, column: &str) -> bool {
        self.eligible.iter().any(|c| c == column)
    }

    pub fn is_inactive(&self, column: &str) -> bool {
        self.inactive.iter().any(|c| c == column)
    }

    pub fn is_done(&self, column: &str) -> bool {
        self.done == column
    }
}

// ---------------------------------------------------------------------------
// SprintDecision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintAction {
    Assign,
    Remove,
    Skip,
}

impl fmt::Display for SprintAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SprintAction::Assign => "assign",
            SprintAction::Remove => "remove",
            SprintAction::Skip => "skip",
        })
    }
}

/// What should happen to an item's sprint. Resolution never writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SprintDecision {
    pub action: SprintAction,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_iteration_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_iteration_id: Option<String>,
}

impl SprintDecision {
    fn skip(reason: impl Into<String>, current: Option<&str>) -> Self {
        Self {
            action: SprintAction::Skip,
            reason: reason.into(),
            target_iteration_id: None,
            current_iteration_id: current.map(str::to_string),
        }
    }

    fn assign(reason: impl Into<String>, target: &Iteration, current: Option<&str>) -> Self {
        Self {
            action: SprintAction::Assign,
            reason: reason.into(),
            target_iteration_id: Some(target.id.clone()),
            current_iteration_id: current.map(str::to_string),
        }
    }

    fn remove(reason: impl Into<String>, current: &str) -> Self {
        Self {
            action: SprintAction::Remove,
            reason: reason.into(),
            target_iteration_id: None,
            current_iteration_id: Some(current.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// SprintResolver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SprintResolver {
    iterations: IterationSet,
    columns: SprintColumns,
}

impl SprintResolver {
    pub fn new(iterations: IterationSet, columns: SprintColumns) -> Self {
        Self {
            iterations,
            columns,
        }
    }

    pub fn iterations(&self) -> &IterationSet {
        &self.iterations
    }

    /// Decide the sprint action for an item in `column`.
    ///
    /// `completed_at` is the merge/close time and is only consulted for the
    /// Done column.
    pub fn resolve(
        &self,
        column: Option<&str>,
        current: Option<&str>,
        now: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> SprintDecision {
        let Some(column) = column else {
            return SprintDecision::skip("item has no column; not sprint-managed", current);
        };

        if self.columns.is_inactive(column) {
            return match current {
                Some(id) => SprintDecision::remove(
                    format!("column '{column}' is inactive; removing sprint"),
                    id,
                ),
                None => SprintDecision::skip(
                    format!("column '{column}' is inactive and no sprint is assigned"),
                    None,
                ),
            };
        }

        if !self.columns.is_eligible(column) {
            return SprintDecision::skip(
                format!("column '{column}' is not sprint-managed"),
                current,
            );
        }

        if self.columns.is_done(column) {
            return self.resolve_completed(current, completed_at);
        }

        let target = match self.single_containing(now) {
            Ok(Some(it)) => it,
            Ok(None) => return SprintDecision::skip("no active iteration configured", current),
            Err(reason) => return SprintDecision::skip(reason, current),
        };
        if current == Some(target.id.as_str()) {
            return SprintDecision::skip(
                format!("already in current sprint '{}'", target.title),
                current,
            );
        }
        SprintDecision::assign(
            format!("assigning current sprint '{}'", target.title),
            target,
            current,
        )
    }

    fn resolve_completed(
        &self,
        current: Option<&str>,
        completed_at: Option<DateTime<Utc>>,
    ) -> SprintDecision {
        let Some(completed_at) = completed_at else {
            return SprintDecision::skip(
                "completed item has no completion timestamp; refusing to default to the current sprint",
                current,
            );
        };
        let date = completed_at.format("%Y-%m-%d");

        match self.single_containing(completed_at) {
            Ok(Some(historical)) => {
                if current == Some(historical.id.as_str()) {
                    return SprintDecision::skip(
                        format!(
                            "already in sprint '{}' covering completion date {date}",
                            historical.title
                        ),
                        current,
                    );
                }
                return SprintDecision::assign(
                    format!(
                        "assigning sprint '{}' covering completion date {date}",
                        historical.title
                    ),
                    historical,
                    current,
                );
            }
            Ok(None) => {}
            Err(reason) => return SprintDecision::skip(reason, current),
        }

        match self.iterations.next_after(completed_at) {
            Some(next) if current == Some(next.id.as_str()) => SprintDecision::skip(
                format!("already in next available sprint '{}'", next.title),
                current,
            ),
            Some(next) => SprintDecision::assign(
                format!(
                    "no sprint covers completion date {date}; assigning next available sprint '{}'",
                    next.title
                ),
                next,
                current,
            ),
            None => SprintDecision::skip(
                format!("no sprint covers completion date {date} and none follow it"),
                current,
            ),
        }
    }

    fn single_containing(&self, at: DateTime<Utc>) -> Result<Option<&Iteration>, String> {
        let matches = self.iterations.containing(at);
        match matches.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(one)),
            many => {
                let titles: Vec<&str> = many.iter().map(|it| it.title.as_str()).collect();
                tracing::error!(at = %at, iterations = ?titles, "overlapping iterations; refusing to choose");
                Err(format!(
                    "overlapping iterations cover {}: {}",
                    at.format("%Y-%m-%d"),
                    titles.join(", ")
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn it(id: &str, y: i32, m: u32, d: u32, days: u32) -> Iteration {
        Iteration {
            id: id.into(),
            title: id.into(),
            start_date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            duration_days: days,
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    /// Sprint5 [06-01, 06-10), Sprint6 [06-15, 06-25).
    fn gapped() -> SprintResolver {
        SprintResolver::new(
            IterationSet::merge(
                vec![it("Sprint6", 2024, 6, 15, 10)],
                vec![it("Sprint5", 2024, 6, 1, 9)],
            ),
            SprintColumns::default(),
        )
    }

    #[test]
    fn window_is_half_open() {
        let s = it("s", 2024, 6, 1, 9);
        assert!(s.contains(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        assert!(s.contains(Utc.with_ymd_and_hms(2024, 6, 9, 23, 59, 59).unwrap()));
        assert!(!s.contains(Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap()));
    }

    #[test]
    fn unmanaged_column_skips() {
        let d = gapped().resolve(Some("Review"), None, at(2024, 6, 3), None);
        assert_eq!(d.action, SprintAction::Skip);
        assert!(d.reason.contains("not sprint-managed"));
        let none = gapped().resolve(None, None, at(2024, 6, 3), None);
        assert_eq!(none.action, SprintAction::Skip);
    }

    #[test]
    fn inactive_column_removes_only_when_assigned() {
        let r = gapped();
        let removed = r.resolve(Some("Parked"), Some("Sprint5"), at(2024, 6, 3), None);
        assert_eq!(removed.action, SprintAction::Remove);
        assert_eq!(removed.current_iteration_id.as_deref(), Some("Sprint5"));
        let skipped = r.resolve(Some("Backlog"), None, at(2024, 6, 3), None);
        assert_eq!(skipped.action, SprintAction::Skip);
    }

    #[test]
    fn eligible_column_assigns_current_window() {
        let d = gapped().resolve(Some("Active"), None, at(2024, 6, 16), None);
        assert_eq!(d.action, SprintAction::Assign);
        assert_eq!(d.target_iteration_id.as_deref(), Some("Sprint6"));
    }

    #[test]
    fn eligible_column_already_current_skips() {
        let d = gapped().resolve(Some("Next"), Some("Sprint6"), at(2024, 6, 16), None);
        assert_eq!(d.action, SprintAction::Skip);
        assert!(d.reason.contains("already"));
    }

    #[test]
    fn eligible_column_in_gap_skips_with_explicit_reason() {
        let d = gapped().resolve(Some("Waiting"), None, at(2024, 6, 12), None);
        assert_eq!(d.action, SprintAction::Skip);
        assert_eq!(d.reason, "no active iteration configured");
    }

    #[test]
    fn done_without_timestamp_never_defaults_to_current() {
        let d = gapped().resolve(Some("Done"), None, at(2024, 6, 16), None);
        assert_eq!(d.action, SprintAction::Skip);
        assert!(d.target_iteration_id.is_none());
    }

    #[test]
    fn done_uses_historical_sprint_not_current() {
        let d = gapped().resolve(Some("Done"), None, at(2024, 6, 20), Some(at(2024, 6, 5)));
        assert_eq!(d.action, SprintAction::Assign);
        assert_eq!(d.target_iteration_id.as_deref(), Some("Sprint5"));
    }

    #[test]
    fn done_already_in_historical_sprint_skips() {
        let d = gapped().resolve(Some("Done"), Some("Sprint5"), at(2024, 6, 20), Some(at(2024, 6, 5)));
        assert_eq!(d.action, SprintAction::Skip);
    }

    #[test]
    fn done_in_gap_assigns_next_available() {
        // merged on day 12, between Sprint5 (ends day 10) and Sprint6 (starts day 15)
        let d = gapped().resolve(Some("Done"), None, at(2024, 6, 20), Some(at(2024, 6, 12)));
        assert_eq!(d.action, SprintAction::Assign);
        assert_eq!(d.target_iteration_id.as_deref(), Some("Sprint6"));
        assert!(d.reason.contains("next available"));
    }

    #[test]
    fn done_after_last_sprint_skips_even_if_current_exists() {
        let d = gapped().resolve(Some("Done"), None, at(2024, 6, 20), Some(at(2024, 7, 1)));
        assert_eq!(d.action, SprintAction::Skip);
        assert!(d.reason.contains("none follow it"));
    }

    #[test]
    fn merge_dedupes_and_orders() {
        let set = IterationSet::merge(
            vec![it("b", 2024, 6, 15, 10), it("a", 2024, 6, 1, 9)],
            vec![it("a", 2024, 6, 1, 9), it("z", 2024, 5, 1, 14)],
        );
        let ids: Vec<_> = set.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
        assert!(set.overlaps().is_empty());
    }

    #[test]
    fn overlapping_iterations_are_flagged_and_not_resolved() {
        let r = SprintResolver::new(
            IterationSet::merge(
                vec![it("x", 2024, 6, 1, 14), it("y", 2024, 6, 10, 14)],
                vec![],
            ),
            SprintColumns::default(),
        );
        assert_eq!(r.iterations().overlaps(), &[("x".to_string(), "y".to_string())]);
        let d = r.resolve(Some("Active"), None, at(2024, 6, 12), None);
        assert_eq!(d.action, SprintAction::Skip);
        assert!(d.reason.contains("overlapping"));
        // outside the overlap resolution still works
        let ok = r.resolve(Some("Active"), None, at(2024, 6, 3), None);
        assert_eq!(ok.target_iteration_id.as_deref(), Some("x"));
    }
}
