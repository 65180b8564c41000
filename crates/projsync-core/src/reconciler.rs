//! One reconciliation run across every rule category.

use crate::api::{BoardApi, Clock, SnapshotFilter};
use crate::config::Config;
use crate::counters::{Counter, Counters};
use crate::error::Result;
use crate::processors::{self, Pass, StageReport};
use crate::ratelimit::{preflight, Preflight};
use crate::rules::RuleCategory;
use crate::types::WorkItem;
use crate::verify::RetrySummary;
use chrono::Duration;
use serde::Serialize;

/// Where a run gets its items from.
#[derive(Debug, Clone)]
pub enum Seed {
    /// A single item taken from a webhook/workflow event payload.
    Event(WorkItem),
    /// A bulk search.
    Snapshot(SnapshotFilter),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub items: usize,
    pub stages: Vec<StageReport>,
    pub counters: Counters,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub retries: Vec<RetrySummary>,
}

impl RunReport {
    pub fn failure_count(&self) -> usize {
        self.stages.iter().map(|s| s.failures.len()).sum()
    }

    pub fn stage(&self, category: RuleCategory) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.category == category)
    }
}

pub struct Reconciler<'a> {
    api: &'a dyn BoardApi,
    clock: &'a dyn Clock,
    config: &'a Config,
    dry_run: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(api: &'a dyn BoardApi, clock: &'a dyn Clock, config: &'a Config) -> Self {
        Self {
            api,
            clock,
            config,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Items authored by or assigned to the monitored user, plus everything in
    /// the monitored repositories, updated within the lookback window.
    pub fn default_filter(&self) -> SnapshotFilter {
        let m = &self.config.monitored;
        SnapshotFilter {
            kinds: Vec::new(),
            author: Some(m.user.clone()),
            assignee: Some(m.user.clone()),
            repositories: m.repositories.clone(),
            updated_since: Some(
                self.clock.now() - Duration::hours(i64::from(self.config.limits.lookback_hours)),
            ),
        }
    }

    /// Run every stage in order. Per-item failures are collected in the
    /// report; only fatal errors end the run early.
    pub fn run(&self, seed: Seed) -> Result<RunReport> {
        self.config.ensure_valid()?;
        let mut pass = Pass::new(self.api, self.clock, self.config, self.dry_run)?;

        let items = match seed {
            Seed::Event(item) => vec![item],
            Seed::Snapshot(filter) => {
                match preflight(self.api, self.config.limits.rate_limit_floor, "snapshot")? {
                    Preflight::Proceed { .. } => self.api.fetch_snapshot(&filter)?,
                    Preflight::Skip { remaining, floor, .. } => {
                        pass.counters.increment(Counter::PreflightSkipped);
                        let reason = format!("rate limit {remaining} below floor {floor}; snapshot not fetched");
                        let stages = RuleCategory::all()
                            .iter()
                            .map(|&c| StageReport::skipped(c, 0, reason.clone()))
                            .collect();
                        return Ok(self.finish(pass, 0, stages));
                    }
                }
            }
        };
        tracing::info!(items = items.len(), dry_run = self.dry_run, "reconciling");
        pass.counters.add(Counter::ItemsProcessed, items.len() as u64);

        let mut stages = Vec::with_capacity(RuleCategory::all().len());
        for &category in RuleCategory::all() {
            let report = match category {
                RuleCategory::BoardItems => processors::board_items::process(&mut pass, &items)?,
                RuleCategory::Columns => processors::columns::process(&mut pass, &items)?,
                RuleCategory::Sprints => processors::sprints::process(&mut pass, &items)?,
                RuleCategory::Assignees => processors::assignees::process(&mut pass, &items)?,
                RuleCategory::LinkedIssues => processors::linked_issues::process(&mut pass, &items)?,
            };
            tracing::info!(
                stage = %category,
                decisions = report.decisions.len(),
                failures = report.failures.len(),
                skipped = report.is_skipped(),
                "stage finished"
            );
            stages.push(report);
        }
        Ok(self.finish(pass, items.len(), stages))
    }

    fn finish(&self, pass: Pass, items: usize, stages: Vec<StageReport>) -> RunReport {
        let mut counters = pass.counters;
        counters.merge(pass.verifier.counters());
        RunReport {
            dry_run: self.dry_run,
            items,
            stages,
            counters,
            retries: pass.verifier.retried(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::processors::testing::*;
    use crate::types::ItemState;
    use chrono::{TimeZone, Utc};

    #[test]
    fn end_to_end_new_to_done_lands_in_next_available_sprint() {
        let board = board();
        let clock = clock();
        let cfg = config();
        let mut item = pr("PR_1", 1, ItemState::Merged);
        item.merged_at = Some(Utc.with_ymd_and_hms(2024, 6, 12, 10, 0, 0).unwrap());
        board.seed_item(item.clone());
        board.seed_placement("PR_1", "PVTI_1", Some("New"), None);

        let report = Reconciler::new(&board, &clock, &cfg)
            .run(Seed::Event(item))
            .unwrap();

        let placed = board.placement("PR_1").unwrap();
        assert_eq!(placed.column.as_deref(), Some("Done"));
        assert_eq!(placed.sprint_id.as_deref(), Some("Sprint6"));
        let sprint = report.stage(RuleCategory::Sprints).unwrap();
        assert!(sprint.decisions[0].detail.contains("next available"));
        assert_eq!(report.counters.get(Counter::ItemsProcessed), 1);
        assert_eq!(report.failure_count(), 0);
    }

    #[test]
    fn snapshot_run_adds_and_places_new_work() {
        let board = board();
        let clock = clock();
        let cfg = config();
        board.seed_item(pr("PR_9", 9, ItemState::Open));

        let rec = Reconciler::new(&board, &clock, &cfg);
        let report = rec.run(Seed::Snapshot(rec.default_filter())).unwrap();
        let placed = board.placement("PR_9").unwrap();
        assert_eq!(placed.column.as_deref(), Some("Active"));
        assert_eq!(placed.sprint_id.as_deref(), Some("Sprint6"));
        assert_eq!(board.read_assignees_now("PR_9"), vec!["DerekRoberts".to_string()]);
        assert_eq!(report.counters.get(Counter::ItemsAdded), 1);
        assert_eq!(report.stages.len(), 5);
    }

    #[test]
    fn dry_run_changes_nothing() {
        let board = board();
        let clock = clock();
        let cfg = config();
        board.seed_item(pr("PR_9", 9, ItemState::Open));
        board.seed_placement("PR_9", "PVTI_9", None, None);

        let rec = Reconciler::new(&board, &clock, &cfg).dry_run(true);
        let report = rec.run(Seed::Snapshot(rec.default_filter())).unwrap();
        assert!(report.dry_run);
        assert_eq!(board.batch_requests(), 0);
        assert!(board.placement("PR_9").unwrap().column.is_none());
        assert!(!report.stage(RuleCategory::Columns).unwrap().decisions.is_empty());
    }

    #[test]
    fn exhausted_budget_skips_everything() {
        let board = board();
        board.set_rate_limit(5);
        board.seed_item(pr("PR_9", 9, ItemState::Open));
        let clock = clock();
        let cfg = config();
        let rec = Reconciler::new(&board, &clock, &cfg);
        let report = rec.run(Seed::Snapshot(rec.default_filter())).unwrap();
        assert!(report.stages.iter().all(StageReport::is_skipped));
        assert!(board.placement("PR_9").is_none());
    }

    #[test]
    fn exhausted_retries_fail_the_item_not_the_run() {
        let board = board();
        board.set_read_lag(10);
        let clock = clock();
        let cfg = config();
        let item = pr("PR_1", 1, ItemState::Open);
        board.seed_item(item.clone());
        board.seed_placement("PR_1", "PVTI_1", None, None);

        let report = Reconciler::new(&board, &clock, &cfg)
            .run(Seed::Event(item))
            .unwrap();
        assert!(report.failure_count() >= 1);
        assert!(report.counters.get(Counter::RetriesExhausted) >= 1);
        assert!(report.retries.iter().any(|r| !r.succeeded));
    }

    #[test]
    fn auth_failure_aborts_the_run() {
        let board = board();
        let clock = clock();
        let cfg = config();
        let item = pr("PR_1", 1, ItemState::Open);
        board.seed_placement("PR_1", "PVTI_1", None, None);
        board.fail_next_batch(SyncError::Unauthorized("token revoked".into()));
        let err = Reconciler::new(&board, &clock, &cfg)
            .run(Seed::Event(item))
            .unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));
    }

    #[test]
    fn invalid_config_is_fatal_before_any_call() {
        let board = board();
        let clock = clock();
        let mut cfg = config();
        cfg.rules.columns[0].valid_transitions.clear();
        cfg.rules.columns[1].valid_transitions.clear();
        let err = Reconciler::new(&board, &clock, &cfg)
            .run(Seed::Event(pr("PR_1", 1, ItemState::Open)))
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedTransitions(_)));
        assert_eq!(board.batch_requests(), 0);
    }
}
