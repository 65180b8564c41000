//! Per-category processors.
//!
//! Each stage reads fresh board state for its items, evaluates its rules,
//! queues the resulting writes through the batcher, and verifies what was
//! applied. Stages share one [`Pass`] so caches, counters and retry audits
//! span the whole run.

pub mod assignees;
pub mod board_items;
pub mod columns;
pub mod linked_issues;
pub mod sprints;

use crate::api::{BoardApi, Clock, FieldKind};
use crate::batch::{BatchReport, FieldUpdate, MutationBatcher};
use crate::condition::EvalContext;
use crate::config::Config;
use crate::context::RunContext;
use crate::counters::{Counter, Counters};
use crate::error::{Result, SyncError};
use crate::ratelimit::{preflight, Preflight};
use crate::rules::{evaluate_rules, Action, RuleCategory, RuleSet};
use crate::transition::TransitionValidator;
use crate::types::{BoardPlacement, WorkItem};
use crate::verify::StateVerifier;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    /// The stage did not run, e.g. the rate-limit budget was below the floor.
    Skipped { reason: String },
}

/// One decision taken for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemDecision {
    pub item: String,
    pub action: String,
    pub detail: String,
    /// `false` for blocked transitions, skipped sprints and dry runs.
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub item: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub category: RuleCategory,
    pub outcome: StageOutcome,
    pub items: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<ItemDecision>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ItemFailure>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub batches: Vec<BatchReport>,
}

impl StageReport {
    pub fn new(category: RuleCategory, items: usize) -> Self {
        Self {
            category,
            outcome: StageOutcome::Completed,
            items,
            decisions: Vec::new(),
            failures: Vec::new(),
            batches: Vec::new(),
        }
    }

    pub fn skipped(category: RuleCategory, items: usize, reason: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::Skipped {
                reason: reason.into(),
            },
            ..Self::new(category, items)
        }
    }

    pub fn decide(&mut self, item: &str, action: impl Into<String>, detail: impl Into<String>, applied: bool) {
        self.decisions.push(ItemDecision {
            item: item.to_string(),
            action: action.into(),
            detail: detail.into(),
            applied,
        });
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, StageOutcome::Skipped { .. })
    }
}

// ---------------------------------------------------------------------------
// Pass
// ---------------------------------------------------------------------------

/// Shared state of one reconciliation run.
pub struct Pass<'a> {
    pub api: &'a dyn BoardApi,
    pub clock: &'a dyn Clock,
    pub config: &'a Config,
    pub rules: RuleSet,
    pub validator: TransitionValidator,
    pub batcher: MutationBatcher,
    pub ctx: RunContext,
    pub verifier: StateVerifier<'a>,
    pub counters: Counters,
}

impl<'a> Pass<'a> {
    pub fn new(
        api: &'a dyn BoardApi,
        clock: &'a dyn Clock,
        config: &'a Config,
        dry_run: bool,
    ) -> Result<Self> {
        let table = config.transition_table()?;
        Ok(Self {
            api,
            clock,
            config,
            rules: config.rule_set(),
            validator: TransitionValidator::new(table),
            batcher: MutationBatcher::new(config.limits.batch_size, dry_run),
            ctx: RunContext::new(&config.project),
            verifier: StateVerifier::new(config.retry.clone(), clock),
            counters: Counters::new(),
        })
    }

    pub fn dry_run(&self) -> bool {
        self.batcher.is_dry_run()
    }

    /// Rate-limit preflight for a stage. `Some` carries the skipped report.
    pub fn preflight(&mut self, category: RuleCategory, items: usize) -> Result<Option<StageReport>> {
        match preflight(self.api, self.config.limits.rate_limit_floor, category.as_str())? {
            Preflight::Proceed { .. } => Ok(None),
            Preflight::Skip {
                remaining,
                floor,
                reset_at,
            } => {
                self.counters.increment(Counter::PreflightSkipped);
                Ok(Some(StageReport::skipped(
                    category,
                    items,
                    format!("rate limit {remaining} below floor {floor}; resets at {reset_at}"),
                )))
            }
        }
    }

    /// Evaluate a category's rules for `item` as it currently sits on the board.
    pub fn evaluate(
        &self,
        category: RuleCategory,
        item: &WorkItem,
        placement: Option<&BoardPlacement>,
    ) -> Vec<Action> {
        let ctx = EvalContext::new(item, placement, &self.config.monitored);
        evaluate_rules(&ctx, self.rules.for_category(category))
    }

    /// Fresh placement of `content_id`, retrying transient read failures.
    pub fn find_placement(&mut self, item: &str, content_id: &str) -> Result<Option<BoardPlacement>> {
        let api = self.api;
        self.verifier
            .retry_with_tracking(item, "read placement", || api.find_placement(content_id))
    }

    /// Live assignees of `content_id`, retrying transient read failures.
    pub fn read_assignees(&mut self, item: &str, content_id: &str) -> Result<Vec<String>> {
        let api = self.api;
        self.verifier
            .retry_with_tracking(item, "read assignees", || api.read_assignees(content_id))
    }

    /// Send `updates` through the batcher under the run's retry policy.
    pub fn apply_batch(&mut self, kind: FieldKind, updates: &[FieldUpdate]) -> Result<BatchReport> {
        self.batcher
            .apply_batch(self.api, &mut self.verifier, kind, updates)
    }

    /// Record a per-item failure, or propagate it when it must stop the run.
    pub fn item_failed(&mut self, report: &mut StageReport, item: &str, err: SyncError) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }
        tracing::warn!(stage = %report.category, item, error = %err, "item failed");
        self.counters.increment(Counter::ItemErrors);
        report.failures.push(ItemFailure {
            item: item.to_string(),
            error: err.to_string(),
        });
        Ok(())
    }

    /// Count the batch's failed sub-operations and keep the batch for the report.
    pub fn record_batch(&mut self, report: &mut StageReport, batch: BatchReport) {
        self.counters.add(Counter::MutationsFailed, batch.failed.len() as u64);
        for f in &batch.failed {
            report.failures.push(ItemFailure {
                item: f.item.clone(),
                error: f.error.clone(),
            });
        }
        report.batches.push(batch);
    }
}

/// An item together with its current board placement.
#[derive(Debug, Clone)]
pub struct Placed {
    pub item: WorkItem,
    pub placement: BoardPlacement,
}

/// Fresh placements for every item on the board. Lookup failures are
/// recorded on `report`; items not on the board are left out.
pub fn placed_items(pass: &mut Pass, report: &mut StageReport, items: &[WorkItem]) -> Result<Vec<Placed>> {
    let mut out = Vec::new();
    for item in items {
        match pass.find_placement(&item.label(), &item.id) {
            Ok(Some(placement)) => out.push(Placed {
                item: item.clone(),
                placement,
            }),
            Ok(None) => {
                tracing::debug!(stage = %report.category, item = %item.label(), "not on board");
            }
            Err(e) => pass.item_failed(report, &item.label(), e)?,
        }
    }
    Ok(out)
}
