//! Column assignment under the transition policy.

use super::{placed_items, Pass, StageReport};
use crate::api::{FieldKind, MutationOp};
use crate::batch::FieldUpdate;
use crate::condition::EvalContext;
use crate::counters::Counter;
use crate::error::Result;
use crate::rules::{ActionName, RuleCategory};
use crate::transition::{column_label, normalize_column};
use crate::types::{BoardField, WorkItem};

struct Pending {
    label: String,
    project_item_id: String,
    target: String,
}

pub fn process(pass: &mut Pass, items: &[WorkItem]) -> Result<StageReport> {
    let category = RuleCategory::Columns;
    if let Some(skipped) = pass.preflight(category, items.len())? {
        return Ok(skipped);
    }
    let mut report = StageReport::new(category, items.len());
    let placed = placed_items(pass, &mut report, items)?;

    let mut pending = Vec::new();
    let mut updates = Vec::new();
    for p in &placed {
        let label = p.item.label();
        let actions = pass.evaluate(category, &p.item, Some(&p.placement));
        let mut targets = actions
            .iter()
            .filter(|a| a.name == ActionName::SetColumn)
            .filter_map(|a| normalize_column(a.first_param()));
        let Some(target) = targets.next() else {
            continue;
        };
        if let Some(ignored) = targets.next() {
            tracing::debug!(item = %label, used = %target, ignored = %ignored, "several column rules fired; first wins");
        }

        let current = p.placement.column.as_deref();
        let ctx = EvalContext::new(&p.item, Some(&p.placement), &pass.config.monitored);
        let check = pass.validator.validate_with(current, Some(&target), &ctx);
        if !check.valid {
            let reason = check.reason.unwrap_or_default();
            tracing::warn!(item = %label, from = column_label(current), to = %target, reason = %reason, "transition blocked");
            pass.counters.increment(Counter::TransitionBlocked);
            report.decide(&label, "transition_blocked", reason, false);
            continue;
        }
        if current == Some(target.as_str()) {
            continue;
        }

        let option = match pass.ctx.column_option(pass.api, &target) {
            Ok(o) => o,
            Err(e) => {
                pass.item_failed(&mut report, &label, e)?;
                continue;
            }
        };
        let field_id = pass.ctx.status_field_id(pass.api)?;
        report.decide(
            &label,
            ActionName::SetColumn.as_str(),
            format!("{} -> {target}", column_label(current)),
            !pass.dry_run(),
        );
        updates.push(FieldUpdate {
            item: label.clone(),
            target_id: p.placement.project_item_id.clone(),
            op: MutationOp::SetColumn {
                field_id,
                option_id: option.id,
            },
        });
        pending.push(Pending {
            label,
            project_item_id: p.placement.project_item_id.clone(),
            target,
        });
    }

    let batch = pass.apply_batch(FieldKind::Column, &updates)?;
    let applied: Vec<&Pending> = pending
        .iter()
        .filter(|p| batch.was_applied(&p.project_item_id))
        .collect();
    pass.record_batch(&mut report, batch);

    for p in applied {
        match pass.verifier.verify_field(
            pass.api,
            &p.label,
            &p.project_item_id,
            BoardField::Column,
            Some(&p.target),
        ) {
            Ok(()) => pass.counters.increment(Counter::ColumnsSet),
            Err(e) => pass.item_failed(&mut report, &p.label, e)?,
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::processors::testing::*;
    use crate::types::ItemState;

    #[test]
    fn new_pr_moves_to_active_and_is_verified() {
        let board = board();
        board.seed_placement("PR_1", "PVTI_1", None, None);
        board.set_read_lag(1);
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();

        let report = process(&mut pass, &[pr("PR_1", 1, ItemState::Open)]).unwrap();
        assert_eq!(report.decisions[0].detail, "None -> Active");
        assert_eq!(board.placement("PR_1").unwrap().column.as_deref(), Some("Active"));
        assert_eq!(pass.counters.get(Counter::ColumnsSet), 1);
        // one stale read, one backoff, then consistent
        assert_eq!(clock.sleeps().len(), 1);
        let audit = pass.verifier.audit("bcgov/nr-nerds#1").unwrap();
        assert_eq!(audit.attempts_for("verify column=Active"), 2);
    }

    #[test]
    fn undeclared_transition_is_blocked_not_written() {
        let board = board();
        board.seed_placement("PR_1", "PVTI_1", Some("Parked"), None);
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();

        let report = process(&mut pass, &[pr("PR_1", 1, ItemState::Merged)]).unwrap();
        assert_eq!(report.decisions[0].action, "transition_blocked");
        assert!(report.failures.is_empty());
        assert_eq!(board.batch_requests(), 0);
        assert_eq!(board.placement("PR_1").unwrap().column.as_deref(), Some("Parked"));
        assert_eq!(pass.counters.get(Counter::TransitionBlocked), 1);
    }

    #[test]
    fn items_already_in_target_column_are_left_alone() {
        let board = board();
        board.seed_placement("PR_1", "PVTI_1", Some("Done"), None);
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        let report = process(&mut pass, &[pr("PR_1", 1, ItemState::Merged)]).unwrap();
        assert!(report.decisions.is_empty());
        assert_eq!(board.batch_requests(), 0);
    }

    #[test]
    fn several_items_share_one_request() {
        let board = board();
        for n in 1..=3 {
            board.seed_placement(&format!("PR_{n}"), &format!("PVTI_{n}"), Some("Active"), None);
        }
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        let items: Vec<_> = (1..=3).map(|n| pr(&format!("PR_{n}"), n, ItemState::Merged)).collect();
        process(&mut pass, &items).unwrap();
        assert_eq!(board.batch_requests(), 1);
        assert_eq!(pass.counters.get(Counter::ColumnsSet), 3);
    }

    #[test]
    fn failed_alias_is_an_item_failure_not_a_run_failure() {
        let board = board();
        board.seed_placement("PR_1", "PVTI_1", Some("Active"), None);
        board.seed_placement("PR_2", "PVTI_2", Some("Active"), None);
        board.fail_target("PVTI_1");
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        let report = process(
            &mut pass,
            &[pr("PR_1", 1, ItemState::Merged), pr("PR_2", 2, ItemState::Merged)],
        )
        .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(pass.counters.get(Counter::ColumnsSet), 1);
        assert_eq!(pass.counters.get(Counter::MutationsFailed), 1);
    }

    #[test]
    fn secondary_rate_limit_on_the_write_is_retried() {
        let board = board();
        board.seed_placement("PR_1", "PVTI_1", Some("Active"), None);
        board.fail_next_batch(SyncError::SecondaryRateLimit("slow down".into()));
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();

        let report = process(&mut pass, &[pr("PR_1", 1, ItemState::Merged)]).unwrap();
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(board.batch_requests(), 2);
        assert_eq!(clock.sleeps().len(), 1);
        assert_eq!(board.placement("PR_1").unwrap().column.as_deref(), Some("Done"));
        assert_eq!(pass.counters.get(Counter::ColumnsSet), 1);
        assert_eq!(pass.verifier.retried().len(), 1);
    }

    #[test]
    fn persistent_rate_limit_fails_the_item_after_the_bound() {
        let board = board();
        board.seed_placement("PR_1", "PVTI_1", Some("Active"), None);
        board.fail_next_batch(SyncError::SecondaryRateLimit("slow down".into()));
        let clock = clock();
        let mut cfg = config();
        cfg.retry.max_attempts = 1;
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();

        let report = process(&mut pass, &[pr("PR_1", 1, ItemState::Merged)]).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(board.batch_requests(), 1);
        assert_eq!(board.placement("PR_1").unwrap().column.as_deref(), Some("Active"));
    }

    #[test]
    fn dry_run_plans_without_writing() {
        let board = board();
        board.seed_placement("PR_1", "PVTI_1", Some("Active"), None);
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, true).unwrap();
        let report = process(&mut pass, &[pr("PR_1", 1, ItemState::Merged)]).unwrap();
        assert_eq!(report.decisions[0].detail, "Active -> Done");
        assert!(!report.decisions[0].applied);
        assert_eq!(board.batch_requests(), 0);
        assert_eq!(pass.counters.get(Counter::ColumnsSet), 0);
    }
}
