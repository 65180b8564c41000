//! Sprint assignment. Runs after the column stage and reads each item's
//! column again, since eligibility depends on where the item ended up.

use super::{placed_items, Pass, StageReport};
use crate::api::{FieldKind, MutationOp};
use crate::batch::FieldUpdate;
use crate::counters::Counter;
use crate::error::Result;
use crate::rules::{ActionName, RuleCategory};
use crate::sprint::{SprintAction, SprintDecision};
use crate::types::{BoardField, WorkItem};

struct Pending {
    label: String,
    project_item_id: String,
    expected: Option<String>,
    action: SprintAction,
}

pub fn process(pass: &mut Pass, items: &[WorkItem]) -> Result<StageReport> {
    let category = RuleCategory::Sprints;
    if let Some(skipped) = pass.preflight(category, items.len())? {
        return Ok(skipped);
    }
    let mut report = StageReport::new(category, items.len());
    let resolver = pass
        .ctx
        .sprint_resolver(pass.api, &pass.config.sprint_columns)?;
    let field_id = pass.ctx.sprint_field_id(pass.api)?;
    let now = pass.clock.now();
    let placed = placed_items(pass, &mut report, items)?;

    let mut pending = Vec::new();
    let mut updates = Vec::new();
    for p in &placed {
        let label = p.item.label();
        let current = p.placement.sprint_id.as_deref();

        let decision = if pass.rules.sprints.is_empty() {
            resolver.resolve(p.placement.column.as_deref(), current, now, p.item.completed_at())
        } else {
            let actions = pass.evaluate(category, &p.item, Some(&p.placement));
            let assign = actions.iter().any(|a| a.name == ActionName::SetSprint);
            let remove = actions.iter().any(|a| a.name == ActionName::RemoveSprint);
            if assign {
                resolver.resolve(p.placement.column.as_deref(), current, now, p.item.completed_at())
            } else if remove {
                explicit_removal(current)
            } else {
                tracing::debug!(item = %label, "no sprint rule matched");
                continue;
            }
        };

        let op = match decision.action {
            SprintAction::Skip => {
                tracing::info!(item = %label, reason = %decision.reason, "sprint skipped");
                pass.counters.increment(Counter::SprintSkipped);
                report.decide(&label, "sprint_skip", decision.reason, false);
                continue;
            }
            SprintAction::Assign => match &decision.target_iteration_id {
                Some(id) => MutationOp::SetIteration {
                    field_id: field_id.clone(),
                    iteration_id: id.clone(),
                },
                None => continue,
            },
            SprintAction::Remove => MutationOp::ClearField {
                field_id: field_id.clone(),
            },
        };

        tracing::info!(item = %label, action = %decision.action, reason = %decision.reason, "sprint decision");
        report.decide(
            &label,
            format!("sprint_{}", decision.action),
            decision.reason.clone(),
            !pass.dry_run(),
        );
        updates.push(FieldUpdate {
            item: label.clone(),
            target_id: p.placement.project_item_id.clone(),
            op,
        });
        pending.push(Pending {
            label,
            project_item_id: p.placement.project_item_id.clone(),
            expected: decision.target_iteration_id,
            action: decision.action,
        });
    }

    let batch = pass.apply_batch(FieldKind::Sprint, &updates)?;
    let applied: Vec<&Pending> = pending
        .iter()
        .filter(|p| batch.was_applied(&p.project_item_id))
        .collect();
    pass.record_batch(&mut report, batch);

    for p in applied {
        let verified = pass.verifier.verify_field(
            pass.api,
            &p.label,
            &p.project_item_id,
            BoardField::Sprint,
            p.expected.as_deref(),
        );
        match verified {
            Ok(()) if p.action == SprintAction::Assign => pass.counters.increment(Counter::SprintAssigned),
            Ok(()) => pass.counters.increment(Counter::SprintRemoved),
            Err(e) => pass.item_failed(&mut report, &p.label, e)?,
        }
    }
    Ok(report)
}

fn explicit_removal(current: Option<&str>) -> SprintDecision {
    match current {
        Some(id) => SprintDecision {
            action: SprintAction::Remove,
            reason: "sprint removal rule matched".into(),
            target_iteration_id: None,
            current_iteration_id: Some(id.to_string()),
        },
        None => SprintDecision {
            action: SprintAction::Skip,
            reason: "sprint removal rule matched but no sprint is assigned".into(),
            target_iteration_id: None,
            current_iteration_id: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::{columns, testing::*};
    use crate::types::ItemState;
    use chrono::{TimeZone, Utc};

    #[test]
    fn merged_in_gap_goes_to_next_available_sprint() {
        let board = board();
        board.seed_placement("PR_1", "PVTI_1", Some("New"), None);
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();

        let mut item = pr("PR_1", 1, ItemState::Merged);
        item.merged_at = Some(Utc.with_ymd_and_hms(2024, 6, 12, 15, 0, 0).unwrap());

        // column first: New -> Done, then the sprint stage sees Done
        columns::process(&mut pass, std::slice::from_ref(&item)).unwrap();
        let report = process(&mut pass, &[item]).unwrap();

        assert_eq!(board.placement("PR_1").unwrap().sprint_id.as_deref(), Some("Sprint6"));
        assert!(report.decisions[0].detail.contains("next available"));
        assert_eq!(pass.counters.get(Counter::SprintAssigned), 1);
    }

    #[test]
    fn active_item_gets_current_sprint() {
        let board = board();
        board.seed_placement("PR_1", "PVTI_1", Some("Active"), None);
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        process(&mut pass, &[pr("PR_1", 1, ItemState::Open)]).unwrap();
        assert_eq!(board.placement("PR_1").unwrap().sprint_id.as_deref(), Some("Sprint6"));
    }

    #[test]
    fn inactive_column_clears_sprint() {
        let board = board();
        board.seed_placement("PR_1", "PVTI_1", Some("Parked"), Some("Sprint6"));
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        process(&mut pass, &[pr("PR_1", 1, ItemState::Open)]).unwrap();
        assert!(board.placement("PR_1").unwrap().sprint_id.is_none());
        assert_eq!(pass.counters.get(Counter::SprintRemoved), 1);
    }

    #[test]
    fn done_without_completion_time_is_skipped_and_counted() {
        let board = board();
        board.seed_placement("PR_1", "PVTI_1", Some("Done"), None);
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        let report = process(&mut pass, &[pr("PR_1", 1, ItemState::Merged)]).unwrap();
        assert_eq!(report.decisions[0].action, "sprint_skip");
        assert_eq!(board.batch_requests(), 0);
        assert_eq!(pass.counters.get(Counter::SprintSkipped), 1);
    }

    #[test]
    fn missing_sprint_field_is_fatal() {
        let board = crate::memory::MemoryBoard::new();
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        let err = process(&mut pass, &[pr("PR_1", 1, ItemState::Open)]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn removal_rule_only_clears_assigned_sprints() {
        assert_eq!(explicit_removal(Some("s")).action, SprintAction::Remove);
        assert_eq!(explicit_removal(None).action, SprintAction::Skip);
    }
}
