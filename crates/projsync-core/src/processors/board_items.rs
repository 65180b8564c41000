//! Board membership: add items the rules say belong on the board.

use super::{Pass, StageReport};
use crate::counters::Counter;
use crate::error::{Result, SyncError};
use crate::rules::{ActionName, RuleCategory};
use crate::types::WorkItem;

const STEP_ADDED: &str = "add to board";

pub fn process(pass: &mut Pass, items: &[WorkItem]) -> Result<StageReport> {
    let category = RuleCategory::BoardItems;
    if let Some(skipped) = pass.preflight(category, items.len())? {
        return Ok(skipped);
    }
    let mut report = StageReport::new(category, items.len());

    for item in items {
        let label = item.label();
        let placement = match pass.find_placement(&label, &item.id) {
            Ok(p) => p,
            Err(e) => {
                pass.item_failed(&mut report, &label, e)?;
                continue;
            }
        };
        let wants_board = pass
            .evaluate(category, item, placement.as_ref())
            .iter()
            .any(|a| a.name == ActionName::AddToBoard);
        if !wants_board || placement.is_some() {
            continue;
        }
        if let Err(e) = add(pass, &mut report, item) {
            pass.item_failed(&mut report, &label, e)?;
        }
    }
    Ok(report)
}

/// Add `item` to the board and wait until the board lists it.
pub(crate) fn add(pass: &mut Pass, report: &mut StageReport, item: &WorkItem) -> Result<()> {
    let label = item.label();
    if pass.dry_run() {
        tracing::info!(item = %label, "dry run: would add to board");
        report.decide(&label, ActionName::AddToBoard.as_str(), "dry run", false);
        return Ok(());
    }
    if pass.verifier.is_step_complete(&label, STEP_ADDED) {
        return Ok(());
    }

    let api = pass.api;
    let project_item_id = pass
        .verifier
        .retry_with_tracking(&label, STEP_ADDED, || api.add_to_board(&item.id))?;
    pass.verifier.retry_with_tracking(&label, "confirm board membership", || {
        match api.find_placement(&item.id)? {
            Some(_) => Ok(()),
            None => Err(SyncError::EventualConsistency {
                item: label.clone(),
                field: "board membership".into(),
                expected: project_item_id.clone(),
                actual: "absent".into(),
            }),
        }
    })?;
    pass.verifier.mark_step_complete(&label, STEP_ADDED);
    pass.counters.increment(Counter::ItemsAdded);
    tracing::info!(item = %label, project_item = %project_item_id, "added to board");
    report.decide(&label, ActionName::AddToBoard.as_str(), project_item_id, true);
    Ok(())
}
