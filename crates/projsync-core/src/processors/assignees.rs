//! Assignee reconciliation against the live assignee list.

use super::{Pass, StageReport};
use crate::api::FieldKind;
use crate::batch::{AssigneeDelta, FieldUpdate};
use crate::counters::Counter;
use crate::error::Result;
use crate::rules::{Action, ActionName, RuleCategory};
use crate::types::WorkItem;

struct Pending {
    label: String,
    content_id: String,
    desired: Vec<String>,
    delta: AssigneeDelta,
}

/// The assignee list the fired actions ask for. `set_assignees` replaces the
/// list; `add_assignees` extends it. `None` when no assignee action fired.
pub fn desired_assignees(current: &[String], actions: &[Action]) -> Option<Vec<String>> {
    let mut desired: Option<Vec<String>> = None;
    for action in actions {
        match action.name {
            ActionName::SetAssignees => desired = Some(Vec::new()),
            ActionName::AddAssignees => {
                desired.get_or_insert_with(|| current.to_vec());
            }
            _ => continue,
        }
        let list = desired.get_or_insert_with(Vec::new);
        for login in action.params.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            if !list.iter().any(|l| l.eq_ignore_ascii_case(login)) {
                list.push(login.to_string());
            }
        }
    }
    desired
}

/// Delta moving `current` to `desired` for one item. Equal sets count as
/// unchanged and return `None`, so nothing is queued for them; otherwise the
/// decision is recorded on `report` under `action`.
pub(super) fn plan_delta(
    pass: &mut Pass,
    report: &mut StageReport,
    label: &str,
    action: &str,
    current: &[String],
    desired: &[String],
) -> Option<AssigneeDelta> {
    let delta = AssigneeDelta::compute(current, desired);
    if delta.is_noop() {
        tracing::debug!(item = label, "assignees already match; no mutation");
        pass.counters.increment(Counter::AssigneesUnchanged);
        return None;
    }
    report.decide(
        label,
        action,
        format!("+[{}] -[{}]", delta.to_add.join(", "), delta.to_remove.join(", ")),
        !pass.dry_run(),
    );
    Some(delta)
}

pub fn process(pass: &mut Pass, items: &[WorkItem]) -> Result<StageReport> {
    let category = RuleCategory::Assignees;
    if let Some(skipped) = pass.preflight(category, items.len())? {
        return Ok(skipped);
    }
    let mut report = StageReport::new(category, items.len());

    let mut pending = Vec::new();
    let mut updates = Vec::new();
    for item in items {
        let label = item.label();
        let placement = match pass.find_placement(&label, &item.id) {
            Ok(p) => p,
            Err(e) => {
                pass.item_failed(&mut report, &label, e)?;
                continue;
            }
        };
        let current = match pass.read_assignees(&label, &item.id) {
            Ok(c) => c,
            Err(e) => {
                pass.item_failed(&mut report, &label, e)?;
                continue;
            }
        };
        let mut live = item.clone();
        live.assignees = current.clone();
        let actions = pass.evaluate(category, &live, placement.as_ref());
        let Some(desired) = desired_assignees(&current, &actions) else {
            continue;
        };

        let Some(delta) = plan_delta(pass, &mut report, &label, "assignees", &current, &desired) else {
            continue;
        };
        updates.extend(delta.to_updates(&label, &item.id));
        pending.push(Pending {
            label,
            content_id: item.id.clone(),
            desired,
            delta,
        });
    }

    apply(pass, &mut report, &updates, &pending)?;
    Ok(report)
}

fn apply(pass: &mut Pass, report: &mut StageReport, updates: &[FieldUpdate], pending: &[Pending]) -> Result<()> {
    let batch = pass.apply_batch(FieldKind::Assignees, updates)?;
    let failed: Vec<String> = batch.failed.iter().map(|f| f.target_id.clone()).collect();
    let any_applied = batch.applied > 0;
    pass.record_batch(report, batch);
    if !any_applied {
        return Ok(());
    }

    for p in pending {
        if failed.contains(&p.content_id) {
            continue;
        }
        match pass
            .verifier
            .verify_assignees(pass.api, &p.label, &p.content_id, &p.desired)
        {
            Ok(()) => {
                pass.counters.add(Counter::AssigneesAdded, p.delta.to_add.len() as u64);
                pass.counters.add(Counter::AssigneesRemoved, p.delta.to_remove.len() as u64);
            }
            Err(e) => pass.item_failed(report, &p.label, e)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::testing::*;
    use crate::types::ItemState;

    fn action(name: ActionName, params: &[&str]) -> Action {
        Action {
            rule: "r".into(),
            name,
            params: params.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn logins(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn add_extends_and_set_replaces() {
        let current = logins(&["a", "b"]);
        assert_eq!(desired_assignees(&current, &[]), None);
        assert_eq!(
            desired_assignees(&current, &[action(ActionName::AddAssignees, &["c", "A"])]),
            Some(logins(&["a", "b", "c"]))
        );
        assert_eq!(
            desired_assignees(&current, &[action(ActionName::SetAssignees, &["c"])]),
            Some(logins(&["c"]))
        );
    }

    #[test]
    fn adds_author_and_counts() {
        let board = board();
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        let item = pr("PR_1", 1, ItemState::Open);
        board.seed_item(item.clone());

        process(&mut pass, std::slice::from_ref(&item)).unwrap();
        assert_eq!(board.read_assignees_now("PR_1"), logins(&["DerekRoberts"]));
        assert_eq!(pass.counters.get(Counter::AssigneesAdded), 1);

        // second pass is a no-op
        process(&mut pass, &[item]).unwrap();
        assert_eq!(board.batch_requests(), 1);
        assert_eq!(pass.counters.get(Counter::AssigneesUnchanged), 1);
    }

    #[test]
    fn matching_live_assignees_issue_no_requests() {
        let board = board();
        board.seed_assignees("PR_1", &["helper", "DerekRoberts"]);
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();

        let report = process(&mut pass, &[pr("PR_1", 1, ItemState::Open)]).unwrap();
        assert!(report.decisions.is_empty());
        assert_eq!(board.batch_requests(), 0);
        assert_eq!(pass.counters.get(Counter::AssigneesUnchanged), 1);
    }

    #[test]
    fn stale_snapshot_does_not_cause_a_write() {
        let board = board();
        board.seed_assignees("PR_1", &["derekroberts"]);
        let clock = clock();
        let cfg = config();
        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        // snapshot says nobody is assigned; the live list disagrees
        process(&mut pass, &[pr("PR_1", 1, ItemState::Open)]).unwrap();
        assert_eq!(board.batch_requests(), 0);
    }
}
