//! Linked-issue inheritance: issues closed by a pull request follow its
//! column, sprint and assignees.
//!
//! Each linked issue is fetched fresh and compared against the pull request's
//! placement as read at the start of this stage. A linked issue is updated at
//! most once per run, from the first pull request that reaches it.

use super::{assignees, board_items, placed_items, Pass, StageReport};
use crate::api::{FieldKind, MutationOp};
use crate::batch::FieldUpdate;
use crate::condition::EvalContext;
use crate::counters::Counter;
use crate::error::Result;
use crate::rules::{ActionName, RuleCategory};
use crate::transition::column_label;
use crate::types::{BoardField, BoardPlacement, WorkItem, WorkItemRef};

const STEP_INHERITED: &str = "inherit from linked pull request";

struct FieldPending {
    label: String,
    project_item_id: String,
    field: BoardField,
    expected: Option<String>,
}

struct AssigneePending {
    label: String,
    content_id: String,
    desired: Vec<String>,
}

#[derive(Default)]
struct Queue {
    columns: Vec<FieldUpdate>,
    sprints: Vec<FieldUpdate>,
    assignees: Vec<FieldUpdate>,
    fields: Vec<FieldPending>,
    people: Vec<AssigneePending>,
}

pub fn process(pass: &mut Pass, items: &[WorkItem]) -> Result<StageReport> {
    let category = RuleCategory::LinkedIssues;
    let parents: Vec<WorkItem> = items
        .iter()
        .filter(|i| !i.linked_issues.is_empty())
        .cloned()
        .collect();
    if let Some(skipped) = pass.preflight(category, parents.len())? {
        return Ok(skipped);
    }
    let mut report = StageReport::new(category, parents.len());
    let placed = placed_items(pass, &mut report, &parents)?;

    let mut queue = Queue::default();
    for p in &placed {
        let actions = pass.evaluate(category, &p.item, Some(&p.placement));
        let wants = |name: ActionName| actions.iter().any(|a| a.name == name);
        let inherit = Inherit {
            column: wants(ActionName::InheritColumn),
            sprint: wants(ActionName::InheritSprint),
            assignees: wants(ActionName::InheritAssignees),
        };
        if !inherit.any() {
            continue;
        }
        let parent_assignees = if inherit.assignees {
            match pass.read_assignees(&p.item.label(), &p.item.id) {
                Ok(a) => Some(a),
                Err(e) => {
                    pass.item_failed(&mut report, &p.item.label(), e)?;
                    continue;
                }
            }
        } else {
            None
        };

        for link in &p.item.linked_issues {
            let outcome = inherit_into(
                pass,
                &mut report,
                &mut queue,
                &p.placement,
                parent_assignees.as_deref(),
                inherit,
                link,
            );
            if let Err(e) = outcome {
                pass.item_failed(&mut report, &format!("{}#{}", link.repository, link.number), e)?;
            }
        }
    }

    flush(pass, &mut report, queue)?;
    Ok(report)
}

#[derive(Debug, Clone, Copy)]
struct Inherit {
    column: bool,
    sprint: bool,
    assignees: bool,
}

impl Inherit {
    fn any(self) -> bool {
        self.column || self.sprint || self.assignees
    }
}

fn inherit_into(
    pass: &mut Pass,
    report: &mut StageReport,
    queue: &mut Queue,
    parent: &BoardPlacement,
    parent_assignees: Option<&[String]>,
    inherit: Inherit,
    link: &WorkItemRef,
) -> Result<()> {
    let issue = pass.api.fetch_item(link)?;
    let label = issue.label();
    if pass.verifier.is_step_complete(&label, STEP_INHERITED) {
        tracing::debug!(item = %label, "already inherited this run");
        return Ok(());
    }

    let placement = match pass.find_placement(&label, &issue.id)? {
        Some(p) => p,
        None => {
            board_items::add(pass, report, &issue)?;
            match pass.find_placement(&label, &issue.id)? {
                Some(p) => p,
                None => return Ok(()),
            }
        }
    };

    if inherit.column {
        queue_column(pass, report, queue, &issue, &placement, parent.column.as_deref())?;
    }

    if inherit.sprint {
        if let Some(sprint) = parent.sprint_id.as_deref() {
            if placement.sprint_id.as_deref() != Some(sprint) {
                let field_id = pass.ctx.sprint_field_id(pass.api)?;
                report.decide(&label, ActionName::InheritSprint.as_str(), sprint, !pass.dry_run());
                queue.sprints.push(FieldUpdate {
                    item: label.clone(),
                    target_id: placement.project_item_id.clone(),
                    op: MutationOp::SetIteration {
                        field_id,
                        iteration_id: sprint.to_string(),
                    },
                });
                queue.fields.push(FieldPending {
                    label: label.clone(),
                    project_item_id: placement.project_item_id.clone(),
                    field: BoardField::Sprint,
                    expected: Some(sprint.to_string()),
                });
            }
        }
    }

    if let Some(desired) = parent_assignees {
        let current = pass.read_assignees(&label, &issue.id)?;
        let action = ActionName::InheritAssignees.as_str();
        if let Some(delta) = assignees::plan_delta(pass, report, &label, action, &current, desired) {
            queue.assignees.extend(delta.to_updates(&label, &issue.id));
            queue.people.push(AssigneePending {
                label: label.clone(),
                content_id: issue.id.clone(),
                desired: desired.to_vec(),
            });
        }
    }

    pass.verifier.mark_step_complete(&label, STEP_INHERITED);
    Ok(())
}

fn queue_column(
    pass: &mut Pass,
    report: &mut StageReport,
    queue: &mut Queue,
    issue: &WorkItem,
    placement: &BoardPlacement,
    target: Option<&str>,
) -> Result<()> {
    let Some(target) = target else {
        return Ok(());
    };
    let label = issue.label();
    let current = placement.column.as_deref();
    if current == Some(target) {
        return Ok(());
    }
    let ctx = EvalContext::new(issue, Some(placement), &pass.config.monitored);
    let check = pass.validator.validate_with(current, Some(target), &ctx);
    if !check.valid {
        let reason = check.reason.unwrap_or_default();
        tracing::warn!(item = %label, from = column_label(current), to = target, reason = %reason, "inherited transition blocked");
        pass.counters.increment(Counter::TransitionBlocked);
        report.decide(&label, "transition_blocked", reason, false);
        return Ok(());
    }
    let option = pass.ctx.column_option(pass.api, target)?;
    let field_id = pass.ctx.status_field_id(pass.api)?;
    report.decide(
        &label,
        ActionName::InheritColumn.as_str(),
        format!("{} -> {target}", column_label(current)),
        !pass.dry_run(),
    );
    queue.columns.push(FieldUpdate {
        item: label.clone(),
        target_id: placement.project_item_id.clone(),
        op: MutationOp::SetColumn {
            field_id,
            option_id: option.id,
        },
    });
    queue.fields.push(FieldPending {
        label,
        project_item_id: placement.project_item_id.clone(),
        field: BoardField::Column,
        expected: Some(target.to_string()),
    });
    Ok(())
}

fn flush(pass: &mut Pass, report: &mut StageReport, queue: Queue) -> Result<()> {
    let mut applied_fields = Vec::new();
    for (kind, updates) in [
        (FieldKind::Column, &queue.columns),
        (FieldKind::Sprint, &queue.sprints),
    ] {
        let batch = pass.apply_batch(kind, updates)?;
        applied_fields.extend(batch.applied_targets.iter().map(|t| (kind, t.clone())));
        pass.record_batch(report, batch);
    }
    let batch = pass.apply_batch(FieldKind::Assignees, &queue.assignees)?;
    let failed_people: Vec<String> = batch.failed.iter().map(|f| f.target_id.clone()).collect();
    let people_applied = batch.applied > 0;
    pass.record_batch(report, batch);

    for p in &queue.fields {
        let kind = match p.field {
            BoardField::Column => FieldKind::Column,
            BoardField::Sprint => FieldKind::Sprint,
        };
        if !applied_fields.contains(&(kind, p.project_item_id.clone())) {
            continue;
        }
        match pass.verifier.verify_field(
            pass.api,
            &p.label,
            &p.project_item_id,
            p.field,
            p.expected.as_deref(),
        ) {
            Ok(()) => pass.counters.increment(Counter::LinkedIssuesUpdated),
            Err(e) => pass.item_failed(report, &p.label, e)?,
        }
    }

    if people_applied {
        for p in &queue.people {
            if failed_people.contains(&p.content_id) {
                continue;
            }
            match pass
                .verifier
                .verify_assignees(pass.api, &p.label, &p.content_id, &p.desired)
            {
                Ok(()) => pass.counters.increment(Counter::LinkedIssuesUpdated),
                Err(e) => pass.item_failed(report, &p.label, e)?,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::testing::*;
    use crate::types::ItemState;

    #[test]
    fn issue_follows_pull_request() {
        let board = board();
        let clock = clock();
        let cfg = config();
        let issue = issue("I_1", 40);
        let mut parent = pr("PR_1", 41, ItemState::Open);
        link(&mut parent, &issue);
        board.seed_item(issue.clone());
        board.seed_item(parent.clone());
        board.seed_assignees("PR_1", &["DerekRoberts"]);
        board.seed_placement("PR_1", "PVTI_pr", Some("Active"), Some("Sprint6"));
        board.seed_placement("I_1", "PVTI_issue", Some("New"), None);

        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        let report = process(&mut pass, &[parent]).unwrap();
        assert!(report.failures.is_empty(), "{:?}", report.failures);

        let placed = board.placement("I_1").unwrap();
        assert_eq!(placed.column.as_deref(), Some("Active"));
        assert_eq!(placed.sprint_id.as_deref(), Some("Sprint6"));
        assert_eq!(board.read_assignees_now("I_1"), vec!["DerekRoberts".to_string()]);
        assert_eq!(pass.counters.get(Counter::LinkedIssuesUpdated), 3);
    }

    #[test]
    fn issue_already_matching_its_pull_request_is_not_written() {
        let board = board();
        let clock = clock();
        let cfg = config();
        let issue = issue("I_5", 80);
        let mut parent = pr("PR_5", 81, ItemState::Open);
        link(&mut parent, &issue);
        board.seed_item(issue);
        board.seed_assignees("PR_5", &["DerekRoberts", "helper"]);
        board.seed_assignees("I_5", &["helper", "derekroberts"]);
        board.seed_placement("PR_5", "PVTI_pr5", Some("Active"), None);
        board.seed_placement("I_5", "PVTI_i5", Some("Active"), None);

        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        let report = process(&mut pass, &[parent]).unwrap();
        assert!(report.decisions.is_empty());
        assert_eq!(board.batch_requests(), 0);
        assert_eq!(pass.counters.get(Counter::AssigneesUnchanged), 1);
    }

    #[test]
    fn linked_issue_off_the_board_is_added_first() {
        let board = board();
        let clock = clock();
        let cfg = config();
        let issue = issue("I_2", 50);
        let mut parent = pr("PR_2", 51, ItemState::Open);
        link(&mut parent, &issue);
        board.seed_item(issue);
        board.seed_placement("PR_2", "PVTI_pr2", Some("Active"), None);

        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        process(&mut pass, &[parent]).unwrap();
        assert_eq!(board.placement("I_2").unwrap().column.as_deref(), Some("Active"));
        assert_eq!(pass.counters.get(Counter::ItemsAdded), 1);
    }

    #[test]
    fn blocked_inheritance_is_reported_not_written() {
        let board = board();
        let clock = clock();
        let cfg = config();
        let issue = issue("I_3", 60);
        let mut parent = pr("PR_3", 61, ItemState::Open);
        link(&mut parent, &issue);
        board.seed_item(issue);
        board.seed_placement("PR_3", "PVTI_pr3", Some("Done"), None);
        board.seed_placement("I_3", "PVTI_i3", Some("Parked"), None);

        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        let report = process(&mut pass, &[parent]).unwrap();
        assert!(report.decisions.iter().any(|d| d.action == "transition_blocked"));
        assert_eq!(board.placement("I_3").unwrap().column.as_deref(), Some("Parked"));
    }

    #[test]
    fn issue_shared_by_two_prs_is_updated_once() {
        let board = board();
        let clock = clock();
        let cfg = config();
        let issue = issue("I_4", 70);
        let mut first = pr("PR_a", 71, ItemState::Open);
        let mut second = pr("PR_b", 72, ItemState::Open);
        link(&mut first, &issue);
        link(&mut second, &issue);
        board.seed_item(issue);
        board.seed_placement("PR_a", "PVTI_a", Some("Active"), None);
        board.seed_placement("PR_b", "PVTI_b", Some("New"), None);
        board.seed_placement("I_4", "PVTI_i4", None, None);

        let mut pass = Pass::new(&board, &clock, &cfg, false).unwrap();
        process(&mut pass, &[first, second]).unwrap();
        assert_eq!(board.placement("I_4").unwrap().column.as_deref(), Some("Active"));
    }
}
