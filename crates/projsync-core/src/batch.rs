//! Batched field mutations.
//!
//! Updates of one field kind are chunked into bounded multi-operation
//! requests, one aliased sub-operation per item, so a single round trip
//! updates many items. A failed alias never hides the successes beside it.

use crate::api::{BoardApi, FieldKind, FieldMutation, MutationOp};
use crate::error::Result;
use crate::verify::StateVerifier;
use serde::Serialize;
use std::collections::HashMap;

pub const DEFAULT_BATCH_SIZE: usize = 10;

// ---------------------------------------------------------------------------
// FieldUpdate / BatchReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldUpdate {
    /// Label of the work item, for logs and reports.
    pub item: String,
    pub target_id: String,
    pub op: MutationOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUpdate {
    pub item: String,
    pub target_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub kind: FieldKind,
    pub requested: usize,
    pub applied: usize,
    pub requests: usize,
    pub dry_run: bool,
    /// Target ids whose sub-operation succeeded.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub applied_targets: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<FailedUpdate>,
}

impl BatchReport {
    fn empty(kind: FieldKind, requested: usize, dry_run: bool) -> Self {
        Self {
            kind,
            requested,
            applied: 0,
            requests: 0,
            dry_run,
            applied_targets: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn was_applied(&self, target_id: &str) -> bool {
        self.applied_targets.iter().any(|t| t == target_id)
    }
}

// ---------------------------------------------------------------------------
// MutationBatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct MutationBatcher {
    batch_size: usize,
    dry_run: bool,
}

impl MutationBatcher {
    pub fn new(batch_size: usize, dry_run: bool) -> Self {
        Self {
            batch_size: batch_size.max(1),
            dry_run,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Apply `updates` of one field kind in chunks of `batch_size`.
    ///
    /// Dry runs log every update and return before touching the network.
    /// Each request runs under `verifier`'s retry policy, so a transient
    /// failure (a secondary rate limit) backs off and tries again. A request
    /// that still fails marks its whole chunk failed and moves on, unless the
    /// error is fatal.
    pub fn apply_batch(
        &self,
        api: &dyn BoardApi,
        verifier: &mut StateVerifier,
        kind: FieldKind,
        updates: &[FieldUpdate],
    ) -> Result<BatchReport> {
        let (matching, foreign): (Vec<&FieldUpdate>, Vec<&FieldUpdate>) =
            updates.iter().partition(|u| u.op.kind() == kind);
        for u in &foreign {
            tracing::warn!(item = %u.item, expected = %kind, got = %u.op.kind(), "update of the wrong kind dropped from batch");
        }

        let mut report = BatchReport::empty(kind, matching.len(), self.dry_run);
        if matching.is_empty() {
            return Ok(report);
        }

        if self.dry_run {
            for u in &matching {
                tracing::info!(kind = %kind, item = %u.item, target = %u.target_id, op = ?u.op, "dry run: would apply");
            }
            return Ok(report);
        }

        for (chunk_index, chunk) in matching.chunks(self.batch_size).enumerate() {
            let mutations: Vec<FieldMutation> = chunk
                .iter()
                .enumerate()
                .map(|(i, u)| FieldMutation {
                    alias: format!("{}_{}_{}", kind.as_str(), chunk_index, i),
                    target_id: u.target_id.clone(),
                    op: u.op.clone(),
                })
                .collect();

            report.requests += 1;
            let request = format!("{kind} batch {chunk_index}");
            let results = match verifier.retry_with_tracking(&request, "execute batch", || {
                api.execute_batch(&mutations)
            }) {
                Ok(results) => results,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(kind = %kind, size = chunk.len(), error = %err, "batch request failed");
                    for u in chunk {
                        report.failed.push(FailedUpdate {
                            item: u.item.clone(),
                            target_id: u.target_id.clone(),
                            error: err.to_string(),
                        });
                    }
                    continue;
                }
            };

            let by_alias: HashMap<&str, &Option<String>> = results
                .iter()
                .map(|r| (r.alias.as_str(), &r.error))
                .collect();
            for (m, u) in mutations.iter().zip(chunk) {
                match by_alias.get(m.alias.as_str()) {
                    Some(None) => {
                        report.applied += 1;
                        report.applied_targets.push(u.target_id.clone());
                    }
                    Some(Some(error)) => {
                        tracing::warn!(item = %u.item, alias = %m.alias, error = %error, "mutation failed");
                        report.failed.push(FailedUpdate {
                            item: u.item.clone(),
                            target_id: u.target_id.clone(),
                            error: error.clone(),
                        });
                    }
                    None => {
                        report.failed.push(FailedUpdate {
                            item: u.item.clone(),
                            target_id: u.target_id.clone(),
                            error: format!("no result returned for {}", m.alias),
                        });
                    }
                }
            }
        }

        tracing::info!(
            kind = %kind,
            applied = report.applied,
            failed = report.failed.len(),
            requests = report.requests,
            "batch applied"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// AssigneeDelta
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssigneeDelta {
    pub to_add: Vec<String>,
    pub to_remove: Vec<String>,
}

fn contains_login(list: &[String], login: &str) -> bool {
    list.iter().any(|l| l.eq_ignore_ascii_case(login))
}

fn dedup_logins(logins: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for l in logins {
        if !contains_login(&out, l) {
            out.push(l.clone());
        }
    }
    out
}

impl AssigneeDelta {
    /// `to_add = desired - current`, `to_remove = current - desired`,
    /// comparing logins case-insensitively.
    pub fn compute(current: &[String], desired: &[String]) -> Self {
        let current = dedup_logins(current);
        let desired = dedup_logins(desired);
        Self {
            to_add: desired
                .iter()
                .filter(|d| !contains_login(&current, d))
                .cloned()
                .collect(),
            to_remove: current
                .iter()
                .filter(|c| !contains_login(&desired, c))
                .cloned()
                .collect(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    pub fn to_updates(&self, item: &str, content_id: &str) -> Vec<FieldUpdate> {
        let mut updates = Vec::new();
        if !self.to_remove.is_empty() {
            updates.push(FieldUpdate {
                item: item.to_string(),
                target_id: content_id.to_string(),
                op: MutationOp::RemoveAssignees {
                    logins: self.to_remove.clone(),
                },
            });
        }
        if !self.to_add.is_empty() {
            updates.push(FieldUpdate {
                item: item.to_string(),
                target_id: content_id.to_string(),
                op: MutationOp::AddAssignees {
                    logins: self.to_add.clone(),
                },
            });
        }
        updates
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FixedClock;
    use crate::error::SyncError;
    use crate::memory::MemoryBoard;
    use crate::verify::RetryPolicy;
    use chrono::Utc;
    use std::time::Duration;

    fn logins(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn column_update(n: usize) -> FieldUpdate {
        FieldUpdate {
            item: format!("o/r#{n}"),
            target_id: format!("PVTI_{n}"),
            op: MutationOp::SetColumn {
                field_id: "status".into(),
                option_id: "opt-active".into(),
            },
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            jitter_ms: 0,
            ..RetryPolicy::default()
        }
    }

    fn clock() -> FixedClock {
        FixedClock::new(Utc::now())
    }

    #[test]
    fn delta_updates_carry_one_remove_and_one_add() {
        let board = MemoryBoard::new();
        board.seed_assignees("PR_1", &["a", "b"]);
        let clock = clock();
        let mut verifier = StateVerifier::new(policy(), &clock);
        let delta = AssigneeDelta::compute(&logins(&["a", "b"]), &logins(&["a", "c"]));
        assert_eq!(delta.to_remove, logins(&["b"]));
        assert_eq!(delta.to_add, logins(&["c"]));

        let updates = delta.to_updates("o/r#1", "PR_1");
        MutationBatcher::new(10, false)
            .apply_batch(&board, &mut verifier, FieldKind::Assignees, &updates)
            .unwrap();
        assert_eq!(board.batch_requests(), 1);

        let ops = board.executed();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().any(|m| m.op == MutationOp::RemoveAssignees { logins: logins(&["b"]) }));
        assert!(ops.iter().any(|m| m.op == MutationOp::AddAssignees { logins: logins(&["c"]) }));
        assert_eq!(board.read_assignees_now("PR_1"), logins(&["a", "c"]));
    }

    #[test]
    fn equal_sets_produce_no_updates() {
        let delta = AssigneeDelta::compute(&logins(&["a", "b"]), &logins(&["b", "A"]));
        assert!(delta.is_noop());
        assert!(delta.to_updates("o/r#1", "PR_1").is_empty());
    }

    #[test]
    fn chunks_by_batch_size() {
        let board = MemoryBoard::new();
        for n in 0..5 {
            board.seed_placement(&format!("C_{n}"), &format!("PVTI_{n}"), None, None);
        }
        board.seed_columns(&[("opt-active", "Active")]);
        let clock = clock();
        let mut verifier = StateVerifier::new(policy(), &clock);
        let updates: Vec<_> = (0..5).map(column_update).collect();
        let report = MutationBatcher::new(2, false)
            .apply_batch(&board, &mut verifier, FieldKind::Column, &updates)
            .unwrap();
        assert_eq!(report.requests, 3);
        assert_eq!(report.applied, 5);
        assert_eq!(board.batch_requests(), 3);
    }

    #[test]
    fn partial_failure_keeps_other_successes() {
        let board = MemoryBoard::new();
        board.seed_columns(&[("opt-active", "Active")]);
        board.seed_placement("C_0", "PVTI_0", None, None);
        board.seed_placement("C_2", "PVTI_2", None, None);
        // PVTI_1 does not exist on the board
        let clock = clock();
        let mut verifier = StateVerifier::new(policy(), &clock);
        let updates: Vec<_> = (0..3).map(column_update).collect();
        let report = MutationBatcher::new(10, false)
            .apply_batch(&board, &mut verifier, FieldKind::Column, &updates)
            .unwrap();
        assert_eq!(report.requests, 1);
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].target_id, "PVTI_1");
        assert!(report.was_applied("PVTI_2"));
    }

    #[test]
    fn secondary_limit_backs_off_and_resends_the_chunk() {
        let board = MemoryBoard::new();
        board.seed_columns(&[("opt-active", "Active")]);
        board.seed_placement("C_0", "PVTI_0", None, None);
        board.fail_next_batch(SyncError::SecondaryRateLimit("slow down".into()));
        let clock = clock();
        let mut verifier = StateVerifier::new(policy(), &clock);
        let report = MutationBatcher::new(10, false)
            .apply_batch(&board, &mut verifier, FieldKind::Column, &[column_update(0)])
            .unwrap();
        assert_eq!(report.applied, 1);
        assert!(report.failed.is_empty());
        assert_eq!(board.batch_requests(), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(1000)]);
    }

    #[test]
    fn non_transient_request_failure_fails_the_chunk_without_retry() {
        let board = MemoryBoard::new();
        board.fail_next_batch(SyncError::Api("boom".into()));
        let clock = clock();
        let mut verifier = StateVerifier::new(policy(), &clock);
        let updates: Vec<_> = (0..2).map(column_update).collect();
        let report = MutationBatcher::new(10, false)
            .apply_batch(&board, &mut verifier, FieldKind::Column, &updates)
            .unwrap();
        assert_eq!(report.failed.len(), 2);
        assert_eq!(board.batch_requests(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn dry_run_makes_no_requests() {
        let board = MemoryBoard::new();
        let clock = clock();
        let mut verifier = StateVerifier::new(policy(), &clock);
        let updates: Vec<_> = (0..3).map(column_update).collect();
        let report = MutationBatcher::new(10, true)
            .apply_batch(&board, &mut verifier, FieldKind::Column, &updates)
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.applied, 0);
        assert_eq!(report.requested, 3);
        assert_eq!(board.batch_requests(), 0);
    }

    #[test]
    fn wrong_kind_updates_are_dropped() {
        let board = MemoryBoard::new();
        let clock = clock();
        let mut verifier = StateVerifier::new(policy(), &clock);
        let updates = vec![column_update(0)];
        let report = MutationBatcher::new(10, false)
            .apply_batch(&board, &mut verifier, FieldKind::Sprint, &updates)
            .unwrap();
        assert_eq!(report.requested, 0);
        assert_eq!(board.batch_requests(), 0);
    }

    #[test]
    fn delta_dedupes_case_insensitively() {
        let d = AssigneeDelta::compute(&logins(&["Alice", "alice"]), &logins(&["ALICE", "bob", "Bob"]));
        assert_eq!(d.to_add, logins(&["bob"]));
        assert!(d.to_remove.is_empty());
    }
}
