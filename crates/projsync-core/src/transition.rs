//! Column transition policy.
//!
//! The table is built from every `valid_transitions` entry across the column
//! rules. A `(from, to)` pair that is not declared is blocked; there is no
//! fallback-allow path. `None` is the "no column" state.

use crate::condition::{Condition, EvalContext};
use crate::error::{Result, SyncError};
use crate::rules::{ActionName, RuleDef};
use serde::Serialize;
use std::collections::BTreeMap;

/// Canonical form of a column name: trimmed, with the spellings of
/// "no column" folded into `None`.
pub fn normalize_column(column: Option<&str>) -> Option<String> {
    let c = column?.trim();
    match c {
        "" | "None" | "none" | "null" => None,
        other => Some(other.to_string()),
    }
}

pub fn column_label(column: Option<&str>) -> &str {
    column.unwrap_or("None")
}

// ---------------------------------------------------------------------------
// TransitionTable
// ---------------------------------------------------------------------------

/// Each edge holds one or more alternative condition sets; an empty set is
/// unconditional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionTable {
    edges: BTreeMap<Option<String>, BTreeMap<String, Vec<Vec<Condition>>>>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from column rule definitions.
    ///
    /// Fails when an entry is malformed, or when column rules exist but no
    /// transition was declared at all: running with an empty policy would
    /// silently block every move.
    pub fn from_rules(rules: &[RuleDef]) -> Result<Self> {
        let mut table = Self::new();
        let mut sets_columns = false;
        for rule in rules {
            if rule.action.to_vec().contains(&ActionName::SetColumn) {
                sets_columns = true;
            }
            for t in &rule.valid_transitions {
                let to = normalize_column(Some(&t.to)).ok_or_else(|| {
                    SyncError::MalformedTransitions(format!(
                        "rule '{}' declares a transition into no column",
                        rule.name
                    ))
                })?;
                let conditions = t.conditions.iter().map(|c| c.compile()).collect();
                table.allow(normalize_column(t.from.as_deref()), to, conditions);
            }
        }
        if sets_columns && table.is_empty() {
            return Err(SyncError::MalformedTransitions(
                "column rules are configured but no valid_transitions are declared".into(),
            ));
        }
        Ok(table)
    }

    pub fn allow(&mut self, from: Option<String>, to: String, conditions: Vec<Condition>) {
        self.edges
            .entry(from)
            .or_default()
            .entry(to)
            .or_default()
            .push(conditions);
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn allowed_from(&self, from: Option<&str>) -> Vec<String> {
        self.edges
            .get(&from.map(str::to_string))
            .map(|tos| tos.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any declared edge leads into `to`.
    pub fn reaches(&self, to: &str) -> bool {
        self.edges.values().any(|tos| tos.contains_key(to))
    }

    fn alternatives(&self, from: Option<&str>, to: &str) -> Option<&Vec<Vec<Condition>>> {
        self.edges.get(&from.map(str::to_string))?.get(to)
    }

    /// Number of declared `(from, to)` edges.
    pub fn len(&self) -> usize {
        self.edges.values().map(BTreeMap::len).sum()
    }
}

// ---------------------------------------------------------------------------
// TransitionCheck
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
}

impl TransitionCheck {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
            allowed: Vec::new(),
        }
    }

    fn blocked(reason: String, allowed: Vec<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            allowed,
        }
    }
}

// ---------------------------------------------------------------------------
// TransitionValidator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TransitionValidator {
    table: TransitionTable,
}

impl TransitionValidator {
    pub fn new(table: TransitionTable) -> Self {
        Self { table }
    }

    /// Replace the policy wholesale. Nothing from the previous table survives.
    pub fn initialize(&mut self, table: TransitionTable) {
        self.table = table;
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Check `(from, to)` against the declared edges, ignoring edge conditions.
    pub fn validate(&self, from: Option<&str>, to: Option<&str>) -> TransitionCheck {
        self.check(from, to, None)
    }

    /// Like [`validate`](Self::validate), and additionally requires one of the
    /// edge's condition sets to hold for `ctx`.
    pub fn validate_with(
        &self,
        from: Option<&str>,
        to: Option<&str>,
        ctx: &EvalContext,
    ) -> TransitionCheck {
        self.check(from, to, Some(ctx))
    }

    fn check(
        &self,
        from: Option<&str>,
        to: Option<&str>,
        ctx: Option<&EvalContext>,
    ) -> TransitionCheck {
        let from = normalize_column(from);
        let to = normalize_column(to);
        if from == to {
            return TransitionCheck::ok();
        }

        let allowed = self.table.allowed_from(from.as_deref());
        let Some(to) = to else {
            return TransitionCheck::blocked(
                format!(
                    "clearing the column from '{}' is not a declared transition",
                    column_label(from.as_deref())
                ),
                allowed,
            );
        };

        let Some(alternatives) = self.table.alternatives(from.as_deref(), &to) else {
            let reason = if allowed.is_empty() {
                format!(
                    "no transitions are declared from '{}'",
                    column_label(from.as_deref())
                )
            } else {
                format!(
                    "transition '{}' -> '{}' is not declared (allowed: {})",
                    column_label(from.as_deref()),
                    to,
                    allowed.join(", ")
                )
            };
            return TransitionCheck::blocked(reason, allowed);
        };

        let Some(ctx) = ctx else {
            return TransitionCheck::ok();
        };
        let satisfied = alternatives
            .iter()
            .any(|conds| conds.iter().all(|c| c.matches(ctx)));
        if satisfied {
            TransitionCheck::ok()
        } else {
            TransitionCheck::blocked(
                format!(
                    "conditions for '{}' -> '{}' are not met",
                    column_label(from.as_deref()),
                    to
                ),
                allowed,
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Monitored;
    use crate::types::{BoardPlacement, ItemKind, ItemState, WorkItem};

    fn defs(yaml: &str) -> Vec<RuleDef> {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn standard() -> TransitionValidator {
        let rules = defs(
            r#"
- name: pr_to_active
  trigger: "item.column == None"
  action: set_column
  value: Active
  valid_transitions:
    - { from: None, to: Active }
    - { from: New, to: Active }
- name: merged_to_done
  trigger: "item.state == merged"
  action: set_column
  value: Done
  valid_transitions:
    - { from: Active, to: Done }
    - { from: Waiting, to: Done }
"#,
        );
        TransitionValidator::new(TransitionTable::from_rules(&rules).unwrap())
    }

    #[test]
    fn same_column_is_always_valid() {
        let v = TransitionValidator::default();
        assert!(v.validate(Some("Parked"), Some("Parked")).valid);
        assert!(v.validate(None, None).valid);
    }

    #[test]
    fn undeclared_pairs_are_blocked_with_allowed_list() {
        let v = standard();
        let check = v.validate(Some("Active"), Some("New"));
        assert!(!check.valid);
        assert_eq!(check.allowed, vec!["Done".to_string()]);
        assert!(check.reason.unwrap().contains("not declared"));

        let unknown_from = v.validate(Some("Backlog"), Some("Done"));
        assert!(!unknown_from.valid);
        assert!(unknown_from.allowed.is_empty());
    }

    #[test]
    fn declared_pairs_pass_including_from_none() {
        let v = standard();
        assert!(v.validate(None, Some("Active")).valid);
        assert!(v.validate(Some("None"), Some("Active")).valid);
        assert!(v.validate(Some(" Waiting "), Some("Done")).valid);
    }

    #[test]
    fn clearing_a_column_is_blocked_unless_unchanged() {
        let v = standard();
        assert!(!v.validate(Some("Active"), None).valid);
    }

    #[test]
    fn reinitialize_drops_stale_edges() {
        let mut v = standard();
        assert!(v.validate(Some("Active"), Some("Done")).valid);

        let replacement = defs(
            "- name: only\n  trigger: always\n  action: set_column\n  value: Next\n  valid_transitions:\n    - { from: New, to: Next }\n",
        );
        v.initialize(TransitionTable::from_rules(&replacement).unwrap());
        assert!(!v.validate(Some("Active"), Some("Done")).valid);
        assert!(v.validate(Some("New"), Some("Next")).valid);
        assert_eq!(v.table().len(), 1);
    }

    #[test]
    fn column_rules_without_transitions_are_malformed() {
        let rules = defs("- name: r\n  trigger: always\n  action: set_column\n  value: Active\n");
        let err = TransitionTable::from_rules(&rules).unwrap_err();
        assert!(matches!(err, SyncError::MalformedTransitions(_)));
    }

    #[test]
    fn transition_into_no_column_is_malformed() {
        let rules = defs(
            "- name: r\n  trigger: always\n  action: set_column\n  value: Active\n  valid_transitions:\n    - { from: Active, to: None }\n",
        );
        assert!(TransitionTable::from_rules(&rules).is_err());
    }

    #[test]
    fn edge_conditions_gate_validate_with() {
        let rules = defs(
            r#"
- name: merged_to_done
  trigger: always
  action: set_column
  value: Done
  valid_transitions:
    - from: Active
      to: Done
      conditions: ["item.state == merged"]
"#,
        );
        let v = TransitionValidator::new(TransitionTable::from_rules(&rules).unwrap());
        let m = Monitored {
            user: "u".into(),
            repositories: vec![],
        };
        let mut item = WorkItem {
            kind: ItemKind::PullRequest,
            id: "PR_1".into(),
            number: 1,
            repository: "o/r".into(),
            author: "a".into(),
            assignees: vec![],
            state: ItemState::Open,
            linked_issues: vec![],
            closed_at: None,
            merged_at: None,
        };
        let placement = BoardPlacement::default();
        let ctx = EvalContext::new(&item, Some(&placement), &m);
        assert!(v.validate(Some("Active"), Some("Done")).valid);
        assert!(!v.validate_with(Some("Active"), Some("Done"), &ctx).valid);

        item.state = ItemState::Merged;
        let ctx = EvalContext::new(&item, Some(&placement), &m);
        assert!(v.validate_with(Some("Active"), Some("Done"), &ctx).valid);
    }
}
