//! Declarative rules and the rule evaluator.
//!
//! A rule pairs a trigger condition (when to act) with one or more actions
//! (what to do). Evaluation is pure: it reads a snapshot and returns the
//! actions that fire, leaving execution order to the processors.

use crate::condition::{Condition, ConditionSpec, EvalContext};
use crate::types::ItemKind;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// RuleCategory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    BoardItems,
    Columns,
    Sprints,
    Assignees,
    LinkedIssues,
}

impl RuleCategory {
    /// Processing order within a run.
    pub fn all() -> &'static [RuleCategory] {
        &[
            RuleCategory::BoardItems,
            RuleCategory::Columns,
            RuleCategory::Sprints,
            RuleCategory::Assignees,
            RuleCategory::LinkedIssues,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleCategory::BoardItems => "board_items",
            RuleCategory::Columns => "columns",
            RuleCategory::Sprints => "sprints",
            RuleCategory::Assignees => "assignees",
            RuleCategory::LinkedIssues => "linked_issues",
        }
    }

    /// Actions a rule in this category may emit.
    pub fn allowed_actions(self) -> &'static [ActionName] {
        match self {
            RuleCategory::BoardItems => &[ActionName::AddToBoard],
            RuleCategory::Columns => &[ActionName::SetColumn],
            RuleCategory::Sprints => &[ActionName::SetSprint, ActionName::RemoveSprint],
            RuleCategory::Assignees => &[ActionName::AddAssignees, ActionName::SetAssignees],
            RuleCategory::LinkedIssues => &[
                ActionName::InheritColumn,
                ActionName::InheritSprint,
                ActionName::InheritAssignees,
            ],
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ActionName
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionName {
    AddToBoard,
    SetColumn,
    SetSprint,
    RemoveSprint,
    AddAssignees,
    SetAssignees,
    InheritColumn,
    InheritSprint,
    InheritAssignees,
}

impl ActionName {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionName::AddToBoard => "add_to_board",
            ActionName::SetColumn => "set_column",
            ActionName::SetSprint => "set_sprint",
            ActionName::RemoveSprint => "remove_sprint",
            ActionName::AddAssignees => "add_assignees",
            ActionName::SetAssignees => "set_assignees",
            ActionName::InheritColumn => "inherit_column",
            ActionName::InheritSprint => "inherit_sprint",
            ActionName::InheritAssignees => "inherit_assignees",
        }
    }

    /// Whether the action is meaningless without a `value`.
    pub fn requires_value(self) -> bool {
        matches!(
            self,
            ActionName::SetColumn | ActionName::AddAssignees | ActionName::SetAssignees
        )
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Config-facing rule definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(vs) => vs.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDef {
    /// `None` (or the literal `None`) is the "no column" state.
    #[serde(default)]
    pub from: Option<String>,
    pub to: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_entity_types")]
    pub entity_types: Vec<ItemKind>,
    pub trigger: ConditionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<ConditionSpec>,
    pub action: OneOrMany<ActionName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<OneOrMany<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid_transitions: Vec<TransitionDef>,
}

fn default_entity_types() -> Vec<ItemKind> {
    ItemKind::all().to_vec()
}

// ---------------------------------------------------------------------------
// Rule (compiled)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    pub category: RuleCategory,
    pub entity_types: Vec<ItemKind>,
    pub trigger: Condition,
    pub skip_if: Option<Condition>,
    pub actions: Vec<ActionName>,
    pub value: Vec<String>,
}

impl Rule {
    pub fn compile(category: RuleCategory, def: &RuleDef) -> Self {
        Self {
            name: def.name.clone(),
            category,
            entity_types: def.entity_types.clone(),
            trigger: def.trigger.compile(),
            skip_if: def.skip_if.as_ref().map(ConditionSpec::compile),
            actions: def.action.to_vec(),
            value: def.value.as_ref().map(OneOrMany::to_vec).unwrap_or_default(),
        }
    }

    pub fn applies_to(&self, kind: ItemKind) -> bool {
        self.entity_types.contains(&kind)
    }
}

/// Compiled rules for one run, grouped by category in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    pub board_items: Vec<Rule>,
    pub columns: Vec<Rule>,
    pub sprints: Vec<Rule>,
    pub assignees: Vec<Rule>,
    pub linked_issues: Vec<Rule>,
}

impl RuleSet {
    pub fn compile(config: &crate::config::RulesConfig) -> Self {
        let compile_all = |category, defs: &[RuleDef]| {
            defs.iter().map(|d| Rule::compile(category, d)).collect()
        };
        Self {
            board_items: compile_all(RuleCategory::BoardItems, &config.board_items),
            columns: compile_all(RuleCategory::Columns, &config.columns),
            sprints: compile_all(RuleCategory::Sprints, &config.sprints),
            assignees: compile_all(RuleCategory::Assignees, &config.assignees),
            linked_issues: compile_all(RuleCategory::LinkedIssues, &config.linked_issues),
        }
    }

    pub fn for_category(&self, category: RuleCategory) -> &[Rule] {
        match category {
            RuleCategory::BoardItems => &self.board_items,
            RuleCategory::Columns => &self.columns,
            RuleCategory::Sprints => &self.sprints,
            RuleCategory::Assignees => &self.assignees,
            RuleCategory::LinkedIssues => &self.linked_issues,
        }
    }
}

// ---------------------------------------------------------------------------
// Action (evaluator output)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub rule: String,
    pub name: ActionName,
    /// The rule's `value`, with template variables resolved.
    pub params: Vec<String>,
}

impl Action {
    pub fn first_param(&self) -> Option<&str> {
        self.params.first().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Evaluate `rules` against one snapshot, in declaration order.
///
/// Rules scoped to another item kind are ignored. A rule whose skip
/// condition holds contributes nothing; otherwise every action of a rule
/// whose trigger holds is returned.
pub fn evaluate_rules(ctx: &EvalContext, rules: &[Rule]) -> Vec<Action> {
    let mut actions = Vec::new();
    for rule in rules {
        if !rule.applies_to(ctx.item.kind) {
            continue;
        }
        if rule.skip_if.as_ref().is_some_and(|c| c.matches(ctx)) {
            tracing::debug!(rule = %rule.name, item = %ctx.item.label(), "skip condition met");
            continue;
        }
        if !rule.trigger.matches(ctx) {
            continue;
        }
        let params: Vec<String> = rule.value.iter().map(|v| interpolate(v, ctx)).collect();
        for name in &rule.actions {
            actions.push(Action {
                rule: rule.name.clone(),
                name: *name,
                params: params.clone(),
            });
        }
    }
    actions
}

/// Resolve template variables in a rule value.
///
/// Supported: `@author`, `@monitored`, and `{{author}}`, `{{item.author}}`,
/// `{{monitored.user}}`, `{{repository}}`, `{{number}}`.
pub fn interpolate(value: &str, ctx: &EvalContext) -> String {
    let trimmed = value.trim();
    match trimmed {
        "@author" => return ctx.item.author.clone(),
        "@monitored" => return ctx.monitored.user.clone(),
        _ => {}
    }
    if !trimmed.contains("{{") {
        return trimmed.to_string();
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut rest = trimmed;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = after[..end].trim();
        match var {
            "author" | "item.author" => out.push_str(&ctx.item.author),
            "monitored.user" => out.push_str(&ctx.monitored.user),
            "repository" | "item.repository" => out.push_str(&ctx.item.repository),
            "number" | "item.number" => out.push_str(&ctx.item.number.to_string()),
            other => {
                tracing::warn!(variable = other, "unknown template variable left as-is");
                out.push_str(&rest[start..start + 2 + end + 2]);
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Monitored;
    use crate::types::{BoardPlacement, ItemState, WorkItem};

    fn monitored() -> Monitored {
        Monitored {
            user: "DerekRoberts".into(),
            repositories: vec!["bcgov/nr-nerds".into()],
        }
    }

    fn pr(author: &str) -> WorkItem {
        WorkItem {
            kind: ItemKind::PullRequest,
            id: "PR_1".into(),
            number: 31,
            repository: "bcgov/nr-nerds".into(),
            author: author.into(),
            assignees: vec![],
            state: ItemState::Open,
            linked_issues: vec![],
            closed_at: None,
            merged_at: None,
        }
    }

    fn rule_yaml(yaml: &str) -> Rule {
        let def: RuleDef = serde_yaml::from_str(yaml).unwrap();
        Rule::compile(RuleCategory::Assignees, &def)
    }

    #[test]
    fn trigger_emits_interpolated_action() {
        let rule = rule_yaml(
            r#"
name: assign_author
entity_types: [pull_request]
trigger: "item.author == monitored.user"
action: add_assignees
value: "@author"
"#,
        );
        let m = monitored();
        let item = pr("DerekRoberts");
        let actions = evaluate_rules(&EvalContext::new(&item, None, &m), &[rule]);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].name, ActionName::AddAssignees);
        assert_eq!(actions[0].params, vec!["DerekRoberts".to_string()]);
    }

    #[test]
    fn skip_condition_wins_over_trigger() {
        let rule = rule_yaml(
            r#"
name: assign_author
trigger: always
skip_if: "item.assignees includes item.author"
action: add_assignees
value: "{{author}}"
"#,
        );
        let m = monitored();
        let mut item = pr("DerekRoberts");
        item.assignees = vec!["derekroberts".into()];
        assert!(evaluate_rules(&EvalContext::new(&item, None, &m), &[rule]).is_empty());
    }

    #[test]
    fn entity_type_scoping() {
        let rule = rule_yaml("name: issues_only\nentity_types: [issue]\ntrigger: always\naction: add_assignees\nvalue: x\n");
        let m = monitored();
        let item = pr("x");
        assert!(evaluate_rules(&EvalContext::new(&item, None, &m), &[rule]).is_empty());
    }

    #[test]
    fn multiple_rules_and_multi_action_rules_all_fire_in_order() {
        let first = rule_yaml("name: a\ntrigger: always\naction: [inherit_column, inherit_assignees]\n");
        let second = rule_yaml("name: b\ntrigger: \"item.author == monitored.user\"\naction: inherit_sprint\n");
        let m = monitored();
        let item = pr("DerekRoberts");
        let names: Vec<_> = evaluate_rules(&EvalContext::new(&item, None, &m), &[first, second])
            .into_iter()
            .map(|a| (a.rule, a.name))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a".to_string(), ActionName::InheritColumn),
                ("a".to_string(), ActionName::InheritAssignees),
                ("b".to_string(), ActionName::InheritSprint),
            ]
        );
    }

    #[test]
    fn unknown_trigger_never_fires() {
        let rule = rule_yaml("name: typo\ntrigger: \"item.autor == monitored.user\"\naction: add_assignees\nvalue: x\n");
        let m = monitored();
        let item = pr("DerekRoberts");
        assert!(evaluate_rules(&EvalContext::new(&item, None, &m), &[rule]).is_empty());
    }

    #[test]
    fn evaluation_sees_board_placement() {
        let def: RuleDef = serde_yaml::from_str(
            "name: new_to_active\ntrigger: \"item.column == None\"\naction: set_column\nvalue: Active\n",
        )
        .unwrap();
        let rule = Rule::compile(RuleCategory::Columns, &def);
        let m = monitored();
        let item = pr("x");
        let placement = BoardPlacement {
            project_item_id: "PVTI_1".into(),
            ..Default::default()
        };
        let actions = evaluate_rules(&EvalContext::new(&item, Some(&placement), &m), &[rule.clone()]);
        assert_eq!(actions[0].first_param(), Some("Active"));
        assert!(evaluate_rules(&EvalContext::new(&item, None, &m), &[rule]).is_empty());
    }

    #[test]
    fn interpolation_variants() {
        let m = monitored();
        let item = pr("octocat");
        let ctx = EvalContext::new(&item, None, &m);
        assert_eq!(interpolate("@monitored", &ctx), "DerekRoberts");
        assert_eq!(interpolate("{{ item.author }}", &ctx), "octocat");
        assert_eq!(interpolate("{{repository}}#{{number}}", &ctx), "bcgov/nr-nerds#31");
        assert_eq!(interpolate("{{nope}}", &ctx), "{{nope}}");
        assert_eq!(interpolate("Active", &ctx), "Active");
    }

    #[test]
    fn category_action_allowlists() {
        assert!(RuleCategory::Columns.allowed_actions().contains(&ActionName::SetColumn));
        assert!(!RuleCategory::Columns.allowed_actions().contains(&ActionName::SetSprint));
        assert_eq!(RuleCategory::all().first(), Some(&RuleCategory::BoardItems));
    }
}
