use crate::error::{Result, SyncError};
use crate::rules::{ActionName, RuleCategory, RuleDef, RuleSet};
use crate::sprint::SprintColumns;
use crate::transition::{normalize_column, TransitionTable};
use crate::verify::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = ".projsync.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: String) -> Self {
        Self {
            level: WarnLevel::Warning,
            message,
        }
    }

    fn error(message: String) -> Self {
        Self {
            level: WarnLevel::Error,
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    #[default]
    Organization,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub owner: String,
    #[serde(default)]
    pub owner_type: OwnerType,
    pub number: u64,
    /// Project node id. Looked up from `owner`/`number` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "default_status_field")]
    pub status_field: String,
    #[serde(default = "default_sprint_field")]
    pub sprint_field: String,
}

fn default_status_field() -> String {
    "Status".to_string()
}

fn default_sprint_field() -> String {
    "Sprint".to_string()
}

// ---------------------------------------------------------------------------
// Monitored
// ---------------------------------------------------------------------------

/// The user whose work is tracked and the repositories watched on their behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitored {
    pub user: String,
    #[serde(default)]
    pub repositories: Vec<String>,
}

impl Monitored {
    pub fn watches_repository(&self, repository: &str) -> bool {
        self.repositories
            .iter()
            .any(|r| r.eq_ignore_ascii_case(repository))
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Skip a bulk operation when fewer API points than this remain.
    #[serde(default = "default_rate_limit_floor")]
    pub rate_limit_floor: u32,
    /// Snapshot window for bulk runs, in hours.
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,
}

fn default_batch_size() -> usize {
    crate::batch::DEFAULT_BATCH_SIZE
}

fn default_rate_limit_floor() -> u32 {
    100
}

fn default_lookback_hours() -> u32 {
    24
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            rate_limit_floor: default_rate_limit_floor(),
            lookback_hours: default_lookback_hours(),
        }
    }
}

// ---------------------------------------------------------------------------
// RulesConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub board_items: Vec<RuleDef>,
    #[serde(default)]
    pub columns: Vec<RuleDef>,
    #[serde(default)]
    pub sprints: Vec<RuleDef>,
    #[serde(default)]
    pub assignees: Vec<RuleDef>,
    #[serde(default)]
    pub linked_issues: Vec<RuleDef>,
}

impl RulesConfig {
    pub fn for_category(&self, category: RuleCategory) -> &[RuleDef] {
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
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub project: ProjectConfig,
    pub monitored: Monitored,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub sprint_columns: SprintColumns,
    #[serde(default)]
    pub rules: RulesConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SyncError::ConfigNotFound(path.display().to_string()));
        }
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Walk upward from `start` looking for [`CONFIG_FILE`].
    pub fn discover(start: &Path) -> Option<PathBuf> {
        let mut dir = Some(start);
        while let Some(d) = dir {
            let candidate = d.join(CONFIG_FILE);
            if candidate.is_file() {
                return Some(candidate);
            }
            dir = d.parent();
        }
        None
    }

    pub fn rule_set(&self) -> RuleSet {
        RuleSet::compile(&self.rules)
    }

    pub fn transition_table(&self) -> Result<TransitionTable> {
        TransitionTable::from_rules(&self.rules.columns)
    }

    /// Fail on any error-level finding. Warnings are logged and tolerated.
    pub fn ensure_valid(&self) -> Result<()> {
        self.transition_table()?;
        let mut errors = Vec::new();
        for w in self.validate() {
            match w.level {
                WarnLevel::Warning => tracing::warn!(message = %w.message, "config warning"),
                WarnLevel::Error => errors.push(w.message),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SyncError::InvalidConfig(errors.join("; ")))
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.project.owner.trim().is_empty() {
            warnings.push(ConfigWarning::error("project.owner is empty".into()));
        }
        if self.monitored.user.trim().is_empty() {
            warnings.push(ConfigWarning::error("monitored.user is empty".into()));
        }
        for repo in &self.monitored.repositories {
            if repo.split('/').filter(|p| !p.is_empty()).count() != 2 {
                warnings.push(ConfigWarning::error(format!(
                    "monitored repository '{repo}' is not in owner/name form"
                )));
            }
        }

        if self.limits.batch_size == 0 {
            warnings.push(ConfigWarning::error("limits.batch_size must be at least 1".into()));
        } else if self.limits.batch_size > 50 {
            warnings.push(ConfigWarning::warning(format!(
                "limits.batch_size={} is large; oversized mutation requests are often rejected",
                self.limits.batch_size
            )));
        }

        if self.retry.max_attempts == 0 {
            warnings.push(ConfigWarning::error("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            warnings.push(ConfigWarning::warning(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({}); every delay is capped",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }

        let sc = &self.sprint_columns;
        for c in &sc.eligible {
            if sc.is_inactive(c) {
                warnings.push(ConfigWarning::error(format!(
                    "column '{c}' is both sprint-eligible and inactive"
                )));
            }
        }
        if !sc.is_eligible(&sc.done) {
            warnings.push(ConfigWarning::warning(format!(
                "done column '{}' is not sprint-eligible; completed items will never get a sprint",
                sc.done
            )));
        }

        for &category in RuleCategory::all() {
            let mut seen = BTreeSet::new();
            for rule in self.rules.for_category(category) {
                if !seen.insert(rule.name.as_str()) {
                    warnings.push(ConfigWarning::warning(format!(
                        "duplicate rule name '{}' in {category}",
                        rule.name
                    )));
                }
                validate_rule(category, rule, &mut warnings);
            }
        }

        match self.transition_table() {
            Ok(table) => {
                for rule in &self.rules.columns {
                    let Some(value) = &rule.value else { continue };
                    for target in value.to_vec() {
                        let Some(target) = normalize_column(Some(&target)) else { continue };
                        if !table.reaches(&target) {
                            warnings.push(ConfigWarning::warning(format!(
                                "rule '{}' sets column '{target}', which no transition leads into",
                                rule.name
                            )));
                        }
                    }
                }
            }
            Err(e) => warnings.push(ConfigWarning::error(e.to_string())),
        }

        warnings
    }
}

fn validate_rule(category: RuleCategory, rule: &RuleDef, warnings: &mut Vec<ConfigWarning>) {
    let allowed = category.allowed_actions();
    let actions = rule.action.to_vec();
    for action in &actions {
        if !allowed.contains(action) {
            warnings.push(ConfigWarning::error(format!(
                "rule '{}' in {category} uses action '{action}', which that category does not allow",
                rule.name
            )));
        }
    }

    let has_value = rule
        .value
        .as_ref()
        .is_some_and(|v| v.to_vec().iter().any(|s| !s.trim().is_empty()));
    if actions.iter().any(|a| a.requires_value()) && !has_value {
        warnings.push(ConfigWarning::error(format!(
            "rule '{}' needs a value for its action",
            rule.name
        )));
    }
    if actions.contains(&ActionName::SetColumn) && rule.value.as_ref().is_some_and(|v| v.to_vec().len() > 1) {
        warnings.push(ConfigWarning::warning(format!(
            "rule '{}' lists several columns; only the first is used",
            rule.name
        )));
    }

    if category != RuleCategory::Columns && !rule.valid_transitions.is_empty() {
        warnings.push(ConfigWarning::warning(format!(
            "rule '{}' in {category} declares valid_transitions, which only column rules use",
            rule.name
        )));
    }

    let mut conditions = vec![("trigger", rule.trigger.compile())];
    if let Some(skip) = &rule.skip_if {
        conditions.push(("skip_if", skip.compile()));
    }
    for t in &rule.valid_transitions {
        for c in &t.conditions {
            conditions.push(("transition condition", c.compile()));
        }
    }
    for (place, condition) in &conditions {
        for text in condition.unknown_leaves() {
            warnings.push(ConfigWarning::warning(format!(
                "rule '{}' has an unrecognised {place} '{text}'; it never matches",
                rule.name
            )));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
project:
  owner: bcgov
  number: 16
monitored:
  user: DerekRoberts
  repositories: [bcgov/nr-nerds, bcgov/quickstart-openshift]
rules:
  board_items:
    - name: authored_prs
      entity_types: [pull_request]
      trigger: "item.author == monitored.user"
      action: add_to_board
  columns:
    - name: new_to_active
      trigger: "item.column == None"
      action: set_column
      value: Active
      valid_transitions:
        - { from: None, to: Active }
        - { from: New, to: Active }
        - { from: Active, to: Done }
  assignees:
    - name: assign_author
      trigger: "item.author == monitored.user"
      skip_if: "item.assignees includes item.author"
      action: add_assignees
      value: "@author"
"#;

    fn errors(cfg: &Config) -> Vec<String> {
        cfg.validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect()
    }

    #[test]
    fn sample_parses_with_defaults() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.project.status_field, "Status");
        assert_eq!(cfg.project.sprint_field, "Sprint");
        assert_eq!(cfg.project.owner_type, OwnerType::Organization);
        assert_eq!(cfg.limits.batch_size, 10);
        assert_eq!(cfg.limits.rate_limit_floor, 100);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.sprint_columns.done, "Done");
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
        cfg.ensure_valid().unwrap();
        assert_eq!(cfg.rule_set().columns.len(), 1);
    }

    #[test]
    fn disallowed_action_is_an_error() {
        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.rules.assignees[0].action = crate::rules::OneOrMany::One(ActionName::SetSprint);
        let errs = errors(&cfg);
        assert!(errs.iter().any(|m| m.contains("does not allow")), "{errs:?}");
        assert!(matches!(cfg.ensure_valid(), Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn missing_value_is_an_error() {
        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.rules.columns[0].value = None;
        assert!(errors(&cfg).iter().any(|m| m.contains("needs a value")));
    }

    #[test]
    fn unknown_condition_is_a_warning() {
        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.rules.assignees[0].trigger = "item.autor == monitored.user".into();
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("unrecognised trigger")));
        assert!(cfg.ensure_valid().is_ok());
    }

    #[test]
    fn column_rules_without_transitions_are_malformed() {
        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.rules.columns[0].valid_transitions.clear();
        assert!(matches!(
            cfg.ensure_valid(),
            Err(SyncError::MalformedTransitions(_))
        ));
    }

    #[test]
    fn unreachable_target_column_warns() {
        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.rules.columns[0].value = Some(crate::rules::OneOrMany::One("Review".into()));
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("no transition leads into")));
    }

    #[test]
    fn overlapping_sprint_column_sets_are_an_error() {
        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.sprint_columns.inactive.push("Active".into());
        assert!(errors(&cfg).iter().any(|m| m.contains("both sprint-eligible and inactive")));
    }

    #[test]
    fn load_missing_file_is_config_not_found() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join(CONFIG_FILE)).unwrap_err();
        assert!(matches!(err, SyncError::ConfigNotFound(_)));
    }

    #[test]
    fn discover_walks_upward() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), SAMPLE).unwrap();
        let deep = dir.path().join("a/b/c");
        std::fs::create_dir_all(&deep).unwrap();
        let found = Config::discover(&deep).unwrap();
        assert_eq!(found, dir.path().join(CONFIG_FILE));
        let cfg = Config::load(&found).unwrap();
        assert_eq!(cfg.project.number, 16);
    }
}
