use crate::api::BoardApi;
use crate::config::ProjectConfig;
use crate::error::{Result, SyncError};
use crate::sprint::{IterationSet, SprintColumns, SprintResolver};
use crate::types::{ColumnOption, StatusField};

/// Board metadata fetched at most once per run.
///
/// The status field's options and the sprint field's iterations do not change
/// during a run, so the first lookup is kept. A missing field is fatal.
#[derive(Debug, Clone)]
pub struct RunContext {
    status_field_name: String,
    sprint_field_name: String,
    status: Option<StatusField>,
    sprint: Option<(String, IterationSet)>,
}

impl RunContext {
    pub fn new(project: &ProjectConfig) -> Self {
        Self {
            status_field_name: project.status_field.clone(),
            sprint_field_name: project.sprint_field.clone(),
            status: None,
            sprint: None,
        }
    }

    /// Drop every cached lookup.
    pub fn reset(&mut self) {
        self.status = None;
        self.sprint = None;
    }

    pub fn status_field(&mut self, api: &dyn BoardApi) -> Result<&StatusField> {
        if self.status.is_none() {
            let field = api.status_field(&self.status_field_name)?;
            tracing::debug!(field = %self.status_field_name, options = field.options.len(), "status field loaded");
            self.status = Some(field);
        }
        self.status
            .as_ref()
            .ok_or_else(|| SyncError::FieldNotFound(self.status_field_name.clone()))
    }

    /// The option for `column`. Exact names win over case-insensitive ones.
    pub fn column_option(&mut self, api: &dyn BoardApi, column: &str) -> Result<ColumnOption> {
        let field = self.status_field(api)?;
        let column = column.trim();
        field
            .options
            .iter()
            .find(|o| o.name == column)
            .or_else(|| field.options.iter().find(|o| o.name.eq_ignore_ascii_case(column)))
            .cloned()
            .ok_or_else(|| SyncError::UnknownColumn(column.to_string()))
    }

    pub fn status_field_id(&mut self, api: &dyn BoardApi) -> Result<String> {
        Ok(self.status_field(api)?.id.clone())
    }

    fn load_sprint(&mut self, api: &dyn BoardApi) -> Result<&(String, IterationSet)> {
        if self.sprint.is_none() {
            let field = api.sprint_field(&self.sprint_field_name)?;
            let set = IterationSet::merge(field.active, field.completed);
            tracing::debug!(field = %self.sprint_field_name, iterations = set.len(), "sprint field loaded");
            self.sprint = Some((field.id, set));
        }
        self.sprint
            .as_ref()
            .ok_or_else(|| SyncError::FieldNotFound(self.sprint_field_name.clone()))
    }

    pub fn sprint_field_id(&mut self, api: &dyn BoardApi) -> Result<String> {
        Ok(self.load_sprint(api)?.0.clone())
    }

    pub fn iterations(&mut self, api: &dyn BoardApi) -> Result<&IterationSet> {
        Ok(&self.load_sprint(api)?.1)
    }

    pub fn sprint_resolver(&mut self, api: &dyn BoardApi, columns: &SprintColumns) -> Result<SprintResolver> {
        Ok(SprintResolver::new(self.iterations(api)?.clone(), columns.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OwnerType, ProjectConfig};
    use crate::memory::MemoryBoard;
    use crate::sprint::Iteration;
    use chrono::NaiveDate;

    fn project() -> ProjectConfig {
        ProjectConfig {
            owner: "bcgov".into(),
            owner_type: OwnerType::Organization,
            number: 16,
            id: None,
            status_field: "Status".into(),
            sprint_field: "Sprint".into(),
        }
    }

    #[test]
    fn lookups_are_cached_until_reset() {
        let board = MemoryBoard::new();
        board.seed_columns(&[("o1", "Active")]);
        let mut ctx = RunContext::new(&project());
        assert_eq!(ctx.column_option(&board, "active").unwrap().id, "o1");

        board.seed_columns(&[("o2", "Active")]);
        assert_eq!(ctx.column_option(&board, "Active").unwrap().id, "o1");
        ctx.reset();
        assert_eq!(ctx.column_option(&board, "Active").unwrap().id, "o2");
    }

    #[test]
    fn unknown_column_and_missing_field() {
        let board = MemoryBoard::new();
        let mut ctx = RunContext::new(&project());
        assert!(matches!(
            ctx.column_option(&board, "Active"),
            Err(SyncError::FieldNotFound(_))
        ));
        board.seed_columns(&[("o1", "Active")]);
        assert!(matches!(
            ctx.column_option(&board, "Review"),
            Err(SyncError::UnknownColumn(_))
        ));
        assert!(matches!(ctx.iterations(&board), Err(SyncError::FieldNotFound(_))));
    }

    #[test]
    fn iterations_merge_active_and_completed() {
        let board = MemoryBoard::new();
        let it = |id: &str, d: u32| Iteration {
            id: id.into(),
            title: id.into(),
            start_date: NaiveDate::from_ymd_opt(2024, 6, d).unwrap(),
            duration_days: 7,
        };
        board.seed_iterations(vec![it("b", 15)], vec![it("a", 1)]);
        let mut ctx = RunContext::new(&project());
        assert_eq!(ctx.iterations(&board).unwrap().len(), 2);
        assert_eq!(ctx.sprint_field_id(&board).unwrap(), crate::memory::SPRINT_FIELD_ID);
    }
}
