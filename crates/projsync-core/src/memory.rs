//! An in-memory board.
//!
//! Backs offline plans (loaded from a YAML fixture) and the test suite. Reads
//! after a write can be made to lag so retry paths are exercised the same way
//! the hosted board exercises them.

use crate::api::{
    BoardApi, FieldMutation, MutationOp, MutationResult, RateLimitStatus, SnapshotFilter,
    SprintField,
};
use crate::error::{Result, SyncError};
use crate::sprint::Iteration;
use crate::types::{BoardField, BoardPlacement, ColumnOption, StatusField, WorkItem, WorkItemRef};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub const STATUS_FIELD_ID: &str = "PVTSSF_status";
pub const SPRINT_FIELD_ID: &str = "PVTIF_sprint";

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FixturePlacement {
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub sprint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FixtureIterations {
    #[serde(default)]
    pub active: Vec<Iteration>,
    #[serde(default)]
    pub completed: Vec<Iteration>,
}

/// YAML description of a board and the items around it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BoardFixture {
    /// Frozen "now" for the run.
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub iterations: Option<FixtureIterations>,
    #[serde(default)]
    pub items: Vec<WorkItem>,
    /// Keyed by item node id.
    #[serde(default)]
    pub placements: BTreeMap<String, FixturePlacement>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitStatus>,
    /// Stale reads served after each field write.
    #[serde(default)]
    pub read_lag: u32,
    /// Targets whose mutations always fail.
    #[serde(default)]
    pub failing_targets: Vec<String>,
}

impl BoardFixture {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }
}

pub fn option_id(column: &str) -> String {
    format!("opt-{}", column.trim().to_ascii_lowercase().replace(' ', "-"))
}

pub fn project_item_id(content_id: &str) -> String {
    format!("PVTI_{content_id}")
}

// ---------------------------------------------------------------------------
// MemoryBoard
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct State {
    items: BTreeMap<String, WorkItem>,
    /// content id -> placement
    placements: BTreeMap<String, BoardPlacement>,
    assignees: BTreeMap<String, Vec<String>>,
    status: Option<StatusField>,
    sprint: Option<SprintField>,
    rate_limit: Option<RateLimitStatus>,
    read_lag: u32,
    /// (project item id, field) -> (stale value, reads left)
    stale: BTreeMap<(String, BoardField), (Option<String>, u32)>,
    failing: BTreeSet<String>,
    fail_next_batch: Option<SyncError>,
    executed: Vec<FieldMutation>,
    batch_requests: usize,
    field_reads: usize,
}

impl State {
    fn content_for(&self, project_item_id: &str) -> Option<&str> {
        self.placements
            .iter()
            .find(|(_, p)| p.project_item_id == project_item_id)
            .map(|(id, _)| id.as_str())
    }

    fn placement_mut(&mut self, project_item_id: &str) -> Option<&mut BoardPlacement> {
        self.placements
            .values_mut()
            .find(|p| p.project_item_id == project_item_id)
    }

    fn write_field(&mut self, project_item_id: &str, field: BoardField, value: Option<String>) -> std::result::Result<(), String> {
        let lag = self.read_lag;
        let placement = self
            .placement_mut(project_item_id)
            .ok_or_else(|| format!("project item {project_item_id} not found"))?;
        let slot = match field {
            BoardField::Column => &mut placement.column,
            BoardField::Sprint => &mut placement.sprint_id,
        };
        let previous = std::mem::replace(slot, value);
        if lag > 0 {
            self.stale
                .insert((project_item_id.to_string(), field), (previous, lag));
        }
        Ok(())
    }

    fn apply(&mut self, m: &FieldMutation) -> std::result::Result<(), String> {
        if self.failing.contains(&m.target_id) {
            return Err(format!("mutation on {} rejected", m.target_id));
        }
        match &m.op {
            MutationOp::SetColumn { option_id, .. } => {
                let name = self
                    .status
                    .as_ref()
                    .and_then(|s| s.options.iter().find(|o| &o.id == option_id))
                    .map(|o| o.name.clone())
                    .ok_or_else(|| format!("unknown column option {option_id}"))?;
                self.write_field(&m.target_id, BoardField::Column, Some(name))
            }
            MutationOp::SetIteration { iteration_id, .. } => {
                let known = self.sprint.as_ref().is_some_and(|s| {
                    s.active
                        .iter()
                        .chain(&s.completed)
                        .any(|it| &it.id == iteration_id)
                });
                if !known {
                    return Err(format!("unknown iteration {iteration_id}"));
                }
                self.write_field(&m.target_id, BoardField::Sprint, Some(iteration_id.clone()))
            }
            MutationOp::ClearField { field_id } => {
                let field = if field_id == STATUS_FIELD_ID {
                    BoardField::Column
                } else {
                    BoardField::Sprint
                };
                self.write_field(&m.target_id, field, None)
            }
            MutationOp::AddAssignees { logins } => {
                let list = self.assignees.entry(m.target_id.clone()).or_default();
                for login in logins {
                    if !list.iter().any(|l| l.eq_ignore_ascii_case(login)) {
                        list.push(login.clone());
                    }
                }
                Ok(())
            }
            MutationOp::RemoveAssignees { logins } => {
                let list = self.assignees.entry(m.target_id.clone()).or_default();
                list.retain(|l| !logins.iter().any(|x| x.eq_ignore_ascii_case(l)));
                Ok(())
            }
        }
    }

    fn snapshot(&self, item: &WorkItem) -> WorkItem {
        let mut item = item.clone();
        if let Some(live) = self.assignees.get(&item.id) {
            item.assignees = live.clone();
        }
        item
    }
}

pub struct MemoryBoard {
    state: RefCell<State>,
    now: Option<DateTime<Utc>>,
}

impl Default for MemoryBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBoard {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State::default()),
            now: None,
        }
    }

    pub fn from_fixture(fixture: BoardFixture) -> Self {
        let board = Self {
            state: RefCell::new(State::default()),
            now: fixture.now,
        };
        if !fixture.columns.is_empty() {
            let options: Vec<(String, String)> = fixture
                .columns
                .iter()
                .map(|c| (option_id(c), c.clone()))
                .collect();
            let refs: Vec<(&str, &str)> = options.iter().map(|(i, n)| (i.as_str(), n.as_str())).collect();
            board.seed_columns(&refs);
        }
        if let Some(its) = fixture.iterations {
            board.seed_iterations(its.active, its.completed);
        }
        for item in fixture.items {
            board.seed_item(item);
        }
        for (content_id, p) in &fixture.placements {
            board.seed_placement(
                content_id,
                &project_item_id(content_id),
                p.column.as_deref(),
                p.sprint.as_deref(),
            );
        }
        {
            let mut st = board.state.borrow_mut();
            st.rate_limit = fixture.rate_limit;
            st.read_lag = fixture.read_lag;
            st.failing.extend(fixture.failing_targets);
        }
        board
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_fixture(BoardFixture::load(path)?))
    }

    /// The fixture's frozen time, if it set one.
    pub fn now(&self) -> Option<DateTime<Utc>> {
        self.now
    }

    // -- seeding ------------------------------------------------------------

    pub fn seed_item(&self, item: WorkItem) {
        let mut st = self.state.borrow_mut();
        st.assignees.insert(item.id.clone(), item.assignees.clone());
        st.items.insert(item.id.clone(), item);
    }

    pub fn seed_placement(
        &self,
        content_id: &str,
        project_item_id: &str,
        column: Option<&str>,
        sprint: Option<&str>,
    ) {
        self.state.borrow_mut().placements.insert(
            content_id.to_string(),
            BoardPlacement {
                project_item_id: project_item_id.to_string(),
                column: column.map(str::to_string),
                sprint_id: sprint.map(str::to_string),
                assignees: Vec::new(),
            },
        );
    }

    pub fn seed_assignees(&self, content_id: &str, logins: &[&str]) {
        self.state.borrow_mut().assignees.insert(
            content_id.to_string(),
            logins.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// `(option id, column name)` pairs.
    pub fn seed_columns(&self, options: &[(&str, &str)]) {
        self.state.borrow_mut().status = Some(StatusField {
            id: STATUS_FIELD_ID.to_string(),
            options: options
                .iter()
                .map(|(id, name)| ColumnOption {
                    id: id.to_string(),
                    name: name.to_string(),
                })
                .collect(),
        });
    }

    pub fn seed_iterations(&self, active: Vec<Iteration>, completed: Vec<Iteration>) {
        self.state.borrow_mut().sprint = Some(SprintField {
            id: SPRINT_FIELD_ID.to_string(),
            active,
            completed,
        });
    }

    pub fn set_rate_limit(&self, remaining: u32) {
        self.state.borrow_mut().rate_limit = Some(RateLimitStatus {
            remaining,
            limit: 5000,
            reset_at: Utc::now(),
        });
    }

    pub fn set_read_lag(&self, reads: u32) {
        self.state.borrow_mut().read_lag = reads;
    }

    pub fn fail_target(&self, target_id: &str) {
        self.state.borrow_mut().failing.insert(target_id.to_string());
    }

    pub fn fail_next_batch(&self, err: SyncError) {
        self.state.borrow_mut().fail_next_batch = Some(err);
    }

    // -- inspection ---------------------------------------------------------

    pub fn batch_requests(&self) -> usize {
        self.state.borrow().batch_requests
    }

    pub fn field_reads(&self) -> usize {
        self.state.borrow().field_reads
    }

    pub fn executed(&self) -> Vec<FieldMutation> {
        self.state.borrow().executed.clone()
    }

    pub fn placement(&self, content_id: &str) -> Option<BoardPlacement> {
        self.state.borrow().placements.get(content_id).cloned()
    }

    pub fn read_assignees_now(&self, content_id: &str) -> Vec<String> {
        self.state
            .borrow()
            .assignees
            .get(content_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl BoardApi for MemoryBoard {
    fn fetch_snapshot(&self, filter: &SnapshotFilter) -> Result<Vec<WorkItem>> {
        let st = self.state.borrow();
        Ok(st
            .items
            .values()
            .map(|i| st.snapshot(i))
            .filter(|i| filter.admits(i))
            .collect())
    }

    fn fetch_item(&self, item: &WorkItemRef) -> Result<WorkItem> {
        let st = self.state.borrow();
        let found = st.items.get(&item.id).or_else(|| {
            st.items.values().find(|i| {
                i.number == item.number && i.repository.eq_ignore_ascii_case(&item.repository)
            })
        });
        found
            .map(|i| st.snapshot(i))
            .ok_or_else(|| SyncError::ItemNotFound(format!("{}#{}", item.repository, item.number)))
    }

    fn find_placement(&self, content_id: &str) -> Result<Option<BoardPlacement>> {
        let st = self.state.borrow();
        Ok(st.placements.get(content_id).map(|p| BoardPlacement {
            assignees: st.assignees.get(content_id).cloned().unwrap_or_default(),
            ..p.clone()
        }))
    }

    fn add_to_board(&self, content_id: &str) -> Result<String> {
        let mut st = self.state.borrow_mut();
        if let Some(p) = st.placements.get(content_id) {
            return Ok(p.project_item_id.clone());
        }
        let id = project_item_id(content_id);
        st.placements.insert(
            content_id.to_string(),
            BoardPlacement {
                project_item_id: id.clone(),
                ..Default::default()
            },
        );
        Ok(id)
    }

    fn read_field(&self, project_item_id: &str, field: BoardField) -> Result<Option<String>> {
        let mut st = self.state.borrow_mut();
        st.field_reads += 1;
        let key = (project_item_id.to_string(), field);
        if let Some((value, left)) = st.stale.get_mut(&key) {
            let value = value.clone();
            *left -= 1;
            if *left == 0 {
                st.stale.remove(&key);
            }
            return Ok(value);
        }
        let content = st
            .content_for(project_item_id)
            .ok_or_else(|| SyncError::NotOnBoard {
                item: project_item_id.to_string(),
            })?
            .to_string();
        let placement = &st.placements[&content];
        Ok(match field {
            BoardField::Column => placement.column.clone(),
            BoardField::Sprint => placement.sprint_id.clone(),
        })
    }

    fn read_assignees(&self, content_id: &str) -> Result<Vec<String>> {
        Ok(self.read_assignees_now(content_id))
    }

    fn status_field(&self, name: &str) -> Result<StatusField> {
        self.state
            .borrow()
            .status
            .clone()
            .ok_or_else(|| SyncError::FieldNotFound(name.to_string()))
    }

    fn sprint_field(&self, name: &str) -> Result<SprintField> {
        self.state
            .borrow()
            .sprint
            .clone()
            .ok_or_else(|| SyncError::FieldNotFound(name.to_string()))
    }

    fn execute_batch(&self, mutations: &[FieldMutation]) -> Result<Vec<MutationResult>> {
        let mut st = self.state.borrow_mut();
        st.batch_requests += 1;
        if let Some(err) = st.fail_next_batch.take() {
            return Err(err);
        }
        let mut results = Vec::with_capacity(mutations.len());
        for m in mutations {
            match st.apply(m) {
                Ok(()) => {
                    st.executed.push(m.clone());
                    results.push(MutationResult::ok(&m.alias));
                }
                Err(e) => results.push(MutationResult::failed(&m.alias, e)),
            }
        }
        Ok(results)
    }

    fn rate_limit_status(&self) -> Result<RateLimitStatus> {
        Ok(self.state.borrow().rate_limit.clone().unwrap_or(RateLimitStatus {
            remaining: 5000,
            limit: 5000,
            reset_at: self.now.unwrap_or_else(Utc::now),
        }))
    }
}
