//! `BoardApi` over the GitHub GraphQL API (Projects v2).

pub mod event;
mod queries;

use crate::api::{
    BoardApi, FieldMutation, MutationOp, MutationResult, RateLimitStatus, SnapshotFilter,
    SprintField,
};
use crate::config::{OwnerType, ProjectConfig};
use crate::error::{Result, SyncError};
use crate::sprint::Iteration;
use crate::types::{
    BoardField, BoardPlacement, ColumnOption, ItemKind, ItemState, StatusField, WorkItem,
    WorkItemRef,
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub const GITHUB_GRAPHQL_URL: &str = "https://api.github.com/graphql";

/// Search pages fetched per query before giving up on the rest.
const MAX_SEARCH_PAGES: usize = 10;

const USER_AGENT: &str = concat!("projsync/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    path: Vec<Value>,
}

impl GraphQlError {
    fn alias(&self) -> Option<&str> {
        self.path.first().and_then(Value::as_str)
    }

    fn is_rate_limited(&self) -> bool {
        self.kind.as_deref() == Some("RATE_LIMITED")
    }
}

#[derive(Debug, Deserialize)]
struct Login {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Repo {
    name_with_owner: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkedRef {
    id: String,
    number: u64,
    repository: Repo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemNode {
    #[serde(rename = "__typename")]
    typename: String,
    id: String,
    number: u64,
    state: String,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    author: Option<Login>,
    repository: Repo,
    #[serde(default)]
    assignees: Option<Nodes<Login>>,
    #[serde(default)]
    closing_issues_references: Option<Nodes<LinkedRef>>,
}

impl ItemNode {
    fn into_item(self) -> Result<WorkItem> {
        let kind = match self.typename.as_str() {
            "PullRequest" => ItemKind::PullRequest,
            "Issue" => ItemKind::Issue,
            other => return Err(SyncError::Api(format!("unexpected node type '{other}'"))),
        };
        let state: ItemState = self
            .state
            .parse()
            .map_err(|_| SyncError::Api(format!("unexpected item state '{}'", self.state)))?;
        Ok(WorkItem {
            kind,
            id: self.id,
            number: self.number,
            repository: self.repository.name_with_owner,
            // Deleted accounts come back as a null author.
            author: self.author.map(|a| a.login).unwrap_or_else(|| "ghost".to_string()),
            assignees: self
                .assignees
                .map(|a| a.nodes.into_iter().map(|l| l.login).collect())
                .unwrap_or_default(),
            state,
            linked_issues: self
                .closing_issues_references
                .map(|r| {
                    r.nodes
                        .into_iter()
                        .map(|l| WorkItemRef {
                            id: l.id,
                            repository: l.repository.name_with_owner,
                            number: l.number,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            closed_at: self.closed_at,
            merged_at: self.merged_at,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IterationNode {
    id: String,
    title: String,
    start_date: NaiveDate,
    duration: u32,
}

impl From<IterationNode> for Iteration {
    fn from(n: IterationNode) -> Self {
        Iteration {
            id: n.id,
            title: n.title,
            start_date: n.start_date,
            duration_days: n.duration,
        }
    }
}

// ---------------------------------------------------------------------------
// GitHubBoard
// ---------------------------------------------------------------------------

pub struct GitHubBoard {
    http: Client,
    endpoint: String,
    token: String,
    project: ProjectConfig,
    project_id: RefCell<Option<String>>,
    user_ids: RefCell<HashMap<String, String>>,
}

impl GitHubBoard {
    pub fn new(token: impl Into<String>, project: &ProjectConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            endpoint: GITHUB_GRAPHQL_URL.to_string(),
            token: token.into(),
            project: project.clone(),
            project_id: RefCell::new(project.id.clone()),
            user_ids: RefCell::new(HashMap::new()),
        })
    }

    /// Build from `GITHUB_TOKEN` (or `GH_TOKEN`).
    pub fn from_env(project: &ProjectConfig) -> Result<Self> {
        let token = std::env::var("GITHUB_TOKEN")
            .or_else(|_| std::env::var("GH_TOKEN"))
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| SyncError::Unauthorized("GITHUB_TOKEN is not set".to_string()))?;
        Self::new(token, project)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn post(&self, query: &str, variables: Value) -> Result<GraphQlResponse> {
        let body = json!({ "query": query, "variables": variables });
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&body)
            .send()?;
        let status = resp.status();
        let remaining = header_u64(&resp, "x-ratelimit-remaining");
        let reset = header_u64(&resp, "x-ratelimit-reset");
        let text = resp.text()?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(SyncError::Unauthorized(snippet(&text)));
        }
        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            if text.to_ascii_lowercase().contains("secondary rate limit") {
                return Err(SyncError::SecondaryRateLimit(snippet(&text)));
            }
            if remaining == Some(0) {
                return Err(SyncError::RateLimitExhausted {
                    remaining: 0,
                    reset_at: reset
                        .and_then(|s| DateTime::<Utc>::from_timestamp(s as i64, 0))
                        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                        .unwrap_or_else(|| "unknown".to_string()),
                });
            }
        }
        if !status.is_success() {
            return Err(SyncError::Api(format!("HTTP {status}: {}", snippet(&text))));
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Run a query and return its `data`, failing on any reported error.
    fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        let resp = self.post(query, variables)?;
        fail_on_errors(&resp.errors)?;
        resp.data
            .ok_or_else(|| SyncError::Api("response carried no data".to_string()))
    }

    fn project_id(&self) -> Result<String> {
        if let Some(id) = self.project_id.borrow().as_ref() {
            return Ok(id.clone());
        }
        let query = match self.project.owner_type {
            OwnerType::Organization => queries::ORG_PROJECT,
            OwnerType::User => queries::USER_PROJECT,
        };
        let data = self.graphql(
            query,
            json!({ "owner": self.project.owner, "number": self.project.number }),
        )?;
        let id = data
            .pointer("/owner/projectV2/id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SyncError::InvalidConfig(format!(
                    "project {}/{} not found or not visible to this token",
                    self.project.owner, self.project.number
                ))
            })?
            .to_string();
        tracing::debug!(project = %id, "resolved project id");
        *self.project_id.borrow_mut() = Some(id.clone());
        Ok(id)
    }

    fn user_id(&self, login: &str) -> Result<String> {
        let key = login.to_ascii_lowercase();
        if let Some(id) = self.user_ids.borrow().get(&key) {
            return Ok(id.clone());
        }
        let data = self.graphql(queries::USER_ID, json!({ "login": login }))?;
        let id = data
            .pointer("/user/id")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Api(format!("unknown user '{login}'")))?
            .to_string();
        self.user_ids.borrow_mut().insert(key, id.clone());
        Ok(id)
    }

    /// Search strings for a snapshot filter, one per widening criterion.
    fn search_queries(&self, filter: &SnapshotFilter) -> Vec<String> {
        let mut base = Vec::new();
        match filter.kinds.as_slice() {
            [ItemKind::PullRequest] => base.push("is:pr".to_string()),
            [ItemKind::Issue] => base.push("is:issue".to_string()),
            _ => {}
        }
        if let Some(since) = filter.updated_since {
            base.push(format!(
                "updated:>={}",
                since.to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
        }
        let base = base.join(" ");

        let mut scopes = Vec::new();
        if let Some(a) = &filter.author {
            scopes.push(format!("author:{a}"));
        }
        if let Some(a) = &filter.assignee {
            scopes.push(format!("assignee:{a}"));
        }
        for repo in &filter.repositories {
            scopes.push(format!("repo:{repo}"));
        }
        if scopes.is_empty() {
            let owner = match self.project.owner_type {
                OwnerType::Organization => "org",
                OwnerType::User => "user",
            };
            scopes.push(format!("{owner}:{}", self.project.owner));
        }
        scopes
            .into_iter()
            .map(|s| format!("{s} {base}").trim().to_string())
            .collect()
    }

    fn search(&self, q: &str) -> Result<Vec<WorkItem>> {
        let query = queries::search();
        let mut items = Vec::new();
        let mut after: Option<String> = None;
        for _ in 0..MAX_SEARCH_PAGES {
            let data = self.graphql(&query, json!({ "q": q, "after": after }))?;
            let search = &data["search"];
            let nodes = search["nodes"].as_array().cloned().unwrap_or_default();
            for node in nodes {
                // Search can surface types this query does not select.
                if node.get("id").is_none() {
                    continue;
                }
                let node: ItemNode = serde_json::from_value(node)?;
                items.push(node.into_item()?);
            }
            let has_next = search
                .pointer("/pageInfo/hasNextPage")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !has_next {
                return Ok(items);
            }
            after = search
                .pointer("/pageInfo/endCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        tracing::warn!(query = q, pages = MAX_SEARCH_PAGES, "search truncated");
        Ok(items)
    }

    /// One aliased field of the batch document, or `None` for a no-op.
    fn mutation_field(&self, project_id: &str, m: &FieldMutation) -> Result<Option<String>> {
        let s = gql_string;
        let field = match &m.op {
            MutationOp::SetColumn { field_id, option_id } => format!(
                "updateProjectV2ItemFieldValue(input: {{projectId: {}, itemId: {}, fieldId: {}, value: {{singleSelectOptionId: {}}}}}) {{ clientMutationId }}",
                s(project_id), s(&m.target_id), s(field_id), s(option_id)
            ),
            MutationOp::SetIteration { field_id, iteration_id } => format!(
                "updateProjectV2ItemFieldValue(input: {{projectId: {}, itemId: {}, fieldId: {}, value: {{iterationId: {}}}}}) {{ clientMutationId }}",
                s(project_id), s(&m.target_id), s(field_id), s(iteration_id)
            ),
            MutationOp::ClearField { field_id } => format!(
                "clearProjectV2ItemFieldValue(input: {{projectId: {}, itemId: {}, fieldId: {}}}) {{ clientMutationId }}",
                s(project_id), s(&m.target_id), s(field_id)
            ),
            MutationOp::AddAssignees { logins } | MutationOp::RemoveAssignees { logins } => {
                if logins.is_empty() {
                    return Ok(None);
                }
                let ids = logins
                    .iter()
                    .map(|l| self.user_id(l).map(|id| s(&id)))
                    .collect::<Result<Vec<_>>>()?;
                let name = match m.op {
                    MutationOp::AddAssignees { .. } => "addAssigneesToAssignable",
                    _ => "removeAssigneesFromAssignable",
                };
                format!(
                    "{name}(input: {{assignableId: {}, assigneeIds: [{}]}}) {{ clientMutationId }}",
                    s(&m.target_id),
                    ids.join(", ")
                )
            }
        };
        Ok(Some(format!("  {}: {field}", m.alias)))
    }
}

impl BoardApi for GitHubBoard {
    fn fetch_snapshot(&self, filter: &SnapshotFilter) -> Result<Vec<WorkItem>> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for q in self.search_queries(filter) {
            tracing::debug!(query = %q, "searching");
            for item in self.search(&q)? {
                if filter.admits(&item) && seen.insert(item.id.clone()) {
                    items.push(item);
                }
            }
        }
        tracing::info!(items = items.len(), "snapshot fetched");
        Ok(items)
    }

    fn fetch_item(&self, item: &WorkItemRef) -> Result<WorkItem> {
        let label = format!("{}#{}", item.repository, item.number);
        let node = if item.id.is_empty() {
            let (owner, name) = item
                .repository
                .split_once('/')
                .ok_or_else(|| SyncError::ItemNotFound(label.clone()))?;
            let data = self.graphql(
                &queries::repository_item(),
                json!({ "owner": owner, "name": name, "number": item.number }),
            )?;
            data.pointer("/repository/issueOrPullRequest").cloned()
        } else {
            let data = self.graphql(&queries::node_item(), json!({ "id": item.id }))?;
            data.get("node").cloned()
        };
        match node {
            Some(node) if !node.is_null() => serde_json::from_value::<ItemNode>(node)?.into_item(),
            _ => Err(SyncError::ItemNotFound(label)),
        }
    }

    fn find_placement(&self, content_id: &str) -> Result<Option<BoardPlacement>> {
        let project_id = self.project_id()?;
        let data = self.graphql(queries::PROJECT_ITEMS, json!({ "id": content_id }))?;
        let node = &data["node"];
        if node.is_null() {
            return Err(SyncError::ItemNotFound(content_id.to_string()));
        }
        let assignees: Vec<String> = node
            .pointer("/assignees/nodes")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|n| n["login"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let items = node
            .pointer("/projectItems/nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let Some(pi) = items
            .iter()
            .find(|pi| pi.pointer("/project/id").and_then(Value::as_str) == Some(project_id.as_str()))
        else {
            return Ok(None);
        };

        let mut placement = BoardPlacement {
            project_item_id: pi["id"].as_str().unwrap_or_default().to_string(),
            column: None,
            sprint_id: None,
            assignees,
        };
        for value in pi
            .pointer("/fieldValues/nodes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let field = value.pointer("/field/name").and_then(Value::as_str);
            if field == Some(self.project.status_field.as_str()) {
                placement.column = value["name"].as_str().map(str::to_string);
            } else if field == Some(self.project.sprint_field.as_str()) {
                placement.sprint_id = value["iterationId"].as_str().map(str::to_string);
            }
        }
        Ok(Some(placement))
    }

    fn add_to_board(&self, content_id: &str) -> Result<String> {
        let project_id = self.project_id()?;
        let data = self.graphql(
            queries::ADD_TO_PROJECT,
            json!({ "project": project_id, "content": content_id }),
        )?;
        data.pointer("/addProjectV2ItemById/item/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::Api(format!("adding {content_id} returned no project item")))
    }

    fn read_field(&self, project_item_id: &str, field: BoardField) -> Result<Option<String>> {
        let name = match field {
            BoardField::Column => &self.project.status_field,
            BoardField::Sprint => &self.project.sprint_field,
        };
        let data = self.graphql(
            queries::FIELD_VALUE,
            json!({ "id": project_item_id, "field": name }),
        )?;
        let node = &data["node"];
        if node.is_null() || node.get("id").is_none() {
            return Err(SyncError::NotOnBoard {
                item: project_item_id.to_string(),
            });
        }
        let value = &node["fieldValueByName"];
        let key = match field {
            BoardField::Column => "name",
            BoardField::Sprint => "iterationId",
        };
        Ok(value.get(key).and_then(Value::as_str).map(str::to_string))
    }

    fn read_assignees(&self, content_id: &str) -> Result<Vec<String>> {
        let data = self.graphql(queries::ASSIGNEES, json!({ "id": content_id }))?;
        let nodes = data
            .pointer("/node/assignees/nodes")
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::ItemNotFound(content_id.to_string()))?;
        Ok(nodes
            .iter()
            .filter_map(|n| n["login"].as_str().map(str::to_string))
            .collect())
    }

    fn status_field(&self, name: &str) -> Result<StatusField> {
        let project_id = self.project_id()?;
        let data = self.graphql(
            queries::STATUS_FIELD,
            json!({ "project": project_id, "field": name }),
        )?;
        let field = &data["node"]["field"];
        let Some(id) = field["id"].as_str() else {
            return Err(SyncError::FieldNotFound(name.to_string()));
        };
        let options: Vec<ColumnOption> = serde_json::from_value(field["options"].clone())?;
        Ok(StatusField {
            id: id.to_string(),
            options,
        })
    }

    fn sprint_field(&self, name: &str) -> Result<SprintField> {
        let project_id = self.project_id()?;
        let data = self.graphql(
            queries::SPRINT_FIELD,
            json!({ "project": project_id, "field": name }),
        )?;
        let field = &data["node"]["field"];
        let Some(id) = field["id"].as_str() else {
            return Err(SyncError::FieldNotFound(name.to_string()));
        };
        let iterations = |key: &str| -> Result<Vec<Iteration>> {
            let raw = field["configuration"][key].clone();
            if raw.is_null() {
                return Ok(Vec::new());
            }
            let nodes: Vec<IterationNode> = serde_json::from_value(raw)?;
            Ok(nodes.into_iter().map(Iteration::from).collect())
        };
        Ok(SprintField {
            id: id.to_string(),
            active: iterations("iterations")?,
            completed: iterations("completedIterations")?,
        })
    }

    fn execute_batch(&self, mutations: &[FieldMutation]) -> Result<Vec<MutationResult>> {
        if mutations.is_empty() {
            return Ok(Vec::new());
        }
        let project_id = self.project_id()?;

        let mut results: HashMap<String, MutationResult> = HashMap::new();
        let mut lines = Vec::new();
        let mut sent = Vec::new();
        for m in mutations {
            match self.mutation_field(&project_id, m) {
                Ok(Some(line)) => {
                    lines.push(line);
                    sent.push(m.alias.clone());
                }
                Ok(None) => {
                    results.insert(m.alias.clone(), MutationResult::ok(&m.alias));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    results.insert(m.alias.clone(), MutationResult::failed(&m.alias, e.to_string()));
                }
            }
        }

        if !lines.is_empty() {
            let document = format!("mutation Batch {{\n{}\n}}", lines.join("\n"));
            let resp = self.post(&document, json!({}))?;
            let (aliased, unaliased): (Vec<_>, Vec<_>) = resp
                .errors
                .into_iter()
                .partition(|e| e.alias().is_some_and(|a| sent.iter().any(|s| s == a)));
            fail_on_errors(&unaliased)?;
            let data = resp.data.unwrap_or(Value::Null);
            for alias in &sent {
                let result = if let Some(err) = aliased.iter().find(|e| e.alias() == Some(alias.as_str())) {
                    MutationResult::failed(alias, &err.message)
                } else if data.get(alias).map_or(true, Value::is_null) {
                    MutationResult::failed(alias, "no result returned")
                } else {
                    MutationResult::ok(alias)
                };
                results.insert(alias.clone(), result);
            }
        }

        Ok(mutations
            .iter()
            .filter_map(|m| results.remove(&m.alias))
            .collect())
    }

    fn rate_limit_status(&self) -> Result<RateLimitStatus> {
        let data = self.graphql(queries::RATE_LIMIT, json!({}))?;
        let rl = &data["rateLimit"];
        let reset_at = rl["resetAt"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| SyncError::Api("rate limit response missing resetAt".to_string()))?;
        Ok(RateLimitStatus {
            remaining: rl["remaining"].as_u64().unwrap_or(0) as u32,
            limit: rl["limit"].as_u64().unwrap_or(0) as u32,
            reset_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fail_on_errors(errors: &[GraphQlError]) -> Result<()> {
    let Some(first) = errors.first() else {
        return Ok(());
    };
    if errors.iter().any(GraphQlError::is_rate_limited) {
        return Err(SyncError::RateLimitExhausted {
            remaining: 0,
            reset_at: "unknown".to_string(),
        });
    }
    if errors.len() == 1 {
        return Err(SyncError::Api(first.message.clone()));
    }
    let joined: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
    Err(SyncError::Api(joined.join("; ")))
}

/// A GraphQL string literal; JSON escaping is a valid subset.
fn gql_string(v: &str) -> String {
    Value::String(v.to_string()).to_string()
}

fn header_u64(resp: &reqwest::blocking::Response, name: &str) -> Option<u64> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(200) {
        Some((i, _)) => format!("{}...", &trimmed[..i]),
        None => trimmed.to_string(),
    }
}
