//! GraphQL documents sent to the GitHub API.

/// Fields read for every issue or pull request.
const ITEM_FIELDS: &str = r#"
fragment ItemFields on Node {
  __typename
  ... on PullRequest {
    id number state closedAt mergedAt
    author { login }
    repository { nameWithOwner }
    assignees(first: 50) { nodes { login } }
    closingIssuesReferences(first: 20) { nodes { id number repository { nameWithOwner } } }
  }
  ... on Issue {
    id number state closedAt
    author { login }
    repository { nameWithOwner }
    assignees(first: 50) { nodes { login } }
  }
}
"#;

pub fn search() -> String {
    format!(
        r#"
query Search($q: String!, $after: String) {{
  search(query: $q, type: ISSUE, first: 50, after: $after) {{
    pageInfo {{ hasNextPage endCursor }}
    nodes {{ ...ItemFields }}
  }}
}}
{ITEM_FIELDS}"#
    )
}

pub fn node_item() -> String {
    format!(
        r#"
query Item($id: ID!) {{
  node(id: $id) {{ ...ItemFields }}
}}
{ITEM_FIELDS}"#
    )
}

pub fn repository_item() -> String {
    format!(
        r#"
query RepoItem($owner: String!, $name: String!, $number: Int!) {{
  repository(owner: $owner, name: $name) {{
    issueOrPullRequest(number: $number) {{ ...ItemFields }}
  }}
}}
{ITEM_FIELDS}"#
    )
}

pub const ORG_PROJECT: &str = r#"
query OrgProject($owner: String!, $number: Int!) {
  owner: organization(login: $owner) { projectV2(number: $number) { id } }
}
"#;

pub const USER_PROJECT: &str = r#"
query UserProject($owner: String!, $number: Int!) {
  owner: user(login: $owner) { projectV2(number: $number) { id } }
}
"#;

pub const PROJECT_ITEMS: &str = r#"
query Placement($id: ID!) {
  node(id: $id) {
    ... on Issue { ...Placement }
    ... on PullRequest { ...Placement }
  }
}
fragment Placement on Assignable {
  assignees(first: 50) { nodes { login } }
  ... on Issue { projectItems(first: 20) { nodes { ...ProjectItem } } }
  ... on PullRequest { projectItems(first: 20) { nodes { ...ProjectItem } } }
}
fragment ProjectItem on ProjectV2Item {
  id
  project { id }
  fieldValues(first: 30) {
    nodes {
      ... on ProjectV2ItemFieldSingleSelectValue { name field { ... on ProjectV2FieldCommon { name } } }
      ... on ProjectV2ItemFieldIterationValue { iterationId field { ... on ProjectV2FieldCommon { name } } }
    }
  }
}
"#;

pub const FIELD_VALUE: &str = r#"
query FieldValue($id: ID!, $field: String!) {
  node(id: $id) {
    ... on ProjectV2Item {
      id
      fieldValueByName(name: $field) {
        ... on ProjectV2ItemFieldSingleSelectValue { name }
        ... on ProjectV2ItemFieldIterationValue { iterationId }
      }
    }
  }
}
"#;

pub const ASSIGNEES: &str = r#"
query Assignees($id: ID!) {
  node(id: $id) {
    ... on Issue { assignees(first: 50) { nodes { login } } }
    ... on PullRequest { assignees(first: 50) { nodes { login } } }
  }
}
"#;

pub const STATUS_FIELD: &str = r#"
query StatusField($project: ID!, $field: String!) {
  node(id: $project) {
    ... on ProjectV2 {
      field(name: $field) {
        ... on ProjectV2SingleSelectField { id options { id name } }
      }
    }
  }
}
"#;

pub const SPRINT_FIELD: &str = r#"
query SprintField($project: ID!, $field: String!) {
  node(id: $project) {
    ... on ProjectV2 {
      field(name: $field) {
        ... on ProjectV2IterationField {
          id
          configuration {
            iterations { id title startDate duration }
            completedIterations { id title startDate duration }
          }
        }
      }
    }
  }
}
"#;

pub const ADD_TO_PROJECT: &str = r#"
mutation AddItem($project: ID!, $content: ID!) {
  addProjectV2ItemById(input: { projectId: $project, contentId: $content }) { item { id } }
}
"#;

pub const USER_ID: &str = r#"
query UserId($login: String!) { user(login: $login) { id } }
"#;

pub const RATE_LIMIT: &str = r#"
query RateLimit { rateLimit { remaining limit resetAt } }
"#;
