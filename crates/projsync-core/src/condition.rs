//! Rule conditions.
//!
//! Conditions are a closed set of tagged variants. Config files may spell them
//! either structurally (`{type: column_is, column: Done}`) or with the short
//! text form (`item.column == 'Done'`); the text form is parsed once, at load
//! time, into the same variants. Text that does not parse becomes
//! [`Condition::Unknown`], which never matches.

use crate::config::Monitored;
use crate::types::{BoardPlacement, ItemState, WorkItem};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// EvalContext
// ---------------------------------------------------------------------------

pub struct EvalContext<'a> {
    pub item: &'a WorkItem,
    /// `None` when the item is not on the board.
    pub placement: Option<&'a BoardPlacement>,
    pub monitored: &'a Monitored,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        item: &'a WorkItem,
        placement: Option<&'a BoardPlacement>,
        monitored: &'a Monitored,
    ) -> Self {
        Self {
            item,
            placement,
            monitored,
        }
    }

    fn column(&self) -> Option<&str> {
        self.placement.and_then(|p| p.column.as_deref())
    }

    fn sprint(&self) -> Option<&str> {
        self.placement.and_then(|p| p.sprint_id.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Always,
    AuthorIsMonitored,
    AuthorIn {
        users: Vec<String>,
    },
    AssignedToMonitored,
    AssigneeIn {
        users: Vec<String>,
    },
    AssigneesIncludeAuthor,
    RepositoryMonitored,
    RepositoryIn {
        repositories: Vec<String>,
    },
    StateIs {
        state: ItemState,
    },
    OnBoard,
    /// `column: null` matches items on the board with no column set.
    ColumnIs {
        #[serde(default)]
        column: Option<String>,
    },
    ColumnIn {
        columns: Vec<String>,
    },
    /// `sprint: null` matches items with no iteration assigned.
    SprintIs {
        #[serde(default)]
        sprint: Option<String>,
    },
    SprintAssigned,
    HasLinkedIssues,
    AnyOf {
        conditions: Vec<Condition>,
    },
    AllOf {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
    Unknown {
        text: String,
    },
}

fn login_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn contains_login(list: &[String], login: &str) -> bool {
    list.iter().any(|l| login_eq(l, login))
}

impl Condition {
    /// Evaluate against a snapshot. Pure; unknown conditions are `false`, and
    /// so is any negation wrapping one.
    pub fn matches(&self, ctx: &EvalContext) -> bool {
        match self {
            Condition::Always => true,
            Condition::AuthorIsMonitored => login_eq(&ctx.item.author, &ctx.monitored.user),
            Condition::AuthorIn { users } => contains_login(users, &ctx.item.author),
            Condition::AssignedToMonitored => {
                contains_login(&ctx.item.assignees, &ctx.monitored.user)
            }
            Condition::AssigneeIn { users } => {
                ctx.item.assignees.iter().any(|a| contains_login(users, a))
            }
            Condition::AssigneesIncludeAuthor => {
                contains_login(&ctx.item.assignees, &ctx.item.author)
            }
            Condition::RepositoryMonitored => {
                contains_login(&ctx.monitored.repositories, &ctx.item.repository)
            }
            Condition::RepositoryIn { repositories } => {
                contains_login(repositories, &ctx.item.repository)
            }
            Condition::StateIs { state } => ctx.item.state == *state,
            Condition::OnBoard => ctx.placement.is_some(),
            Condition::ColumnIs { column } => {
                ctx.placement.is_some() && ctx.column() == column.as_deref()
            }
            Condition::ColumnIn { columns } => ctx
                .column()
                .map(|c| columns.iter().any(|x| x == c))
                .unwrap_or(false),
            Condition::SprintIs { sprint } => {
                ctx.placement.is_some() && ctx.sprint() == sprint.as_deref()
            }
            Condition::SprintAssigned => ctx.sprint().is_some(),
            Condition::HasLinkedIssues => !ctx.item.linked_issues.is_empty(),
            Condition::AnyOf { conditions } => conditions.iter().any(|c| c.matches(ctx)),
            Condition::AllOf { conditions } => conditions.iter().all(|c| c.matches(ctx)),
            Condition::Not { condition } => {
                let unknown = condition.unknown_leaves();
                if !unknown.is_empty() {
                    tracing::warn!(condition = %unknown.join(", "), item = %ctx.item.label(), "negated unknown condition never matches");
                    return false;
                }
                !condition.matches(ctx)
            }
            Condition::Unknown { text } => {
                tracing::warn!(condition = %text, item = %ctx.item.label(), "unknown condition never matches");
                false
            }
        }
    }

    /// Every `Unknown` leaf in this tree, for config validation.
    pub fn unknown_leaves(&self) -> Vec<&str> {
        match self {
            Condition::Unknown { text } => vec![text.as_str()],
            Condition::AnyOf { conditions } | Condition::AllOf { conditions } => {
                conditions.iter().flat_map(|c| c.unknown_leaves()).collect()
            }
            Condition::Not { condition } => condition.unknown_leaves(),
            _ => Vec::new(),
        }
    }

    /// Parse the short text form. Never fails: unparseable input yields
    /// `Condition::Unknown` carrying the normalised text.
    pub fn parse(text: &str) -> Condition {
        let normalized = normalize(text);
        parse_disjunction(&normalized).unwrap_or(Condition::Unknown { text: normalized })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Always => f.write_str("always"),
            Condition::AuthorIsMonitored => f.write_str("item.author == monitored.user"),
            Condition::AuthorIn { users } => write!(f, "item.author in [{}]", users.join(", ")),
            Condition::AssignedToMonitored => f.write_str("item.assignees includes monitored.user"),
            Condition::AssigneeIn { users } => {
                write!(f, "item.assignees includes any of [{}]", users.join(", "))
            }
            Condition::AssigneesIncludeAuthor => f.write_str("item.assignees includes item.author"),
            Condition::RepositoryMonitored => f.write_str("monitored.repos includes item.repository"),
            Condition::RepositoryIn { repositories } => {
                write!(f, "item.repository in [{}]", repositories.join(", "))
            }
            Condition::StateIs { state } => write!(f, "item.state == {state}"),
            Condition::OnBoard => f.write_str("item.inProject"),
            Condition::ColumnIs { column } => {
                write!(f, "item.column == {}", column.as_deref().unwrap_or("None"))
            }
            Condition::ColumnIn { columns } => write!(f, "item.column in [{}]", columns.join(", ")),
            Condition::SprintIs { sprint } => {
                write!(f, "item.sprint == {}", sprint.as_deref().unwrap_or("None"))
            }
            Condition::SprintAssigned => f.write_str("item.sprint != None"),
            Condition::HasLinkedIssues => f.write_str("item.hasLinkedIssues"),
            Condition::AnyOf { conditions } => write_joined(f, conditions, " || "),
            Condition::AllOf { conditions } => write_joined(f, conditions, " && "),
            Condition::Not { condition } => write!(f, "!({condition})"),
            Condition::Unknown { text } => write!(f, "<unknown: {text}>"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, conditions: &[Condition], sep: &str) -> fmt::Result {
    let parts: Vec<String> = conditions.iter().map(|c| format!("({c})")).collect();
    f.write_str(&parts.join(sep))
}

// ---------------------------------------------------------------------------
// ConditionSpec (config-facing)
// ---------------------------------------------------------------------------

/// How a condition is written in config: short text or structured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    Text(String),
    Structured(Condition),
}

impl ConditionSpec {
    pub fn compile(&self) -> Condition {
        match self {
            ConditionSpec::Text(text) => Condition::parse(text),
            ConditionSpec::Structured(c) => c.clone(),
        }
    }
}

impl From<&str> for ConditionSpec {
    fn from(s: &str) -> Self {
        ConditionSpec::Text(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Text form parser
// ---------------------------------------------------------------------------

fn normalize(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    strip_outer_parens(&collapsed).to_string()
}

fn strip_outer_parens(s: &str) -> &str {
    let mut s = s.trim();
    while s.starts_with('(') && s.ends_with(')') && balanced(&s[1..s.len() - 1]) {
        s = s[1..s.len() - 1].trim();
    }
    s
}

fn balanced(s: &str) -> bool {
    let mut depth = 0i32;
    for ch in s.chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Split on `sep` only where parentheses are balanced.
fn split_top_level<'a>(s: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && s.is_char_boundary(i) && s[i..].starts_with(sep) {
            parts.push(s[start..i].trim());
            i += sep.len();
            start = i;
            continue;
        }
        i += 1;
    }
    parts.push(s[start..].trim());
    parts
}

fn parse_disjunction(s: &str) -> Option<Condition> {
    let parts = split_top_level(s, "||");
    if parts.len() == 1 {
        return parse_conjunction(s);
    }
    let conditions = parts
        .into_iter()
        .map(parse_conjunction)
        .collect::<Option<Vec<_>>>()?;
    Some(Condition::AnyOf { conditions })
}

fn parse_conjunction(s: &str) -> Option<Condition> {
    let parts = split_top_level(s, "&&");
    if parts.len() == 1 {
        return parse_unary(s);
    }
    let conditions = parts
        .into_iter()
        .map(parse_unary)
        .collect::<Option<Vec<_>>>()?;
    Some(Condition::AllOf { conditions })
}

fn parse_unary(s: &str) -> Option<Condition> {
    let s = strip_outer_parens(s);
    if let Some(rest) = s.strip_prefix('!') {
        if !rest.starts_with('=') {
            let inner = parse_unary(rest)?;
            return Some(Condition::Not {
                condition: Box::new(inner),
            });
        }
    }
    if s.contains("||") || s.contains("&&") {
        return parse_disjunction(s);
    }
    parse_atom(s)
}

static COMPARISON_RE: OnceLock<Regex> = OnceLock::new();

fn comparison_re() -> &'static Regex {
    COMPARISON_RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_.]*)\s*(==|!=|\bin\b|\bincludes\b)\s*(.+)$").unwrap()
    })
}

fn parse_atom(s: &str) -> Option<Condition> {
    match s {
        "true" | "always" => return Some(Condition::Always),
        "item.inProject" | "item.onBoard" => return Some(Condition::OnBoard),
        "item.hasLinkedIssues" | "item.linkedIssues" => return Some(Condition::HasLinkedIssues),
        _ => {}
    }

    let caps = comparison_re().captures(s)?;
    let lhs = caps.get(1)?.as_str();
    let op = caps.get(2)?.as_str();
    let rhs = caps.get(3)?.as_str().trim();

    let positive = match (lhs, op) {
        ("item.author", "==") => author_eq(rhs),
        ("monitored.user", "==") if rhs == "item.author" => Some(Condition::AuthorIsMonitored),
        ("item.author", "in") => Some(Condition::AuthorIn {
            users: parse_list(rhs)?,
        }),
        ("item.assignees", "includes") => match rhs {
            "monitored.user" => Some(Condition::AssignedToMonitored),
            "item.author" => Some(Condition::AssigneesIncludeAuthor),
            literal => Some(Condition::AssigneeIn {
                users: vec![parse_literal(literal)?],
            }),
        },
        ("monitored.repos", "includes") | ("monitored.repositories", "includes")
            if rhs == "item.repository" =>
        {
            Some(Condition::RepositoryMonitored)
        }
        ("item.repository", "in") => match rhs {
            "monitored.repos" | "monitored.repositories" => Some(Condition::RepositoryMonitored),
            list => Some(Condition::RepositoryIn {
                repositories: parse_list(list)?,
            }),
        },
        ("item.repository", "==") => Some(Condition::RepositoryIn {
            repositories: vec![parse_literal(rhs)?],
        }),
        ("item.state", "==") => Some(Condition::StateIs {
            state: parse_literal(rhs)?.parse().ok()?,
        }),
        ("item.column", "==") => Some(Condition::ColumnIs {
            column: parse_optional_literal(rhs)?,
        }),
        ("item.column", "in") => Some(Condition::ColumnIn {
            columns: parse_list(rhs)?,
        }),
        ("item.sprint", "==") => Some(Condition::SprintIs {
            sprint: parse_optional_literal(rhs)?,
        }),
        ("item.column", "!=") | ("item.sprint", "!=") | ("item.author", "!=")
        | ("item.state", "!=") | ("item.repository", "!=") => None,
        _ => return None,
    };

    if op != "!=" {
        return positive;
    }

    // `a != b` is `!(a == b)`, except the common "sprint is set" idiom.
    if lhs == "item.sprint" && is_none_literal(rhs) {
        return Some(Condition::SprintAssigned);
    }
    let equality = format!("{lhs} == {rhs}");
    let inner = parse_atom(&equality)?;
    Some(Condition::Not {
        condition: Box::new(inner),
    })
}

fn author_eq(rhs: &str) -> Option<Condition> {
    if rhs == "monitored.user" {
        return Some(Condition::AuthorIsMonitored);
    }
    Some(Condition::AuthorIn {
        users: vec![parse_literal(rhs)?],
    })
}

fn is_none_literal(s: &str) -> bool {
    matches!(s, "None" | "none" | "null")
}

fn parse_literal(s: &str) -> Option<String> {
    let s = s.trim();
    let unquoted = s
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|r| r.strip_suffix('"')))
        .unwrap_or(s);
    if unquoted.is_empty() {
        return None;
    }
    // bare words must be plain names, not references or expressions
    let bare = unquoted == s;
    if bare
        && (unquoted.contains(&['(', ')', '[', ']', ' '][..])
            || unquoted.starts_with("item.")
            || unquoted.starts_with("monitored."))
    {
        return None;
    }
    Some(unquoted.to_string())
}

fn parse_optional_literal(s: &str) -> Option<Option<String>> {
    if is_none_literal(s.trim()) {
        return Some(None);
    }
    parse_literal(s).map(Some)
}

fn parse_list(s: &str) -> Option<Vec<String>> {
    let inner = s.trim().strip_prefix('[')?.strip_suffix(']')?;
    let items = inner
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(parse_literal)
        .collect::<Option<Vec<_>>>()?;
    if items.is_empty() {
        return None;
    }
    Some(items)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
