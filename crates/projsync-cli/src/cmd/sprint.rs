use crate::output::print_json;
use crate::root::load_config;
use anyhow::Context;
use chrono::{DateTime, Utc};
use projsync_core::api::BoardApi;
use projsync_core::context::RunContext;
use projsync_core::github::GitHubBoard;
use projsync_core::memory::MemoryBoard;
use std::path::{Path, PathBuf};

pub struct SprintArgs {
    pub column: Option<String>,
    pub current: Option<String>,
    pub completed_at: Option<String>,
    pub now: Option<String>,
    pub fixture: Option<PathBuf>,
}

fn parse_time(flag: &str, value: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("--{flag} '{value}' is not an RFC 3339 timestamp"))
}

pub fn run(config: Option<&Path>, args: SprintArgs, json: bool) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let completed_at = args
        .completed_at
        .as_deref()
        .map(|v| parse_time("completed-at", v))
        .transpose()?;

    let (board, fixture_now): (Box<dyn BoardApi>, Option<DateTime<Utc>>) = match &args.fixture {
        Some(path) => {
            let board = MemoryBoard::load(path)
                .with_context(|| format!("loading fixture {}", path.display()))?;
            let now = board.now();
            (Box::new(board) as Box<dyn BoardApi>, now)
        }
        None => (Box::new(GitHubBoard::from_env(&config.project)?) as Box<dyn BoardApi>, None),
    };
    let now = match args.now.as_deref() {
        Some(v) => parse_time("now", v)?,
        None => fixture_now.unwrap_or_else(Utc::now),
    };

    let mut ctx = RunContext::new(&config.project);
    let resolver = ctx
        .sprint_resolver(board.as_ref(), &config.sprint_columns)
        .context("loading iterations")?;
    let decision = resolver.resolve(
        args.column.as_deref(),
        args.current.as_deref(),
        now,
        completed_at,
    );

    if json {
        return print_json(&decision);
    }
    println!("{}: {}", decision.action, decision.reason);
    if let Some(target) = &decision.target_iteration_id {
        let title = resolver
            .iterations()
            .get(target)
            .map(|it| it.title.as_str())
            .unwrap_or("?");
        println!("  target: {title} ({target})");
    }
    Ok(())
}
