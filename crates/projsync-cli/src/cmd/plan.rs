use crate::cmd::run::print_report;
use crate::output::{print_json, print_table};
use crate::root::load_config;
use anyhow::Context;
use chrono::Utc;
use projsync_core::api::FixedClock;
use projsync_core::memory::{BoardFixture, MemoryBoard};
use projsync_core::reconciler::{Reconciler, Seed};
use projsync_core::transition::column_label;
use std::path::Path;

/// Reconcile a fixture board. Without `apply` this is a dry run; with it the
/// in-memory board is mutated and its final placements are printed.
pub fn run(config: Option<&Path>, fixture: &Path, apply: bool, json: bool) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let fixture = BoardFixture::load(fixture)
        .with_context(|| format!("loading fixture {}", fixture.display()))?;
    let ids: Vec<(String, String)> = fixture
        .items
        .iter()
        .map(|i| (i.id.clone(), i.label()))
        .collect();

    let clock = FixedClock::new(fixture.now.unwrap_or_else(Utc::now));
    let board = MemoryBoard::from_fixture(fixture);
    let reconciler = Reconciler::new(&board, &clock, &config).dry_run(!apply);
    let report = reconciler
        .run(Seed::Snapshot(reconciler.default_filter()))
        .context("reconciliation aborted")?;

    if !apply {
        return print_report(&report, json);
    }

    let placements: Vec<_> = ids
        .iter()
        .map(|(id, label)| (label, board.placement(id), board.read_assignees_now(id)))
        .collect();
    if json {
        let board_state: Vec<_> = placements
            .iter()
            .map(|(label, p, assignees)| {
                serde_json::json!({
                    "item": label,
                    "on_board": p.is_some(),
                    "column": p.as_ref().and_then(|p| p.column.clone()),
                    "sprint": p.as_ref().and_then(|p| p.sprint_id.clone()),
                    "assignees": assignees,
                })
            })
            .collect();
        return print_json(&serde_json::json!({ "report": report, "board": board_state }));
    }

    print_report(&report, false)?;
    println!();
    let rows = placements
        .into_iter()
        .map(|(label, p, assignees)| match p {
            Some(p) => vec![
                label.clone(),
                column_label(p.column.as_deref()).to_string(),
                p.sprint_id.unwrap_or_else(|| "-".to_string()),
                assignees.join(", "),
            ],
            None => vec![label.clone(), "(not on board)".into(), "-".into(), assignees.join(", ")],
        })
        .collect();
    print_table(&["ITEM", "COLUMN", "SPRINT", "ASSIGNEES"], rows);
    Ok(())
}
