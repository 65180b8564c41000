use crate::output::{print_json, print_table};
use crate::root::load_config;
use anyhow::Context;
use projsync_core::api::{BoardApi, SystemClock};
use projsync_core::github::{event::load_event, GitHubBoard};
use projsync_core::processors::StageOutcome;
use projsync_core::reconciler::{Reconciler, RunReport, Seed};
use std::path::Path;

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub fn run(config: Option<&Path>, dry_run: bool, event: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let board = GitHubBoard::from_env(&config.project).context("connecting to GitHub")?;
    let clock = SystemClock;
    let reconciler = Reconciler::new(&board, &clock, &config).dry_run(dry_run);

    let seed = match event {
        Some(path) => {
            let item = load_event(path).with_context(|| format!("reading event {}", path.display()))?;
            // Payloads can lag the board and omit linked-issue ids; re-read.
            match board.fetch_item(&item.to_ref()) {
                Ok(fresh) => Seed::Event(fresh),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(item = %item.label(), error = %e, "using event payload as-is");
                    Seed::Event(item)
                }
            }
        }
        None => Seed::Snapshot(reconciler.default_filter()),
    };

    let report = reconciler.run(seed).context("reconciliation aborted")?;
    print_report(&report, json)
}

// ---------------------------------------------------------------------------
// Report rendering
// ---------------------------------------------------------------------------

pub fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(report);
    }

    if report.dry_run {
        println!("Dry run: nothing was written.\n");
    }

    let stages: Vec<Vec<String>> = report
        .stages
        .iter()
        .map(|s| {
            let status = match &s.outcome {
                StageOutcome::Completed => "completed".to_string(),
                StageOutcome::Skipped { reason } => format!("skipped ({reason})"),
            };
            vec![
                s.category.to_string(),
                status,
                s.decisions.len().to_string(),
                s.failures.len().to_string(),
            ]
        })
        .collect();
    print_table(&["STAGE", "STATUS", "DECISIONS", "FAILURES"], stages);

    let decisions: Vec<Vec<String>> = report
        .stages
        .iter()
        .flat_map(|s| s.decisions.iter())
        .map(|d| {
            vec![
                d.item.clone(),
                d.action.clone(),
                d.detail.clone(),
                if d.applied { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    if !decisions.is_empty() {
        println!();
        print_table(&["ITEM", "ACTION", "DETAIL", "APPLIED"], decisions);
    }

    let failures: Vec<Vec<String>> = report
        .stages
        .iter()
        .flat_map(|s| s.failures.iter().map(move |f| (s.category, f)))
        .map(|(c, f)| vec![c.to_string(), f.item.clone(), f.error.clone()])
        .collect();
    if !failures.is_empty() {
        println!();
        print_table(&["STAGE", "ITEM", "ERROR"], failures);
    }

    println!();
    if report.counters.is_empty() {
        println!("No counters recorded ({} items).", report.items);
    } else {
        let rows = report
            .counters
            .iter()
            .map(|(c, n)| vec![c.to_string(), n.to_string()])
            .collect();
        print_table(&["COUNTER", "COUNT"], rows);
    }
    Ok(())
}
