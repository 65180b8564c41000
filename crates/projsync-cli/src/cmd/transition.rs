use crate::output::print_json;
use crate::root::load_config;
use anyhow::Context;
use projsync_core::transition::{column_label, TransitionValidator};
use std::path::Path;

/// Check `from -> to` against the declared edges. Edge conditions need an
/// item to evaluate and are not checked here.
pub fn run(config: Option<&Path>, from: Option<&str>, to: &str, json: bool) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let table = config
        .transition_table()
        .context("building the transition table")?;
    let validator = TransitionValidator::new(table);
    let check = validator.validate(from, Some(to));

    if json {
        return print_json(&serde_json::json!({
            "from": from,
            "to": to,
            "check": check,
        }));
    }

    let arrow = format!("{} -> {}", column_label(from), to);
    if check.valid {
        println!("allowed: {arrow}");
    } else {
        println!("blocked: {arrow}");
        if let Some(reason) = &check.reason {
            println!("  {reason}");
        }
        if !check.allowed.is_empty() {
            println!("  allowed from '{}': {}", column_label(from), check.allowed.join(", "));
        }
    }
    Ok(())
}
