use crate::output::{print_json, print_table};
use crate::root::{load_config, resolve_config};
use clap::Subcommand;
use projsync_core::config::WarnLevel;
use projsync_core::rules::RuleCategory;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the config for common mistakes
    Validate,

    /// Show the resolved config file and its rules
    Show,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(config: Option<&Path>, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Validate => validate(config, json),
        ConfigSubcommand::Show => show(config, json),
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(config: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(config: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let path = resolve_config(config)?;
    let config = load_config(Some(&path))?;

    if json {
        return print_json(&serde_json::json!({
            "path": path,
            "config": config,
        }));
    }

    println!("Config:   {}", path.display());
    println!(
        "Project:  {}/{} (status field '{}', sprint field '{}')",
        config.project.owner,
        config.project.number,
        config.project.status_field,
        config.project.sprint_field
    );
    println!("Monitors: {}", config.monitored.user);
    for repo in &config.monitored.repositories {
        println!("          {repo}");
    }
    println!();

    let rows: Vec<Vec<String>> = RuleCategory::all()
        .iter()
        .flat_map(|&c| {
            config.rules.for_category(c).iter().map(move |r| {
                vec![
                    c.to_string(),
                    r.name.clone(),
                    r.action
                        .to_vec()
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                ]
            })
        })
        .collect();
    if rows.is_empty() {
        println!("No rules configured.");
    } else {
        print_table(&["CATEGORY", "RULE", "ACTIONS"], rows);
    }
    Ok(())
}
