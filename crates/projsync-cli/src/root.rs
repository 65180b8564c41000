use projsync_core::config::{Config, CONFIG_FILE};
use std::path::{Path, PathBuf};

/// Resolve the config file.
///
/// Priority:
/// 1. `--config` flag / `PROJSYNC_CONFIG` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.projsync.yaml`
pub fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    let cwd = std::env::current_dir()?;
    Config::discover(&cwd).ok_or_else(|| {
        anyhow::anyhow!(
            "no {CONFIG_FILE} found in {} or any parent (pass --config)",
            cwd.display()
        )
    })
}

pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    use anyhow::Context;
    let path = resolve_config(explicit)?;
    Config::load(&path).with_context(|| format!("loading {}", path.display()))
}
