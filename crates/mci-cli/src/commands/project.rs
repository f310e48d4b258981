//! `mci validate` / `mci evaluate` - project file tools.

use std::path::Path;

use anyhow::{bail, Context, Result};
use mci_core::expansion::Expansions;
use mci_core::model::ProjectConfig;
use mci_core::settings::Settings;

/// Parse a project file and report what it defines.
pub fn validate(path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let project: ProjectConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    if project.id.is_empty() {
        bail!("project file has no id");
    }
    println!(
        "{} is valid: {} task(s), {} pre command(s), {} post command(s)",
        path.display(),
        project.tasks.len(),
        project.pre.len(),
        project.post.len(),
    );
    Ok(())
}

/// Expand a project file with the configured and supplied expansions and
/// print the result.
pub fn evaluate(settings: &Settings, path: &Path, vars: &[String]) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let mut expansions = Expansions::new();
    expansions.update(settings.expansions.clone());
    let parsed: ProjectConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    expansions.update(parsed.expansions.clone());
    for pair in vars {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("--var '{pair}' is not name=value");
        };
        expansions.put(name, value);
    }

    let expanded = expansions
        .expand(&raw)
        .context("expanding project file")?;
    // confirm the expansion still parses before printing it
    let _: ProjectConfig =
        serde_yaml::from_str(&expanded).context("expanded project no longer parses")?;
    print!("{expanded}");
    Ok(())
}
