//! The expansions plugin: mutate the task's expansion map mid-pipeline.

use async_trait::async_trait;
use serde::Deserialize;

use super::{Command, CommandError, ExecContext, TaskConfig};

#[derive(Debug, Clone, Deserialize)]
struct UpdateEntry {
    /// Expansion name to set.
    key: String,

    /// New value; may itself reference expansions.
    #[serde(default)]
    value: String,

    /// Append to the existing value instead of replacing it.
    #[serde(default)]
    concat: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateParams {
    updates: Vec<UpdateEntry>,
}

/// `expansions.update`: apply a list of key/value updates.
pub struct ExpansionsUpdateCommand {
    params: UpdateParams,
}

impl ExpansionsUpdateCommand {
    /// Decode and validate parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if `updates` is missing or mistyped.
    pub fn parse(params: &serde_json::Value) -> Result<Box<dyn Command>, CommandError> {
        let params: UpdateParams = serde_json::from_value(params.clone()).map_err(|e| {
            CommandError::InvalidParams {
                command: "expansions.update".to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Box::new(Self { params }))
    }
}

#[async_trait]
impl Command for ExpansionsUpdateCommand {
    fn name(&self) -> &'static str {
        "update"
    }

    fn plugin(&self) -> &'static str {
        "expansions"
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        config: &mut TaskConfig,
    ) -> Result<(), CommandError> {
        for entry in &self.params.updates {
            // values resolve against the map as it stands, so earlier
            // updates are visible to later ones
            let value = config.expansions.expand(&entry.value)?;
            let value = if entry.concat {
                let existing = config.expansions.get(&entry.key).unwrap_or_default();
                format!("{existing}{value}")
            } else {
                value
            };
            config.expansions.put(entry.key.as_str(), value);
        }
        ctx.logger.execution(format!(
            "updated {} expansion(s)",
            self.params.updates.len()
        ));
        Ok(())
    }
}

/// `expansions.fetch_vars`: merge the project's server-side variables
/// into the live expansion map.
pub struct ExpansionsFetchVarsCommand;

impl ExpansionsFetchVarsCommand {
    /// Accepts and ignores any parameters.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn parse(_params: &serde_json::Value) -> Result<Box<dyn Command>, CommandError> {
        Ok(Box::new(Self))
    }
}

#[async_trait]
impl Command for ExpansionsFetchVarsCommand {
    fn name(&self) -> &'static str {
        "fetch_vars"
    }

    fn plugin(&self) -> &'static str {
        "expansions"
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        config: &mut TaskConfig,
    ) -> Result<(), CommandError> {
        let vars = ctx
            .comm
            .fetch_vars(&ctx.cancel)
            .await
            .map_err(|e| CommandError::Failed(format!("fetching vars: {e}")))?;
        let count = vars.vars.len();
        config.expansions.update(vars.vars);
        ctx.logger.execution(format!("fetched {count} project var(s)"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_requires_updates_list() {
        assert!(ExpansionsUpdateCommand::parse(&json!({})).is_err());
        assert!(ExpansionsUpdateCommand::parse(&json!({
            "updates": [{"key": "foo", "value": "bar"}]
        }))
        .is_ok());
    }
}
