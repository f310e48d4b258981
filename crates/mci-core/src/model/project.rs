//! Project configuration as consumed by the dispatch core.
//!
//! The YAML project loader and selector evaluation live outside the core;
//! this is the loaded shape the API serves to agents: command pipelines
//! per task plus project-scoped expansions and variables.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One command invocation in a pipeline.
///
/// `command` is the `plugin.name` pair, e.g. `shell.exec`; `params` is the
/// raw parameter map the agent decodes against the command's typed schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    /// `plugin.name` identifier.
    pub command: String,

    /// Raw parameters, decoded by the command runtime.
    #[serde(default)]
    pub params: serde_json::Value,

    /// Optional label shown in logs instead of the identifier.
    #[serde(default)]
    pub display_name: String,

    /// Command type attributed to failures, e.g. `test` or `system`.
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl CommandDescriptor {
    /// Build a descriptor for `command` with the given YAML-ish params.
    #[must_use]
    pub fn new(command: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            command: command.into(),
            params,
            display_name: String::new(),
            kind: String::new(),
        }
    }

    /// Split the identifier into (plugin, name).
    #[must_use]
    pub fn plugin_and_name(&self) -> (&str, &str) {
        match self.command.split_once('.') {
            Some((plugin, name)) => (plugin, name),
            None => ("", self.command.as_str()),
        }
    }
}

/// A named task definition within a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDef {
    /// Display name tasks reference.
    pub name: String,

    /// The task's main command pipeline.
    #[serde(default)]
    pub commands: Vec<CommandDescriptor>,
}

/// Loaded project configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project identifier.
    pub id: String,

    /// Disabled projects are skipped by the control plane.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Commands run before every task.
    #[serde(default)]
    pub pre: Vec<CommandDescriptor>,

    /// Commands run after every task, regardless of outcome.
    #[serde(default)]
    pub post: Vec<CommandDescriptor>,

    /// Task definitions.
    #[serde(default)]
    pub tasks: Vec<TaskDef>,

    /// Project-level expansions.
    #[serde(default)]
    pub expansions: HashMap<String, String>,

    /// Project-scoped variables served by `fetch_vars`.
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

const fn default_enabled() -> bool {
    true
}

impl ProjectConfig {
    /// The main pipeline for a task display name.
    #[must_use]
    pub fn commands_for(&self, display_name: &str) -> Option<&[CommandDescriptor]> {
        self.tasks
            .iter()
            .find(|def| def.name == display_name)
            .map(|def| def.commands.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_and_name_split() {
        let cmd = CommandDescriptor::new("shell.exec", serde_json::Value::Null);
        assert_eq!(cmd.plugin_and_name(), ("shell", "exec"));

        let bare = CommandDescriptor::new("noop", serde_json::Value::Null);
        assert_eq!(bare.plugin_and_name(), ("", "noop"));
    }

    #[test]
    fn test_project_yaml_shape() {
        let yaml = r#"
id: my-project
pre:
  - command: shell.exec
    params:
      script: "echo pre"
tasks:
  - name: compile
    commands:
      - command: shell.exec
        params:
          script: "make"
        type: test
"#;
        let project: ProjectConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(project.enabled);
        assert_eq!(project.pre.len(), 1);
        let commands = project.commands_for("compile").unwrap();
        assert_eq!(commands[0].kind, "test");
        assert!(project.commands_for("missing").is_none());
    }
}
