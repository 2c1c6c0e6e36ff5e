use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declarative definition of one task, as loaded from `<tasksDir>/<id>.yaml` or synthesized
/// from a `.sh`/`.js` file by [`crate::manager::Manager`].
///
/// Mirrors the shape of `gofer_sdk::config::Task`, but describes a locally executed command
/// or script rather than a containerized workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskConfig {
    /// Unique identifier within the tasks directory. Not part of the YAML body; filled in by
    /// the Manager at load time.
    #[serde(skip)]
    pub task_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, rename = "desc")]
    pub description: String,

    #[serde(default)]
    pub runtime: Runtime,

    #[serde(default)]
    pub command: String,

    #[serde(default)]
    pub dir: String,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub depends: Vec<String>,

    #[serde(default)]
    pub canceled_exit_code: i32,

    #[serde(default)]
    pub allow_parallel: bool,

    #[serde(default)]
    pub disable_log: bool,

    #[serde(default)]
    pub sequential: bool,

    #[serde(default)]
    pub steps: Vec<TaskConfig>,
}

/// Execution runtime for a task's `command`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    #[default]
    #[serde(alias = "")]
    Sh,
    Js,
}

impl TaskConfig {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            name: task_id.to_string(),
            ..Default::default()
        }
    }

    /// Applies dependency-fixup recursively: for every container with `sequential == true`,
    /// each child's `depends` becomes exactly its immediate predecessor's name (empty for the
    /// first child). Applied once, at load time, by the Manager.
    pub fn fix_dependencies(&mut self) {
        for i in 0..self.steps.len() {
            if self.sequential {
                if i > 0 {
                    let prev_name = self.steps[i - 1].name.clone();
                    self.steps[i].depends = vec![prev_name];
                } else {
                    self.steps[i].depends.clear();
                }
            }
        }
        for step in &mut self.steps {
            step.fix_dependencies();
        }
    }

    /// Applies an invocation's params on top of this task's variable defaults. Only keys
    /// already present in `variables` are overwritten; unknown keys are ignored here (the HTTP
    /// boundary may still pass them through as `VARS.*`/`PARAMS.*` form fields).
    pub fn bind_params(&mut self, params: &HashMap<String, String>) {
        for (k, v) in params {
            if self.variables.contains_key(k) {
                self.variables
                    .insert(k.clone(), serde_json::Value::String(v.clone()));
            }
        }
    }

    pub fn has_command(&self) -> bool {
        !self.command.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_runtime_string_deserializes_to_sh() {
        let runtime: Runtime = serde_json::from_str("\"\"").unwrap();
        assert_eq!(runtime, Runtime::Sh);
    }

    #[test]
    fn sequential_steps_fixup_chains_depends() {
        let mut task = TaskConfig {
            sequential: true,
            steps: vec![
                TaskConfig::new("a"),
                TaskConfig::new("b"),
                TaskConfig::new("c"),
            ],
            ..Default::default()
        };
        task.steps[0].name = "a".into();
        task.steps[1].name = "b".into();
        task.steps[2].name = "c".into();

        task.fix_dependencies();

        assert!(task.steps[0].depends.is_empty());
        assert_eq!(task.steps[1].depends, vec!["a".to_string()]);
        assert_eq!(task.steps[2].depends, vec!["b".to_string()]);
    }

    #[test]
    fn non_sequential_steps_keep_explicit_depends() {
        let mut task = TaskConfig {
            sequential: false,
            steps: vec![TaskConfig::new("a"), TaskConfig::new("b")],
            ..Default::default()
        };
        task.steps[1].depends = vec!["a".to_string()];

        task.fix_dependencies();

        assert!(task.steps[0].depends.is_empty());
        assert_eq!(task.steps[1].depends, vec!["a".to_string()]);
    }

    #[test]
    fn bind_params_only_overrides_known_variables() {
        let mut task = TaskConfig {
            variables: HashMap::from([("x".to_string(), serde_json::json!(1))]),
            ..Default::default()
        };
        let mut params = HashMap::new();
        params.insert("x".to_string(), "7".to_string());
        params.insert("unknown".to_string(), "ignored".to_string());

        task.bind_params(&params);

        assert_eq!(
            task.variables.get("x"),
            Some(&serde_json::Value::String("7".to_string()))
        );
        assert!(!task.variables.contains_key("unknown"));
    }
}
