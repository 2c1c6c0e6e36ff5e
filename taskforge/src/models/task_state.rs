use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::task_config::TaskConfig;

/// Runtime status of a [`TaskState`] node. Transitions are monotone: once a node reaches a
/// terminal status (`Success`, `Failed`, `Canceled`) it is frozen for the remainder of the run.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    #[default]
    Queued,
    Running,
    Success,
    Failed,
    Canceled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failed | Status::Canceled)
    }
}

/// Runtime mirror of a [`TaskConfig`] for one run. Built once, at submission time, as a tree
/// shaped exactly like the task's `steps`, and mutated in place as the run progresses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskState {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<TaskState>,

    pub status: Status,

    #[serde(default)]
    pub started_at: i64,

    #[serde(default)]
    pub finished_at: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_file: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl TaskState {
    /// Builds the (still-unstarted) runtime mirror of a task tree, one node per config node.
    pub fn from_config(config: &TaskConfig) -> Self {
        TaskState {
            name: config.name.clone(),
            depends: config.depends.clone(),
            steps: config.steps.iter().map(TaskState::from_config).collect(),
            status: Status::Queued,
            started_at: 0,
            finished_at: 0,
            log_file: String::new(),
            message: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(Status::Success.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(Status::Canceled.is_terminal());
        assert!(!Status::Queued.is_terminal());
        assert!(!Status::Running.is_terminal());
    }

    #[test]
    fn from_config_mirrors_step_tree() {
        let config = TaskConfig {
            name: "root".into(),
            steps: vec![TaskConfig {
                name: "child".into(),
                depends: vec!["sibling".into()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let state = TaskState::from_config(&config);
        assert_eq!(state.name, "root");
        assert_eq!(state.status, Status::Queued);
        assert_eq!(state.steps.len(), 1);
        assert_eq!(state.steps[0].name, "child");
        assert_eq!(state.steps[0].depends, vec!["sibling".to_string()]);
    }
}
