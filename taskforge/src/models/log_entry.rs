use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::models::task_state::TaskState;

/// One history record: the full state of a run, from submission to completion.
///
/// Created at [`crate::runner::Runner::start`], mutated in place while the run executes, and
/// serialized as one JSON line to `<logDir>/<taskId>/task.log` once the root task reaches a
/// terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LogEntry {
    pub task_id: String,
    pub run_id: i64,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,

    pub task: TaskState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let entry = LogEntry {
            task_id: "hello".into(),
            run_id: 12345,
            params: HashMap::from([("x".to_string(), "7".to_string())]),
            task: TaskState {
                name: "hello".into(),
                ..Default::default()
            },
        };

        let json = serde_json::to_string(&entry).unwrap();
        let decoded: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, entry);
    }
}
