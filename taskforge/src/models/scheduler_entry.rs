use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A persistent binding of `taskId` + cron spec + default invocation params.
///
/// Serialized as a YAML sequence at the scheduler's configured persistence path. The `cron_id`
/// is never serialized; it is the opaque handle the cron engine hands back on registration and
/// only has meaning for the lifetime of the owning [`crate::scheduler::Scheduler`].
///
/// `schedule` is accepted on read as an alias for `spec` to support an older config variant;
/// writes always use `spec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SchedulerEntry {
    pub task_id: String,

    #[serde(alias = "schedule")]
    pub spec: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,

    #[serde(skip)]
    pub cron_id: Option<u64>,
}

impl SchedulerEntry {
    pub fn new(task_id: impl Into<String>, spec: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            spec: spec.into(),
            params: HashMap::new(),
            cron_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_legacy_schedule_key_on_read() {
        let yaml = "taskId: ping\nschedule: \"@every 1s\"\n";
        let entry: SchedulerEntry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(entry.spec, "@every 1s");
    }

    #[test]
    fn write_always_uses_spec_key() {
        let entry = SchedulerEntry::new("ping", "@every 1s");
        let yaml = serde_yaml::to_string(&entry).unwrap();
        assert!(yaml.contains("spec:"));
        assert!(!yaml.contains("schedule:"));
    }
}
