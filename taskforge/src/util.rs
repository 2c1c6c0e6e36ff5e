use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, used for run ids and `startedAt`/`finishedAt` timestamps.
pub fn epoch_milli() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The shell used to run a task's `command`: `cmd.exe /s /c` on Windows, `/bin/sh -c` elsewhere.
/// Shared by [`crate::runner`]'s subprocess step and [`crate::scripthost::child_process`] so the
/// two invocation paths stay in parity.
pub fn shell_invocation() -> (&'static str, &'static [&'static str]) {
    if cfg!(windows) {
        ("cmd.exe", &["/s", "/c"])
    } else {
        ("/bin/sh", &["-c"])
    }
}

/// Renders a task variable value as an environment variable's string content. Strings pass
/// through verbatim; everything else uses its JSON text form.
pub fn value_to_env_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
