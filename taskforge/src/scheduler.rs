//! Fires tasks on a cron-like schedule.
//!
//! Mirrors `gotask`'s `Scheduler`, which wraps `robfig/cron`'s `AddFunc`/`Remove` and a
//! background goroutine per entry. The `cron` crate used here only parses a standard five/six
//! field expression and computes its next occurrence; it has no ticking engine of its own, so
//! each registered entry gets its own `tokio::spawn`'d loop that sleeps until the computed next
//! fire time (or, for the legacy `@every` shorthand, a fixed interval) and re-evaluates after
//! every tick.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::manager::Manager;
use crate::models::SchedulerEntry;
use crate::runner::Runner;

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("no schedule registered for task {0:?}")]
    NotFound(String),

    #[error("invalid schedule spec {spec:?}: {message}")]
    BadSpec { spec: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse schedules file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

enum CronSpec {
    Every(Duration),
    Expression(cron::Schedule),
}

/// Parses a cron spec: either the standard five/six field expression understood by [`cron`], or
/// the `@every <duration>` shorthand (e.g. `@every 1s30ms`) that `gotask`'s config carries over
/// from `robfig/cron`'s descriptor parser, which the `cron` crate does not implement natively.
fn parse_spec(spec: &str) -> Result<CronSpec, SchedulerError> {
    let spec = spec.trim();
    if let Some(rest) = spec.strip_prefix("@every ") {
        let duration = parse_duration(rest.trim()).ok_or_else(|| SchedulerError::BadSpec {
            spec: spec.to_string(),
            message: format!("invalid duration {rest:?}"),
        })?;
        return Ok(CronSpec::Every(duration));
    }

    cron::Schedule::from_str(spec)
        .map(CronSpec::Expression)
        .map_err(|e| SchedulerError::BadSpec {
            spec: spec.to_string(),
            message: e.to_string(),
        })
}

/// Parses a sequence of `<number><unit>` pairs (`1h30m`, `90s`, `500ms`) with no separators,
/// matching Go's `time.ParseDuration` syntax closely enough for the specs this scheduler
/// actually sees. Units: `ns`, `us`, `ms`, `s`, `m`, `h`.
fn parse_duration(text: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut rest = text;
    if rest.is_empty() {
        return None;
    }

    while !rest.is_empty() {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit() && c != '.')?;
        let (number, tail) = rest.split_at(digits_end);
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);

        let value: f64 = number.parse().ok()?;
        let unit_nanos: f64 = match unit {
            "ns" => 1.0,
            "us" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60.0 * 1_000_000_000.0,
            "h" => 3_600.0 * 1_000_000_000.0,
            _ => return None,
        };
        total += Duration::from_nanos((value * unit_nanos) as u64);
        rest = tail;
    }

    Some(total)
}

/// Owns the set of active schedules for one tasks directory and drives each one's background
/// firing loop.
pub struct Scheduler {
    manager: Arc<Manager>,
    runner: Arc<Runner>,
    schedules_path: PathBuf,
    schedules: Arc<RwLock<Vec<SchedulerEntry>>>,
    tasks: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new(manager: Arc<Manager>, runner: Arc<Runner>, schedules_path: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            runner,
            schedules_path: schedules_path.into(),
            schedules: Arc::new(RwLock::new(Vec::new())),
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Loads the persisted schedule list and registers every entry. Called once at service
    /// startup.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.reload().await
    }

    /// Re-reads the schedules file from disk, tearing down every currently-registered entry
    /// first. A missing file is treated as an empty schedule list, not an error.
    pub async fn reload(&self) -> Result<(), SchedulerError> {
        {
            let mut entries = self.schedules.write().expect("schedules lock poisoned");
            for entry in entries.iter_mut() {
                self.unregister(entry);
            }
            entries.clear();
        }

        let bytes = match tokio::fs::read(&self.schedules_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut loaded: Vec<SchedulerEntry> = serde_yaml::from_slice(&bytes)?;

        for entry in loaded.iter_mut() {
            if let Err(e) = self.register(entry) {
                warn!(task_id = %entry.task_id, spec = %entry.spec, error = %e, "dropping unschedulable entry on reload");
            }
        }

        *self.schedules.write().expect("schedules lock poisoned") = loaded;
        Ok(())
    }

    fn register(&self, entry: &mut SchedulerEntry) -> Result<(), SchedulerError> {
        let cron_spec = parse_spec(&entry.spec)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        self.tasks
            .lock()
            .expect("tasks lock poisoned")
            .insert(id, cancel.clone());
        entry.cron_id = Some(id);

        tokio::spawn(run_schedule_loop(
            cron_spec,
            self.manager.clone(),
            self.runner.clone(),
            entry.task_id.clone(),
            entry.params.clone(),
            cancel,
        ));
        Ok(())
    }

    fn unregister(&self, entry: &mut SchedulerEntry) {
        if let Some(id) = entry.cron_id.take() {
            if let Some(cancel) = self.tasks.lock().expect("tasks lock poisoned").remove(&id) {
                cancel.cancel();
            }
        }
    }

    /// Replaces (or removes, if `spec` is empty) the schedule for `task_id`, persisting the
    /// result. Mirrors the original's remove-then-register sequencing: a prior entry is always
    /// torn down and saved before a new one is registered, even when both exist for the same
    /// task id.
    pub async fn set(&self, task_id: &str, spec: &str) -> Result<(), SchedulerError> {
        self.remove(task_id).await;

        if spec.is_empty() {
            return Ok(());
        }

        let mut entry = SchedulerEntry::new(task_id, spec);
        self.register(&mut entry)?;
        self.schedules
            .write()
            .expect("schedules lock poisoned")
            .push(entry);
        self.persist().await
    }

    /// Removes any schedule for `task_id`. Returns whether one existed.
    pub async fn remove(&self, task_id: &str) -> bool {
        let removed = {
            let mut entries = self.schedules.write().expect("schedules lock poisoned");
            let Some(pos) = entries.iter().position(|e| e.task_id == task_id) else {
                return false;
            };
            let mut entry = entries.remove(pos);
            self.unregister(&mut entry);
            true
        };
        if removed {
            let _ = self.persist().await;
        }
        removed
    }

    pub fn get_schedule(&self, task_id: &str) -> Option<SchedulerEntry> {
        self.schedules
            .read()
            .expect("schedules lock poisoned")
            .iter()
            .find(|e| e.task_id == task_id)
            .cloned()
    }

    pub fn schedules(&self) -> Vec<SchedulerEntry> {
        self.schedules.read().expect("schedules lock poisoned").clone()
    }

    async fn persist(&self) -> Result<(), SchedulerError> {
        let entries = self.schedules.read().expect("schedules lock poisoned").clone();
        let yaml = serde_yaml::to_string(&entries)?;
        if let Some(parent) = self.schedules_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.schedules_path, yaml).await?;
        Ok(())
    }
}

async fn run_schedule_loop(
    spec: CronSpec,
    manager: Arc<Manager>,
    runner: Arc<Runner>,
    task_id: String,
    params: HashMap<String, String>,
    cancel: CancellationToken,
) {
    loop {
        let sleep_for = match &spec {
            CronSpec::Every(duration) => *duration,
            CronSpec::Expression(schedule) => {
                let now = Utc::now();
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!(task_id = %task_id, "cron schedule has no future occurrence; stopping");
                    return;
                };
                match (next - now).to_std() {
                    Ok(d) => d,
                    Err(_) => Duration::from_millis(0),
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(sleep_for) => {}
        }
        if cancel.is_cancelled() {
            return;
        }

        match manager.load(&task_id).await {
            Ok(task) => {
                info!(task_id = %task_id, "firing scheduled run");
                runner.start(task, params.clone()).await;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "scheduled run skipped: could not load task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn parses_every_shorthand() {
        let d = parse_duration("1s30ms").unwrap();
        assert_eq!(d, StdDuration::from_millis(1030));
    }

    #[test]
    fn parses_standard_cron_expression() {
        match parse_spec("0 */5 * * * *").unwrap() {
            CronSpec::Expression(_) => {}
            _ => panic!("expected a standard cron expression"),
        }
    }

    #[test]
    fn rejects_malformed_spec() {
        let err = parse_spec("not a cron expression").unwrap_err();
        assert!(matches!(err, SchedulerError::BadSpec { .. }));
    }

    #[test]
    fn accepts_every_shorthand_spec() {
        match parse_spec("@every 1s").unwrap() {
            CronSpec::Every(d) => assert_eq!(d, StdDuration::from_secs(1)),
            _ => panic!("expected an @every duration"),
        }
    }

    #[tokio::test]
    async fn set_then_remove_round_trips_through_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let tasks_dir = dir.path().join("tasks");
        tokio::fs::create_dir_all(&tasks_dir).await.unwrap();
        let schedules_path = dir.path().join("schedules.yaml");

        let manager = Arc::new(Manager::new(&tasks_dir));
        let queue = crate::queue::TaskQueue::new(2, 5);
        let runner = Arc::new(Runner::new(queue, dir.path().join("logs")));
        let scheduler = Scheduler::new(manager, runner, &schedules_path);

        scheduler.set("ping", "@every 1h").await.unwrap();
        assert!(scheduler.get_schedule("ping").is_some());

        let persisted = tokio::fs::read_to_string(&schedules_path).await.unwrap();
        assert!(persisted.contains("ping"));

        let removed = scheduler.remove("ping").await;
        assert!(removed);
        assert!(scheduler.get_schedule("ping").is_none());

        let persisted = tokio::fs::read_to_string(&schedules_path).await.unwrap();
        let entries: Vec<SchedulerEntry> = serde_yaml::from_str(&persisted).unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn reload_tolerates_a_missing_schedules_file() {
        let dir = tempfile::tempdir().unwrap();
        let tasks_dir = dir.path().join("tasks");
        tokio::fs::create_dir_all(&tasks_dir).await.unwrap();
        let manager = Arc::new(Manager::new(&tasks_dir));
        let queue = crate::queue::TaskQueue::new(2, 5);
        let runner = Arc::new(Runner::new(queue, dir.path().join("logs")));
        let scheduler = Scheduler::new(manager, runner, dir.path().join("missing.yaml"));

        scheduler.start().await.unwrap();
        assert!(scheduler.schedules().is_empty());
    }
}
