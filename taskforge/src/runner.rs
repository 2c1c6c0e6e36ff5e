//! Drives a task tree to completion: expands steps, respects `depends` edges, enqueues leaf
//! work on the [`TaskQueue`], and records the result.
//!
//! Mirrors `binzume/gotask`'s `Runner`/`runState`: each node in the task tree gets its own
//! async "goroutine" (here, a `tokio::spawn`'d future) that waits for its dependencies, then
//! either fans out to its own steps or submits its command to the queue. The whole tree shares
//! one `Arc<Mutex<LogEntry>>`; nodes mutate through a path into that tree rather than holding
//! parent pointers, which sidesteps the cyclic-ownership risk a naive port would hit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::{LogEntry, Runtime, Status, TaskConfig, TaskState};
use crate::queue::{Job, TaskQueue};
use crate::scripthost::ScriptHost;
use crate::util::{epoch_milli, shell_invocation, value_to_env_string};

/// One in-flight run, registered in [`Runner::runnings`] for exactly as long as some part of its
/// tree is non-terminal.
struct RunningRun {
    task_id: String,
    run_id: i64,
    log: Arc<StdMutex<LogEntry>>,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
}

#[derive(Clone)]
struct RunCtx {
    task_id: String,
    run_id: i64,
    root: Arc<TaskConfig>,
    log: Arc<StdMutex<LogEntry>>,
    queue: TaskQueue,
    log_dir: PathBuf,
    cancel: CancellationToken,
    runnings: Arc<RwLock<Vec<Arc<RunningRun>>>>,
    done_tx: watch::Sender<bool>,
}

/// Drives runs of a single task tree to completion over the shared [`TaskQueue`].
pub struct Runner {
    queue: TaskQueue,
    log_dir: PathBuf,
    runnings: Arc<RwLock<Vec<Arc<RunningRun>>>>,
}

impl Runner {
    pub fn new(queue: TaskQueue, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            queue,
            log_dir: log_dir.into(),
            runnings: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn is_task_running(&self, task_id: &str) -> bool {
        self.runnings
            .read()
            .expect("runnings lock poisoned")
            .iter()
            .any(|r| r.task_id == task_id)
    }

    /// Submits a run and returns immediately; the run itself executes in the background.
    ///
    /// If `task.allow_parallel` is false and another run of the same task id is already
    /// registered, the submission is skipped entirely: a terminal, never-started `LogEntry` is
    /// returned and nothing is added to `runnings`.
    pub async fn start(&self, mut task: TaskConfig, params: HashMap<String, String>) -> LogEntry {
        let task_id = task.task_id.clone();

        if !task.allow_parallel && self.is_task_running(&task_id) {
            warn!(task_id = %task_id, "skipped: still running");
            let mut state = TaskState::from_config(&task);
            let now = epoch_milli();
            state.status = Status::Canceled;
            state.message = "skipped: still running".to_string();
            state.finished_at = now;
            return LogEntry {
                task_id,
                run_id: now,
                params,
                task: state,
            };
        }

        task.bind_params(&params);
        let run_id = epoch_milli();
        let state = TaskState::from_config(&task);
        let entry = LogEntry {
            task_id: task_id.clone(),
            run_id,
            params,
            task: state,
        };
        let log = Arc::new(StdMutex::new(entry.clone()));
        let cancel = CancellationToken::new();
        let (done_tx, _done_rx) = watch::channel(false);

        let running = Arc::new(RunningRun {
            task_id: task_id.clone(),
            run_id,
            log: log.clone(),
            cancel: cancel.clone(),
            done_tx: done_tx.clone(),
        });
        self.runnings
            .write()
            .expect("runnings lock poisoned")
            .push(running);

        let ctx = RunCtx {
            task_id: task_id.clone(),
            run_id,
            root: Arc::new(task),
            log,
            queue: self.queue.clone(),
            log_dir: self.log_dir.clone(),
            cancel,
            runnings: self.runnings.clone(),
            done_tx,
        };

        tokio::spawn(async move {
            run_node(ctx.clone(), Vec::new(), ".".to_string()).await;
            finalize(ctx).await;
        });

        entry
    }

    /// Cancels a running run's context. Returns `false` if no such run is registered.
    pub fn stop(&self, task_id: &str, run_id: i64) -> bool {
        let runnings = self.runnings.read().expect("runnings lock poisoned");
        match runnings
            .iter()
            .find(|r| r.task_id == task_id && r.run_id == run_id)
        {
            Some(r) => {
                r.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Blocks until the given run finishes. Returns immediately if it is not (or no longer)
    /// registered, since that means it already finished.
    pub async fn wait(&self, task_id: &str, run_id: i64) {
        let rx = {
            let runnings = self.runnings.read().expect("runnings lock poisoned");
            runnings
                .iter()
                .find(|r| r.task_id == task_id && r.run_id == run_id)
                .map(|r| r.done_tx.subscribe())
        };
        if let Some(mut rx) = rx {
            if *rx.borrow() {
                return;
            }
            let _ = rx.changed().await;
        }
    }

    /// Merges currently-running entries for `task_id` with the tail of its history file, newest
    /// first, up to `limit` entries total.
    pub async fn get_history(&self, task_id: &str, limit: usize) -> Vec<LogEntry> {
        let running: Vec<Arc<RunningRun>> = self
            .runnings
            .read()
            .expect("runnings lock poisoned")
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();

        let mut result: Vec<LogEntry> = running
            .iter()
            .map(|r| r.log.lock().expect("log mutex poisoned").clone())
            .collect();

        if result.len() >= limit {
            result.truncate(limit);
            return result;
        }

        let remaining = limit - result.len();
        result.extend(self.read_history_tail(task_id, remaining).await);
        result
    }

    async fn read_history_tail(&self, task_id: &str, limit: usize) -> Vec<LogEntry> {
        const WINDOW: u64 = 64 * 1024;

        let path = self.log_dir.join(task_id).join("task.log");
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let len = match file.metadata().await {
            Ok(m) => m.len(),
            Err(_) => return Vec::new(),
        };
        let start = len.saturating_sub(WINDOW);
        if file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
            return Vec::new();
        }
        let mut buf = String::new();
        if file.read_to_string(&mut buf).await.is_err() {
            return Vec::new();
        }

        let mut entries: Vec<LogEntry> = buf
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<LogEntry>(line).ok())
            .collect();
        entries.reverse();
        entries.truncate(limit);
        entries
    }
}

/// Result of [`Runner::invoke`]: the script/command's own result object plus whether it
/// succeeded, mirroring `gotask`'s `TaskResult{Result, Success}` pair.
pub struct InvokeOutcome {
    pub result: serde_json::Value,
    pub ok: bool,
}

impl Runner {
    /// Runs `task`'s own body synchronously, bypassing the queue, run history, and step
    /// expansion entirely — the HTTP boundary's `action=invoke`, which expects a result back in
    /// the same request/response cycle rather than a `(taskId, runId)` handle to poll later.
    ///
    /// A script task's resolved object (or rejection) is returned as-is. A shell command's
    /// captured stdout becomes `{ "body": <stdout> }`, giving both runtimes the same `{body}`
    /// shape the HTTP layer looks for per §6's response-shaping rule.
    pub async fn invoke(&self, mut task: TaskConfig, params: HashMap<String, String>) -> InvokeOutcome {
        task.bind_params(&params);
        let dir = if task.dir.is_empty() {
            ".".to_string()
        } else {
            task.dir.clone()
        };

        match task.runtime {
            Runtime::Js => {
                let script_path = Path::new(&dir).join(&task.command);
                let mut event_params: HashMap<String, String> = task
                    .variables
                    .iter()
                    .map(|(k, v)| (k.clone(), value_to_env_string(v)))
                    .collect();
                event_params.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));

                let host = match ScriptHost::start(&script_path).await {
                    Ok(h) => h,
                    Err(e) => {
                        return InvokeOutcome {
                            result: serde_json::json!({ "error": e.to_string() }),
                            ok: false,
                        }
                    }
                };

                let outcome = match host.execute(&event_params, &task.env, &task.name).await {
                    Ok((json, ok)) => InvokeOutcome { result: json, ok },
                    Err(e) => InvokeOutcome {
                        result: serde_json::json!({ "error": e.to_string() }),
                        ok: false,
                    },
                };
                let _ = host.wait().await;
                host.close().await;
                outcome
            }
            Runtime::Sh => invoke_shell(&task.command, &dir, &merge_env(&task), task.canceled_exit_code).await,
        }
    }
}

/// Runs a shell command synchronously, capturing its stdout as the `body` of the result object
/// `invoke` returns. Unlike the queued leaf-execution path, output is never written to a log
/// file: `invoke` is a one-shot request/response call, not a tracked run.
async fn invoke_shell(
    command: &str,
    dir: &str,
    env: &[(String, String)],
    canceled_exit_code: i32,
) -> InvokeOutcome {
    let (program, shell_args) = shell_invocation();
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(shell_args).arg(command);
    if !dir.is_empty() {
        cmd.current_dir(dir);
    }
    cmd.envs(env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let output = match cmd.output().await {
        Ok(output) => output,
        Err(e) => {
            return InvokeOutcome {
                result: serde_json::json!({ "error": format!("failed to start command: {e}") }),
                ok: false,
            }
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    match classify_exit(output.status, canceled_exit_code) {
        CommandOutcome::Success => InvokeOutcome {
            result: serde_json::json!({ "body": stdout }),
            ok: true,
        },
        CommandOutcome::Canceled | CommandOutcome::Failed(_) => InvokeOutcome {
            result: serde_json::json!({
                "body": stdout,
                "error": String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            ok: false,
        },
    }
}

async fn finalize(ctx: RunCtx) {
    let entry = ctx.log.lock().expect("log mutex poisoned").clone();

    if let Err(e) = append_history(&ctx.log_dir, &entry).await {
        warn!(task_id = %ctx.task_id, run_id = ctx.run_id, error = %e, "failed to write run history");
    }

    ctx.runnings
        .write()
        .expect("runnings lock poisoned")
        .retain(|r| !(r.task_id == ctx.task_id && r.run_id == ctx.run_id));

    let _ = ctx.done_tx.send(true);
    info!(task_id = %ctx.task_id, run_id = ctx.run_id, status = %entry.task.status, "run finished");
}

async fn append_history(log_dir: &Path, entry: &LogEntry) -> std::io::Result<()> {
    let dir = log_dir.join(&entry.task_id);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join("task.log");
    let line = serde_json::to_string(entry).unwrap_or_default();

    let mut file = open_append_only(&path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

/// Opens `path` for append, creating it with user-read-write permissions if it doesn't exist.
/// Runs the blocking `open` call on a blocking-pool thread since `OpenOptionsExt::mode` has no
/// async equivalent.
async fn open_append_only(path: &Path) -> std::io::Result<tokio::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let path = path.to_path_buf();
    let std_file =
        tokio::task::spawn_blocking(move || options.open(&path)).await.map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
        })??;
    Ok(tokio::fs::File::from_std(std_file))
}

fn config_at<'a>(root: &'a TaskConfig, path: &[usize]) -> &'a TaskConfig {
    let mut node = root;
    for &i in path {
        node = &node.steps[i];
    }
    node
}

fn state_at<'a>(root: &'a TaskState, path: &[usize]) -> &'a TaskState {
    let mut node = root;
    for &i in path {
        node = &node.steps[i];
    }
    node
}

fn state_at_mut<'a>(root: &'a mut TaskState, path: &[usize]) -> &'a mut TaskState {
    let mut node = root;
    for &i in path {
        node = &mut node.steps[i];
    }
    node
}

async fn set_state(ctx: &RunCtx, path: &[usize], status: Status, message: impl Into<String>) {
    let mut log = ctx.log.lock().expect("log mutex poisoned");
    let node = state_at_mut(&mut log.task, path);
    node.status = status;
    node.message = message.into();
    if status.is_terminal() {
        node.finished_at = epoch_milli();
    }
}

/// Marks a node `running`, as `gotask` does right before it starts spawning steps, or right as
/// its queued command actually begins executing. `started_at` is set only the first time.
async fn set_running(ctx: &RunCtx, path: &[usize]) {
    let mut log = ctx.log.lock().expect("log mutex poisoned");
    let node = state_at_mut(&mut log.task, path);
    if node.started_at == 0 {
        node.started_at = epoch_milli();
    }
    node.status = Status::Running;
}

async fn set_log_file(ctx: &RunCtx, path: &[usize], log_file: &str) {
    let mut log = ctx.log.lock().expect("log mutex poisoned");
    state_at_mut(&mut log.task, path).log_file = log_file.to_string();
}

fn node_status(ctx: &RunCtx, path: &[usize]) -> Status {
    let log = ctx.log.lock().expect("log mutex poisoned");
    state_at(&log.task, path).status
}

fn run_node(
    ctx: RunCtx,
    path: Vec<usize>,
    parent_dir: String,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        let cfg = config_at(&ctx.root, &path).clone();
        let effective_dir = if cfg.dir.is_empty() { parent_dir } else { cfg.dir.clone() };

        if !cfg.steps.is_empty() {
            set_running(&ctx, &path).await;
            let ok = run_steps(&ctx, &path, cfg.steps.len(), &effective_dir).await;

            if ctx.cancel.is_cancelled() {
                set_state(&ctx, &path, Status::Canceled, "").await;
                return;
            }
            if !ok {
                set_state(&ctx, &path, Status::Failed, "sub tasks are not completed").await;
                return;
            }
        }

        run_leaf(&ctx, &path, &cfg, &effective_dir).await;
    })
}

/// Expands `path`'s `n` children, launching each as soon as its `depends` have all reached
/// `success`, and waits for all of them (started or not) to settle. Returns whether every child
/// that started ended in `success`; children that never got to start (because a dependency never
/// reached `success`) are marked `canceled` and also count against the result.
async fn run_steps(ctx: &RunCtx, path: &[usize], n: usize, effective_dir: &str) -> bool {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let mut started = vec![false; n];
    let mut in_flight = 0usize;

    loop {
        if !ctx.cancel.is_cancelled() {
            for i in 0..n {
                if started[i] {
                    continue;
                }
                let deps_ok = {
                    let parent_cfg = config_at(&ctx.root, path);
                    let depends = parent_cfg.steps[i].depends.clone();
                    let log = ctx.log.lock().expect("log mutex poisoned");
                    let parent_state = state_at(&log.task, path);
                    depends.iter().all(|d| {
                        parent_state
                            .steps
                            .iter()
                            .find(|s| &s.name == d)
                            .map(|s| s.status == Status::Success)
                            .unwrap_or(false)
                    })
                };
                if !deps_ok {
                    continue;
                }

                started[i] = true;
                in_flight += 1;
                let mut child_path = path.to_vec();
                child_path.push(i);
                let ctx2 = ctx.clone();
                let dir2 = effective_dir.to_string();
                let tx2 = tx.clone();
                tokio::spawn(async move {
                    run_node(ctx2, child_path, dir2).await;
                    let _ = tx2.send(());
                });
            }
        }

        if in_flight == 0 {
            break;
        }
        if rx.recv().await.is_none() {
            break;
        }
        in_flight -= 1;
    }

    let mut ok = true;
    for i in 0..n {
        let mut child_path = path.to_vec();
        child_path.push(i);
        if !started[i] {
            set_state(ctx, &child_path, Status::Canceled, "dependency not satisfied").await;
            ok = false;
            continue;
        }
        if node_status(ctx, &child_path) != Status::Success {
            ok = false;
        }
    }
    ok
}

/// Runs a node's own body once its steps (if any) have all succeeded: enqueues it on the Task
/// Queue (even when its `command` is empty, so it still passes through the `running` transition
/// the same way a real command would) and waits for it to finish.
async fn run_leaf(ctx: &RunCtx, path: &[usize], cfg: &TaskConfig, effective_dir: &str) {
    let id = format!("{}:{}.{}", ctx.task_id, cfg.name, epoch_milli());
    let job_ctx = ctx.clone();
    let job_path = path.to_vec();
    let job_cfg = cfg.clone();
    let dir = effective_dir.to_string();

    let job: Job = Box::pin(async move {
        run_leaf_job(job_ctx, job_path, job_cfg, dir).await;
    });

    let (entry, accepted) = ctx.queue.try_post_with_id(job, id).await;
    if !accepted {
        set_state(ctx, path, Status::Failed, "failed to enqueue").await;
        return;
    }
    if let Some(entry) = entry {
        entry.wait().await;
    }
}

enum CommandOutcome {
    Success,
    Canceled,
    Failed(String),
}

async fn run_leaf_job(ctx: RunCtx, path: Vec<usize>, cfg: TaskConfig, dir: String) {
    set_running(&ctx, &path).await;

    if !cfg.has_command() {
        set_state(&ctx, &path, Status::Success, "").await;
        return;
    }

    if ctx.cancel.is_cancelled() {
        set_state(&ctx, &path, Status::Canceled, "").await;
        return;
    }

    let log_file_rel = if cfg.disable_log {
        None
    } else {
        let rel = format!("{}/{}_{}.log", ctx.task_id, ctx.run_id, cfg.name);
        set_log_file(&ctx, &path, &rel).await;
        Some(rel)
    };

    let outcome = match cfg.runtime {
        Runtime::Sh => {
            let log_path = log_file_rel.as_ref().map(|rel| ctx.log_dir.join(rel));
            execute_subprocess(
                &cfg.command,
                &dir,
                &merge_env(&cfg),
                log_path.as_deref(),
                cfg.canceled_exit_code,
                ctx.cancel.clone(),
            )
            .await
        }
        Runtime::Js => {
            let script_path = Path::new(&dir).join(&cfg.command);
            let env_vars = cfg.env.clone();
            let event_params: HashMap<String, String> = cfg
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), value_to_env_string(v)))
                .collect();
            execute_script(&script_path, &event_params, &env_vars, &cfg.name, ctx.cancel.clone())
                .await
        }
    };

    match outcome {
        CommandOutcome::Success => set_state(&ctx, &path, Status::Success, "").await,
        CommandOutcome::Canceled => set_state(&ctx, &path, Status::Canceled, "").await,
        CommandOutcome::Failed(message) => set_state(&ctx, &path, Status::Failed, message).await,
    }
}

fn merge_env(cfg: &TaskConfig) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = cfg
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, v) in &cfg.variables {
        vars.push((k.clone(), value_to_env_string(v)));
    }
    vars
}

async fn execute_subprocess(
    command: &str,
    dir: &str,
    env: &[(String, String)],
    log_path: Option<&Path>,
    canceled_exit_code: i32,
    cancel: CancellationToken,
) -> CommandOutcome {
    let (program, shell_args) = shell_invocation();
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(shell_args).arg(command);
    if !dir.is_empty() {
        cmd.current_dir(dir);
    }
    cmd.envs(env.iter().map(|(k, v)| (k.clone(), v.clone())));

    match log_path {
        Some(log_path) => {
            if let Some(parent) = log_path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return CommandOutcome::Failed(format!("could not create log directory: {e}"));
                }
            }
            let stdout_file = match open_log_file(log_path).await {
                Ok(f) => f,
                Err(e) => return CommandOutcome::Failed(format!("could not open log file: {e}")),
            };
            let stderr_file = match stdout_file.try_clone() {
                Ok(f) => f,
                Err(e) => {
                    return CommandOutcome::Failed(format!(
                        "could not duplicate log file handle: {e}"
                    ))
                }
            };
            cmd.stdout(Stdio::from(stdout_file));
            cmd.stderr(Stdio::from(stderr_file));
        }
        None => {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return CommandOutcome::Failed(format!("failed to start command: {e}")),
    };

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => classify_exit(status, canceled_exit_code),
            Err(e) => CommandOutcome::Failed(format!("command wait failed: {e}")),
        },
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            CommandOutcome::Canceled
        }
    }
}

async fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || options.open(&path))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?
}

fn classify_exit(status: std::process::ExitStatus, canceled_exit_code: i32) -> CommandOutcome {
    match status.code() {
        Some(0) => CommandOutcome::Success,
        Some(code) if canceled_exit_code != 0 && code == canceled_exit_code => {
            CommandOutcome::Canceled
        }
        Some(code) => CommandOutcome::Failed(format!("command exited with code {code}")),
        None => CommandOutcome::Failed("command terminated by signal".to_string()),
    }
}

async fn execute_script(
    path: &Path,
    params: &HashMap<String, String>,
    env: &HashMap<String, String>,
    name: &str,
    cancel: CancellationToken,
) -> CommandOutcome {
    let host = match ScriptHost::start(path).await {
        Ok(h) => h,
        Err(e) => return CommandOutcome::Failed(format!("failed to start script: {e}")),
    };

    tokio::select! {
        result = host.execute(params, env, name) => {
            let outcome = match result {
                Ok((_json, true)) => CommandOutcome::Success,
                Ok((json, false)) => CommandOutcome::Failed(script_error_message(&json)),
                Err(e) => CommandOutcome::Failed(e.to_string()),
            };
            let _ = host.wait().await;
            host.close().await;
            outcome
        }
        _ = cancel.cancelled() => {
            tokio::spawn(async move {
                let _ = host.wait().await;
                host.close().await;
            });
            CommandOutcome::Canceled
        }
    }
}

fn script_error_message(json: &serde_json::Value) -> String {
    json.get("error")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| json.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;
    #[cfg(unix)]
    use std::os::unix::process::ExitStatusExt;

    fn make_runner(parallel: usize, queue_len: usize, log_dir: &Path) -> Runner {
        Runner::new(TaskQueue::new(parallel, queue_len), log_dir)
    }

    async fn wait_for_history(runner: &Runner, task_id: &str, timeout: Duration) -> Vec<LogEntry> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let history = runner.get_history(task_id, 50).await;
            if history.first().is_some_and(|e| e.task.status.is_terminal()) {
                return history;
            }
            if tokio::time::Instant::now() >= deadline {
                return history;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn e1_simple_command_succeeds_and_logs_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(4, 10, dir.path());

        let mut task = TaskConfig::new("hello");
        task.command = "echo hi".to_string();

        let entry = runner.start(task, HashMap::new()).await;
        runner.wait("hello", entry.run_id).await;

        let history = runner.get_history("hello", 10).await;
        assert_eq!(history[0].task.status, Status::Success);

        let log_path = dir
            .path()
            .join(&history[0].task.log_file);
        let contents = std::fs::read_to_string(log_path).unwrap();
        assert_eq!(contents, "hi\n");
    }

    #[tokio::test]
    async fn e2_failed_step_skips_later_steps_and_fails_parent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(4, 10, dir.path());

        let mut task = TaskConfig::new("pipeline");
        task.sequential = true;
        let mut a = TaskConfig::new("a");
        a.name = "a".to_string();
        a.command = "true".to_string();
        let mut b = TaskConfig::new("b");
        b.name = "b".to_string();
        b.command = "exit 1".to_string();
        let mut c = TaskConfig::new("c");
        c.name = "c".to_string();
        c.command = "true".to_string();
        task.steps = vec![a, b, c];
        task.fix_dependencies();

        let entry = runner.start(task, HashMap::new()).await;
        runner.wait("pipeline", entry.run_id).await;

        let history = runner.get_history("pipeline", 10).await;
        let root = &history[0].task;
        assert_eq!(root.status, Status::Failed);
        assert_eq!(root.message, "sub tasks are not completed");
        assert_eq!(root.steps[0].status, Status::Success);
        assert_eq!(root.steps[1].status, Status::Failed);
        assert_eq!(root.steps[2].status, Status::Canceled);
    }

    #[tokio::test]
    async fn e3_stop_cancels_a_running_sleep_quickly() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(4, 10, dir.path());

        let mut task = TaskConfig::new("slow");
        task.command = "sleep 60".to_string();

        let entry = runner.start(task, HashMap::new()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runner.stop("slow", entry.run_id));

        let history = wait_for_history(&runner, "slow", Duration::from_secs(5)).await;
        let root = &history[0].task;
        assert_eq!(root.status, Status::Canceled);
        assert!(root.finished_at - root.started_at < 5000);
    }

    #[tokio::test]
    async fn e4_canceled_exit_code_maps_to_canceled_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(4, 10, dir.path());

        let mut task = TaskConfig::new("sentinel");
        task.command = "exit 42".to_string();
        task.canceled_exit_code = 42;

        let entry = runner.start(task, HashMap::new()).await;
        runner.wait("sentinel", entry.run_id).await;

        let history = runner.get_history("sentinel", 10).await;
        assert_eq!(history[0].task.status, Status::Canceled);
    }

    #[rstest]
    #[case(0, 0, Status::Success)]
    #[case(1, 0, Status::Failed)]
    #[case(42, 42, Status::Canceled)]
    #[case(7, 42, Status::Failed)]
    fn classifies_exit_codes(
        #[case] code: i32,
        #[case] canceled_exit_code: i32,
        #[case] expected: Status,
    ) {
        let status = std::process::ExitStatus::from_raw(code);
        let outcome = classify_exit(status, canceled_exit_code);
        let actual = match outcome {
            CommandOutcome::Success => Status::Success,
            CommandOutcome::Canceled => Status::Canceled,
            CommandOutcome::Failed(_) => Status::Failed,
        };
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn allow_parallel_false_skips_second_run_while_first_is_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(4, 10, dir.path());

        let mut task = TaskConfig::new("exclusive");
        task.command = "sleep 1".to_string();
        task.allow_parallel = false;

        let first = runner.start(task.clone(), HashMap::new()).await;
        let second = runner.start(task.clone(), HashMap::new()).await;

        assert_eq!(second.task.status, Status::Canceled);
        assert_eq!(second.task.message, "skipped: still running");
        assert!(runner.stop("exclusive", first.run_id));
    }

    #[tokio::test]
    async fn invoke_passes_params_to_a_js_handler_event() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(4, 10, dir.path());

        let script_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            script_dir.path().join("greet.js"),
            "exports.handler = (event) => 'ok:' + event.x;\n",
        )
        .unwrap();

        let mut task = TaskConfig::new("greet");
        task.runtime = Runtime::Js;
        task.command = "greet.js".to_string();
        task.dir = script_dir.path().to_string_lossy().into_owned();

        let mut params = HashMap::new();
        params.insert("x".to_string(), "7".to_string());

        let outcome = runner.invoke(task, params).await;

        assert!(outcome.ok);
        assert_eq!(outcome.result, serde_json::json!("ok:7"));
    }

    #[tokio::test]
    async fn failed_enqueue_marks_the_node_failed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = make_runner(1, 0, dir.path());

        let mut blocker = TaskConfig::new("blocker");
        blocker.command = "sleep 1".to_string();
        let blocker_entry = runner.start(blocker, HashMap::new()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut blocked = TaskConfig::new("blocked");
        blocked.command = "true".to_string();
        let entry = runner.start(blocked, HashMap::new()).await;
        runner.wait("blocked", entry.run_id).await;

        let history = runner.get_history("blocked", 10).await;
        assert_eq!(history[0].task.status, Status::Failed);
        assert_eq!(history[0].task.message, "failed to enqueue");

        runner.wait("blocker", blocker_entry.run_id).await;
    }
}
