//! Sandboxed, single-threaded script execution context for `runtime: "js"` tasks.
//!
//! Grounded on `binzume/gotask`'s `goja_utils.JsRunner`: a script engine is confined to one
//! owning thread (quickjs contexts, like goja runtimes, are not `Send`), and every call the host
//! makes into the script is marshaled onto that thread. Where the original spawns a goroutine
//! for blocking I/O and reports back by queuing a microtask on the event loop, we spawn an OS
//! thread and post a boxed closure back onto the same channel the actor thread already drains
//! — the Rust equivalent of `StartGoroutineTask` + `QueueMicrotask`.

mod child_process;
mod fetch;
mod fs_module;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use rquickjs::{Context, Ctx, Function, Object, Runtime, Value};
use serde_json::Value as Json;
use tokio::sync::oneshot;

/// Installed as `globalThis.__taskforgeEntry`. Mirrors gotask's `InitScript`: a script registers
/// `exports.handler(event, context)`, and the adapter turns calling it into a (result, ok)
/// callback pair. Evaluated once per script load, before the script itself.
const INIT_SCRIPT: &str = r#"
var exports = {};
var module = { exports: exports };
var process = { env: {} };
globalThis.__taskforgeEntry = function (cb, data) {
    if (exports.handler) {
        process.env = data.env;
        Promise.resolve(exports.handler(data.event, data.context)).then(
            function (r) {
                if (typeof r === 'string') { r = { body: r }; }
                cb(r, true);
            },
            function (e) {
                cb({ error: String(e) }, false);
            }
        );
        return;
    }
    cb({ body: null }, true);
};
"#;

#[derive(thiserror::Error, Debug)]
pub enum ScriptHostError {
    #[error("could not read script {path}; {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("script {path} failed to load; {message}")]
    Load { path: String, message: String },

    #[error("script host actor terminated unexpectedly")]
    ActorGone,
}

/// A closure run with access to the live quickjs context, on the actor thread that owns it.
type VmJob = Box<dyn FnOnce(&Ctx<'_>) + Send + 'static>;

enum Message {
    Run(VmJob),
    Shutdown,
}

/// Background work a native capability (fetch/fs/child_process) has handed off to its own
/// thread; shared so [`ScriptHost::wait`] knows when the script is fully quiesced.
#[derive(Clone)]
pub(super) struct HostHandle {
    tx: std_mpsc::Sender<Message>,
    pending: Arc<AtomicI64>,
    /// The tokio runtime the actor was started under, captured once while [`ScriptHost::start`]
    /// is still running on a tokio worker thread. Lets native capabilities spawn real async
    /// tasks (fetch, async fs, child process waits) instead of parking an OS thread per call,
    /// same role as the goroutine behind `StartGoroutineTask` in the original.
    rt: tokio::runtime::Handle,
}

impl HostHandle {
    /// Posts a closure back onto the actor thread once background work completes, the Rust
    /// analogue of `QueueMicrotask`. Call sites increment `pending` before spawning their
    /// background work and this decrements it once the closure has actually run.
    pub(super) fn post(&self, job: VmJob) {
        let pending = self.pending.clone();
        let wrapped: VmJob = Box::new(move |ctx: &Ctx<'_>| {
            job(ctx);
            pending.fetch_sub(1, Ordering::SeqCst);
        });
        let _ = self.tx.send(Message::Run(wrapped));
    }

    pub(super) fn mark_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Runs `fut` on the captured tokio runtime, the equivalent of `StartGoroutineTask`'s `go
    /// func() { ... }`. Callers increment `pending` (via [`Self::mark_pending`]) before calling
    /// this and must eventually call [`Self::post`] from within `fut` to deliver the result and
    /// decrement it back down.
    pub(super) fn spawn_background<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.rt.spawn(fut);
    }
}

/// A running script instance. Owns a dedicated OS thread holding the quickjs runtime; every
/// public method here marshals its work onto that thread and waits for the result.
pub struct ScriptHost {
    tx: std_mpsc::Sender<Message>,
    handle: Option<JoinHandle<()>>,
    pending: Arc<AtomicI64>,
}

impl ScriptHost {
    /// Loads `path` on a fresh actor thread and evaluates the bootstrap closure against it. One
    /// instance is created per run and discarded afterward, matching `StartJsTask`'s lifecycle.
    pub async fn start(path: impl AsRef<Path>) -> Result<Self, ScriptHostError> {
        let path = path.as_ref().to_path_buf();
        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ScriptHostError::Io {
                path: path.display().to_string(),
                source,
            })?;

        let (tx, rx) = std_mpsc::channel::<Message>();
        let pending = Arc::new(AtomicI64::new(0));
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle_for_actor = HostHandle {
            tx: tx.clone(),
            pending: pending.clone(),
            rt: tokio::runtime::Handle::current(),
        };
        let actor_path = path.clone();
        let handle = std::thread::Builder::new()
            .name(format!("scripthost:{}", path.display()))
            .spawn(move || {
                Self::run_actor(actor_path, source, handle_for_actor, rx, ready_tx);
            })
            .map_err(|e| ScriptHostError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        ready_rx.await.map_err(|_| ScriptHostError::ActorGone)??;

        Ok(ScriptHost {
            tx,
            handle: Some(handle),
            pending,
        })
    }

    fn run_actor(
        path: PathBuf,
        source: String,
        handle: HostHandle,
        rx: std_mpsc::Receiver<Message>,
        ready_tx: oneshot::Sender<Result<(), ScriptHostError>>,
    ) {
        let setup = (|| -> Result<(Runtime, Context), ScriptHostError> {
            let runtime = Runtime::new().map_err(|e| ScriptHostError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            let context = Context::full(&runtime).map_err(|e| ScriptHostError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            context
                .with(|ctx| -> Result<(), String> {
                    child_process::register(&ctx, handle.clone()).map_err(|e| e.to_string())?;
                    fetch::register(&ctx, handle.clone()).map_err(|e| e.to_string())?;
                    fs_module::register(&ctx, handle.clone()).map_err(|e| e.to_string())?;
                    ctx.eval::<(), _>(INIT_SCRIPT.as_bytes())
                        .map_err(|e| format!("bootstrap closure failed: {e}"))?;
                    ctx.eval::<(), _>(source.as_bytes())
                        .map_err(|e| e.to_string())?;
                    Ok(())
                })
                .map_err(|message| ScriptHostError::Load {
                    path: path.display().to_string(),
                    message,
                })?;
            Ok((runtime, context))
        })();

        let (runtime, context) = match setup {
            Ok(pair) => {
                let _ = ready_tx.send(Ok(()));
                pair
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        for message in rx {
            match message {
                Message::Run(job) => {
                    context.with(|ctx| job(&ctx));
                    while runtime.is_job_pending() {
                        let _ = runtime.execute_pending_job();
                    }
                }
                Message::Shutdown => break,
            }
        }
    }

    /// Invokes the script's handler with `params` as the event and `{env, name}` as context.
    /// Blocks until the handler's returned promise settles.
    pub async fn execute(
        &self,
        params: &HashMap<String, String>,
        env: &HashMap<String, String>,
        name: &str,
    ) -> Result<(Json, bool), ScriptHostError> {
        let (reply_tx, reply_rx) = oneshot::channel::<(Json, bool)>();
        let params_json = serde_json::to_value(params).unwrap_or(Json::Null);
        let env_json = serde_json::to_value(env).unwrap_or(Json::Null);
        let name = name.to_string();

        let job: VmJob = Box::new(move |ctx: &Ctx<'_>| {
            invoke_handler(ctx, &params_json, &env_json, &name, reply_tx);
        });
        // `invoke_handler` only arranges for `reply_tx` to fire eventually (possibly from a
        // later pending-job drain on this same actor thread, once the handler's promise
        // settles); it does not resolve synchronously.

        self.tx
            .send(Message::Run(job))
            .map_err(|_| ScriptHostError::ActorGone)?;

        reply_rx.await.map_err(|_| ScriptHostError::ActorGone)
    }

    /// Drains background work (spawned by `fetch`/`fs`/`child_process` calls) until none
    /// remains pending, mirroring `JsRunner.Wait`'s stop/restart-until-empty loop.
    pub async fn wait(&self) -> Result<(), ScriptHostError> {
        loop {
            if self.pending.load(Ordering::SeqCst) <= 0 {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    /// Terminates the actor thread. No further calls are permitted afterward.
    pub async fn close(mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

/// Parses `text` via the VM's own `JSON.parse`, sidestepping version-specific helper methods on
/// `Ctx`/`Value` for JSON conversion.
fn json_parse<'js>(ctx: &Ctx<'js>, json: &Json) -> rquickjs::Result<Value<'js>> {
    let text = serde_json::to_string(json).unwrap_or_else(|_| "null".to_string());
    let json_global: Object = ctx.globals().get("JSON")?;
    let parse: Function = json_global.get("parse")?;
    parse.call((text,))
}

fn json_stringify(ctx: &Ctx<'_>, value: Value<'_>) -> rquickjs::Result<Json> {
    let json_global: Object = ctx.globals().get("JSON")?;
    let stringify: Function = json_global.get("stringify")?;
    let text: String = stringify.call((value,))?;
    Ok(serde_json::from_str(&text).unwrap_or(Json::Null))
}

/// Calls `__taskforgeEntry(callback, data)` and arranges for `reply_tx` to be sent exactly once
/// when `callback` fires — whether that happens synchronously (a handler that returns a plain
/// value, not a promise) or later, while the actor loop drains pending microtasks after a
/// handler's promise settles. The sender is wrapped so the `Fn`-bound quickjs callback can move
/// it without requiring `FnOnce`.
fn invoke_handler(
    ctx: &Ctx<'_>,
    params: &Json,
    env: &Json,
    name: &str,
    reply_tx: oneshot::Sender<(Json, bool)>,
) {
    let reply_tx = Arc::new(std::sync::Mutex::new(Some(reply_tx)));

    let entry: Function = match ctx.globals().get("__taskforgeEntry") {
        Ok(f) => f,
        Err(_) => {
            send_reply(&reply_tx, Json::String("no entry point".into()), false);
            return;
        }
    };

    let event = json_parse(ctx, params).unwrap_or_else(|_| Value::new_undefined(ctx.clone()));
    let js_env = json_parse(ctx, env).unwrap_or_else(|_| Value::new_undefined(ctx.clone()));

    let context_obj = Object::new(ctx.clone()).expect("object alloc");
    let _ = context_obj.set("env", js_env.clone());
    let _ = context_obj.set("name", name);

    let data = Object::new(ctx.clone()).expect("object alloc");
    let _ = data.set("env", js_env);
    let _ = data.set("event", event);
    let _ = data.set("context", context_obj);

    let reply_for_cb = reply_tx.clone();
    let callback = Function::new(ctx.clone(), move |ctx: Ctx<'_>, value: Value<'_>, ok: bool| {
        let json = json_stringify(&ctx, value).unwrap_or(Json::Null);
        send_reply(&reply_for_cb, json, ok);
    })
    .expect("callback alloc");

    let call_result: rquickjs::Result<Value> = entry.call((callback, data));
    if let Err(e) = call_result {
        send_reply(&reply_tx, Json::String(e.to_string()), false);
    }
}

/// Sends on `reply_tx` at most once; a handler that never resolves its promise simply leaves the
/// caller's `reply_rx.await` pending, same as a script that never calls back in the original.
fn send_reply(reply_tx: &Arc<std::sync::Mutex<Option<oneshot::Sender<(Json, bool)>>>>, json: Json, ok: bool) {
    if let Some(tx) = reply_tx.lock().expect("reply mutex poisoned").take() {
        let _ = tx.send((json, ok));
    }
}
