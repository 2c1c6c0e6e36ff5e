//! `globalThis.child_process`, grounded on `goja_utils.RequireChildProcess`: `exec`/`execFile`
//! run a subprocess on the actor's tokio runtime and deliver `(err, stdout, stderr)` to a
//! Node-style callback; `execSync`/`execFileSync`/`spawnSync` block the actor thread directly,
//! the same way the original shells out synchronously before returning to the VM.
//!
//! `spawnSync` fixes a bug present in the original: a failed command there returns `nil`,
//! discarding stderr and the exit code. Here it always returns `{output, stderr, status}`, with
//! `status` holding the real exit code (or `-1` if the process could not be started at all) even
//! on failure.

use std::process::{Command, Output};

use rquickjs::{Ctx, Function, Object, Persistent, Result as JsResult};

use super::HostHandle;
use crate::util::shell_invocation;

/// The invoking shell and its fixed leading arguments as owned `String`s, ready to have the
/// command string pushed on. Wraps [`shell_invocation`] (whose `&'static str` slice can't carry
/// a borrowed command string) for the callers below.
fn shell() -> (&'static str, Vec<String>) {
    let (program, args) = shell_invocation();
    (program, args.iter().map(|s| s.to_string()).collect())
}

fn output_to_object<'js>(ctx: &Ctx<'js>, output: &Output) -> JsResult<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("output", String::from_utf8_lossy(&output.stdout).to_string())?;
    obj.set("stderr", String::from_utf8_lossy(&output.stderr).to_string())?;
    obj.set("status", output.status.code().unwrap_or(-1))?;
    Ok(obj)
}

pub(super) fn register(ctx: &Ctx<'_>, handle: HostHandle) -> JsResult<()> {
    let cp = Object::new(ctx.clone())?;

    cp.set(
        "execSync",
        Function::new(ctx.clone(), |cmd: String| -> String {
            let (program, mut args) = shell();
            args.push(cmd);
            Command::new(program)
                .args(args)
                .output()
                .ok()
                .map(|out| String::from_utf8_lossy(&out.stdout).to_string())
                .unwrap_or_default()
        }),
    )?;

    cp.set(
        "execFileSync",
        Function::new(ctx.clone(), |cmd: String, args: Vec<String>| -> String {
            Command::new(cmd)
                .args(args)
                .output()
                .ok()
                .map(|out| String::from_utf8_lossy(&out.stdout).to_string())
                .unwrap_or_default()
        }),
    )?;

    cp.set(
        "spawnSync",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'_>, cmd: String, args: Vec<String>| -> JsResult<Object<'_>> {
                match Command::new(&cmd).args(&args).output() {
                    Ok(output) => output_to_object(&ctx, &output),
                    Err(e) => {
                        let obj = Object::new(ctx)?;
                        obj.set("output", "")?;
                        obj.set("stderr", e.to_string())?;
                        obj.set("status", -1)?;
                        Ok(obj)
                    }
                }
            },
        ),
    )?;

    let exec_handle = handle.clone();
    cp.set(
        "exec",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>, cmd: String, callback: Function<'_>| {
                let (program, mut args) = shell();
                args.push(cmd);
                spawn_exec(&exec_handle, ctx, program.to_string(), args, callback)
            },
        ),
    )?;

    let exec_file_handle = handle.clone();
    cp.set(
        "execFile",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'_>, cmd: String, args: Vec<String>, callback: Function<'_>| {
                spawn_exec(&exec_file_handle, ctx, cmd, args, callback)
            },
        ),
    )?;

    ctx.globals().set("child_process", cp)?;
    Ok(())
}

fn spawn_exec(
    handle: &HostHandle,
    ctx: Ctx<'_>,
    program: String,
    args: Vec<String>,
    callback: Function<'_>,
) -> JsResult<()> {
    let callback = Persistent::save(ctx.clone(), callback);
    handle.mark_pending();
    let reply_handle = handle.clone();
    handle.spawn_background(async move {
        let outcome = tokio::process::Command::new(&program)
            .args(&args)
            .output()
            .await;
        reply_handle.post(Box::new(move |ctx: &Ctx<'_>| {
            let cb: Function = match callback.restore(ctx.clone()) {
                Ok(cb) => cb,
                Err(_) => return,
            };
            match outcome {
                Ok(output) => {
                    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                    let _ = cb.call::<_, ()>(("", stdout, stderr));
                }
                Err(e) => {
                    let _ = cb.call::<_, ()>((e.to_string(), "", ""));
                }
            }
        }));
    });
    Ok(())
}
