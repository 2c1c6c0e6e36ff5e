//! `globalThis.fs`, grounded on `goja_utils.RequireFs`/`SetupFsPromises`: synchronous
//! `readFileSync`/`writeFileSync`/`appendFileSync` run directly on the actor thread (they are
//! meant to block, the same as Node's), while `fs.promises.readFile`/`writeFile` hand off to the
//! tokio runtime and resolve a promise once done.

use std::fs;

use rquickjs::{Ctx, Function, Object, Persistent, Result as JsResult};

use super::HostHandle;

const FS_PROMISES_SHIM: &str = r#"
globalThis.fs.promises = {
    readFile: function (path) {
        return new Promise(function (resolve, reject) {
            __taskforge_fs_read_async(path, function (errText, text) {
                if (errText) { reject(new Error(errText)); } else { resolve(text); }
            });
        });
    },
    writeFile: function (path, text) {
        return new Promise(function (resolve, reject) {
            __taskforge_fs_write_async(path, text, function (errText) {
                if (errText) { reject(new Error(errText)); } else { resolve(); }
            });
        });
    },
};
"#;

pub(super) fn register(ctx: &Ctx<'_>, handle: HostHandle) -> JsResult<()> {
    let fs_obj = Object::new(ctx.clone())?;

    fs_obj.set(
        "readFileSync",
        Function::new(ctx.clone(), |path: String| -> String {
            fs::read_to_string(&path).unwrap_or_default()
        }),
    )?;
    fs_obj.set(
        "writeFileSync",
        Function::new(ctx.clone(), |path: String, text: String| -> bool {
            fs::write(&path, text).is_ok()
        }),
    )?;
    fs_obj.set(
        "appendFileSync",
        Function::new(ctx.clone(), |path: String, text: String| -> bool {
            use std::io::Write;
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut f| f.write_all(text.as_bytes()))
                .is_ok()
        }),
    )?;
    ctx.globals().set("fs", fs_obj)?;

    let read_handle = handle.clone();
    let read_native = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'_>, path: String, callback: Function<'_>| {
            let callback = Persistent::save(ctx.clone(), callback);
            read_handle.mark_pending();
            let reply_handle = read_handle.clone();
            read_handle.spawn_background(async move {
                let outcome = tokio::fs::read_to_string(&path).await;
                reply_handle.post(Box::new(move |ctx: &Ctx<'_>| {
                    let cb: Function = match callback.restore(ctx.clone()) {
                        Ok(cb) => cb,
                        Err(_) => return,
                    };
                    let (err_text, text) = match outcome {
                        Ok(text) => (String::new(), text),
                        Err(e) => (e.to_string(), String::new()),
                    };
                    let _ = cb.call::<_, ()>((err_text, text));
                }));
            });
            Ok::<_, rquickjs::Error>(())
        },
    )?;
    ctx.globals().set("__taskforge_fs_read_async", read_native)?;

    let write_handle = handle.clone();
    let write_native = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'_>, path: String, text: String, callback: Function<'_>| {
            let callback = Persistent::save(ctx.clone(), callback);
            write_handle.mark_pending();
            let reply_handle = write_handle.clone();
            write_handle.spawn_background(async move {
                let outcome = tokio::fs::write(&path, text).await;
                reply_handle.post(Box::new(move |ctx: &Ctx<'_>| {
                    let cb: Function = match callback.restore(ctx.clone()) {
                        Ok(cb) => cb,
                        Err(_) => return,
                    };
                    let err_text = outcome.err().map(|e| e.to_string()).unwrap_or_default();
                    let _ = cb.call::<_, ()>((err_text,));
                }));
            });
            Ok::<_, rquickjs::Error>(())
        },
    )?;
    ctx.globals().set("__taskforge_fs_write_async", write_native)?;

    ctx.eval::<(), _>(FS_PROMISES_SHIM.as_bytes())?;
    Ok(())
}
