//! `globalThis.fetch`, grounded on `goja_utils.EnableFetch`/`fetch`: a native call kicks off the
//! HTTP request on the actor's tokio runtime and resolves a JS-constructed promise once the
//! response body has been read in full.

use rquickjs::{Ctx, Function, Persistent, Result as JsResult};
use serde_json::Value as Json;

use super::HostHandle;

/// A minimal JS shim that exposes `fetch(url, options)` as a real `Promise`, built on top of the
/// native `__taskforge_fetch_native(url, optionsJson, callback)` registered below. Constructing
/// the `Promise` in JS sidesteps needing to drive rquickjs's promise-resolver API from Rust.
const FETCH_SHIM: &str = r#"
globalThis.fetch = function (url, options) {
    return new Promise(function (resolve, reject) {
        __taskforge_fetch_native(url, JSON.stringify(options || {}), function (errText, resultJson) {
            if (errText) {
                reject(new Error(errText));
                return;
            }
            var r = JSON.parse(resultJson);
            var bodyText = r.body;
            resolve({
                ok: r.status >= 200 && r.status < 300,
                status: r.status,
                headers: r.headers,
                text: function () { return bodyText; },
                json: function () { return JSON.parse(bodyText); },
            });
        });
    });
};
"#;

pub(super) fn register(ctx: &Ctx<'_>, handle: HostHandle) -> JsResult<()> {
    let native = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'_>, url: String, options_json: String, callback: Function<'_>| {
            // The callback only lives as long as this call's `Ctx`; `Persistent` is rquickjs's
            // escape hatch for carrying a JS value across the async boundary, restored against a
            // fresh `Ctx` from the same runtime once the request completes.
            let callback = Persistent::save(ctx.clone(), callback);
            let options: Json = serde_json::from_str(&options_json).unwrap_or(Json::Null);

            handle.mark_pending();
            let reply_handle = handle.clone();
            handle.spawn_background(async move {
                let outcome = run_request(&url, &options).await;
                reply_handle.post(Box::new(move |ctx: &Ctx<'_>| {
                    let cb: Function = match callback.restore(ctx.clone()) {
                        Ok(cb) => cb,
                        Err(_) => return,
                    };
                    let (err_text, result_json) = match outcome {
                        Ok(json) => (String::new(), serde_json::to_string(&json).unwrap_or_default()),
                        Err(message) => (message, String::new()),
                    };
                    let _ = cb.call::<_, ()>((err_text, result_json));
                }));
            });

            Ok::<_, rquickjs::Error>(())
        },
    )?;
    ctx.globals().set("__taskforge_fetch_native", native)?;
    ctx.eval::<(), _>(FETCH_SHIM.as_bytes())?;
    Ok(())
}

async fn run_request(url: &str, options: &Json) -> Result<Json, String> {
    let method = options
        .get("method")
        .and_then(|v| v.as_str())
        .unwrap_or("GET")
        .to_string();
    let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| e.to_string())?;

    let client = reqwest::Client::new();
    let mut builder = client.request(method, url);
    if let Some(headers) = options.get("headers").and_then(|v| v.as_object()) {
        for (key, value) in headers {
            if let Some(value) = value.as_str() {
                builder = builder.header(key, value);
            }
        }
    }
    if let Some(body) = options.get("body").and_then(|v| v.as_str()) {
        builder = builder.body(body.to_string());
    }

    let response = builder.send().await.map_err(|e| e.to_string())?;
    let status = response.status().as_u16();
    let headers: serde_json::Map<String, Json> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), Json::String(v.to_string()))))
        .collect();
    let body = response.text().await.map_err(|e| e.to_string())?;

    Ok(serde_json::json!({
        "status": status,
        "headers": Json::Object(headers),
        "body": body,
    }))
}
