//! `/tasks/` and `/tasks/{task_id}/`: listing, inspecting, and driving runs of a task.

use std::collections::HashMap;
use std::sync::Arc;

use dropshot::{endpoint, Body, HttpError, HttpResponseOk, Path, RequestContext, UntypedBody};
use hyper::{header, StatusCode};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::api::{internal_error, ApiState};
use crate::manager::ManagerError;
use crate::models::{LogEntry, SchedulerEntry, TaskConfig};
use crate::runner::InvokeOutcome;

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct TaskListEntry {
    pub task_id: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct TaskPathArgs {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct TaskDetailResponse {
    pub task: TaskConfig,
    pub recent: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<SchedulerEntry>,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct TaskActionResponse {
    pub task_id: String,
    pub run_id: i64,
    pub ok: bool,
}

/// List every task the configured `tasks_dir` resolves.
#[endpoint(method = GET, path = "/tasks/")]
pub async fn list_tasks(
    rqctx: RequestContext<Arc<ApiState>>,
) -> Result<HttpResponseOk<Vec<TaskListEntry>>, HttpError> {
    let api_state = rqctx.context();

    let items = api_state
        .manager
        .tasks()
        .await
        .map_err(|e| internal_error("could not list tasks", e))?;

    let out = items
        .into_iter()
        .map(|item| TaskListEntry {
            task_id: item.task_id,
        })
        .collect();

    Ok(HttpResponseOk(out))
}

/// Inspect one task: its config, up to 50 recent run history entries, and its schedule (if any).
#[endpoint(method = GET, path = "/tasks/{task_id}/")]
pub async fn get_task(
    rqctx: RequestContext<Arc<ApiState>>,
    path: Path<TaskPathArgs>,
) -> Result<HttpResponseOk<TaskDetailResponse>, HttpError> {
    let api_state = rqctx.context();
    let task_id = path.into_inner().task_id;

    let task = load_task(api_state, &task_id).await?;
    let recent = api_state.runner.get_history(&task_id, 50).await;
    let schedule = api_state.scheduler.get_schedule(&task_id);

    Ok(HttpResponseOk(TaskDetailResponse {
        task,
        recent,
        schedule,
    }))
}

/// Drives a task: starts a run (default), stops one (`action=stop`), or runs it synchronously
/// and returns its result (`action=invoke`). Form fields prefixed `VARS.` or `PARAMS.` become
/// invocation params, matching the original implementation's accepted dual prefix.
#[endpoint(method = POST, path = "/tasks/{task_id}/")]
pub async fn post_task(
    rqctx: RequestContext<Arc<ApiState>>,
    path: Path<TaskPathArgs>,
    body: UntypedBody,
) -> Result<hyper::Response<Body>, HttpError> {
    let api_state = rqctx.context();
    let task_id = path.into_inner().task_id;

    let task = load_task(api_state, &task_id).await?;

    let fields: Vec<(String, String)> = serde_urlencoded::from_bytes(body.as_bytes())
        .map_err(|e| HttpError::for_bad_request(None, format!("could not parse form body: {e}")))?;

    let mut action = String::new();
    let mut run_id: i64 = 0;
    let mut params = HashMap::new();

    for (key, value) in fields {
        if key == "action" {
            action = value;
        } else if key == "runId" {
            run_id = value.parse().unwrap_or(0);
        } else if let Some(rest) = key.strip_prefix("VARS.") {
            params.insert(rest.to_string(), value);
        } else if let Some(rest) = key.strip_prefix("PARAMS.") {
            params.insert(rest.to_string(), value);
        }
    }

    match action.as_str() {
        "stop" => {
            let ok = api_state.runner.stop(&task_id, run_id);
            json_response(&TaskActionResponse {
                task_id,
                run_id,
                ok,
            })
        }
        "invoke" => {
            let outcome = api_state.runner.invoke(task, params).await;
            invoke_response(outcome)
        }
        _ => {
            let entry = api_state.runner.start(task, params).await;
            json_response(&TaskActionResponse {
                task_id: entry.task_id,
                run_id: entry.run_id,
                ok: true,
            })
        }
    }
}

async fn load_task(api_state: &ApiState, task_id: &str) -> Result<TaskConfig, HttpError> {
    api_state.manager.load(task_id).await.map_err(|e| match e {
        ManagerError::NotFound(_) => {
            HttpError::for_not_found(None, format!("task {task_id:?} not found"))
        }
        other => internal_error("could not load task", other),
    })
}

fn json_response(value: &impl Serialize) -> Result<hyper::Response<Body>, HttpError> {
    let bytes =
        serde_json::to_vec(value).map_err(|e| internal_error("could not serialize response", e))?;

    Ok(hyper::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap())
}

/// Shapes the response of `action=invoke`: a string `body` field in the result becomes the raw
/// response body, with `headers`/`statusCode` from the result applied; otherwise the whole
/// result is returned as JSON.
fn invoke_response(outcome: InvokeOutcome) -> Result<hyper::Response<Body>, HttpError> {
    let Some(body) = outcome.result.get("body").and_then(Json::as_str) else {
        return json_response(&outcome.result);
    };

    let status = outcome
        .result
        .get("statusCode")
        .and_then(Json::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);

    let mut builder = hyper::Response::builder().status(status);
    if let Some(headers) = outcome.result.get("headers").and_then(Json::as_object) {
        for (key, value) in headers {
            if let Some(value) = value.as_str() {
                builder = builder.header(key.as_str(), value);
            }
        }
    }

    Ok(builder.body(Body::from(body.to_string())).unwrap())
}
