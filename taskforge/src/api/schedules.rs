//! `/schedules/`: register or remove a task's cron schedule.

use std::sync::Arc;

use dropshot::{endpoint, HttpError, HttpResponseOk, RequestContext, UntypedBody};
use schemars::JsonSchema;
use serde::Serialize;

use crate::api::{internal_error, ApiState};
use crate::manager::ManagerError;
use crate::scheduler::SchedulerError;

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ScheduleResponse {
    pub task_id: String,
    pub ok: bool,
}

/// Sets (or, with an empty `schedule` field, removes) the cron schedule for `taskId`.
#[endpoint(method = POST, path = "/schedules/")]
pub async fn post_schedule(
    rqctx: RequestContext<Arc<ApiState>>,
    body: UntypedBody,
) -> Result<HttpResponseOk<ScheduleResponse>, HttpError> {
    let api_state = rqctx.context();

    let fields: Vec<(String, String)> = serde_urlencoded::from_bytes(body.as_bytes())
        .map_err(|e| HttpError::for_bad_request(None, format!("could not parse form body: {e}")))?;

    let mut task_id = String::new();
    let mut spec = String::new();

    for (key, value) in fields {
        match key.as_str() {
            "taskId" => task_id = value,
            "schedule" | "spec" => spec = value,
            _ => {}
        }
    }

    if task_id.is_empty() {
        return Err(HttpError::for_bad_request(
            None,
            "missing required form field 'taskId'".to_string(),
        ));
    }

    api_state
        .manager
        .load(&task_id)
        .await
        .map_err(|e| match e {
            ManagerError::NotFound(_) => {
                HttpError::for_not_found(None, format!("task {task_id:?} not found"))
            }
            other => internal_error("could not load task", other),
        })?;

    api_state
        .scheduler
        .set(&task_id, &spec)
        .await
        .map_err(|e| match e {
            SchedulerError::BadSpec { spec, message } => HttpError::for_bad_request(
                None,
                format!("invalid schedule spec {spec:?}: {message}"),
            ),
            other => internal_error("could not set schedule", other),
        })?;

    Ok(HttpResponseOk(ScheduleResponse {
        task_id,
        ok: true,
    }))
}
