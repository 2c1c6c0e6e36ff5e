//! The HTTP transport for taskforge: a thin dropshot layer over [`Manager`]/[`Runner`]/
//! [`Scheduler`]. Mirrors `gofer::api::mod`'s shape (an `ApiState`, `init_logger`,
//! `init_api_description`, `start_web_service`, a request-logging `Middleware`) scaled down to
//! the handful of routes `gotask` needs.

mod schedules;
mod static_router;
mod tasks;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dropshot::{
    ApiDescription, Body, ConfigDropshot, DropshotState, HandlerError, HandlerTaskMode, HttpError,
    HttpServer, ServerBuilder, ServerContext,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use crate::conf::service::ServiceConfig;
use crate::manager::Manager;
use crate::runner::Runner;
use crate::scheduler::Scheduler;

/// Holds everything a route handler needs: the read-only config plus the three collaborators
/// the rest of the crate is built around. Mirrors `gofer::api::ApiState` holding `storage`/
/// `scheduler`/`object_store` as constructor-injected fields rather than globals.
pub struct ApiState {
    pub config: ServiceConfig,
    pub manager: Arc<Manager>,
    pub runner: Arc<Runner>,
    pub scheduler: Arc<Scheduler>,
}

impl ApiState {
    pub fn new(
        config: ServiceConfig,
        manager: Arc<Manager>,
        runner: Arc<Runner>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            config,
            manager,
            runner,
            scheduler,
        }
    }
}

/// Configures the process-wide `tracing` subscriber the way `gofer::api::init_logger` does:
/// quiet the chatty transitive crates, then pick pretty or JSON output depending on
/// `development.pretty_logging`.
pub fn init_logger(log_level: &str, pretty: bool) -> Result<()> {
    let level =
        LevelFilter::from_str(log_level).context("could not parse 'log_level' configuration")?;

    let filter = EnvFilter::from_default_env()
        .add_directive("hyper=off".parse().expect("invalid directive"))
        .add_directive("h2=off".parse().expect("invalid directive"))
        .add_directive("rustls=off".parse().expect("invalid directive"))
        .add_directive("reqwest=off".parse().expect("invalid directive"))
        .add_directive("dropshot=off".parse().expect("invalid directive"))
        .add_directive(level.into());

    if pretty {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
        warn!("pretty logging activated due to config value 'development.pretty_logging'");
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    }

    Ok(())
}

/// Registers the handlers into the API harness. Can panic: a route with a malformed path or
/// duplicate method+path is a programming error we want to fail fast on, not paper over.
fn register_routes(api: &mut ApiDescription<Arc<ApiState>>) {
    /* /tasks/ */
    api.register(tasks::list_tasks).unwrap();
    api.register(tasks::get_task).unwrap();
    api.register(tasks::post_task).unwrap();

    /* /schedules/ */
    api.register(schedules::post_schedule).unwrap();

    /* /tasklogs/{path} */
    api.register(static_router::tasklogs_handler).unwrap();

    /* / and everything else */
    api.register(static_router::static_handler).unwrap();
}

fn init_api_description() -> Result<ApiDescription<Arc<ApiState>>> {
    let mut api = ApiDescription::new();
    register_routes(&mut api);
    Ok(api)
}

/// Starts the HTTP service. Blocks until the server shuts down (ctrl-c/SIGTERM).
pub async fn start_web_service(config: ServiceConfig, api_state: Arc<ApiState>) -> Result<()> {
    let host = if config.http.host.is_empty() {
        "0.0.0.0"
    } else {
        &config.http.host
    };
    let bind_address = format!("{host}:{}", config.http.port);
    let bind_address = SocketAddr::from_str(&bind_address).with_context(|| {
        format!(
            "could not parse url '{bind_address}' while trying to bind to port; \
             should be '<ip>:<port>', not a hostname"
        )
    })?;

    let dropshot_conf = ConfigDropshot {
        bind_address,
        default_request_body_max_bytes: 10 * 1024 * 1024,
        default_handler_task_mode: HandlerTaskMode::Detached,
    };

    let api = init_api_description()?;

    let server = ServerBuilder::new(api, api_state, Some(Arc::new(Middleware)))
        .config(dropshot_conf)
        .tls(None)
        .start()
        .map_err(|error| anyhow!("failed to create server: {error}"))?;

    let shutdown = server.wait_for_shutdown();
    tokio::spawn(wait_for_shutdown_signal(server));

    info!(
        host = %bind_address.ip(),
        port = %bind_address.port(),
        "started taskforge http service"
    );

    shutdown
        .await
        .map_err(|error| anyhow!("server encountered errors while running: {error:#?}"))
}

async fn wait_for_shutdown_signal(server: HttpServer<Arc<ApiState>>) {
    listen_for_terminate_signal().await;
    server.close().await.unwrap()
}

async fn listen_for_terminate_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn format_duration(duration: std::time::Duration) -> String {
    let millis = duration.as_millis();
    if millis > 0 {
        format!("{millis}ms")
    } else {
        format!("{}us", duration.as_micros())
    }
}

#[derive(Debug)]
struct Middleware;

#[async_trait::async_trait]
impl<C: ServerContext> dropshot::Middleware<C> for Middleware {
    async fn handle(
        &self,
        server: Arc<DropshotState<C>>,
        request: hyper::Request<hyper::body::Incoming>,
        request_id: String,
        remote_addr: SocketAddr,
        next: fn(
            Arc<DropshotState<C>>,
            hyper::Request<hyper::body::Incoming>,
            String,
            SocketAddr,
        ) -> Pin<
            Box<dyn Future<Output = Result<hyper::Response<Body>, HandlerError>> + Send>,
        >,
    ) -> Result<hyper::Response<Body>, HandlerError> {
        let start_time = std::time::Instant::now();
        let method = request.method().as_str().to_string();
        let uri = request.uri().to_string();

        let response = next(server, request, request_id.clone(), remote_addr).await;

        if let Ok(response) = &response {
            info!(
                remote_addr = %remote_addr,
                req_id = request_id,
                method = method,
                uri = uri,
                response_code = response.status().as_str(),
                latency = format_duration(start_time.elapsed()),
                "request completed"
            );
        }

        response
    }
}

/// Logs then converts an internal error into an opaque 500, following `gofer`'s `http_error!`
/// convention of always logging the underlying cause even though the client only sees a generic
/// message.
pub(crate) fn internal_error(context: &str, err: impl std::fmt::Display) -> HttpError {
    tracing::error!(message = context, error = %err);
    HttpError::for_internal_error(format!("{context}: {err}"))
}
