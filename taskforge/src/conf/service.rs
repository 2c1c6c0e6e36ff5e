//! The `taskforge` service's configuration, generalizing the four ad hoc `GOTASK_*`
//! environment variables the original implementation read directly in `main()` into a typed
//! [`ServiceConfig`], modeled on `gofer::conf::api::ApiConfig`.

use crate::conf::ConfigType;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_SERVICE_CONFIG: &str = include_str!("./default_service_config.toml");

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ServiceConfig {
    pub http: Http,
    pub development: Development,

    /// Directory task definitions (`<id>.yaml`/`.sh`/`.js`) are resolved from.
    pub tasks_dir: String,

    /// Directory run history (`task.log`) and per-step log files are written to.
    pub log_dir: String,

    /// Path to the scheduler's persisted YAML.
    pub schedules_path: String,

    /// Overrides the process's local timezone at startup, e.g. `JST-9`. Empty disables the
    /// override.
    #[serde(default)]
    pub fixed_tz: String,

    /// Task Queue concurrency bound.
    pub parallel: usize,

    /// Task Queue advertised buffer depth; 0 is legal (rendezvous handoff).
    pub queue_size: usize,

    /// The entire service's log level.
    pub log_level: String,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Http {
    pub port: u16,
    pub host: String,
    pub static_dir: String,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Development {
    pub pretty_logging: bool,
}

impl ConfigType for ServiceConfig {
    fn default_config() -> &'static str {
        DEFAULT_SERVICE_CONFIG
    }

    fn config_paths() -> Vec<PathBuf> {
        vec![PathBuf::from("/etc/taskforge/taskforge.toml"), PathBuf::from("./taskforge.toml")]
    }

    fn env_prefix() -> &'static str {
        "GOTASK_"
    }
}

impl ServiceConfig {
    /// Applies the four flat, non-nested environment variables the original implementation
    /// read directly (`GOTASK_HTTP_PORT`, `GOTASK_HTTP_HOST`, `GOTASK_HTTP_STATIC_DIR`,
    /// `GOTASK_FIXED_TZ`) on top of whatever [`crate::conf::Configuration::load`] already
    /// resolved, so old deployments' environments keep working verbatim even though the typed
    /// config otherwise expects `GOTASK_HTTP__PORT`-style double-underscore nesting.
    pub fn apply_legacy_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("GOTASK_HTTP_PORT") {
            self.http.port = v
                .parse()
                .with_context(|| format!("invalid GOTASK_HTTP_PORT value {v:?}"))?;
        }
        if let Ok(v) = std::env::var("GOTASK_HTTP_HOST") {
            self.http.host = v;
        }
        if let Ok(v) = std::env::var("GOTASK_HTTP_STATIC_DIR") {
            self.http.static_dir = v;
        }
        if let Ok(v) = std::env::var("GOTASK_FIXED_TZ") {
            self.fixed_tz = v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Configuration;

    #[test]
    fn loads_defaults() {
        let config = Configuration::<ServiceConfig>::load(Some(PathBuf::from(
            "/nonexistent/taskforge.toml",
        )))
        .unwrap();
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.parallel, 8);
        assert_eq!(config.tasks_dir, "./tasks");
    }

    #[test]
    fn legacy_env_override_takes_precedence() {
        std::env::set_var("GOTASK_HTTP_PORT", "9999");
        let mut config = Configuration::<ServiceConfig>::load(Some(PathBuf::from(
            "/nonexistent/taskforge.toml",
        )))
        .unwrap();
        config.apply_legacy_env_overrides().unwrap();
        std::env::remove_var("GOTASK_HTTP_PORT");
        assert_eq!(config.http.port, 9999);
    }
}
