//! Typed configuration loading.
//!
//! Mirrors `gofer::conf::Configuration<T: ConfigType>`: a [`Figment`] stack merges an embedded
//! default TOML, an optional config file, and environment variables, in that precedence order.
//! `taskforge` has a single config type ([`service::ServiceConfig`]) since the core runs as one
//! process with no separate CLI-to-server hop.

pub mod service;

use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::path::PathBuf;

pub trait ConfigType: Deserialize<'static> {
    fn default_config() -> &'static str;
    fn config_paths() -> Vec<PathBuf>;
    fn env_prefix() -> &'static str;
}

pub struct Configuration<T: ConfigType> {
    _marker: std::marker::PhantomData<T>,
}

impl<T: ConfigType> Configuration<T> {
    pub fn load(path_override: Option<PathBuf>) -> Result<T> {
        let mut config = Figment::new().merge(Toml::string(T::default_config()));

        if let Some(path) = path_override {
            config = config.merge(Toml::file(path));
        } else {
            for path in T::config_paths() {
                config = config.merge(Toml::file(path));
            }
        }

        // `__` separates nesting levels from underscored keys within a level; see
        // `gofer::conf::Configuration` for the rationale behind the double underscore.
        config = config.merge(Env::prefixed(T::env_prefix()).split("__"));
        let parsed_config: T = config.extract()?;

        Ok(parsed_config)
    }
}
