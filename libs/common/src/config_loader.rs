//! Layered configuration loading
//!
//! Priority: ENV > file > Default

use std::path::Path;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};

/// Load a configuration value from defaults, an optional file and the environment
///
/// # Arguments
/// * `path` - Config file (YAML, TOML or JSON by extension); must exist when given
/// * `env_prefix` - Environment prefix, e.g. `BENCHCTL_`; nested keys use `__`
pub fn load_layered<T>(path: Option<&Path>, env_prefix: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
            Some("toml") => figment.merge(Toml::file(path)),
            Some("json") => figment.merge(Json::file(path)),
            other => {
                return Err(Error::Config(format!(
                    "unsupported config format {:?}: {}",
                    other,
                    path.display()
                )))
            },
        };
        info!("Config file: {}", path.display());
    }

    figment = figment.merge(Env::prefixed(env_prefix).split("__"));
    Ok(figment.extract()?)
}
