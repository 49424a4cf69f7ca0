use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::AppConfig;

/// Prefix of the environment variables overriding file settings, e.g. `QUIESCE_PORT`.
pub const ENV_PREFIX: &str = "QUIESCE";

/// Load configuration from an optional file, overlaid by `QUIESCE_*` environment
/// variables. Supports YAML, JSON and TOML files.
pub fn load_config(config_path: Option<&str>) -> Result<AppConfig> {
    load_config_with_env(config_path, Environment::with_prefix(ENV_PREFIX))
}

/// Same as [`load_config`] with an explicit environment source, which lets tests
/// supply variables without touching the process environment.
pub fn load_config_with_env(config_path: Option<&str>, env: Environment) -> Result<AppConfig> {
    let mut builder = Config::builder();

    if let Some(config_path) = config_path {
        let path = Path::new(config_path);
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            Some("toml") => FileFormat::Toml,
            _ => FileFormat::Toml,
        };
        builder = builder.add_source(File::new(config_path, format));
    }

    let settings = builder
        .add_source(env.prefix_separator("_").separator("__").try_parsing(true))
        .build()
        .with_context(|| match config_path {
            Some(path) => format!("Failed to build config from {path}"),
            None => "Failed to build config from environment".to_string(),
        })?;

    let app_config: AppConfig = settings
        .try_deserialize()
        .context("Failed to deserialize application config")?;

    Ok(app_config)
}
