//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered in this order,
//! later sources overriding earlier ones:
//!
//! 1. Built-in defaults ([`EngineConfig::default`])
//! 2. `<dir>/wavefront.toml`, or the file named by `WAVEFRONT_CONFIG_PATH`
//! 3. `<dir>/wavefront.<environment>.toml`
//! 4. `WAVEFRONT__<SECTION>__<KEY>` environment variables

use super::error::{ConfigResult, ConfigurationError};
use super::EngineConfig;
use crate::logging::get_environment;
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const ENV_PREFIX: &str = "WAVEFRONT";

/// Loaded, validated engine configuration
#[derive(Debug)]
pub struct ConfigManager {
    config: EngineConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = get_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    ///
    /// Useful in tests that must not depend on process-wide variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading engine configuration"
        );

        let base_file = match std::env::var("WAVEFRONT_CONFIG_PATH") {
            Ok(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    return Err(ConfigurationError::ConfigFileNotFound { path });
                }
                path
            }
            Err(_) => config_directory.join("wavefront.toml"),
        };
        let env_file = config_directory.join(format!("wavefront.{environment}.toml"));

        let builder = Config::builder()
            .add_source(Config::try_from(&EngineConfig::default())?)
            .add_source(Self::optional_file(&base_file))
            .add_source(Self::optional_file(&env_file))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        info!(
            environment = environment,
            breakers_enabled = config.circuit_breakers.enabled,
            retry_strategy = ?config.retry.strategy,
            max_concurrency = config.scheduler.max_concurrency,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Parse configuration from an in-memory TOML document layered over defaults
    pub fn from_toml_str(contents: &str) -> ConfigResult<EngineConfig> {
        let config: EngineConfig = Config::builder()
            .add_source(Config::try_from(&EngineConfig::default())?)
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn optional_file(path: &Path) -> File<config::FileSourceFile, FileFormat> {
        File::from(path.to_path_buf())
            .format(FileFormat::Toml)
            .required(false)
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }
}
