use crate::error::{to_env_var, ConfigError, ENV_PREFIX};
use config::{Config, Environment, File};
use forge::agent::AgentConfig;
use forge::memory::RetentionPolicy;
use forge::providers::configs::RouterConfig;
use forge::router::parse_model_id;
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;

/// Points at the settings file, overriding the default location
pub const CONFIG_PATH_ENV: &str = "FORGE_CONFIG";

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolSettings {
    /// Base URL of the external tool executor
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub ai: RouterConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub memory: RetentionPolicy,
    #[serde(default)]
    pub tools: ToolSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load_and_validate(config_path())
    }

    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        Self::load_and_validate(Some(path))
    }

    fn load_and_validate(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?;
        if let Some(path) = path {
            tracing::debug!("reading settings from {}", path.display());
            builder = builder.add_source(File::from(path).required(false));
        }
        let config = builder
            // Layer on the environment variables
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = match config.try_deserialize() {
            Ok(settings) => settings,
            Err(config::ConfigError::NotFound(field)) => {
                return Err(ConfigError::MissingEnvVar {
                    env_var: to_env_var(&field),
                })
            }
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);
                return Err(ConfigError::Other(err));
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(model) = &self.ai.default_model {
            match parse_model_id(model) {
                Ok((_, Some(_))) => {}
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "{} must look like provider/model, got '{}'",
                        to_env_var("ai.default_model"),
                        model
                    )))
                }
            }
        }
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        self.memory
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

fn config_path() -> Option<PathBuf> {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => dirs::home_dir().map(|home| home.join(".config").join("forge").join("config.toml")),
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}
