use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::oauth::CredentialStore;
use crate::router::PolicyRule;

pub const ANTHROPIC_HOST: &str = "https://api.anthropic.com";
pub const ANTHROPIC_DEFAULT_MODEL: &str = "claude-sonnet-4-6";
pub const OPENAI_HOST: &str = "https://api.openai.com";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";
pub const OLLAMA_HOST: &str = "http://localhost:11434";
pub const OLLAMA_MODEL: &str = "codestral";

// Unified enum to wrap different provider configurations
pub enum ProviderConfig {
    Anthropic(AnthropicProviderConfig),
    OpenAi(OpenAiProviderConfig),
    Ollama(OllamaProviderConfig),
}

pub enum AnthropicAuth {
    /// Static key. Keys from the OAuth family are sent as bearer tokens.
    ApiKey(String),
    /// Delegated credential borrowed from a local CLI login
    OAuth(Arc<CredentialStore>),
}

pub struct AnthropicProviderConfig {
    pub host: String,
    pub model: String,
    pub auth: AnthropicAuth,
    /// The host is a relay that authenticates on our behalf and speaks the
    /// relay event format
    pub relay: bool,
}

impl AnthropicProviderConfig {
    pub fn new(auth: AnthropicAuth) -> Self {
        Self {
            host: ANTHROPIC_HOST.to_string(),
            model: ANTHROPIC_DEFAULT_MODEL.to_string(),
            auth,
            relay: false,
        }
    }
}

pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
}

pub struct OllamaProviderConfig {
    pub host: String,
    pub model: String,
}

impl Default for OllamaProviderConfig {
    fn default() -> Self {
        Self {
            host: OLLAMA_HOST.to_string(),
            model: OLLAMA_MODEL.to_string(),
        }
    }
}

/// One provider entry as written in a configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// `anthropic`, `openai` or `ollama`
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
    /// Credential reference, resolved through [`crate::credentials`]
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
}

/// Everything needed to assemble a router
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}
