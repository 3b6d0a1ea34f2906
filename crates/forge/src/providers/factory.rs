use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use super::{
    anthropic::AnthropicProvider,
    base::Provider,
    configs::{
        AnthropicAuth, AnthropicProviderConfig, OllamaProviderConfig, OpenAiProviderConfig,
        ProviderConfig, ProviderDescriptor, RouterConfig, ANTHROPIC_DEFAULT_MODEL, OLLAMA_HOST,
        OLLAMA_MODEL, OPENAI_DEFAULT_MODEL, OPENAI_HOST,
    },
    oauth::{find_account_file, CredentialStore},
    ollama::OllamaProvider,
    openai::OpenAiProvider,
};
use crate::credentials::resolve_secret;
use crate::errors::{ForgeError, ForgeResult};
use crate::router::Router;

/// When set, anthropic traffic goes to this relay instead of the vendor
pub const PROXY_ENV: &str = "ANTHROPIC_PROXY";

#[derive(EnumIter, EnumString, Display, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum ProviderType {
    Anthropic,
    OpenAi,
    Ollama,
}

pub fn get_provider(config: ProviderConfig) -> ForgeResult<Arc<dyn Provider>> {
    match config {
        ProviderConfig::Anthropic(anthropic_config) => {
            Ok(Arc::new(AnthropicProvider::new(anthropic_config)?))
        }
        ProviderConfig::OpenAi(openai_config) => Ok(Arc::new(OpenAiProvider::new(openai_config)?)),
        ProviderConfig::Ollama(ollama_config) => Ok(Arc::new(OllamaProvider::new(ollama_config)?)),
    }
}

fn or_default(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Turn a configuration entry into a provider config, resolving its
/// credential reference. An anthropic entry without a key yields `None`.
pub fn provider_config(descriptor: &ProviderDescriptor) -> ForgeResult<Option<ProviderConfig>> {
    let provider_type = ProviderType::from_str(&descriptor.name).map_err(|_| {
        let known: Vec<String> = ProviderType::iter().map(|p| p.to_string()).collect();
        ForgeError::Configuration(format!(
            "unknown provider '{}', expected one of: {}",
            descriptor.name,
            known.join(", ")
        ))
    })?;

    let api_key = if descriptor.api_key.is_empty() {
        String::new()
    } else {
        resolve_secret(&descriptor.api_key)?
    };

    let config = match provider_type {
        ProviderType::Anthropic => {
            if api_key.is_empty() {
                return Ok(None);
            }
            let mut config = AnthropicProviderConfig::new(AnthropicAuth::ApiKey(api_key));
            if !descriptor.endpoint.is_empty() {
                config.host = descriptor.endpoint.clone();
            }
            config.model = or_default(&descriptor.model, ANTHROPIC_DEFAULT_MODEL);
            ProviderConfig::Anthropic(config)
        }
        ProviderType::OpenAi => ProviderConfig::OpenAi(OpenAiProviderConfig {
            host: or_default(&descriptor.endpoint, OPENAI_HOST),
            api_key,
            model: or_default(&descriptor.model, OPENAI_DEFAULT_MODEL),
        }),
        ProviderType::Ollama => ProviderConfig::Ollama(OllamaProviderConfig {
            host: or_default(&descriptor.endpoint, OLLAMA_HOST),
            model: or_default(&descriptor.model, OLLAMA_MODEL),
        }),
    };
    Ok(Some(config))
}

/// A delegated-credential anthropic config backed by a local account file
pub fn delegated_config(account_file: &Path) -> ForgeResult<AnthropicProviderConfig> {
    let store = CredentialStore::from_account_file(account_file)?;
    Ok(AnthropicProviderConfig::new(AnthropicAuth::OAuth(Arc::new(store))))
}

/// Build a router from configuration and the process environment
pub fn build_router(config: &RouterConfig) -> ForgeResult<Router> {
    let proxy = std::env::var(PROXY_ENV).ok().filter(|p| !p.is_empty());
    build_router_with(config, proxy, find_account_file())
}

fn route_through(config: &mut AnthropicProviderConfig, proxy: &str) {
    config.host = proxy.to_string();
    config.relay = true;
}

/// Build a router.
///
/// Entries that cannot be built are logged and skipped. When no anthropic
/// entry is configured the delegated account file is used, if one exists.
/// With a relay, anthropic is always registered and sends no credentials.
/// A local model server is always registered.
pub fn build_router_with(
    config: &RouterConfig,
    proxy: Option<String>,
    account_file: Option<PathBuf>,
) -> ForgeResult<Router> {
    let mut router = Router::new(config.policies.clone(), config.default_model.clone());

    for descriptor in &config.providers {
        let built = provider_config(descriptor).and_then(|config| match config {
            Some(ProviderConfig::Anthropic(mut anthropic)) => {
                if let Some(proxy) = &proxy {
                    route_through(&mut anthropic, proxy);
                }
                get_provider(ProviderConfig::Anthropic(anthropic)).map(Some)
            }
            Some(other) => get_provider(other).map(Some),
            None => Ok(None),
        });
        match built {
            Ok(Some(provider)) => router.register(provider),
            Ok(None) => {
                tracing::debug!("skipping {} provider without credentials", descriptor.name)
            }
            Err(e) => tracing::warn!("skipping provider {}: {}", descriptor.name, e),
        }
    }

    let anthropic = ProviderType::Anthropic.to_string();
    if !router.is_registered(&anthropic) {
        let detected = match &account_file {
            Some(path) => match delegated_config(path) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!("ignoring account file {}: {}", path.display(), e);
                    None
                }
            },
            None => None,
        };
        let delegated = match (&proxy, detected) {
            (Some(proxy), detected) => {
                let mut config = detected.unwrap_or_else(|| {
                    AnthropicProviderConfig::new(AnthropicAuth::ApiKey(String::new()))
                });
                route_through(&mut config, proxy);
                Some(config)
            }
            (None, detected) => detected,
        };
        if let Some(config) = delegated {
            router.register(get_provider(ProviderConfig::Anthropic(config))?);
        }
    }

    let ollama = ProviderType::Ollama.to_string();
    if !router.is_registered(&ollama) {
        router.register(get_provider(ProviderConfig::Ollama(
            OllamaProviderConfig::default(),
        ))?);
    }

    Ok(router)
}
