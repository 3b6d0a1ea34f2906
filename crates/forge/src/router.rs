use futures::future::join_all;
use futures::StreamExt;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use strum_macros::Display;
use tokio_util::sync::CancellationToken;

use crate::errors::{ForgeError, ForgeResult};
use crate::firewall::Firewall;
use crate::providers::base::{ChunkStream, ModelRequest, ModelResponse, Provider};

/// The credential-delegated cloud vendor, preferred when nothing else decides
pub const DELEGATED_PROVIDER: &str = "anthropic";
/// The local model server, always registered
pub const LOCAL_PROVIDER: &str = "ollama";

const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Maps a project path pattern to the providers allowed to see that project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub project_pattern: String,
    pub allowed_providers: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

impl PolicyRule {
    pub fn new<P: Into<String>>(project_pattern: P, allowed_providers: &[&str]) -> Self {
        Self {
            project_pattern: project_pattern.into(),
            allowed_providers: allowed_providers.iter().map(|p| p.to_string()).collect(),
            reason: String::new(),
        }
    }

    /// Shell-style match where `*` does not cross path separators. A
    /// malformed pattern matches nothing.
    pub fn matches(&self, project: &str) -> bool {
        Pattern::new(&self.project_pattern)
            .map(|pattern| pattern.matches_with(project, PATH_MATCH))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderStatus {
    Ready,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    /// `provider/model`
    pub id: String,
    pub provider: String,
    pub model: String,
    /// Whether this is the current default model
    pub active: bool,
    pub status: ProviderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ResolutionSource {
    Override,
    Policy,
    Default,
    Fallback,
}

/// The provider chosen for one request
#[derive(Clone)]
pub struct Resolution {
    pub provider: Arc<dyn Provider>,
    /// Provider-local model id, or `None` for the provider's own default
    pub model: Option<String>,
    pub source: ResolutionSource,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("source", &self.source)
            .finish()
    }
}

/// Split `provider/model`. A bare provider name is accepted; an empty half
/// is not.
pub fn parse_model_id(id: &str) -> ForgeResult<(&str, Option<&str>)> {
    let malformed = || {
        ForgeError::Configuration(format!(
            "invalid model '{}', use: provider/model (e.g. ollama/codestral)",
            id
        ))
    };
    match id.split_once('/') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            Ok((provider, Some(model)))
        }
        Some(_) => Err(malformed()),
        None if !id.is_empty() => Ok((id, None)),
        None => Err(malformed()),
    }
}

/// Picks exactly one provider per request and dispatches to it.
///
/// The registry is fixed once the router is shared; only the default model
/// changes at runtime.
pub struct Router {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    policies: Vec<PolicyRule>,
    default_model: RwLock<Option<String>>,
    firewall: Firewall,
}

impl Router {
    pub fn new(policies: Vec<PolicyRule>, default_model: Option<String>) -> Self {
        Self {
            providers: BTreeMap::new(),
            policies,
            default_model: RwLock::new(default_model.filter(|m| !m.is_empty())),
            firewall: Firewall::new(),
        }
    }

    pub fn with_firewall(mut self, firewall: Firewall) -> Self {
        self.firewall = firewall;
        self
    }

    /// Register a provider under its own name, replacing any previous one
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        tracing::info!("registered model provider {name}");
        self.providers.insert(name, provider);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn firewall(&self) -> &Firewall {
        &self.firewall
    }

    pub fn policies(&self) -> &[PolicyRule] {
        &self.policies
    }

    pub fn list_providers(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn default_model(&self) -> Option<String> {
        self.default_model
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Change the default model. The id must name a registered provider and
    /// a model.
    pub fn set_default_model(&self, id: &str) -> ForgeResult<()> {
        let (provider, model) = parse_model_id(id)?;
        if model.is_none() {
            return Err(ForgeError::Configuration(format!(
                "invalid model '{}', use: provider/model (e.g. ollama/codestral)",
                id
            )));
        }
        if !self.is_registered(provider) {
            return Err(ForgeError::Configuration(format!(
                "unknown provider: {}",
                provider
            )));
        }
        *self.default_model.write().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        Ok(())
    }

    async fn first_available<'a, I>(&self, names: I) -> Option<Arc<dyn Provider>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            if let Some(provider) = self.providers.get(name) {
                if provider.available().await {
                    return Some(provider.clone());
                }
            }
        }
        None
    }

    /// Choose the provider for a request: explicit override, then project
    /// policy, then the default model, then the fallback chain.
    pub async fn resolve(&self, request: &ModelRequest) -> ForgeResult<Resolution> {
        if let Some(id) = request.model.as_deref() {
            let (name, model) = parse_model_id(id)?;
            let provider = self.providers.get(name).ok_or_else(|| {
                ForgeError::Configuration(format!("unknown provider: {}", name))
            })?;
            return Ok(Resolution {
                provider: provider.clone(),
                model: model.map(str::to_string),
                source: ResolutionSource::Override,
            });
        }

        if let Some(project) = request.project.as_deref() {
            for rule in self.policies.iter().filter(|r| r.matches(project)) {
                let allowed = rule.allowed_providers.iter().map(String::as_str);
                if let Some(provider) = self.first_available(allowed).await {
                    return Ok(Resolution {
                        provider,
                        model: None,
                        source: ResolutionSource::Policy,
                    });
                }
                tracing::warn!(
                    "policy {} matched {} but none of {:?} is available",
                    rule.project_pattern,
                    project,
                    rule.allowed_providers
                );
            }
        }

        if let Some(id) = self.default_model() {
            let (name, model) = parse_model_id(&id)?;
            match self.providers.get(name) {
                Some(provider) => {
                    return Ok(Resolution {
                        provider: provider.clone(),
                        model: model.map(str::to_string),
                        source: ResolutionSource::Default,
                    })
                }
                None => tracing::warn!("default model {id} names an unregistered provider"),
            }
        }

        let preferred = [DELEGATED_PROVIDER, LOCAL_PROVIDER];
        let others = self
            .providers
            .keys()
            .map(String::as_str)
            .filter(|name| !preferred.contains(name));
        let names = preferred.into_iter().chain(others).collect::<Vec<_>>();
        match self.first_available(names).await {
            Some(provider) => Ok(Resolution {
                provider,
                model: None,
                source: ResolutionSource::Fallback,
            }),
            None => Err(ForgeError::Configuration(
                "no available AI model provider".to_string(),
            )),
        }
    }

    async fn prepare(&self, request: &ModelRequest) -> ForgeResult<(Resolution, ModelRequest)> {
        let resolution = self.resolve(request).await?;
        tracing::debug!(
            provider = resolution.provider.name(),
            model = ?resolution.model,
            source = %resolution.source,
            "resolved model provider"
        );
        let mut outbound = self.firewall.scrub_request(request);
        outbound.model = resolution.model.clone();
        Ok((resolution, outbound))
    }

    pub async fn complete(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> ForgeResult<ModelResponse> {
        if cancel.is_cancelled() {
            return Err(ForgeError::Cancelled);
        }
        let (resolution, outbound) = self.prepare(request).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ForgeError::Cancelled),
            response = resolution.provider.complete(&outbound) => response,
        }
    }

    /// Stream a completion. Cancelling the token ends the stream with a
    /// cancellation error.
    pub async fn stream_complete(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> ForgeResult<ChunkStream> {
        if cancel.is_cancelled() {
            return Err(ForgeError::Cancelled);
        }
        let (resolution, outbound) = self.prepare(request).await?;
        let mut inner = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
            stream = resolution.provider.stream_complete(&outbound) => stream?,
        };

        let cancel = cancel.clone();
        let stream = async_stream::stream! {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        yield Err(ForgeError::Cancelled);
                        break;
                    }
                    next = inner.next() => match next {
                        Some(item) => yield item,
                        None => break,
                    },
                }
            }
        };
        Ok(stream.boxed())
    }

    /// Live catalog of every registered provider, in provider name order
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        let current = self.default_model();
        let catalogs = join_all(self.providers.iter().map(|(name, provider)| async move {
            let (available, models) = tokio::join!(provider.available(), provider.models());
            (name.clone(), available, models)
        }))
        .await;

        catalogs
            .into_iter()
            .flat_map(|(name, available, models)| {
                let status = if available {
                    ProviderStatus::Ready
                } else {
                    ProviderStatus::Unavailable
                };
                let current = current.clone();
                models.into_iter().map(move |model| {
                    let id = format!("{}/{}", name, model);
                    ModelInfo {
                        active: current.as_deref() == Some(id.as_str()),
                        id,
                        provider: name.clone(),
                        model,
                        status,
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;
    use crate::providers::mock::MockProvider;
    use futures::StreamExt;
    use std::time::Duration;

    fn request() -> ModelRequest {
        ModelRequest::new(vec![Message::user().with_text("hello")])
    }

    fn mock(name: &str, text: &str) -> Arc<MockProvider> {
        Arc::new(MockProvider::repeating(name, ModelResponse::text(text)))
    }

    fn router_with(
        providers: &[Arc<MockProvider>],
        policies: Vec<PolicyRule>,
        default: Option<&str>,
    ) -> Router {
        let mut router = Router::new(policies, default.map(str::to_string));
        for provider in providers {
            router.register(provider.clone());
        }
        router
    }

    #[test]
    fn test_parse_model_id() {
        assert_eq!(parse_model_id("ollama/codestral").unwrap(), ("ollama", Some("codestral")));
        assert_eq!(
            parse_model_id("ollama/library/model:7b").unwrap(),
            ("ollama", Some("library/model:7b"))
        );
        assert_eq!(parse_model_id("ollama").unwrap(), ("ollama", None));
        for bad in ["", "/codestral", "ollama/"] {
            assert!(matches!(parse_model_id(bad), Err(ForgeError::Configuration(_))));
        }
    }

    #[test]
    fn test_policy_glob_is_path_aware() {
        let rule = PolicyRule::new("/company/*", &["local"]);
        assert!(rule.matches("/company/app"));
        assert!(!rule.matches("/company/app/sub"));
        assert!(!rule.matches("/other/app"));
        assert!(!PolicyRule::new("[", &["local"]).matches("["));
    }

    #[tokio::test]
    async fn test_override_selects_provider_and_model() -> anyhow::Result<()> {
        let ollama = mock("ollama", "local");
        let anthropic = mock("anthropic", "cloud");
        let router = router_with(&[ollama.clone(), anthropic], vec![], None);

        let response = router
            .complete(&request().with_model("ollama/llama3.1"), &CancellationToken::new())
            .await?;
        assert_eq!(response.content, "local");
        assert_eq!(ollama.requests()[0].model.as_deref(), Some("llama3.1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_override_unknown_provider_fails_fast() {
        let router = router_with(&[mock("ollama", "local")], vec![], None);
        let err = router
            .complete(&request().with_model("gemini/pro"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ForgeError::Configuration("unknown provider: gemini".into()));
    }

    #[tokio::test]
    async fn test_policy_scenario() -> anyhow::Result<()> {
        let local = mock("local", "from local");
        let cloud = mock("cloud", "from cloud");
        let router = router_with(
            &[local, cloud],
            vec![PolicyRule::new("/company/*", &["local"])],
            Some("cloud/big"),
        );

        let request = request().with_project("/company/app");
        let resolution = router.resolve(&request).await?;
        assert_eq!(resolution.provider.name(), "local");
        assert_eq!(resolution.source, ResolutionSource::Policy);

        // Outside the policy the default applies
        let resolution = router.resolve(&self::request().with_project("/home/me/oss")).await?;
        assert_eq!(resolution.provider.name(), "cloud");
        assert_eq!(resolution.model.as_deref(), Some("big"));
        Ok(())
    }

    #[tokio::test]
    async fn test_policy_skips_unavailable_providers() -> anyhow::Result<()> {
        let local = mock("local", "");
        let onprem = mock("onprem", "");
        local.set_available(false);
        let router = router_with(
            &[local, onprem],
            vec![PolicyRule::new("/company/**", &["local", "onprem"])],
            None,
        );
        let resolution = router.resolve(&request().with_project("/company/a/b")).await?;
        assert_eq!(resolution.provider.name(), "onprem");
        Ok(())
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic() -> anyhow::Result<()> {
        let router = router_with(
            &[mock("zeta", ""), mock("alpha", ""), mock("mid", "")],
            vec![],
            None,
        );
        let first = router.resolve(&request()).await?.provider.name().to_string();
        for _ in 0..10 {
            assert_eq!(router.resolve(&request()).await?.provider.name(), first);
        }
        assert_eq!(first, "alpha");
        Ok(())
    }

    #[tokio::test]
    async fn test_fallback_order() -> anyhow::Result<()> {
        let anthropic = mock(DELEGATED_PROVIDER, "");
        let ollama = mock(LOCAL_PROVIDER, "");
        let router = router_with(&[anthropic.clone(), ollama.clone()], vec![], None);

        assert_eq!(router.resolve(&request()).await?.provider.name(), DELEGATED_PROVIDER);
        anthropic.set_available(false);
        assert_eq!(router.resolve(&request()).await?.provider.name(), LOCAL_PROVIDER);
        ollama.set_available(false);
        assert!(matches!(
            router.resolve(&request()).await,
            Err(ForgeError::Configuration(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_registry_fails_immediately() {
        let router = Router::new(vec![], None);
        let err = router
            .complete(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_requests_are_scrubbed() -> anyhow::Result<()> {
        let ollama = mock("ollama", "ok");
        let router = router_with(&[ollama.clone()], vec![], None);
        let original = ModelRequest::new(vec![
            Message::user().with_text(r#"config has password: "s3cr3t12345""#),
        ]);

        router.complete(&original, &CancellationToken::new()).await?;

        let seen = &ollama.requests()[0];
        assert!(!seen.messages[0].content.contains("s3cr3t12345"));
        assert!(seen.messages[0].content.contains("password:"));
        assert!(original.messages[0].content.contains("s3cr3t12345"));
        Ok(())
    }

    #[tokio::test]
    async fn test_default_model_admin() -> anyhow::Result<()> {
        let router = router_with(&[mock("ollama", ""), mock("anthropic", "")], vec![], None);
        assert_eq!(router.default_model(), None);

        router.set_default_model("ollama/codestral")?;
        assert_eq!(router.default_model().as_deref(), Some("ollama/codestral"));

        assert!(router.set_default_model("ollama").is_err());
        assert!(router.set_default_model("mystery/model").is_err());
        assert_eq!(router.default_model().as_deref(), Some("ollama/codestral"));

        let resolution = router.resolve(&request()).await?;
        assert_eq!(resolution.provider.name(), "ollama");
        assert_eq!(resolution.source, ResolutionSource::Default);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_models() {
        let ollama = Arc::new(
            MockProvider::new("ollama", vec![]).with_models(&["codestral", "llama3.1"]),
        );
        let anthropic =
            Arc::new(MockProvider::new("anthropic", vec![]).with_models(&["claude-sonnet-4-6"]));
        anthropic.set_available(false);

        let mut router = Router::new(vec![], Some("ollama/llama3.1".into()));
        router.register(ollama);
        router.register(anthropic);

        let models = router.list_models().await;
        assert_eq!(models.len(), 3);
        assert_eq!(models[0].id, "anthropic/claude-sonnet-4-6");
        assert_eq!(models[0].status, ProviderStatus::Unavailable);
        assert!(!models[1].active);
        assert!(models[2].active);
        assert_eq!(models[2].status.to_string(), "ready");
        assert_eq!(router.list_providers(), vec!["anthropic", "ollama"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let ollama = mock("ollama", "ok");
        let router = router_with(&[ollama.clone()], vec![], None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = router.complete(&request(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(ollama.requests().is_empty());
    }

    #[tokio::test]
    async fn test_stream_passthrough_and_cancel() -> anyhow::Result<()> {
        let router = router_with(&[mock("ollama", "three word answer")], vec![], None);
        let chunks: Vec<_> = router
            .stream_complete(&request(), &CancellationToken::new())
            .await?
            .collect()
            .await;
        assert_eq!(chunks.len(), 4);
        assert!(chunks[3].as_ref().unwrap().done);

        let cancel = CancellationToken::new();
        let mut stream = router.stream_complete(&request(), &cancel).await?;
        assert!(stream.next().await.unwrap().is_ok());
        cancel.cancel();
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next()).await?;
        assert!(matches!(next, Some(Err(ForgeError::Cancelled))));
        Ok(())
    }
}
