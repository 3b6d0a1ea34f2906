//! Outbound secret redaction.
//!
//! Every request is scrubbed on its way to a provider. Only the outbound copy
//! is touched; conversation history keeps what was actually said.

use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::RwLock;

use crate::errors::{ForgeError, ForgeResult};
use crate::providers::base::ModelRequest;

pub const REDACTED: &str = "[REDACTED]";
pub const REDACTED_PRIVATE_KEY: &str = "[REDACTED PRIVATE KEY]";

/// Text starting with this marker has already been scrubbed
const REDACTION_MARKER: &str = "[REDACTED";

const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    (
        "api-key-assignment",
        r#"(?i)\b(?:api[_-]?key|apikey)\s*[:=]\s*['"]?(?P<value>[A-Za-z0-9_\-]{20,})"#,
    ),
    (
        "jdbc-password",
        r"(?i)\bjdbc:[a-z0-9]+:[^\s]*?password=(?P<value>[^\s&;]+)",
    ),
    (
        "azure-connection-string",
        r#"(?i)\b(?:AccountKey|SharedAccessKey)=(?P<value>[^\s;'"]+)"#,
    ),
    (
        "azure-key-assignment",
        r#"(?i)\bazure[_-]?(?:storage|devops|ad)[_-]?(?:key|token|secret|password)\s*[:=]\s*['"]?(?P<value>[^\s'"]{8,})"#,
    ),
    (
        "aws-secret-access-key",
        r#"(?i)\baws[_-]?secret[_-]?access[_-]?key\s*[:=]\s*['"]?(?P<value>[A-Za-z0-9/+=]{40})"#,
    ),
    (
        "secret-assignment",
        r#"(?i)(?:secret|token|password|passwd|pwd)\s*[:=]\s*['"]?(?P<value>[^\s'"]{8,})"#,
    ),
    (
        "bearer-token",
        r"(?i)\bbearer\s+(?P<value>[A-Za-z0-9_\-\.=]{20,})",
    ),
    (
        "url-userinfo",
        r"(?i)\b[a-z][a-z0-9+.\-]*://[^\s:/@]+:(?P<value>[^\s@/]+)@",
    ),
    ("aws-access-key-id", r"\bAKIA[0-9A-Z]{16}\b"),
    (
        "private-key",
        r"-----BEGIN (?:RSA |EC |DSA |OPENSSH |ENCRYPTED )?PRIVATE KEY-----",
    ),
    ("github-token", r"\bgh[pousr]_[A-Za-z0-9_]{36,}"),
    ("gitlab-token", r"\bglpat-[A-Za-z0-9_\-]{20,}"),
    ("anthropic-key", r"\bsk-ant-[A-Za-z0-9_\-]{20,}"),
    ("openai-key", r"\bsk-[A-Za-z0-9_\-]{20,}"),
];

/// A compiled secret shape.
///
/// When the expression has a `value` group only that span is replaced and the
/// rest of the match (key name, separator, quotes) is kept. Otherwise the
/// whole match is replaced.
#[derive(Debug, Clone)]
pub struct SecretPattern {
    name: String,
    regex: Regex,
    placeholder: &'static str,
}

impl SecretPattern {
    pub fn new<N: Into<String>>(name: N, pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(pattern)?;
        let has_value_group = regex.capture_names().flatten().any(|n| n == "value");
        let placeholder = if pattern.contains("PRIVATE KEY") && !has_value_group {
            REDACTED_PRIVATE_KEY
        } else {
            REDACTED
        };
        Ok(Self {
            name: name.into(),
            regex,
            placeholder,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn redact(&self, text: &str) -> String {
        self.regex
            .replace_all(text, |caps: &Captures| {
                // Group 0 always participates in a match
                let whole = &caps[0];
                let offset = caps.get(0).map_or(0, |m| m.start());
                match caps.name("value") {
                    // Keep the existing placeholder, but the rest of a greedy
                    // capture may still hold a secret
                    Some(value) if value.as_str().starts_with(REDACTION_MARKER) => {
                        let start = value.start() - offset;
                        let kept = whole[start..]
                            .find(']')
                            .map_or(whole.len(), |i| start + i + 1);
                        format!("{}{}", &whole[..kept], self.redact(&whole[kept..]))
                    }
                    Some(value) => {
                        let start = value.start() - offset;
                        let end = value.end() - offset;
                        format!("{}{}{}", &whole[..start], self.placeholder, &whole[end..])
                    }
                    None => self.placeholder.to_string(),
                }
            })
            .into_owned()
    }
}

pub struct Firewall {
    patterns: RwLock<Vec<SecretPattern>>,
}

impl Default for Firewall {
    fn default() -> Self {
        Self::new()
    }
}

impl Firewall {
    /// A firewall loaded with the default pattern battery
    pub fn new() -> Self {
        let patterns = DEFAULT_PATTERNS
            .iter()
            .filter_map(|(name, pattern)| match SecretPattern::new(*name, pattern) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!("skipping secret pattern {name}: {e}");
                    None
                }
            })
            .collect();
        Self {
            patterns: RwLock::new(patterns),
        }
    }

    pub fn empty() -> Self {
        Self {
            patterns: RwLock::new(Vec::new()),
        }
    }

    /// Register an additional pattern. Takes effect for every scrub that
    /// starts after this returns.
    pub fn add_pattern(&self, pattern: &str) -> ForgeResult<()> {
        let mut patterns = self.patterns.write().unwrap_or_else(|e| e.into_inner());
        let name = format!("custom-{}", patterns.len());
        let compiled = SecretPattern::new(name, pattern)
            .map_err(|e| ForgeError::Configuration(format!("invalid secret pattern: {}", e)))?;
        patterns.push(compiled);
        Ok(())
    }

    pub fn pattern_names(&self) -> Vec<String> {
        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        patterns.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn scrub_text(&self, text: &str) -> String {
        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        patterns
            .iter()
            .fold(text.to_string(), |acc, pattern| pattern.redact(&acc))
    }

    /// An outbound copy of the request with every message scrubbed
    pub fn scrub_request(&self, request: &ModelRequest) -> ModelRequest {
        let mut scrubbed = request.clone();
        for message in &mut scrubbed.messages {
            message.content = self.scrub_text(&message.content);
            for call in &mut message.tool_calls {
                for value in call.input.values_mut() {
                    self.scrub_value(value);
                }
            }
        }
        scrubbed
    }

    /// Scrub every string inside a JSON value, in place
    fn scrub_value(&self, value: &mut Value) {
        match value {
            Value::String(text) => *text = self.scrub_text(text),
            Value::Array(items) => items.iter_mut().for_each(|item| self.scrub_value(item)),
            Value::Object(map) => map.values_mut().for_each(|item| self.scrub_value(item)),
            _ => {}
        }
    }

    /// Whether scrubbing would change the text
    pub fn contains_secret(&self, text: &str) -> bool {
        self.scrub_text(text) != text
    }
}
