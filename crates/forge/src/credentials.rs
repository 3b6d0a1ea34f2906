//! Resolution of credential references found in configuration.
//!
//! Configuration never holds plaintext keys when it can avoid it. A value
//! may name an environment variable (`env:OPENAI_API_KEY`), an entry in the
//! system keyring (`keyring:openai`), or be the key itself.

use keyring::Entry;
use std::env;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::errors::ForgeError;

pub const KEYRING_SERVICE: &str = "forge";

#[derive(Error, Debug)]
pub enum CredentialRefError {
    #[error("Failed to access keyring entry {name}: {message}")]
    KeyringAccess { name: String, message: String },

    #[error("Environment variable {0} is not set")]
    EnvVarMissing(String),
}

impl From<CredentialRefError> for ForgeError {
    fn from(err: CredentialRefError) -> Self {
        ForgeError::Credential(err.to_string())
    }
}

#[cfg_attr(test, automock)]
pub trait Keyring: Send + Sync {
    fn get_password(&self, name: &str) -> Result<String, CredentialRefError>;
}

#[cfg_attr(test, automock)]
pub trait Environment: Send + Sync {
    fn get_var(&self, key: &str) -> Result<String, env::VarError>;
}

pub struct RealEnvironment;

impl Environment for RealEnvironment {
    fn get_var(&self, key: &str) -> Result<String, env::VarError> {
        env::var(key)
    }
}

/// The operating system keyring, scoped to one service name
pub struct SystemKeyring {
    service: String,
}

impl SystemKeyring {
    pub fn new<S: Into<String>>(service: S) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Default for SystemKeyring {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl Keyring for SystemKeyring {
    fn get_password(&self, name: &str) -> Result<String, CredentialRefError> {
        let access = |e: keyring::Error| CredentialRefError::KeyringAccess {
            name: name.to_string(),
            message: e.to_string(),
        };
        Entry::new(&self.service, name)
            .map_err(access)?
            .get_password()
            .map_err(access)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRef<'a> {
    Env(&'a str),
    Keyring(&'a str),
    Literal(&'a str),
}

impl<'a> SecretRef<'a> {
    pub fn parse(reference: &'a str) -> Self {
        let reference = reference.trim();
        if let Some(name) = reference.strip_prefix("env:") {
            SecretRef::Env(name)
        } else if let Some(name) = reference.strip_prefix("keyring:") {
            SecretRef::Keyring(name)
        } else {
            SecretRef::Literal(reference)
        }
    }
}

/// Resolve a reference against the real environment and system keyring
pub fn resolve_secret(reference: &str) -> Result<String, CredentialRefError> {
    resolve_secret_with(reference, &SystemKeyring::default(), &RealEnvironment)
}

pub fn resolve_secret_with(
    reference: &str,
    keyring: &impl Keyring,
    env: &impl Environment,
) -> Result<String, CredentialRefError> {
    match SecretRef::parse(reference) {
        SecretRef::Env(name) => env
            .get_var(name)
            .map_err(|_| CredentialRefError::EnvVarMissing(name.to_string())),
        SecretRef::Keyring(name) => keyring.get_password(name),
        SecretRef::Literal(value) => Ok(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[test]
    fn test_parse() {
        assert_eq!(SecretRef::parse("env:OPENAI_API_KEY"), SecretRef::Env("OPENAI_API_KEY"));
        assert_eq!(SecretRef::parse(" keyring:openai "), SecretRef::Keyring("openai"));
        assert_eq!(SecretRef::parse("sk-plain"), SecretRef::Literal("sk-plain"));
    }

    #[test]
    fn test_resolve_from_environment() {
        let mut mock_env = MockEnvironment::new();
        let mut mock_keyring = MockKeyring::new();

        mock_env
            .expect_get_var()
            .with(eq("OPENAI_API_KEY"))
            .times(1)
            .return_once(|_| Ok("env_value".to_string()));
        mock_keyring.expect_get_password().times(0);

        let result = resolve_secret_with("env:OPENAI_API_KEY", &mock_keyring, &mock_env);
        assert!(matches!(result.as_deref(), Ok("env_value")));
    }

    #[test]
    fn test_resolve_missing_environment() {
        let mut mock_env = MockEnvironment::new();
        let mock_keyring = MockKeyring::new();

        mock_env
            .expect_get_var()
            .times(1)
            .return_once(|_| Err(env::VarError::NotPresent));

        let result = resolve_secret_with("env:OPENAI_API_KEY", &mock_keyring, &mock_env);
        assert!(matches!(
            result,
            Err(CredentialRefError::EnvVarMissing(name)) if name == "OPENAI_API_KEY"
        ));
    }

    #[test]
    fn test_resolve_from_keyring() {
        let mut mock_env = MockEnvironment::new();
        let mut mock_keyring = MockKeyring::new();

        mock_keyring
            .expect_get_password()
            .with(eq("anthropic"))
            .times(1)
            .return_once(|_| Ok("keyring_value".to_string()));
        mock_env.expect_get_var().times(0);

        let result = resolve_secret_with("keyring:anthropic", &mock_keyring, &mock_env);
        assert!(matches!(result.as_deref(), Ok("keyring_value")));
    }

    #[test]
    fn test_keyring_failure_becomes_credential_error() {
        let mock_env = MockEnvironment::new();
        let mut mock_keyring = MockKeyring::new();

        mock_keyring.expect_get_password().times(1).return_once(|name| {
            Err(CredentialRefError::KeyringAccess {
                name: name.to_string(),
                message: "No matching entry found".to_string(),
            })
        });

        let err: ForgeError = resolve_secret_with("keyring:anthropic", &mock_keyring, &mock_env)
            .unwrap_err()
            .into();
        assert!(matches!(err, ForgeError::Credential(msg) if msg.contains("anthropic")));
    }

    #[test]
    fn test_literal_passes_through() {
        let mock_env = MockEnvironment::new();
        let mock_keyring = MockKeyring::new();
        let result = resolve_secret_with("sk-plain", &mock_keyring, &mock_env);
        assert!(matches!(result.as_deref(), Ok("sk-plain")));
    }
}
