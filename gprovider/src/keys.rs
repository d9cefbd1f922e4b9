//! Resolved-credential contracts and in-memory key handling.
//!
//! Decryption and key selection live outside the gateway; the session only
//! sees the already-resolved access bundle a [`KeyResolver`] hands back, and
//! reports problem keys through a [`KeyStatusSink`].

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use gcommon::{BoxFuture, MetadataMap};

use crate::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderKeyId(String);

impl ProviderKeyId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for ProviderKeyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderKeyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ProviderKeyId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(PartialEq, Eq)]
pub struct SecretString {
    value: String,
}

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn expose(&self) -> &str {
        self.value.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        unsafe {
            self.value.as_mut_vec().fill(0);
        }
    }
}

/// What a key resolution yields: the model the key is provisioned for, the
/// decrypted secret, and any provider-specific extras.
#[derive(Debug)]
pub struct ResolvedAccess {
    pub model: String,
    pub api_key: SecretString,
    pub extra: MetadataMap,
}

impl ResolvedAccess {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: SecretString::new(api_key),
            extra: MetadataMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

pub trait KeyResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        key_id: &'a ProviderKeyId,
        scope: &'a MetadataMap,
    ) -> BoxFuture<'a, Result<ResolvedAccess, ProviderError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFlag {
    /// Skip this key on the next selection pass (rate limited).
    Avoid,
    /// The key no longer authenticates.
    Invalid,
    /// The key points at a model that no longer exists.
    Deprecated,
}

impl Display for KeyFlag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let flag = match self {
            Self::Avoid => "avoid",
            Self::Invalid => "invalid",
            Self::Deprecated => "deprecated",
        };

        f.write_str(flag)
    }
}

pub trait KeyStatusSink: Send + Sync {
    fn flag(&self, key_id: &ProviderKeyId, flag: KeyFlag);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopKeyStatusSink;

impl KeyStatusSink for NoopKeyStatusSink {
    fn flag(&self, _key_id: &ProviderKeyId, _flag: KeyFlag) {}
}

#[derive(Debug, Clone)]
struct StaticKeyEntry {
    model: String,
    api_key: String,
    extra: MetadataMap,
}

/// Map-backed resolver for tests and single-tenant deployments.
#[derive(Default)]
pub struct StaticKeyResolver {
    entries: Mutex<HashMap<ProviderKeyId, StaticKeyEntry>>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        key_id: impl Into<ProviderKeyId>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<(), ProviderError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(ProviderError::auth("api key must not be empty"));
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ProviderError::auth("key resolver lock poisoned"))?;
        entries.insert(
            key_id.into(),
            StaticKeyEntry {
                model: model.into(),
                api_key,
                extra: MetadataMap::new(),
            },
        );

        Ok(())
    }
}

impl KeyResolver for StaticKeyResolver {
    fn resolve<'a>(
        &'a self,
        key_id: &'a ProviderKeyId,
        _scope: &'a MetadataMap,
    ) -> BoxFuture<'a, Result<ResolvedAccess, ProviderError>> {
        Box::pin(async move {
            let entries = self
                .entries
                .lock()
                .map_err(|_| ProviderError::auth("key resolver lock poisoned"))?;

            let entry = entries
                .get(key_id)
                .ok_or_else(|| ProviderError::auth(format!("no key configured for '{key_id}'")))?;

            let mut access = ResolvedAccess::new(entry.model.clone(), entry.api_key.clone());
            access.extra = entry.extra.clone();
            Ok(access)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProviderFault;

    #[test]
    fn secret_string_redacts_debug_output() {
        let secret = SecretString::new("sk-very-secret");
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(secret.expose(), "sk-very-secret");
    }

    #[test]
    fn resolved_access_debug_never_leaks_the_key() {
        let access = ResolvedAccess::new("gpt-4o-mini", "sk-secret").with_extra("org", "acme");
        let rendered = format!("{access:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn static_resolver_returns_configured_access() {
        let resolver = StaticKeyResolver::new();
        resolver
            .insert("key-1", "gpt-4o-mini", "sk-live-123")
            .expect("key should insert");

        let access = resolver
            .resolve(&ProviderKeyId::from("key-1"), &MetadataMap::new())
            .await
            .expect("resolution should succeed");
        assert_eq!(access.model, "gpt-4o-mini");
        assert_eq!(access.api_key.expose(), "sk-live-123");
    }

    #[tokio::test]
    async fn static_resolver_rejects_unknown_and_empty_keys() {
        let resolver = StaticKeyResolver::new();
        let error = resolver
            .resolve(&ProviderKeyId::from("missing"), &MetadataMap::new())
            .await
            .expect_err("missing key should fail");
        assert_eq!(error.fault, ProviderFault::Auth);

        let error = resolver
            .insert("key-2", "gpt-4o-mini", "")
            .expect_err("empty key should fail");
        assert_eq!(error.fault, ProviderFault::Auth);
    }
}
