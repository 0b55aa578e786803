use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_lsp::lsp_types::request::Request;
use tower_lsp::Client;

use crate::javatypes::{JavaTypeInfo, ResolvedJavaType, ResolvedJavaTypeData};

/// What the external provider knows about a lookup. `Resolved(None)` means
/// "definitely no such type"; `NotYetKnown` means the provider cannot answer
/// yet and the question should be asked again later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderResponse<T> {
    Resolved(Option<T>),
    NotYetKnown,
}

/// The external type-resolution collaborator (spec boundary): discovery of
/// host classes and members lives on the other side of this trait.
#[async_trait]
pub trait TypeResolutionProvider: Send + Sync {
    async fn resolved_java_type(
        &self,
        signature: &str,
        project_uri: &str,
    ) -> ProviderResponse<ResolvedJavaTypeData>;

    async fn java_types(
        &self,
        pattern: &str,
        project_uri: &str,
    ) -> ProviderResponse<Vec<JavaTypeInfo>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub project_uri: String,
    pub signature: String,
}

impl CacheKey {
    pub fn new(project_uri: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            project_uri: project_uri.into(),
            signature: signature.into(),
        }
    }
}

/// A synchronous read of the cache: either a settled answer or "still in
/// flight / not asked yet".
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Resolved(Option<Arc<ResolvedJavaType>>),
    Pending,
}

enum Entry {
    Resolved(Option<Arc<ResolvedJavaType>>),
    InFlight(watch::Receiver<bool>),
}

struct Inner {
    provider: Arc<dyn TypeResolutionProvider>,
    entries: DashMap<CacheKey, Entry>,
    types_by_pattern: DashMap<CacheKey, Arc<Vec<JavaTypeInfo>>>,
}

/// Memoizes resolved type descriptors per `(project, signature)` and
/// serializes concurrent requests for the same key into one in-flight
/// provider call, fanning the result out to every waiter.
#[derive(Clone)]
pub struct TypeResolutionCache {
    inner: Arc<Inner>,
}

impl TypeResolutionCache {
    pub fn new(provider: Arc<dyn TypeResolutionProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                entries: DashMap::new(),
                types_by_pattern: DashMap::new(),
            }),
        }
    }

    /// Non-blocking read used by validation and completion walks.
    pub fn lookup(&self, key: &CacheKey) -> CacheLookup {
        match self.inner.entries.get(key) {
            Some(entry) => match &*entry {
                Entry::Resolved(value) => CacheLookup::Resolved(value.clone()),
                Entry::InFlight(_) => CacheLookup::Pending,
            },
            None => CacheLookup::Pending,
        }
    }

    /// Resolves one key, sharing any in-flight request for it.
    pub async fn resolve(&self, key: CacheKey) -> Option<Arc<ResolvedJavaType>> {
        loop {
            let waiter = match self.inner.entries.get(&key) {
                Some(entry) => match &*entry {
                    Entry::Resolved(value) => return value.clone(),
                    Entry::InFlight(rx) => Some(rx.clone()),
                },
                None => None,
            };
            if let Some(mut rx) = waiter {
                if rx.changed().await.is_err() {
                    // The in-flight request was dropped without settling;
                    // clear the stale entry and retry.
                    self.inner
                        .entries
                        .remove_if(&key, |_, entry| matches!(entry, Entry::InFlight(_)));
                }
                continue;
            }

            let (tx, rx) = watch::channel(false);
            match self.inner.entries.entry(key.clone()) {
                MapEntry::Occupied(_) => continue, // lost the race, re-read
                MapEntry::Vacant(vacant) => {
                    vacant.insert(Entry::InFlight(rx));
                }
            }

            let response = self
                .inner
                .provider
                .resolved_java_type(&key.signature, &key.project_uri)
                .await;
            let result = match response {
                ProviderResponse::Resolved(data) => {
                    let resolved = data.map(|data| Arc::new(ResolvedJavaType::finalize(data)));
                    self.inner
                        .entries
                        .insert(key.clone(), Entry::Resolved(resolved.clone()));
                    resolved
                }
                ProviderResponse::NotYetKnown => {
                    // Leave no entry behind so a later pass may ask again.
                    self.inner.entries.remove(&key);
                    None
                }
            };
            let _ = tx.send(true);
            return result;
        }
    }

    /// Resolves a settle-batch of keys concurrently and returns once all of
    /// them are answered (or reported not-yet-known). Callers re-validate
    /// once per batch, not once per key.
    pub async fn resolve_batch(&self, keys: impl IntoIterator<Item = CacheKey>) {
        let mut handles = Vec::new();
        for key in keys {
            let cache = self.clone();
            handles.push(tokio::spawn(async move {
                let _ = cache.resolve(key).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Cached pattern search results, if any. Completion reads these and
    /// never waits.
    pub fn lookup_types(&self, project_uri: &str, pattern: &str) -> Option<Arc<Vec<JavaTypeInfo>>> {
        self.inner
            .types_by_pattern
            .get(&CacheKey::new(project_uri, pattern))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Fires a pattern search in the background; a later completion pass
    /// picks the result up from the cache. A no-op outside a runtime.
    pub fn request_types(&self, project_uri: &str, pattern: &str) {
        let key = CacheKey::new(project_uri, pattern);
        if self.inner.types_by_pattern.contains_key(&key) {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let cache = self.clone();
        tokio::spawn(async move {
            let response = cache
                .inner
                .provider
                .java_types(&key.signature, &key.project_uri)
                .await;
            if let ProviderResponse::Resolved(Some(types)) = response {
                cache.inner.types_by_pattern.insert(key, Arc::new(types));
            }
        });
    }
}

// --- LSP-side provider -----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuteResolvedJavaTypeParams {
    pub signature: String,
    pub project_uri: String,
}

/// Custom request asking the editor-side host plugin to resolve a type.
pub enum QuteResolvedJavaTypeRequest {}

impl Request for QuteResolvedJavaTypeRequest {
    type Params = QuteResolvedJavaTypeParams;
    type Result = Option<ResolvedJavaTypeData>;
    const METHOD: &'static str = "qute/template/resolvedJavaType";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuteJavaTypesParams {
    pub pattern: String,
    pub project_uri: String,
}

pub enum QuteJavaTypesRequest {}

impl Request for QuteJavaTypesRequest {
    type Params = QuteJavaTypesParams;
    type Result = Option<Vec<JavaTypeInfo>>;
    const METHOD: &'static str = "qute/template/javaTypes";
}

/// Provider backed by the connected LSP client. Transport failures degrade
/// to `NotYetKnown` so stale absence is never cached.
pub struct ClientTypeProvider {
    client: Client,
}

impl ClientTypeProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TypeResolutionProvider for ClientTypeProvider {
    async fn resolved_java_type(
        &self,
        signature: &str,
        project_uri: &str,
    ) -> ProviderResponse<ResolvedJavaTypeData> {
        let params = QuteResolvedJavaTypeParams {
            signature: signature.to_string(),
            project_uri: project_uri.to_string(),
        };
        match self
            .client
            .send_request::<QuteResolvedJavaTypeRequest>(params)
            .await
        {
            Ok(result) => ProviderResponse::Resolved(result),
            Err(err) => {
                debug!("resolvedJavaType request for `{signature}` failed: {err}");
                ProviderResponse::NotYetKnown
            }
        }
    }

    async fn java_types(
        &self,
        pattern: &str,
        project_uri: &str,
    ) -> ProviderResponse<Vec<JavaTypeInfo>> {
        let params = QuteJavaTypesParams {
            pattern: pattern.to_string(),
            project_uri: project_uri.to_string(),
        };
        match self.client.send_request::<QuteJavaTypesRequest>(params).await {
            Ok(Some(types)) => ProviderResponse::Resolved(Some(types)),
            Ok(None) => ProviderResponse::Resolved(None),
            Err(err) => {
                debug!("javaTypes request for `{pattern}` failed: {err}");
                ProviderResponse::NotYetKnown
            }
        }
    }
}
