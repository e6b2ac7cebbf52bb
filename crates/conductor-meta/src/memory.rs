use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use conductor_common::{
    ModelConfiguration, ModelDefinition, ModelRunnerEndpoint, VirtualModelRunner,
};

use crate::types::{Directory, DirectoryEvent, DirectorySnapshot, EventStream};

type Key = (String, String);

const EVENT_CAPACITY: usize = 1024;

fn key(tenant_id: &str, id: &str) -> Key {
    (tenant_id.to_string(), id.to_string())
}

/// In-process directory. Writes broadcast a [`DirectoryEvent`] to watchers.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<DirectoryEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    vmrs: BTreeMap<Key, VirtualModelRunner>,
    endpoints: BTreeMap<Key, ModelRunnerEndpoint>,
    model_definitions: BTreeMap<Key, ModelDefinition>,
    model_configurations: BTreeMap<Key, ModelConfiguration>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::with_event_capacity(EVENT_CAPACITY)
    }

    /// Directory whose watchers buffer at most `capacity` undelivered events.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    /// Build a directory from bulk contents. No events are emitted.
    pub fn from_snapshot(snapshot: DirectorySnapshot) -> Self {
        let mut inner = Inner::default();
        for vmr in snapshot.vmrs {
            inner.vmrs.insert(key(&vmr.tenant_id, &vmr.id), vmr);
        }
        for ep in snapshot.endpoints {
            inner.endpoints.insert(key(&ep.tenant_id, &ep.id), ep);
        }
        for def in snapshot.model_definitions {
            inner
                .model_definitions
                .insert(key(&def.tenant_id, &def.id), def);
        }
        for cfg in snapshot.model_configurations {
            inner
                .model_configurations
                .insert(key(&cfg.tenant_id, &cfg.id), cfg);
        }

        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(inner)),
            tx,
        }
    }

    pub async fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read directory file {}", path.display()))?;
        let snapshot: DirectorySnapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse directory file {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            vmrs = snapshot.vmrs.len(),
            endpoints = snapshot.endpoints.len(),
            model_definitions = snapshot.model_definitions.len(),
            model_configurations = snapshot.model_configurations.len(),
            "directory loaded"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    fn emit(&self, event: DirectoryEvent) {
        let _ = self.tx.send(event);
    }

    pub async fn put_endpoint(&self, endpoint: ModelRunnerEndpoint) {
        let existed = {
            let mut inner = self.inner.write().await;
            inner
                .endpoints
                .insert(key(&endpoint.tenant_id, &endpoint.id), endpoint.clone())
                .is_some()
        };
        if existed {
            self.emit(DirectoryEvent::EndpointUpdated(endpoint));
        } else {
            self.emit(DirectoryEvent::EndpointCreated(endpoint));
        }
    }

    pub async fn delete_endpoint(&self, tenant_id: &str, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            inner.endpoints.remove(&key(tenant_id, id))
        };
        match removed {
            Some(ep) => {
                self.emit(DirectoryEvent::EndpointDeleted(ep));
                true
            }
            None => false,
        }
    }

    pub async fn put_vmr(&self, vmr: VirtualModelRunner) {
        {
            let mut inner = self.inner.write().await;
            inner.vmrs.insert(key(&vmr.tenant_id, &vmr.id), vmr.clone());
        }
        self.emit(DirectoryEvent::VmrUpdated(vmr));
    }

    pub async fn delete_vmr(&self, tenant_id: &str, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            inner.vmrs.remove(&key(tenant_id, id))
        };
        match removed {
            Some(vmr) => {
                self.emit(DirectoryEvent::VmrDeleted(vmr));
                true
            }
            None => false,
        }
    }

    pub async fn put_model_definition(&self, def: ModelDefinition) {
        let mut inner = self.inner.write().await;
        inner
            .model_definitions
            .insert(key(&def.tenant_id, &def.id), def);
    }

    pub async fn put_model_configuration(&self, cfg: ModelConfiguration) {
        let mut inner = self.inner.write().await;
        inner
            .model_configurations
            .insert(key(&cfg.tenant_id, &cfg.id), cfg);
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Directory for MemoryDirectory {
    async fn read_endpoint(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ModelRunnerEndpoint>> {
        let inner = self.inner.read().await;
        Ok(inner.endpoints.get(&key(tenant_id, id)).cloned())
    }

    async fn read_vmr(&self, tenant_id: &str, id: &str) -> Result<Option<VirtualModelRunner>> {
        let inner = self.inner.read().await;
        Ok(inner.vmrs.get(&key(tenant_id, id)).cloned())
    }

    async fn read_model_definition(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ModelDefinition>> {
        let inner = self.inner.read().await;
        Ok(inner.model_definitions.get(&key(tenant_id, id)).cloned())
    }

    async fn read_model_configuration(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ModelConfiguration>> {
        let inner = self.inner.read().await;
        Ok(inner.model_configurations.get(&key(tenant_id, id)).cloned())
    }

    async fn read_vmr_by_routing_key(
        &self,
        path: &str,
        host: Option<&str>,
    ) -> Result<Option<VirtualModelRunner>> {
        let inner = self.inner.read().await;
        let best = inner
            .vmrs
            .values()
            .filter_map(|vmr| vmr.match_score(path, host).map(|score| (score, vmr)))
            .max_by_key(|(score, vmr)| (*score, vmr.active))
            .map(|(_, vmr)| vmr.clone());
        Ok(best)
    }

    async fn list_endpoints(&self, tenant_id: Option<&str>) -> Result<Vec<ModelRunnerEndpoint>> {
        let inner = self.inner.read().await;
        Ok(inner
            .endpoints
            .values()
            .filter(|ep| tenant_id.map_or(true, |t| ep.tenant_id == t))
            .cloned()
            .collect())
    }

    async fn list_vmrs(&self, tenant_id: Option<&str>) -> Result<Vec<VirtualModelRunner>> {
        let inner = self.inner.read().await;
        Ok(inner
            .vmrs
            .values()
            .filter(|vmr| tenant_id.map_or(true, |t| vmr.tenant_id == t))
            .cloned()
            .collect())
    }

    async fn watch(&self) -> Result<EventStream> {
        let rx = self.tx.subscribe();
        // A lagged watcher has lost events for good; end the stream so the
        // consumer re-lists instead.
        let stream = BroadcastStream::new(rx)
            .take_while(|msg| match msg {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(error=%e, "directory watcher lagged, ending watch");
                    false
                }
            })
            .filter_map(Result::ok);
        Ok(Box::pin(stream))
    }
}
