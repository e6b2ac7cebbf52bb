use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use conductor_common::{
    ModelConfiguration, ModelDefinition, ModelRunnerEndpoint, VirtualModelRunner,
};

/// Configuration change the routing core has to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    EndpointCreated(ModelRunnerEndpoint),
    EndpointUpdated(ModelRunnerEndpoint),
    EndpointDeleted(ModelRunnerEndpoint),
    VmrUpdated(VirtualModelRunner),
    VmrDeleted(VirtualModelRunner),
}

pub type EventStream = Pin<Box<dyn Stream<Item = DirectoryEvent> + Send>>;

/// Bulk contents of a directory, as loaded from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DirectorySnapshot {
    #[serde(default)]
    pub vmrs: Vec<VirtualModelRunner>,
    #[serde(default)]
    pub endpoints: Vec<ModelRunnerEndpoint>,
    #[serde(default)]
    pub model_definitions: Vec<ModelDefinition>,
    #[serde(default)]
    pub model_configurations: Vec<ModelConfiguration>,
}

/// Read-only view of tenant configuration consumed by the router.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn read_endpoint(&self, tenant_id: &str, id: &str)
        -> Result<Option<ModelRunnerEndpoint>>;
    async fn read_vmr(&self, tenant_id: &str, id: &str) -> Result<Option<VirtualModelRunner>>;
    async fn read_model_definition(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ModelDefinition>>;
    async fn read_model_configuration(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ModelConfiguration>>;

    /// Most specific runner whose base path and/or hostname matches. Inactive
    /// runners are returned too; the caller decides what to do with them.
    async fn read_vmr_by_routing_key(
        &self,
        path: &str,
        host: Option<&str>,
    ) -> Result<Option<VirtualModelRunner>>;

    async fn list_endpoints(&self, tenant_id: Option<&str>) -> Result<Vec<ModelRunnerEndpoint>>;
    async fn list_vmrs(&self, tenant_id: Option<&str>) -> Result<Vec<VirtualModelRunner>>;

    /// Change events emitted after each write.
    async fn watch(&self) -> Result<EventStream>;
}
