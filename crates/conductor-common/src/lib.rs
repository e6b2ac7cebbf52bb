pub mod endpoint;
pub mod model;
pub mod vmr;

pub use endpoint::{
    ApiType, EndpointHealthState, HealthCheckConfig, HealthCheckMethod, ModelRunnerEndpoint,
};
pub use model::{ModelConfiguration, ModelDefinition};
pub use vmr::{LoadBalancingMode, SessionAffinityMode, VirtualModelRunner};

pub mod telemetry;
