//! Cloud provisioner trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::ResourceId;

use crate::error::ServiceError;

/// Connection details of a running instance.
#[derive(Debug, Clone)]
pub struct InstanceDetails {
    pub admin_url: String,
    pub ip_addr: String,
}

/// Trait for the cloud provider that runs the actual servers.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Launches an instance for the resource; returns the provider's
    /// instance identifier.
    async fn provision(&self, resource_id: ResourceId) -> Result<String, ServiceError>;

    /// Tears down a running instance.
    async fn terminate(&self, provider_instance_id: &str) -> Result<(), ServiceError>;

    /// Looks up connection details of a running instance.
    async fn describe(&self, provider_instance_id: &str)
    -> Result<InstanceDetails, ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryProvisionerState {
    running: HashMap<String, ResourceId>,
    provisioned: u32,
    terminated: u32,
    fail_on_provision: bool,
    fail_on_terminate: bool,
}

/// In-memory provisioner for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvisioner {
    state: Arc<RwLock<InMemoryProvisionerState>>,
}

impl InMemoryProvisioner {
    /// Creates a new in-memory provisioner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the provisioner to fail launches transiently.
    pub fn set_fail_on_provision(&self, fail: bool) {
        self.state.write().unwrap().fail_on_provision = fail;
    }

    /// Configures the provisioner to fail teardowns transiently.
    pub fn set_fail_on_terminate(&self, fail: bool) {
        self.state.write().unwrap().fail_on_terminate = fail;
    }

    /// Returns how many instances were launched in total.
    pub fn provision_count(&self) -> u32 {
        self.state.read().unwrap().provisioned
    }

    /// Returns how many instances were torn down in total.
    pub fn terminate_count(&self) -> u32 {
        self.state.read().unwrap().terminated
    }

    /// Returns the number of currently running instances.
    pub fn running_count(&self) -> usize {
        self.state.read().unwrap().running.len()
    }

    /// Returns true if the given instance is currently running.
    pub fn is_running(&self, provider_instance_id: &str) -> bool {
        self.state
            .read()
            .unwrap()
            .running
            .contains_key(provider_instance_id)
    }
}

#[async_trait]
impl Provisioner for InMemoryProvisioner {
    async fn provision(&self, resource_id: ResourceId) -> Result<String, ServiceError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_provision {
            return Err(ServiceError::TransientUpstream {
                service: "provisioner",
                reason: "instance quota exceeded".to_string(),
            });
        }

        state.provisioned += 1;
        let instance_id = format!("i-{:08x}", state.provisioned);
        state.running.insert(instance_id.clone(), resource_id);

        Ok(instance_id)
    }

    async fn terminate(&self, provider_instance_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_terminate {
            return Err(ServiceError::TransientUpstream {
                service: "provisioner",
                reason: "terminate endpoint unavailable".to_string(),
            });
        }

        if state.running.remove(provider_instance_id).is_some() {
            state.terminated += 1;
        }
        Ok(())
    }

    async fn describe(
        &self,
        provider_instance_id: &str,
    ) -> Result<InstanceDetails, ServiceError> {
        Ok(InstanceDetails {
            admin_url: format!("https://admin.example.com/{provider_instance_id}"),
            ip_addr: "10.11.12.13".to_string(),
        })
    }
}
