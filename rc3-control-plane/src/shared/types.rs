use serde::{Deserialize, Serialize};

pub use rc3_core::{Instance, InstanceKind, InstanceSize};

/// Request to create a new instance. Fields stay raw strings so that
/// validation happens in one place, before any cluster call.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CreateInstanceRequest {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub size: String,
}

impl CreateInstanceRequest {
    pub fn new(kind: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            size: size.into(),
        }
    }
}

/// Request to delete an instance
#[derive(Debug, Clone, Copy)]
pub struct DeleteInstanceRequest {
    pub instance_id: u64,
}

/// Identity of whoever issued the request. Opaque to the control plane,
/// compared only for equality against decoded ownership tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub identity: String,
}

impl Requester {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

/// Result of a successful creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstance {
    pub id: u64,
    pub node: String,
    pub task: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListInstancesResponse {
    pub instances: Vec<Instance>,
}

/// Error body returned by the REST API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_details: String,
}
