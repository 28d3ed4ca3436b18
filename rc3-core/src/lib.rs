pub mod placement;
pub mod profile;
pub mod tags;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use placement::{FirstNode, NodeSummary, PlacementDecision, PlacementStrategy};
pub use profile::{NetworkSpec, ProfileResolver, ResourceProfile};
pub use tags::OwnershipTag;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("Invalid instance size: {0}")]
    InvalidSize(String),
    #[error("Invalid instance type: {0}")]
    InvalidKind(String),
    #[error("Invalid owner identity: {0}")]
    InvalidOwner(String),
    #[error("No nodes available for placement")]
    NoNodesAvailable,
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Which cluster subsystem owns an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceKind {
    #[serde(rename = "container")]
    Container,
    #[serde(rename = "vm")]
    VirtualMachine,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Container => "container",
            InstanceKind::VirtualMachine => "vm",
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "container" => Ok(InstanceKind::Container),
            "vm" => Ok(InstanceKind::VirtualMachine),
            other => Err(CoreError::InvalidKind(other.to_string())),
        }
    }
}

/// Abstract size class. `Unknown` is never requestable; it only shows up
/// when an instance's ownership tag is missing or unreadable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceSize {
    Small,
    Medium,
    Large,
    Unknown,
}

impl InstanceSize {
    pub const REQUESTABLE: [InstanceSize; 3] =
        [InstanceSize::Small, InstanceSize::Medium, InstanceSize::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceSize::Small => "small",
            InstanceSize::Medium => "medium",
            InstanceSize::Large => "large",
            InstanceSize::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InstanceSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceSize {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "small" => Ok(InstanceSize::Small),
            "medium" => Ok(InstanceSize::Medium),
            "large" => Ok(InstanceSize::Large),
            other => Err(CoreError::InvalidSize(other.to_string())),
        }
    }
}

/// Unified user-facing view of a container or virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: u64,
    pub kind: InstanceKind,
    pub size: InstanceSize,
    pub name: String,
    pub node: String,
    pub status: String,
    pub uptime: u64,
    pub owner: String,
}

impl Instance {
    pub fn is_owned_by(&self, identity: &str) -> bool {
        !self.owner.is_empty() && self.owner == identity
    }
}

/// Machine-readable failure category shared by every layer above core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    NotFound,
    PermissionDenied,
    Unauthenticated,
    UpstreamUnavailable,
    NoCapacity,
    AllocationConflict,
    Unsupported,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorCode::NoCapacity => "NO_CAPACITY",
            ErrorCode::AllocationConflict => "ALLOCATION_CONFLICT",
            ErrorCode::Unsupported => "UNSUPPORTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
        }
    }
}
