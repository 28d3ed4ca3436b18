pub mod cluster;
pub mod identity;
pub mod instance_management;
pub mod inventory;
pub mod observability;
