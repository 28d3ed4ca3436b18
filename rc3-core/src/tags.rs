//! Ownership tags
//!
//! The cluster has no custom metadata field, only a free-text tag list. We
//! store `size=<size>,owner=<owner>` there. Decoding is best-effort and
//! forward-compatible: unknown keys and malformed segments are skipped, and
//! anything missing falls back to an empty owner and `InstanceSize::Unknown`.

use crate::{CoreError, InstanceSize, Result};
use std::fmt;
use std::str::FromStr;

/// Segment delimiter reserved by the cluster's tagging mechanism.
pub const DELIMITER: char = ',';

pub const SIZE_KEY: &str = "size";
pub const OWNER_KEY: &str = "owner";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipTag {
    pub owner: String,
    pub size: InstanceSize,
}

impl Default for OwnershipTag {
    fn default() -> Self {
        Self {
            owner: String::new(),
            size: InstanceSize::Unknown,
        }
    }
}

impl OwnershipTag {
    pub fn new(owner: impl Into<String>, size: InstanceSize) -> Result<Self> {
        let owner = owner.into();
        validate_owner(&owner)?;
        Ok(Self { owner, size })
    }
}

impl fmt::Display for OwnershipTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SIZE_KEY}={}{DELIMITER}{OWNER_KEY}={}",
            self.size, self.owner
        )
    }
}

impl FromStr for OwnershipTag {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(decode(s))
    }
}

fn validate_owner(owner: &str) -> Result<()> {
    if owner.contains(DELIMITER) {
        return Err(CoreError::InvalidOwner(format!(
            "owner identity must not contain '{DELIMITER}'"
        )));
    }
    Ok(())
}

pub fn encode(owner: &str, size: InstanceSize) -> Result<String> {
    Ok(OwnershipTag::new(owner, size)?.to_string())
}

pub fn decode(tag: &str) -> OwnershipTag {
    let mut decoded = OwnershipTag::default();

    for segment in tag.split(DELIMITER) {
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };

        match key.trim() {
            SIZE_KEY => {
                decoded.size = value.parse().unwrap_or(InstanceSize::Unknown);
            }
            OWNER_KEY => {
                decoded.owner = value.to_string();
            }
            _ => {}
        }
    }

    decoded
}
