//! Who is calling. The control plane never authenticates by itself; an
//! upstream proxy is expected to set the identity header.

use crate::config::{AuthConfig, DevelopmentConfig};
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::Requester;
use axum::http::{HeaderMap, HeaderName};

pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<Requester>;
}

/// Reads the identity from a single request header
pub struct HeaderIdentityResolver {
    header: HeaderName,
    fallback: Option<String>,
}

impl HeaderIdentityResolver {
    pub fn new(header: &str) -> ControlPlaneResult<Self> {
        let header = HeaderName::try_from(header).map_err(|e| {
            ControlPlaneError::InvalidRequest(format!("invalid identity header '{header}': {e}"))
        })?;

        Ok(Self {
            header,
            fallback: None,
        })
    }

    /// Identity used when the header is absent
    pub fn with_fallback(mut self, identity: impl Into<String>) -> Self {
        self.fallback = Some(identity.into());
        self
    }

    pub fn from_config(
        auth: &AuthConfig,
        development: &DevelopmentConfig,
    ) -> ControlPlaneResult<Self> {
        let resolver = Self::new(&auth.identity_header)?;
        if development.bypass_auth {
            return Ok(resolver.with_fallback(development.dev_identity.clone()));
        }
        Ok(resolver)
    }
}

impl IdentityResolver for HeaderIdentityResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<Requester> {
        headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .filter(|identity| !identity.is_empty())
            .map(Requester::new)
            .or_else(|| self.fallback.clone().map(Requester::new))
    }
}
