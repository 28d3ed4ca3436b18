use async_trait::async_trait;
use hyper::ext::ReasonPhrase;
use rc3_core::NodeSummary;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::debug;

use super::{ClusterError, ClusterRepository, ClusterResult, ContainerSpec, ResourceRecord, TaskId};
use crate::config::ProxmoxConfig;

/// `ClusterRepository` backed by the Proxmox VE REST API
pub struct ProxmoxClusterRepository {
    client: Client,
    base_url: String,
    authorization: String,
}

impl ProxmoxClusterRepository {
    pub fn new(config: &ProxmoxConfig) -> ClusterResult<Self> {
        // Without TLS verification we still speak https; self-signed clusters
        // are the common case.
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.use_tls)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ClusterError::Transport(e.without_url().to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            authorization: format!("PVEAPIToken={}={}", config.token_id, config.token_secret),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ClusterResult<T> {
        self.send(self.client.get(self.url(path))).await
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClusterResult<T> {
        let response = request
            .header(AUTHORIZATION, &self.authorization)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let reason = reason_phrase(&response);
            let body = response.text().await.unwrap_or_default();
            let message = upstream_message(&body)
                .or(reason)
                .or_else(|| status.canonical_reason().map(str::to_string))
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(ClusterError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| ClusterError::Decode(e.without_url().to_string()))?;
        Ok(envelope.data)
    }

    async fn list_guests(&self, node: &str, kind: &str) -> ClusterResult<Vec<ResourceRecord>> {
        let guests: Vec<GuestWire> = self.get(&format!("/nodes/{node}/{kind}")).await?;
        Ok(guests
            .into_iter()
            .map(|guest| guest.into_record(node))
            .collect())
    }
}

#[async_trait]
impl ClusterRepository for ProxmoxClusterRepository {
    async fn version(&self) -> ClusterResult<String> {
        let version: VersionWire = self.get("/version").await?;
        Ok(version.version)
    }

    async fn list_nodes(&self) -> ClusterResult<Vec<NodeSummary>> {
        let nodes: Vec<NodeWire> = self.get("/nodes").await?;
        Ok(nodes.into_iter().map(NodeSummary::from).collect())
    }

    async fn list_containers(&self, node: &str) -> ClusterResult<Vec<ResourceRecord>> {
        self.list_guests(node, "lxc").await
    }

    async fn list_vms(&self, node: &str) -> ClusterResult<Vec<ResourceRecord>> {
        self.list_guests(node, "qemu").await
    }

    async fn next_id(&self) -> ClusterResult<u64> {
        let id: LenientU64 = self.get("/cluster/nextid").await?;
        Ok(id.0)
    }

    async fn create_container(
        &self,
        node: &str,
        id: u64,
        spec: &ContainerSpec,
    ) -> ClusterResult<TaskId> {
        let mut form = Vec::with_capacity(spec.options.len() + 2);
        form.push(("vmid".to_string(), id.to_string()));
        form.extend(spec.options.iter().cloned());
        if !spec.tags.is_empty() {
            form.push(("tags".to_string(), spec.tags.clone()));
        }

        debug!(%node, id, "Submitting container create");
        let request = self
            .client
            .post(self.url(&format!("/nodes/{node}/lxc")))
            .form(&form);

        match self.send::<String>(request).await {
            Err(ClusterError::Upstream { message, .. }) if is_id_conflict(&message) => {
                Err(ClusterError::IdConflict(id))
            }
            other => other,
        }
    }

    async fn delete_container(&self, node: &str, id: u64) -> ClusterResult<TaskId> {
        debug!(%node, id, "Submitting container delete");
        let request = self
            .client
            .delete(self.url(&format!("/nodes/{node}/lxc/{id}")))
            .query(&[("purge", "1"), ("force", "1")]);
        self.send(request).await
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct VersionWire {
    version: String,
}

#[derive(Debug, Deserialize)]
struct NodeWire {
    node: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    cpu: f64,
    #[serde(default)]
    maxcpu: u32,
    #[serde(default)]
    mem: u64,
    #[serde(default)]
    maxmem: u64,
}

impl From<NodeWire> for NodeSummary {
    fn from(wire: NodeWire) -> Self {
        NodeSummary {
            name: wire.node,
            status: wire.status,
            cpu: wire.cpu,
            max_cpu: wire.maxcpu,
            mem: wire.mem,
            max_mem: wire.maxmem,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GuestWire {
    vmid: LenientU64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    uptime: u64,
    #[serde(default)]
    tags: String,
}

impl GuestWire {
    fn into_record(self, node: &str) -> ResourceRecord {
        ResourceRecord {
            id: self.vmid.0,
            name: self.name,
            node: node.to_string(),
            status: self.status,
            uptime: self.uptime,
            tags: self.tags,
        }
    }
}

/// Proxmox reports ids as numbers on some endpoints and strings on others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LenientU64(u64);

impl<'de> Deserialize<'de> for LenientU64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(LenientU64(n)),
            Raw::Text(s) => s
                .trim()
                .parse()
                .map(LenientU64)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Proxmox puts its error text in the status line and leaves the body as
/// `{"data":null}`. hyper only keeps the phrase when it is not the canonical one.
fn reason_phrase(response: &Response) -> Option<String> {
    response
        .extensions()
        .get::<ReasonPhrase>()
        .map(|reason| String::from_utf8_lossy(reason.as_bytes()).trim().to_string())
        .filter(|reason| !reason.is_empty())
}

fn upstream_message(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }

    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        if let Some(message) = envelope.message.filter(|m| !m.trim().is_empty()) {
            return Some(message.trim().to_string());
        }
        if let Some(errors) = envelope.errors.filter(|e| !e.is_empty()) {
            let joined = errors
                .iter()
                .map(|(field, reason)| match reason.as_str() {
                    Some(reason) => format!("{field}: {}", reason.trim()),
                    None => format!("{field}: {reason}"),
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Some(joined);
        }
        return None;
    }

    Some(body.to_string())
}

fn is_id_conflict(message: &str) -> bool {
    message.contains("already exists")
}
