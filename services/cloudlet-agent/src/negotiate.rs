//! Destination negotiation for cross-deployment handoff.
//!
//! Before streaming a VM to another deployment, the source resolves the
//! destination's copy of the base VM, a network and an exactly matching
//! flavor, then asks the destination to create a VM that will receive the
//! handoff. The create reply says where the receiving worker listens.

use std::time::Duration;

use cloudlet_id::BaseHash;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{ImageRecord, AUTH_HEADER};
use crate::handoff::HandoffDestination;
use crate::image::{ArtifactKind, PROP_BASE_HASH, PROP_CLOUDLET_TYPE};

/// Errors from destination negotiation.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("No base VM with hash {base_hash} at {endpoint}")]
    NoMatchingBaseVm { base_hash: BaseHash, endpoint: String },

    #[error("No network {name:?} owned by project {project_id} at {endpoint}")]
    NoMatchingNetwork {
        name: Option<String>,
        project_id: String,
        endpoint: String,
    },

    #[error("No flavor with vcpus={vcpus}, ram={memory_mb}MB at {endpoint}")]
    NoMatchingFlavor {
        vcpus: u32,
        memory_mb: u64,
        endpoint: String,
    },

    #[error("Destination reply carries no handoff address")]
    MissingHandoffAddress,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Destination returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Service endpoints of the destination deployment.
#[derive(Debug, Clone)]
pub struct DestinationEndpoints {
    /// Compute API, including any version/project path.
    pub compute_url: String,
    pub image_url: String,
    pub network_url: String,
}

/// What the source knows about the VM being handed off.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub display_name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub base_hash: BaseHash,
    pub project_id: String,
    pub overlay_url: Option<String>,
}

/// Where the destination's receiving worker listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffDestinationAddress {
    pub server_ip: String,
    #[serde(with = "port_repr")]
    pub server_port: u16,
}

impl HandoffDestinationAddress {
    pub fn destination(&self) -> HandoffDestination {
        HandoffDestination::Tcp {
            host: self.server_ip.clone(),
            port: self.server_port,
        }
    }
}

/// Ports arrive as numbers or numeric strings.
mod port_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    pub fn serialize<S: Serializer>(port: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(*port)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        match Port::deserialize(deserializer)? {
            Port::Number(port) => Ok(port),
            Port::Text(raw) => raw.trim().parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Network entry from the destination's network API.
#[derive(Debug, Clone, Deserialize)]
pub struct Network {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project_id: String,
}

/// Flavor entry from the destination's compute API.
#[derive(Debug, Clone, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub vcpus: u32,
    pub ram: u64,
}

#[derive(Deserialize)]
struct ImageList {
    images: Vec<ImageRecord>,
}

#[derive(Deserialize)]
struct NetworkList {
    networks: Vec<Network>,
}

#[derive(Deserialize)]
struct FlavorList {
    flavors: Vec<Flavor>,
}

#[derive(Deserialize)]
struct CreateReply {
    handoff: Option<HandoffDestinationAddress>,
}

/// Base disk on the destination whose base hash matches.
pub fn find_base_image<'a>(images: &'a [ImageRecord], base_hash: &BaseHash) -> Option<&'a ImageRecord> {
    images.iter().find(|image| {
        image.property_str(PROP_CLOUDLET_TYPE) == Some(ArtifactKind::Disk.cloudlet_type())
            && image.property_str(PROP_BASE_HASH) == Some(base_hash.as_str())
    })
}

/// Network owned by `project_id` whose name is exactly `name`. Without a
/// name nothing matches.
pub fn find_network<'a>(
    networks: &'a [Network],
    project_id: &str,
    name: Option<&str>,
) -> Option<&'a Network> {
    let name = name?;
    networks
        .iter()
        .find(|network| network.project_id == project_id && network.name == name)
}

/// Flavor with exactly the requested vCPU count and RAM.
pub fn find_flavor(flavors: &[Flavor], vcpus: u32, memory_mb: u64) -> Option<&Flavor> {
    flavors
        .iter()
        .find(|flavor| flavor.vcpus == vcpus && flavor.ram == memory_mb)
}

/// HTTP client for the destination deployment.
pub struct DestinationClient {
    client: Client,
}

impl DestinationClient {
    pub fn new(timeout: Duration) -> Result<Self, NegotiationError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        token: &str,
    ) -> Result<T, NegotiationError> {
        debug!(url = %url, "Querying destination");
        let response = self.client.get(&url).header(AUTH_HEADER, token).send().await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// Resolve base VM, network and flavor at the destination and request a
    /// VM there that will receive the handoff.
    pub async fn resolve_and_create(
        &self,
        endpoints: &DestinationEndpoints,
        token: &str,
        instance: &InstanceSpec,
        dest_name: Option<&str>,
        dest_network: Option<&str>,
    ) -> Result<HandoffDestinationAddress, NegotiationError> {
        let compute = endpoints.compute_url.trim_end_matches('/');

        let images: ImageList = self
            .get(format!("{}/v2/images", endpoints.image_url.trim_end_matches('/')), token)
            .await?;
        let image = find_base_image(&images.images, &instance.base_hash).ok_or_else(|| {
            NegotiationError::NoMatchingBaseVm {
                base_hash: instance.base_hash.clone(),
                endpoint: endpoints.image_url.clone(),
            }
        })?;

        let networks: NetworkList = self
            .get(
                format!("{}/v2.0/networks", endpoints.network_url.trim_end_matches('/')),
                token,
            )
            .await?;
        let network = find_network(&networks.networks, &instance.project_id, dest_network)
            .ok_or_else(|| NegotiationError::NoMatchingNetwork {
                name: dest_network.map(str::to_string),
                project_id: instance.project_id.clone(),
                endpoint: endpoints.network_url.clone(),
            })?;

        let flavors: FlavorList = self.get(format!("{compute}/flavors/detail"), token).await?;
        let flavor = find_flavor(&flavors.flavors, instance.vcpus, instance.memory_mb).ok_or_else(
            || NegotiationError::NoMatchingFlavor {
                vcpus: instance.vcpus,
                memory_mb: instance.memory_mb,
                endpoint: compute.to_string(),
            },
        )?;

        let name = dest_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-handoff", instance.display_name));
        let body = serde_json::json!({
            "server": {
                "name": name,
                "imageRef": image.id,
                "flavorRef": flavor.id,
                "metadata": {
                    "handoff_info": name,
                    "overlay_url": instance.overlay_url,
                },
                "min_count": "1",
                "max_count": "1",
                "networks": [{ "uuid": network.id }],
            }
        });

        info!(
            endpoint = %compute,
            image_id = %image.id,
            flavor_id = %flavor.id,
            network_id = %network.id,
            name = %name,
            "Requesting handoff destination VM"
        );
        let response = self
            .client
            .post(format!("{compute}/servers"))
            .header(AUTH_HEADER, token)
            .json(&body)
            .send()
            .await?;
        let reply: CreateReply = check_status(response).await?.json().await?;

        reply.handoff.ok_or(NegotiationError::MissingHandoffAddress)
    }
}

async fn check_status(response: Response) -> Result<Response, NegotiationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(NegotiationError::Status {
        status: status.as_u16(),
        body,
    })
}
