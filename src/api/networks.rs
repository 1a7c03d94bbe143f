use axum::Json;
use axum::extract::Path;
use bollard::models::{Ipam, IpamConfig, NetworkCreateRequest};
use bollard::query_parameters::{ListNetworksOptions, ListNetworksOptionsBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::docker::get_docker;

use super::error::{ApiError, not_found};

#[derive(Debug, Serialize)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub scope: String,
}

pub async fn list() -> Result<Json<Vec<NetworkInfo>>, ApiError> {
    let options: ListNetworksOptions = ListNetworksOptionsBuilder::new().build();

    let networks = get_docker().list_networks(Some(options)).await?;

    let infos = networks
        .into_iter()
        .map(|network| NetworkInfo {
            id: network.id.unwrap_or_default(),
            name: network.name.unwrap_or_default(),
            driver: network.driver.unwrap_or_default(),
            scope: network.scope.unwrap_or_default(),
        })
        .collect();

    Ok(Json(infos))
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
pub enum NetworkDriver {
    #[default]
    #[serde(alias = "bridge")]
    Bridge,
    #[serde(alias = "host")]
    Host,
    #[serde(alias = "overlay")]
    Overlay,
    #[serde(alias = "macvlan")]
    Macvlan,
    #[serde(alias = "none")]
    None,
}

impl NetworkDriver {
    fn as_str(self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Host => "host",
            Self::Overlay => "overlay",
            Self::Macvlan => "macvlan",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    #[serde(default)]
    pub driver: NetworkDriver,
    #[serde(default)]
    pub internal: bool,
    #[serde(default = "default_attachable")]
    pub attachable: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Optional subnet in CIDR notation.
    pub subnet: Option<String>,
    /// Optional gateway IP.
    pub gateway: Option<String>,
}

fn default_attachable() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct CreateNetworkResponse {
    pub name: String,
}

pub async fn create(
    Json(req): Json<CreateNetworkRequest>,
) -> Result<Json<CreateNetworkResponse>, ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("Network name is required".into()));
    }

    // Build IPAM configuration if subnet or gateway is specified
    let ipam = if req.subnet.is_some() || req.gateway.is_some() {
        let ipam_config = IpamConfig {
            subnet: req.subnet.clone(),
            gateway: req.gateway.clone(),
            ip_range: None,
            auxiliary_addresses: None,
        };

        Some(Ipam {
            driver: Some("default".to_string()),
            config: Some(vec![ipam_config]),
            options: None,
        })
    } else {
        None
    };

    let request = NetworkCreateRequest {
        name: req.name.clone(),
        driver: Some(req.driver.as_str().to_string()),
        internal: Some(req.internal),
        attachable: Some(req.attachable),
        labels: Some(req.labels),
        ipam,
        ..Default::default()
    };

    get_docker().create_network(request).await?;

    log::info!("Network {} created", req.name);
    Ok(Json(CreateNetworkResponse { name: req.name }))
}

pub async fn remove(Path(id): Path<String>) -> Result<(), ApiError> {
    get_docker()
        .remove_network(&id)
        .await
        .map_err(|e| not_found(e, &id))?;

    log::info!("Network {} removed", id);
    Ok(())
}
