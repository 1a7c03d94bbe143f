use axum::Json;
use axum::extract::Path;
use bollard::models::{
    ContainerCreateBody, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateContainerOptionsBuilder, InspectContainerOptions,
    InspectContainerOptionsBuilder, ListContainersOptions, ListContainersOptionsBuilder,
    RemoveContainerOptions, RemoveContainerOptionsBuilder, RestartContainerOptions,
    RestartContainerOptionsBuilder, StartContainerOptions, StartContainerOptionsBuilder,
    StopContainerOptions, StopContainerOptionsBuilder,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::docker::get_docker;

use super::error::{ApiError, not_found};
use super::images::pull_image;

#[derive(Debug, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
    pub created: i64,
}

pub async fn list() -> Result<Json<Vec<ContainerInfo>>, ApiError> {
    let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(true).build();

    let containers = get_docker().list_containers(Some(options)).await?;

    let infos = containers
        .into_iter()
        .map(|summary| ContainerInfo {
            id: summary.id.unwrap_or_default(),
            names: summary
                .names
                .unwrap_or_default()
                .into_iter()
                .map(|n| n.strip_prefix('/').map(str::to_owned).unwrap_or(n))
                .collect(),
            image: summary.image.unwrap_or_default(),
            state: summary
                .state
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            status: summary.status.unwrap_or_default(),
            created: summary.created.unwrap_or_default(),
        })
        .collect();

    Ok(Json(infos))
}

#[derive(Debug, Serialize)]
pub struct ContainerDetailsResponse {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub created: String,
}

pub async fn inspect(Path(id): Path<String>) -> Result<Json<ContainerDetailsResponse>, ApiError> {
    let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

    let info = get_docker()
        .inspect_container(&id, Some(options))
        .await
        .map_err(|e| not_found(e, &id))?;

    let name = info.name.unwrap_or_default();
    Ok(Json(ContainerDetailsResponse {
        id: info.id.unwrap_or(id),
        name: name.strip_prefix('/').map(str::to_owned).unwrap_or(name),
        image: info.config.and_then(|c| c.image).unwrap_or_default(),
        state: info
            .state
            .and_then(|s| s.status)
            .map(crate::watcher::state_label)
            .unwrap_or("unknown")
            .to_string(),
        created: info.created.unwrap_or_default(),
    }))
}

/// Restart policy accepted on container creation.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
pub enum RestartRequest {
    #[serde(alias = "always")]
    Always,
    #[default]
    #[serde(alias = "no", alias = "never")]
    No,
    #[serde(alias = "on-failure", alias = "on_failure", alias = "onfailure")]
    OnFailure,
    #[serde(
        alias = "unless-stopped",
        alias = "unless_stopped",
        alias = "unlessstopped"
    )]
    UnlessStopped,
}

impl RestartRequest {
    fn into_policy(self) -> RestartPolicy {
        let name = match self {
            Self::Always => RestartPolicyNameEnum::ALWAYS,
            Self::No => RestartPolicyNameEnum::NO,
            Self::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
            Self::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        };
        RestartPolicy {
            name: Some(name),
            maximum_retry_count: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeMapping {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateContainerRequest {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeMapping>,
    #[serde(default)]
    pub restart: RestartRequest,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Memory limit (e.g., "512m", "2g")
    pub memory: Option<String>,
    /// Number of CPUs (e.g., "1.5", "2")
    pub cpus: Option<String>,
    /// Pull the image before creating the container.
    #[serde(default)]
    pub pull: bool,
}

#[derive(Debug, Serialize)]
pub struct CreateContainerResponse {
    pub id: String,
    pub warnings: Vec<String>,
}

pub async fn create(
    Json(req): Json<CreateContainerRequest>,
) -> Result<Json<CreateContainerResponse>, ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("Container name is required".into()));
    }
    if req.image.is_empty() {
        return Err(ApiError::BadRequest("Image is required".into()));
    }

    if req.pull {
        pull_image(&req.image).await?;
    }

    let docker = get_docker();

    // Build port bindings
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    let mut exposed_ports: Vec<String> = Vec::new();

    for port in &req.ports {
        let container_port = format!("{}/tcp", port.container);
        exposed_ports.push(container_port.clone());
        port_bindings.insert(
            container_port,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.host.to_string()),
            }]),
        );
    }

    // Build volume bindings
    let binds: Vec<String> = req
        .volumes
        .iter()
        .map(|v| {
            if v.readonly {
                format!("{}:{}:ro", v.source, v.target)
            } else {
                format!("{}:{}", v.source, v.target)
            }
        })
        .collect();

    // Build environment variables
    let env: Vec<String> = req.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

    // Parse memory limit
    let memory = req.memory.as_ref().map(|m| parse_memory_limit(m));

    // Parse CPU limit (convert to nano CPUs)
    let nano_cpus = req.cpus.as_ref().map(|c| {
        let cpus: f64 = c.parse().unwrap_or(1.0);
        (cpus * 1_000_000_000.0) as i64
    });

    let host_config = HostConfig {
        binds: if binds.is_empty() { None } else { Some(binds) },
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        restart_policy: Some(req.restart.into_policy()),
        memory,
        nano_cpus,
        ..Default::default()
    };

    let config = ContainerCreateBody {
        image: Some(req.image.clone()),
        hostname: req.hostname.clone(),
        user: req.user.clone(),
        working_dir: req.working_dir.clone(),
        env: if env.is_empty() { None } else { Some(env) },
        cmd: req.command.clone(),
        entrypoint: req.entrypoint.clone(),
        exposed_ports: if exposed_ports.is_empty() {
            None
        } else {
            Some(exposed_ports)
        },
        host_config: Some(host_config),
        ..Default::default()
    };

    let options: CreateContainerOptions = CreateContainerOptionsBuilder::new()
        .name(&req.name)
        .build();

    let response = docker.create_container(Some(options), config).await?;

    log::info!("Container {} created ({})", req.name, response.id);
    Ok(Json(CreateContainerResponse {
        id: response.id,
        warnings: response.warnings,
    }))
}

pub async fn start(Path(id): Path<String>) -> Result<(), ApiError> {
    let options: StartContainerOptions = StartContainerOptionsBuilder::new().build();

    match get_docker().start_container(&id, Some(options)).await {
        Ok(_) => {
            log::info!("Container {} started", id);
            Ok(())
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        }) => {
            log::info!("Container {} already running", id);
            Ok(())
        }
        Err(e) => Err(not_found(e, &id)),
    }
}

pub async fn stop(Path(id): Path<String>) -> Result<(), ApiError> {
    let options: StopContainerOptions = StopContainerOptionsBuilder::new().t(10).build();

    match get_docker().stop_container(&id, Some(options)).await {
        Ok(_) => {
            log::info!("Container {} stopped", id);
            Ok(())
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        }) => {
            log::info!("Container {} already stopped", id);
            Ok(())
        }
        Err(e) => Err(not_found(e, &id)),
    }
}

pub async fn restart(Path(id): Path<String>) -> Result<(), ApiError> {
    let options: RestartContainerOptions = RestartContainerOptionsBuilder::new().t(10).build();

    get_docker()
        .restart_container(&id, Some(options))
        .await
        .map_err(|e| not_found(e, &id))?;

    log::info!("Container {} restarted", id);
    Ok(())
}

pub async fn remove(Path(id): Path<String>) -> Result<(), ApiError> {
    let options: RemoveContainerOptions = RemoveContainerOptionsBuilder::new().force(true).build();

    get_docker()
        .remove_container(&id, Some(options))
        .await
        .map_err(|e| not_found(e, &id))?;

    log::info!("Container {} removed", id);
    Ok(())
}

/// Parse memory limit string (e.g., "512m", "2g") to bytes
fn parse_memory_limit(limit: &str) -> i64 {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with("g") {
        (&limit[..limit.len() - 1], 1024 * 1024 * 1024)
    } else if limit.ends_with("m") {
        (&limit[..limit.len() - 1], 1024 * 1024)
    } else if limit.ends_with("k") {
        (&limit[..limit.len() - 1], 1024)
    } else if limit.ends_with("b") {
        (&limit[..limit.len() - 1], 1)
    } else {
        (limit.as_str(), 1)
    };

    num_str.parse::<i64>().unwrap_or(0) * multiplier
}
