use async_trait::async_trait;
use bollard::models::ContainerStateStatusEnum;
use bollard::query_parameters::{InspectContainerOptions, InspectContainerOptionsBuilder};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::docker::get_docker;
use crate::relay::OutboundEventPayload;

use super::event::RawEvent;

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("Container not found")]
    NotFound,
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
}

/// Metadata returned by a container point lookup.
#[derive(Debug, Clone, Default)]
pub struct ContainerMetadata {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub created: String,
    pub env: Vec<String>,
}

/// Point-lookup seam for container metadata. The production implementation
/// queries the Docker daemon; tests substitute a canned or failing lookup.
#[async_trait]
pub trait ContainerInspector: Send + Sync {
    async fn inspect(&self, id: &str) -> Result<ContainerMetadata, InspectError>;
}

pub struct DockerInspector;

#[async_trait]
impl ContainerInspector for DockerInspector {
    async fn inspect(&self, id: &str) -> Result<ContainerMetadata, InspectError> {
        let docker = get_docker();

        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

        match docker.inspect_container(id, Some(options)).await {
            Ok(info) => {
                let config = info.config.unwrap_or_default();
                let state = info
                    .state
                    .and_then(|s| s.status)
                    .map(state_label)
                    .unwrap_or("unknown");
                Ok(ContainerMetadata {
                    id: info.id.unwrap_or_else(|| id.to_string()),
                    name: info.name.unwrap_or_default(),
                    image: config.image.unwrap_or_default(),
                    state: state.to_string(),
                    created: info.created.unwrap_or_default(),
                    env: config.env.unwrap_or_default(),
                })
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(InspectError::NotFound),
            Err(e) => Err(InspectError::DockerApi(e)),
        }
    }
}

pub(crate) fn state_label(status: ContainerStateStatusEnum) -> &'static str {
    match status {
        ContainerStateStatusEnum::EMPTY => "empty",
        ContainerStateStatusEnum::CREATED => "created",
        ContainerStateStatusEnum::RUNNING => "running",
        ContainerStateStatusEnum::PAUSED => "paused",
        ContainerStateStatusEnum::RESTARTING => "restarting",
        ContainerStateStatusEnum::REMOVING => "removing",
        ContainerStateStatusEnum::EXITED => "exited",
        ContainerStateStatusEnum::DEAD => "dead",
    }
}

/// Identifiers core injects into the environment of containers it deploys.
/// Derived per enrichment, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    pub application_id: Option<String>,
    pub environment_id: Option<String>,
    pub deployment_id: Option<String>,
}

impl ContainerDetails {
    pub fn from_env(env: &[String]) -> Self {
        let mut details = Self::default();
        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                match key {
                    "CORE_APP_ID" => details.application_id = Some(value.to_string()),
                    "CORE_ENV_ID" => details.environment_id = Some(value.to_string()),
                    "CORE_DEPLOYMENT_ID" => details.deployment_id = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        details
    }
}

/// Split an image reference into (name, tag) components.
///
/// The tag separator is the last colon, unless a slash follows it, in which
/// case the colon belongs to a registry port (e.g. `localhost:5000/app`).
/// A missing or empty tag defaults to "latest".
pub(crate) fn split_image_reference(image: &str) -> (&str, &str) {
    if let Some(colon_pos) = image.rfind(':') {
        let after_colon = &image[colon_pos + 1..];
        if !after_colon.contains('/') && !after_colon.is_empty() {
            return (&image[..colon_pos], after_colon);
        }
        if after_colon.is_empty() {
            return (&image[..colon_pos], "latest");
        }
    }

    (image, "latest")
}

/// Attaches inspected metadata to container-creation events.
///
/// Enrichment is best-effort: when the lookup fails (the container may be
/// gone by the time of inspection) the event is forwarded with its raw
/// actor attributes instead of being dropped.
pub struct EventEnricher {
    inspector: Arc<dyn ContainerInspector>,
}

impl EventEnricher {
    pub fn new(inspector: Arc<dyn ContainerInspector>) -> Self {
        Self { inspector }
    }

    /// Build the outbound payload for a filtered event.
    pub async fn build_payload(&self, event: RawEvent) -> OutboundEventPayload {
        let timestamp = emission_micros(&event);

        if event.kind == "container" && event.action == "create" {
            match self.inspector.inspect(&event.actor.id).await {
                Ok(meta) => {
                    return OutboundEventPayload::new(
                        timestamp,
                        event.action,
                        event.kind,
                        event.actor.id,
                        enriched_attributes(&meta),
                    );
                }
                Err(e) => {
                    log::error!(
                        "Failed to inspect container {} for enrichment: {e}",
                        event.actor.id
                    );
                }
            }
        }

        OutboundEventPayload::new(
            timestamp,
            event.action,
            event.kind,
            event.actor.id,
            raw_attributes(&event.actor.attributes),
        )
    }
}

/// Emission time of the event in microseconds, preferring the
/// nanosecond-precision field and falling back to the relay time when the
/// source carried neither.
fn emission_micros(event: &RawEvent) -> i64 {
    if event.time_nano > 0 {
        event.time_nano / 1_000
    } else if event.time > 0 {
        event.time * 1_000_000
    } else {
        chrono::Utc::now().timestamp_micros()
    }
}

fn raw_attributes(
    attributes: &std::collections::BTreeMap<String, String>,
) -> Map<String, Value> {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

fn enriched_attributes(meta: &ContainerMetadata) -> Map<String, Value> {
    let details = ContainerDetails::from_env(&meta.env);
    let (image, tag) = split_image_reference(&meta.image);
    let name = meta.name.strip_prefix('/').unwrap_or(&meta.name);

    let mut attributes = Map::new();
    attributes.insert("id".to_string(), Value::String(meta.id.clone()));
    attributes.insert("name".to_string(), Value::String(name.to_string()));
    attributes.insert("image".to_string(), Value::String(image.to_string()));
    attributes.insert("tag".to_string(), Value::String(tag.to_string()));
    attributes.insert("state".to_string(), Value::String(meta.state.clone()));
    attributes.insert("created".to_string(), Value::String(meta.created.clone()));
    attributes.insert("application_id".to_string(), opt_value(&details.application_id));
    attributes.insert("environment_id".to_string(), opt_value(&details.environment_id));
    attributes.insert("deployment_id".to_string(), opt_value(&details.deployment_id));
    attributes
}

fn opt_value(value: &Option<String>) -> Value {
    match value {
        Some(v) => Value::String(v.clone()),
        None => Value::Null,
    }
}
