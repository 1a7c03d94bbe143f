use axum::Json;
use axum::extract::Path;
use bollard::query_parameters::{
    CreateImageOptions, CreateImageOptionsBuilder, ListImagesOptions, ListImagesOptionsBuilder,
    RemoveImageOptions, RemoveImageOptionsBuilder,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::docker::get_docker;
use crate::registry;
use crate::watcher::split_image_reference;

use super::error::{ApiError, not_found};

#[derive(Debug, Serialize)]
pub struct ImageInfo {
    pub id: String,
    pub tags: Vec<String>,
    pub size: i64,
    pub created: i64,
}

pub async fn list() -> Result<Json<Vec<ImageInfo>>, ApiError> {
    let options: ListImagesOptions = ListImagesOptionsBuilder::new().all(false).build();

    let images = get_docker().list_images(Some(options)).await?;

    let infos = images
        .into_iter()
        .map(|summary| ImageInfo {
            id: summary.id,
            tags: summary.repo_tags,
            size: summary.size,
            created: summary.created,
        })
        .collect();

    Ok(Json(infos))
}

/// Pull `image`, draining the progress stream. Registry credentials are
/// resolved best-effort from the host's Docker config.
pub(crate) async fn pull_image(image: &str) -> Result<(), ApiError> {
    log::info!("Pulling image: {}", image);
    let docker = get_docker();

    let (name, tag) = split_image_reference(image);

    let options: CreateImageOptions = CreateImageOptionsBuilder::new()
        .from_image(name)
        .tag(tag)
        .build();

    let credentials = registry::credentials_for_image(image);

    let mut stream = docker.create_image(Some(options), None, credentials);

    while let Some(result) = stream.next().await {
        match result {
            Ok(info) => {
                if let Some(status) = info.status {
                    log::debug!("Pull status: {}", status);
                }
            }
            Err(e) => {
                log::error!("Failed to pull image {}: {}", image, e);
                return Err(ApiError::Docker(e));
            }
        }
    }

    log::info!("Image {} pulled successfully", image);
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct PullImageRequest {
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct PullImageResponse {
    pub image: String,
}

pub async fn pull(Json(req): Json<PullImageRequest>) -> Result<Json<PullImageResponse>, ApiError> {
    if req.image.is_empty() {
        return Err(ApiError::BadRequest("Image is required".into()));
    }
    pull_image(&req.image).await?;
    Ok(Json(PullImageResponse { image: req.image }))
}

pub async fn remove(Path(id): Path<String>) -> Result<(), ApiError> {
    let options: RemoveImageOptions = RemoveImageOptionsBuilder::new().build();

    get_docker()
        .remove_image(&id, Some(options), None)
        .await
        .map_err(|e| not_found(e, &id))?;

    log::info!("Image {} removed", id);
    Ok(())
}
