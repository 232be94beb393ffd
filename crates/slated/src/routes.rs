use crate::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use slate_agent_protocol::{ImageSpec, VolumeInventory};
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantiateVolumeRequest {
    pub volume: VolumeInventory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeRequest {
    pub volume: VolumeInventory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBitsRequest {
    pub install_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_uuid: Option<String>,
}

pub async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn instantiate_volume_impl(
    state: &State,
    payload: InstantiateVolumeRequest,
) -> anyhow::Result<VolumeInventory> {
    let volume = state
        .backend
        .instantiate_volume(&payload.volume, payload.image.as_ref())
        .await?;

    info!(
        "Instantiated volume {} at {}",
        volume.uuid,
        volume.install_path.as_deref().unwrap_or("<none>")
    );

    Ok(volume)
}

pub async fn instantiate_volume(
    Extension(state): Extension<State>,
    Json(payload): Json<InstantiateVolumeRequest>,
) -> Result<Json<VolumeInventory>, (StatusCode, String)> {
    match instantiate_volume_impl(&state, payload).await {
        Ok(res) => Ok(Json(res)),
        Err(e) => Err(handle_anyhow_error("instantiate_volume", e)),
    }
}

async fn delete_volume_impl(state: &State, payload: DeleteVolumeRequest) -> anyhow::Result<()> {
    state.backend.delete_volume(&payload.volume).await?;
    info!("Deleted volume {}", payload.volume.uuid);
    Ok(())
}

pub async fn delete_volume(
    Extension(state): Extension<State>,
    Json(payload): Json<DeleteVolumeRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    match delete_volume_impl(&state, payload).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(handle_anyhow_error("delete_volume", e)),
    }
}

async fn delete_bits_impl(state: &State, payload: DeleteBitsRequest) -> anyhow::Result<()> {
    state
        .backend
        .delete_bits(&payload.install_path, payload.volume_uuid.as_deref())
        .await?;
    info!("Deleted bits at {}", payload.install_path);
    Ok(())
}

pub async fn delete_bits(
    Extension(state): Extension<State>,
    Json(payload): Json<DeleteBitsRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    match delete_bits_impl(&state, payload).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(handle_anyhow_error("delete_bits", e)),
    }
}

pub(crate) fn handle_anyhow_error(function: &str, err: anyhow::Error) -> (StatusCode, String) {
    error!("Error in {function}: {err:?}");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err}"))
}
