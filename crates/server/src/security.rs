use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use quillhub_core::DeviceView;
use uuid::Uuid;

use crate::{guard::RefreshSession, session::SessionError, AppState};

pub async fn list_devices(
    State(state): State<AppState>,
    RefreshSession(context): RefreshSession,
) -> Result<Json<Vec<DeviceView>>, SessionError> {
    let devices = state.session().list_devices(context).await?;
    Ok(Json(devices))
}

/// A malformed device id cannot name an existing session, so it is a 404.
pub async fn delete_device(
    State(state): State<AppState>,
    RefreshSession(context): RefreshSession,
    Path(device_id): Path<String>,
) -> Result<StatusCode, SessionError> {
    let device_id = Uuid::parse_str(device_id.trim()).map_err(|_| SessionError::NotFound)?;
    state
        .session()
        .delete_specific_session(context, device_id)
        .await?;
    state.record_auth_event("session_deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_other_devices(
    State(state): State<AppState>,
    RefreshSession(context): RefreshSession,
) -> Result<StatusCode, SessionError> {
    state.session().logout_all_others(context).await?;
    state.record_auth_event("logout_others");
    Ok(StatusCode::NO_CONTENT)
}
