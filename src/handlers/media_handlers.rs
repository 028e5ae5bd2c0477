//! `GET|HEAD /media/{id}`: range-aware delivery of registered media.

use crate::{errors::AppError, state::AppState};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method},
    response::Response,
};

pub async fn get_media(
    State(state): State<AppState>,
    Path(media_id): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let response = state.delivery.deliver(&media_id, &method, &headers).await?;
    Ok(response)
}
