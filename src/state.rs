use crate::services::{delivery_service::DeliveryService, upload_service::UploadService};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub uploads: UploadService,
    pub delivery: DeliveryService,
    /// Probed by `/readyz` for write access.
    pub storage_dir: PathBuf,
}
