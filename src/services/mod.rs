//! Upload coordination, expiry and media delivery.

pub mod audio_probe;
pub mod delivery_service;
pub mod http_range;
pub mod local_media;
pub mod reaper;
pub mod remote_proxy;
pub mod upload_service;
