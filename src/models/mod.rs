//! Core data models for the media store.
//!
//! These entities track in-flight chunked uploads, the object-store backend's
//! multipart context, and the delivery registry. They map cleanly to database
//! tables via `sqlx::FromRow` and serialize naturally as JSON via `serde`.

pub mod media;
pub mod multipart;
pub mod upload;
