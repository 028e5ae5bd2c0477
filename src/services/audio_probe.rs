//! Audio metadata probing for assembled uploads.

use crate::models::upload::AudioMetadata;
use bytes::Bytes;
use std::io::Cursor;
use symphonia::core::{
    codecs::CODEC_TYPE_NULL,
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unrecognized audio data: {0}")]
    Unrecognized(String),
    #[error("no audio track found")]
    NoAudioTrack,
    #[error("probe task failed: {0}")]
    Task(String),
}

/// Reads duration, size, container format and bitrate from raw audio bytes.
pub trait AudioProber: Send + Sync {
    fn probe(&self, file_name: &str, data: &Bytes) -> Result<AudioMetadata, ProbeError>;
}

/// `AudioProber` backed by symphonia's format readers. No decoding happens;
/// duration comes from the track's frame count, or from summing packet
/// durations when the container does not declare one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaProber;

impl AudioProber for SymphoniaProber {
    fn probe(&self, file_name: &str, data: &Bytes) -> Result<AudioMetadata, ProbeError> {
        let extension = file_extension(file_name);
        let mut hint = Hint::new();
        if let Some(ext) = extension.as_deref() {
            hint.with_extension(ext);
        }

        let source =
            MediaSourceStream::new(Box::new(Cursor::new(data.clone())), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                source,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|err| ProbeError::Unrecognized(err.to_string()))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(ProbeError::NoAudioTrack)?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let frames = match params.n_frames {
            Some(n) => n,
            None => {
                let mut total = 0u64;
                loop {
                    match format.next_packet() {
                        Ok(packet) if packet.track_id() == track_id => total += packet.dur,
                        Ok(_) => {}
                        Err(SymphoniaError::IoError(_)) => break,
                        Err(err) => return Err(ProbeError::Unrecognized(err.to_string())),
                    }
                }
                total
            }
        };

        let seconds = match (params.time_base, params.sample_rate) {
            (Some(time_base), _) => {
                let time = time_base.calc_time(frames);
                time.seconds as f64 + time.frac
            }
            (None, Some(rate)) if rate > 0 => frames as f64 / rate as f64,
            _ => 0.0,
        };

        let duration_ms = (seconds * 1000.0).round() as u64;
        let file_size = data.len() as u64;
        let bitrate = (duration_ms > 0).then(|| file_size * 8 * 1000 / duration_ms);
        let format = extension.unwrap_or_else(|| "unknown".into());

        debug!(file_name, duration_ms, file_size, format = %format, "probed audio");
        Ok(AudioMetadata {
            duration_ms,
            file_size,
            format,
            bitrate,
        })
    }
}

fn file_extension(file_name: &str) -> Option<String> {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}
