//! PCM conversion and basic level normalization.
//!
//! The line carries 16-bit little-endian mono PCM. Nothing here transcodes;
//! playback is DC-corrected and peak-normalized, detection input is only
//! DC-corrected.

use crate::error::DetectionError;
use crate::goertzel::PCM_FULL_SCALE;

/// Decode little-endian 16-bit PCM.
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Result<Vec<i16>, DetectionError> {
    if bytes.len() % 2 != 0 {
        return Err(DetectionError::OddByteCount(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encode samples as little-endian 16-bit PCM.
pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Scale to full-scale floats and remove the DC offset.
pub fn to_detection_samples(frame: &[i16]) -> Vec<f32> {
    let mut buffer: Vec<f32> = frame.iter().map(|&s| s as f32 / PCM_FULL_SCALE).collect();
    remove_dc(&mut buffer);
    buffer
}

pub fn remove_dc(samples: &mut [f32]) {
    if samples.is_empty() {
        return;
    }
    let mean = samples.iter().sum::<f32>() / samples.len() as f32;
    for sample in samples.iter_mut() {
        *sample -= mean;
    }
}

/// DC-correct and scale so the loudest sample reaches full scale.
///
/// Silent input comes back as silence.
pub fn normalize_for_playback(samples: &[i16]) -> Vec<i16> {
    let mut buffer: Vec<f32> = samples.iter().map(|&s| s as f32).collect();
    remove_dc(&mut buffer);

    let peak = buffer.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak > 0.0 {
        let gain = i16::MAX as f32 / peak;
        for sample in buffer.iter_mut() {
            *sample *= gain;
        }
    }

    buffer
        .into_iter()
        .map(|s| s.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}
