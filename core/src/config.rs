use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for one FXS line.
///
/// Built once at startup and handed to each component; every field has a
/// default so partial config files work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    /// Hardware channel number
    pub channel: u32,
    pub sample_rate: u32,
    /// Samples per audio frame
    pub frame_size: usize,
    pub detection_threshold_dbm: f32,
    pub min_tone_duration_ms: u32,
    pub idle_voltage: f32,
    pub ring_voltage: f32,
    /// Fraction of idle voltage below which the line is considered off-hook
    pub off_hook_ratio: f32,
    pub dtmf_history_size: usize,
    pub transition_history_size: usize,
    pub audio_interval_ms: u64,
    pub voltage_poll_interval_ms: u64,
    /// Delay between retries once a polling loop keeps failing
    pub error_backoff_ms: u64,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            channel: 1,
            sample_rate: crate::SAMPLE_RATE,
            frame_size: crate::FRAME_SIZE,
            detection_threshold_dbm: crate::DETECTION_THRESHOLD_DBM,
            min_tone_duration_ms: crate::MIN_TONE_DURATION_MS,
            idle_voltage: crate::IDLE_VOLTAGE,
            ring_voltage: crate::RING_VOLTAGE,
            off_hook_ratio: crate::OFF_HOOK_RATIO,
            dtmf_history_size: crate::HISTORY_SIZE,
            transition_history_size: crate::HISTORY_SIZE,
            audio_interval_ms: crate::FRAME_DURATION_MS,
            voltage_poll_interval_ms: crate::VOLTAGE_POLL_INTERVAL_MS,
            error_backoff_ms: crate::ERROR_BACKOFF_MS,
        }
    }
}

fn check_range<T>(field: &'static str, value: T, min: T, max: T) -> Result<(), ConfigError>
where
    T: PartialOrd + std::fmt::Display,
{
    // Written so NaN fails too
    if !(value >= min && value <= max) {
        return Err(ConfigError::new(
            field,
            format!("{} is outside {}..={}", value, min, max),
        ));
    }
    Ok(())
}

impl LineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel == 0 {
            return Err(ConfigError::new("channel", "channels are numbered from 1"));
        }
        check_range("sample_rate", self.sample_rate, 8000, 48000)?;
        check_range("frame_size", self.frame_size, 80, 1024)?;
        check_range("detection_threshold_dbm", self.detection_threshold_dbm, -60.0, 0.0)?;
        check_range("min_tone_duration_ms", self.min_tone_duration_ms, 20, 1000)?;
        check_range("dtmf_history_size", self.dtmf_history_size, 10, 1000)?;
        check_range("transition_history_size", self.transition_history_size, 10, 1000)?;
        check_range("audio_interval_ms", self.audio_interval_ms, 1, 1000)?;
        check_range("voltage_poll_interval_ms", self.voltage_poll_interval_ms, 10, 60_000)?;
        check_range("error_backoff_ms", self.error_backoff_ms, 100, 60_000)?;

        if !(self.idle_voltage > 0.0) {
            return Err(ConfigError::new("idle_voltage", "must be positive"));
        }
        if !(self.ring_voltage > self.idle_voltage) {
            return Err(ConfigError::new(
                "ring_voltage",
                format!("{} V must exceed idle voltage {} V", self.ring_voltage, self.idle_voltage),
            ));
        }
        if !(self.off_hook_ratio > 0.0 && self.off_hook_ratio < 1.0) {
            return Err(ConfigError::new("off_hook_ratio", "must be between 0 and 1"));
        }
        Ok(())
    }

    /// Voltage below which the handset is considered lifted
    pub fn off_hook_threshold(&self) -> f32 {
        self.idle_voltage * self.off_hook_ratio
    }

    pub fn audio_interval(&self) -> Duration {
        Duration::from_millis(self.audio_interval_ms)
    }

    pub fn voltage_poll_interval(&self) -> Duration {
        Duration::from_millis(self.voltage_poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Bytes in one frame of 16-bit PCM
    pub fn frame_bytes(&self) -> usize {
        self.frame_size * 2
    }
}
