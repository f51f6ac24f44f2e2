//! DTMF digit model and debounced frame-by-frame detector.
//!
//! The detector runs on a media clock: every accepted frame advances it by
//! `frame_size / sample_rate`, so debounce decisions depend only on the
//! audio, never on how promptly frames were delivered.

use crate::audio::to_detection_samples;
use crate::config::LineConfig;
use crate::error::DetectionError;
use crate::goertzel::{DtmfEnergies, ToneEnergyAnalyzer, DTMF_HIGH_FREQS, DTMF_LOW_FREQS};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Standard keypad layout, rows by low frequency, columns by high frequency
const DTMF_DIGITS: [[char; 4]; 4] = [
    ['1', '2', '3', 'A'],
    ['4', '5', '6', 'B'],
    ['7', '8', '9', 'C'],
    ['*', '0', '#', 'D'],
];

/// One of the 16 DTMF symbols `0-9 * # A-D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub struct DtmfDigit(char);

impl DtmfDigit {
    pub fn from_indices(row: usize, col: usize) -> Option<Self> {
        DTMF_DIGITS
            .get(row)
            .and_then(|r| r.get(col))
            .map(|&c| DtmfDigit(c))
    }

    /// (row, column) position in the keypad
    pub fn indices(self) -> (usize, usize) {
        for (row, digits) in DTMF_DIGITS.iter().enumerate() {
            if let Some(col) = digits.iter().position(|&c| c == self.0) {
                return (row, col);
            }
        }
        unreachable!("DtmfDigit is only constructed from the keypad table")
    }

    /// (low, high) tone pair in Hz
    pub fn frequencies(self) -> (f32, f32) {
        let (row, col) = self.indices();
        (DTMF_LOW_FREQS[row], DTMF_HIGH_FREQS[col])
    }

    pub fn as_char(self) -> char {
        self.0
    }

    /// Parse a digit string such as `"555*1#"`.
    pub fn parse_sequence(digits: &str) -> Result<Vec<Self>, DetectionError> {
        digits.chars().map(DtmfDigit::try_from).collect()
    }
}

impl TryFrom<char> for DtmfDigit {
    type Error = DetectionError;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        let upper = c.to_ascii_uppercase();
        if DTMF_DIGITS.iter().flatten().any(|&d| d == upper) {
            Ok(DtmfDigit(upper))
        } else {
            Err(DetectionError::InvalidDigit(c))
        }
    }
}

impl From<DtmfDigit> for char {
    fn from(digit: DtmfDigit) -> char {
        digit.0
    }
}

impl fmt::Display for DtmfDigit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated DTMF tone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtmfEvent {
    pub digit: DtmfDigit,
    pub duration_ms: u32,
    pub timestamp: DateTime<Utc>,
    pub signal_level_dbm: f32,
}

/// Detector tuning, normally derived from [`LineConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub detection_threshold_dbm: f32,
    pub min_duration_ms: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::SAMPLE_RATE,
            frame_size: crate::FRAME_SIZE,
            detection_threshold_dbm: crate::DETECTION_THRESHOLD_DBM,
            min_duration_ms: crate::MIN_TONE_DURATION_MS,
        }
    }
}

impl From<&LineConfig> for DetectorConfig {
    fn from(config: &LineConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            frame_size: config.frame_size,
            detection_threshold_dbm: config.detection_threshold_dbm,
            min_duration_ms: config.min_tone_duration_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectorStats {
    pub frames_processed: u64,
    pub tones_detected: u64,
    pub invalid_frames: u64,
}

/// Goertzel-based DTMF detector with debounce.
///
/// A tone must hold the same digit for at least `min_duration_ms` before an
/// event fires, and a continuous hold fires exactly once. Silence, a
/// below-threshold frame or a different digit ends the hold.
pub struct DtmfDetector {
    config: DetectorConfig,
    analyzer: ToneEnergyAnalyzer,
    current_digit: Option<DtmfDigit>,
    digit_start_samples: Option<u64>,
    reported: bool,
    clock_samples: u64,
    previous_energies: Option<DtmfEnergies>,
    stats: DetectorStats,
}

impl DtmfDetector {
    pub fn new(config: DetectorConfig) -> Self {
        debug!(
            "DTMF detector: {} Hz, {} samples/frame, threshold {} dBm, min {} ms",
            config.sample_rate,
            config.frame_size,
            config.detection_threshold_dbm,
            config.min_duration_ms
        );
        Self {
            analyzer: ToneEnergyAnalyzer::new(config.sample_rate, config.frame_size),
            config,
            current_digit: None,
            digit_start_samples: None,
            reported: false,
            clock_samples: 0,
            previous_energies: None,
            stats: DetectorStats::default(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Digit currently inside a debounce window or hold
    pub fn current_digit(&self) -> Option<DtmfDigit> {
        self.current_digit
    }

    /// Energies of the last accepted frame
    pub fn previous_energies(&self) -> Option<&DtmfEnergies> {
        self.previous_energies.as_ref()
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats
    }

    /// Forget any in-progress tone.
    pub fn reset(&mut self) {
        self.current_digit = None;
        self.digit_start_samples = None;
        self.reported = false;
    }

    fn samples_to_ms(&self, samples: u64) -> u64 {
        samples * 1000 / self.config.sample_rate as u64
    }

    /// Feed one frame of PCM.
    ///
    /// A frame of the wrong length is rejected without touching the debounce
    /// state, so one bad frame cannot break a tone that is being validated.
    pub fn process_frame(&mut self, frame: &[i16]) -> Result<Option<DtmfEvent>, DetectionError> {
        if frame.len() != self.config.frame_size {
            self.stats.invalid_frames += 1;
            warn!(
                "Skipping audio frame of {} samples (expected {})",
                frame.len(),
                self.config.frame_size
            );
            return Err(DetectionError::InvalidFrame {
                expected: self.config.frame_size,
                actual: frame.len(),
            });
        }

        self.stats.frames_processed += 1;
        self.clock_samples += frame.len() as u64;
        let now = self.clock_samples;

        let energies = self.analyzer.analyze(&to_detection_samples(frame));
        self.previous_energies = Some(energies);

        let (row, low_energy) = energies.strongest_low();
        let (col, high_energy) = energies.strongest_high();
        let threshold = self.config.detection_threshold_dbm;

        if low_energy < threshold || high_energy < threshold {
            if let Some(digit) = self.current_digit {
                debug!("DTMF tone {} ended", digit);
            }
            self.reset();
            return Ok(None);
        }

        let candidate = match DtmfDigit::from_indices(row, col) {
            Some(digit) => digit,
            None => return Ok(None),
        };

        let start = match (self.current_digit, self.digit_start_samples) {
            (Some(current), Some(start)) if current == candidate => start,
            _ => {
                debug!(
                    "New DTMF candidate {} (low {:.1} dB, high {:.1} dB)",
                    candidate, low_energy, high_energy
                );
                self.current_digit = Some(candidate);
                self.digit_start_samples = Some(now);
                self.reported = false;
                return Ok(None);
            }
        };

        let elapsed_ms = self.samples_to_ms(now - start);
        if self.reported || elapsed_ms < self.config.min_duration_ms as u64 {
            return Ok(None);
        }

        self.reported = true;
        self.stats.tones_detected += 1;
        let event = DtmfEvent {
            digit: candidate,
            duration_ms: elapsed_ms.min(u32::MAX as u64) as u32,
            timestamp: Utc::now(),
            signal_level_dbm: low_energy.max(high_energy),
        };
        info!(
            "Valid DTMF tone detected: {} ({} ms, {:.1} dBm)",
            event.digit, event.duration_ms, event.signal_level_dbm
        );
        Ok(Some(event))
    }
}
