use crate::dtmf::DtmfDigit;
use crate::error::{LineError, Result};
use std::f32::consts::PI;

/// Per-tone amplitude for dual tones (0.7 / 2 to prevent clipping with 2 tones)
const DUAL_TONE_AMPLITUDE: f32 = 0.35;

/// Amplitude for single test tones
const SINGLE_TONE_AMPLITUDE: f32 = 0.7;

/// Edge taper length in milliseconds
const EDGE_TAPER_MS: u32 = 5;

/// Longest tone accepted by [`ToneGenerator::tone`]
pub const MAX_TONE_DURATION_MS: u32 = 10_000;

/// Sine and dual-tone synthesizer producing 16-bit PCM.
///
/// Tones get a raised-cosine attack and decay so they switch on and off
/// without clicks.
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    sample_rate: u32,
}

impl ToneGenerator {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn sample_count(&self, duration_ms: u32) -> usize {
        (self.sample_rate as u64 * duration_ms as u64 / 1000) as usize
    }

    /// Single sine tone.
    pub fn tone(&self, frequency: f32, duration_ms: u32) -> Result<Vec<i16>> {
        let nyquist = self.sample_rate as f32 / 2.0;
        if !(frequency > 0.0 && frequency < nyquist) {
            return Err(LineError::InvalidArgument(format!(
                "frequency {} Hz outside (0, {}) Hz",
                frequency, nyquist
            )));
        }
        check_duration("tone", duration_ms, 1)?;

        let mut samples = self.synthesize(&[(frequency, SINGLE_TONE_AMPLITUDE)], duration_ms);
        self.apply_edge_taper(&mut samples);
        Ok(quantize(&samples))
    }

    /// Dual tone for one DTMF digit.
    pub fn digit(&self, digit: DtmfDigit, duration_ms: u32) -> Result<Vec<i16>> {
        check_duration("tone", duration_ms, 1)?;
        let (low, high) = digit.frequencies();
        let mut samples = self.synthesize(
            &[(low, DUAL_TONE_AMPLITUDE), (high, DUAL_TONE_AMPLITUDE)],
            duration_ms,
        );
        self.apply_edge_taper(&mut samples);
        Ok(quantize(&samples))
    }

    /// Digit sequence with silent gaps between digits.
    pub fn digits(&self, digits: &[DtmfDigit], tone_ms: u32, gap_ms: u32) -> Result<Vec<i16>> {
        check_duration("gap", gap_ms, 0)?;
        let gap = vec![0i16; self.sample_count(gap_ms)];
        let mut samples = Vec::new();
        for &digit in digits {
            samples.extend(self.digit(digit, tone_ms)?);
            samples.extend_from_slice(&gap);
        }
        Ok(samples)
    }

    fn synthesize(&self, components: &[(f32, f32)], duration_ms: u32) -> Vec<f32> {
        let sample_rate = self.sample_rate as f32;
        let mut samples = vec![0.0; self.sample_count(duration_ms)];
        for (i, sample) in samples.iter_mut().enumerate() {
            let t = i as f32 / sample_rate;
            *sample = components
                .iter()
                .map(|&(freq, amplitude)| amplitude * (2.0 * PI * freq * t).sin())
                .sum();
        }
        samples
    }

    fn apply_edge_taper(&self, samples: &mut [f32]) {
        let taper_len = self.sample_count(EDGE_TAPER_MS);
        let window = raised_cosine_window(samples.len(), taper_len);
        for (sample, weight) in samples.iter_mut().zip(window.iter()) {
            *sample *= weight;
        }
    }
}

fn check_duration(what: &str, duration_ms: u32, min_ms: u32) -> Result<()> {
    if duration_ms < min_ms || duration_ms > MAX_TONE_DURATION_MS {
        return Err(LineError::InvalidArgument(format!(
            "{} duration {} ms outside {}..={} ms",
            what, duration_ms, min_ms, MAX_TONE_DURATION_MS
        )));
    }
    Ok(())
}

fn quantize(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

/// Generate raised-cosine window for smooth edge tapering
fn raised_cosine_window(len: usize, taper_len: usize) -> Vec<f32> {
    let taper = taper_len.min(len / 2);
    let mut window = vec![1.0; len];
    if taper == 0 {
        return window;
    }

    for i in 0..taper {
        // Attack: smoothly increase from 0 to 1
        let progress = i as f32 / taper as f32;
        let value = (PI * progress / 2.0).sin().powi(2);
        window[i] = value;

        // Decay: smoothly decrease from 1 to 0
        window[len - 1 - i] = value;
    }

    window
}
