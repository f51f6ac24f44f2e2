//! Single-bin DFT energy measurement (Goertzel algorithm).
//!
//! Energies are reported in dB relative to a full-scale tone: 16-bit samples
//! are scaled into [-1, 1) before the recurrence, the bin magnitude is divided
//! by `N / 2` so a bin-centred sinusoid of amplitude `a` reads `a`, and the
//! result is converted with `20 * log10(magnitude)`. A bin with no energy
//! reports [`MIN_ENERGY_DB`].

use std::f32::consts::PI;

/// DTMF row frequencies (Hz)
pub const DTMF_LOW_FREQS: [f32; 4] = [697.0, 770.0, 852.0, 941.0];

/// DTMF column frequencies (Hz)
pub const DTMF_HIGH_FREQS: [f32; 4] = [1209.0, 1336.0, 1477.0, 1633.0];

/// Floor reported for an empty bin, avoids `log10(0)`
pub const MIN_ENERGY_DB: f32 = -96.0;

/// Scale factor from i16 PCM to full-scale float
pub const PCM_FULL_SCALE: f32 = 32768.0;

/// `2 * cos(2*pi*k/N)` with `k = round(freq * N / sample_rate)`
pub fn goertzel_coefficient(freq: f32, sample_rate: u32, frame_size: usize) -> f32 {
    let n = frame_size as f32;
    let k = (0.5 + n * freq / sample_rate as f32).floor();
    let omega = 2.0 * PI * k / n;
    2.0 * omega.cos()
}

/// Run the second-order recurrence and return the bin energy in dB.
fn energy_db<I>(samples: I, coeff: f32) -> f32
where
    I: IntoIterator<Item = f32>,
{
    let mut s1 = 0.0f32;
    let mut s2 = 0.0f32;
    let mut n = 0usize;

    for sample in samples {
        let s0 = sample + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
        n += 1;
    }
    if n == 0 {
        return MIN_ENERGY_DB;
    }

    // Rounding can push the quadratic form a hair below zero for silent input
    let power = (s1 * s1 + s2 * s2 - coeff * s1 * s2).max(0.0);
    let magnitude = power.sqrt() / (n as f32 / 2.0);
    if magnitude > 0.0 {
        (20.0 * magnitude.log10()).max(MIN_ENERGY_DB)
    } else {
        MIN_ENERGY_DB
    }
}

/// Energy of `freq` in a frame of PCM samples, in dB full scale.
///
/// Pure function of its inputs; the frame length is the Goertzel block size.
pub fn tone_energy_db(frame: &[i16], freq: f32, sample_rate: u32) -> f32 {
    let coeff = goertzel_coefficient(freq, sample_rate, frame.len());
    energy_db(frame.iter().map(|&s| s as f32 / PCM_FULL_SCALE), coeff)
}

/// Per-frame energies at the eight DTMF frequencies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DtmfEnergies {
    pub low: [f32; 4],
    pub high: [f32; 4],
}

impl DtmfEnergies {
    /// Index and energy of the strongest row frequency
    pub fn strongest_low(&self) -> (usize, f32) {
        strongest(&self.low)
    }

    /// Index and energy of the strongest column frequency
    pub fn strongest_high(&self) -> (usize, f32) {
        strongest(&self.high)
    }
}

fn strongest(energies: &[f32; 4]) -> (usize, f32) {
    let mut best = (0, energies[0]);
    for (i, &energy) in energies.iter().enumerate().skip(1) {
        if energy > best.1 {
            best = (i, energy);
        }
    }
    best
}

/// Goertzel analyzer with coefficients precomputed for the DTMF frequencies.
#[derive(Debug, Clone)]
pub struct ToneEnergyAnalyzer {
    sample_rate: u32,
    frame_size: usize,
    low_coeffs: [f32; 4],
    high_coeffs: [f32; 4],
}

impl ToneEnergyAnalyzer {
    pub fn new(sample_rate: u32, frame_size: usize) -> Self {
        let low_coeffs = DTMF_LOW_FREQS.map(|f| goertzel_coefficient(f, sample_rate, frame_size));
        let high_coeffs = DTMF_HIGH_FREQS.map(|f| goertzel_coefficient(f, sample_rate, frame_size));
        Self {
            sample_rate,
            frame_size,
            low_coeffs,
            high_coeffs,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Compute all eight DTMF energies for a full-scale float frame.
    ///
    /// The caller guarantees `samples.len() == frame_size`; the coefficients
    /// are only valid for that block size.
    pub fn analyze(&self, samples: &[f32]) -> DtmfEnergies {
        debug_assert_eq!(samples.len(), self.frame_size);
        DtmfEnergies {
            low: self.low_coeffs.map(|c| energy_db(samples.iter().copied(), c)),
            high: self.high_coeffs.map(|c| energy_db(samples.iter().copied(), c)),
        }
    }
}
