use super::HardwareChannel;
use crate::audio::pcm_to_le_bytes;
use crate::dtmf::DtmfDigit;
use crate::error::HardwareError;
use crate::history::BoundedHistory;
use crate::tone::ToneGenerator;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Voltage seen across the pair while loop current flows
const LOOP_VOLTAGE: f32 = 8.0;

const VOLTAGE_LOG_SIZE: usize = 1000;

/// Audio writes kept for inspection
const AUDIO_WRITES_KEPT: usize = 64;

#[derive(Debug, Default)]
struct FailurePlan {
    voltage_reads: u32,
    voltage_writes: u32,
    audio_reads: u32,
    audio_writes: u32,
}

fn take_failure(counter: &mut u32, operation: &'static str) -> Result<(), HardwareError> {
    if *counter > 0 {
        *counter -= 1;
        return Err(HardwareError::new(operation, "injected failure"));
    }
    Ok(())
}

#[derive(Debug)]
struct SimState {
    applied_voltage: f32,
    off_hook: bool,
    voltage_log: BoundedHistory<f32>,
    audio_in: VecDeque<u8>,
    audio_out: BoundedHistory<Vec<u8>>,
    failures: FailurePlan,
}

/// In-memory FXS line for development and tests.
///
/// Reports the last voltage applied while on-hook and a low loop voltage
/// once the handset is lifted. Audio reads drain injected PCM and pad with
/// silence; writes are captured for inspection.
#[derive(Debug)]
pub struct SimulatedLine {
    state: Mutex<SimState>,
}

impl SimulatedLine {
    pub fn new(initial_voltage: f32) -> Self {
        Self {
            state: Mutex::new(SimState {
                applied_voltage: initial_voltage,
                off_hook: false,
                voltage_log: BoundedHistory::new(VOLTAGE_LOG_SIZE),
                audio_in: VecDeque::new(),
                audio_out: BoundedHistory::new(AUDIO_WRITES_KEPT),
                failures: FailurePlan::default(),
            }),
        }
    }

    pub fn set_off_hook(&self, off_hook: bool) {
        debug!("Simulated handset {}", if off_hook { "lifted" } else { "replaced" });
        self.state.lock().off_hook = off_hook;
    }

    pub fn is_off_hook(&self) -> bool {
        self.state.lock().off_hook
    }

    /// Last voltage applied by the driver, regardless of hook state
    pub fn applied_voltage(&self) -> f32 {
        self.state.lock().applied_voltage
    }

    /// Most recent applied voltages, oldest first
    pub fn voltage_log(&self) -> Vec<f32> {
        self.state.lock().voltage_log.to_vec()
    }

    pub fn inject_audio(&self, samples: &[i16]) {
        self.state.lock().audio_in.extend(pcm_to_le_bytes(samples));
    }

    /// Queue a keypad sequence as if dialed on the handset.
    pub fn inject_dtmf(
        &self,
        digits: &[DtmfDigit],
        sample_rate: u32,
        tone_ms: u32,
        gap_ms: u32,
    ) -> crate::error::Result<()> {
        let samples = ToneGenerator::new(sample_rate).digits(digits, tone_ms, gap_ms)?;
        self.inject_audio(&samples);
        Ok(())
    }

    pub fn pending_audio_bytes(&self) -> usize {
        self.state.lock().audio_in.len()
    }

    /// Bytes from the most recent writes, concatenated in order
    pub fn written_audio(&self) -> Vec<u8> {
        self.state.lock().audio_out.to_vec().concat()
    }

    pub fn fail_voltage_reads(&self, count: u32) {
        self.state.lock().failures.voltage_reads = count;
    }

    pub fn fail_voltage_writes(&self, count: u32) {
        self.state.lock().failures.voltage_writes = count;
    }

    pub fn fail_audio_reads(&self, count: u32) {
        self.state.lock().failures.audio_reads = count;
    }

    pub fn fail_audio_writes(&self, count: u32) {
        self.state.lock().failures.audio_writes = count;
    }
}

#[async_trait]
impl HardwareChannel for SimulatedLine {
    async fn get_voltage(&self, _channel: u32) -> Result<f32, HardwareError> {
        let mut state = self.state.lock();
        take_failure(&mut state.failures.voltage_reads, "get_voltage")?;
        Ok(if state.off_hook {
            LOOP_VOLTAGE
        } else {
            state.applied_voltage
        })
    }

    async fn set_voltage(&self, _channel: u32, volts: f32) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        take_failure(&mut state.failures.voltage_writes, "set_voltage")?;
        state.applied_voltage = volts;
        state.voltage_log.push(volts);
        Ok(())
    }

    async fn read_audio_frame(&self, size: usize) -> Result<Vec<u8>, HardwareError> {
        let mut state = self.state.lock();
        take_failure(&mut state.failures.audio_reads, "read_audio_frame")?;
        let available = state.audio_in.len().min(size);
        let mut frame: Vec<u8> = state.audio_in.drain(..available).collect();
        frame.resize(size, 0);
        Ok(frame)
    }

    async fn write_audio_frame(&self, data: &[u8]) -> Result<usize, HardwareError> {
        let mut state = self.state.lock();
        take_failure(&mut state.failures.audio_writes, "write_audio_frame")?;
        state.audio_out.push(data.to_vec());
        Ok(data.len())
    }
}
