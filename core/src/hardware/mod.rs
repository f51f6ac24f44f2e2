//! Hardware transport seam.
//!
//! The line engine never touches device byte layouts; it asks a
//! [`HardwareChannel`] for voltages and PCM frames.

mod simulated;

pub use simulated::SimulatedLine;

use crate::error::HardwareError;
use async_trait::async_trait;

/// Capability to drive one telephony interface.
#[async_trait]
pub trait HardwareChannel: Send + Sync {
    /// Current line voltage in volts
    async fn get_voltage(&self, channel: u32) -> Result<f32, HardwareError>;

    async fn set_voltage(&self, channel: u32, volts: f32) -> Result<(), HardwareError>;

    /// Read up to `size` bytes of 16-bit little-endian PCM
    async fn read_audio_frame(&self, size: usize) -> Result<Vec<u8>, HardwareError>;

    /// Write PCM to the line, returning bytes accepted
    async fn write_audio_frame(&self, data: &[u8]) -> Result<usize, HardwareError>;
}
