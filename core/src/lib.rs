//! Signal processing and line-state engine for analog FXS telephone ports
//!
//! Goertzel-based DTMF detection, a validated line state machine, ring
//! cadence sequencing and the supervisor that ties them to the hardware.

pub mod audio;
pub mod config;
pub mod dtmf;
pub mod error;
pub mod event;
pub mod goertzel;
pub mod hardware;
pub mod history;
pub mod ring;
pub mod state;
pub mod supervisor;
pub mod tone;

pub use config::LineConfig;
pub use dtmf::{DtmfDetector, DtmfDigit, DtmfEvent};
pub use error::{ErrorClass, LineError, Result};
pub use event::{EventSink, LineEvent, PhoneEvent};
pub use hardware::{HardwareChannel, SimulatedLine};
pub use ring::{RingPattern, RingPatternGenerator, RingPatternKind, RingRequest};
pub use state::{LineState, LineStateMachine, StateTransition};
pub use supervisor::{HardwareSupervisor, LineStatus};

// Audio configuration
pub const SAMPLE_RATE: u32 = 8000;
pub const FRAME_SIZE: usize = 160;
pub const FRAME_DURATION_MS: u64 = (FRAME_SIZE as u64 * 1000) / SAMPLE_RATE as u64; // 20

// DTMF detection
pub const DETECTION_THRESHOLD_DBM: f32 = -30.0;
pub const MIN_TONE_DURATION_MS: u32 = 40;

// Line voltages
pub const IDLE_VOLTAGE: f32 = 48.0;
pub const RING_VOLTAGE: f32 = 90.0;
pub const OFF_HOOK_RATIO: f32 = 0.8;

// History and status
pub const HISTORY_SIZE: usize = 100;
pub const STATUS_DTMF_ENTRIES: usize = 10;

// Supervision timing
pub const VOLTAGE_POLL_INTERVAL_MS: u64 = 1000;
pub const ERROR_BACKOFF_MS: u64 = 5000;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;
