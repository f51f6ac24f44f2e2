//! Ring cadences and the voltage sequencer that plays them.

use crate::error::{HardwareError, LineError, Result};
use crate::hardware::HardwareChannel;
use async_trait::async_trait;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Standard telephone ring patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingPatternKind {
    /// 2s on, 4s off
    Normal,
    /// Short-short-long
    Distinctive1,
    /// Short-long-short
    Distinctive2,
    Continuous,
    /// Single short ring for notifications
    Single,
    /// Three quick rings
    Timer,
    /// Short ring repeated quickly
    Urgent,
}

impl RingPatternKind {
    pub const ALL: [RingPatternKind; 7] = [
        RingPatternKind::Normal,
        RingPatternKind::Distinctive1,
        RingPatternKind::Distinctive2,
        RingPatternKind::Continuous,
        RingPatternKind::Single,
        RingPatternKind::Timer,
        RingPatternKind::Urgent,
    ];

    pub fn pattern(self) -> RingPattern {
        let (cadence, repeat_count): (&[(u32, u32)], u32) = match self {
            RingPatternKind::Normal => (&[(2000, 4000)], 1),
            RingPatternKind::Distinctive1 => (&[(500, 500), (500, 500), (2000, 4000)], 1),
            RingPatternKind::Distinctive2 => (&[(500, 500), (2000, 500), (500, 4000)], 1),
            RingPatternKind::Continuous => (&[(5000, 100)], 1),
            RingPatternKind::Single => (&[(500, 0)], 1),
            RingPatternKind::Timer => (&[(200, 200), (200, 200), (200, 0)], 1),
            RingPatternKind::Urgent => (&[(300, 300)], 5),
        };
        RingPattern {
            cadence: cadence
                .iter()
                .map(|&(on_ms, off_ms)| RingStep { on_ms, off_ms })
                .collect(),
            repeat_count,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RingPatternKind::Normal => "normal",
            RingPatternKind::Distinctive1 => "distinctive1",
            RingPatternKind::Distinctive2 => "distinctive2",
            RingPatternKind::Continuous => "continuous",
            RingPatternKind::Single => "single",
            RingPatternKind::Timer => "timer",
            RingPatternKind::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingStep {
    pub on_ms: u32,
    pub off_ms: u32,
}

/// Ordered on/off steps played `repeat_count` times (0 repeats forever).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingPattern {
    pub cadence: Vec<RingStep>,
    pub repeat_count: u32,
}

impl RingPattern {
    pub fn new(cadence: Vec<RingStep>, repeat_count: u32) -> Result<Self> {
        let pattern = Self {
            cadence,
            repeat_count,
        };
        pattern.validate()?;
        Ok(pattern)
    }

    /// One burst of ring voltage, the "ring for N ms" request
    pub fn single_burst(duration_ms: u32) -> Result<Self> {
        if duration_ms == 0 {
            return Err(LineError::InvalidArgument("ring duration must be positive".into()));
        }
        Self::new(
            vec![RingStep {
                on_ms: duration_ms,
                off_ms: 0,
            }],
            1,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.cadence.is_empty() {
            return Err(LineError::InvalidArgument("ring pattern has no steps".into()));
        }
        if self.cycle_duration().is_zero() {
            return Err(LineError::InvalidArgument(
                "ring pattern steps are all zero length".into(),
            ));
        }
        Ok(())
    }

    /// Length of one pass through the cadence
    pub fn cycle_duration(&self) -> Duration {
        let total: u64 = self
            .cadence
            .iter()
            .map(|step| step.on_ms as u64 + step.off_ms as u64)
            .sum();
        Duration::from_millis(total)
    }
}

/// What the caller asked to ring with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingRequest {
    Pattern(RingPatternKind),
    Custom(RingPattern),
    Duration(u32),
}

impl RingRequest {
    pub fn resolve(&self) -> Result<RingPattern> {
        match self {
            RingRequest::Pattern(kind) => Ok(kind.pattern()),
            RingRequest::Custom(pattern) => {
                pattern.validate()?;
                Ok(pattern.clone())
            }
            RingRequest::Duration(ms) => RingPattern::single_burst(*ms),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            RingRequest::Pattern(kind) => kind.name().to_string(),
            RingRequest::Custom(pattern) => format!("custom({} steps)", pattern.cadence.len()),
            RingRequest::Duration(ms) => format!("{}ms", ms),
        }
    }
}

impl Default for RingRequest {
    fn default() -> Self {
        RingRequest::Pattern(RingPatternKind::Normal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoltageLevel {
    Idle,
    Ring,
}

/// Switches the line between idle and ring voltage.
#[async_trait]
pub trait VoltageController: Send + Sync {
    async fn apply(&self, level: VoltageLevel) -> std::result::Result<(), HardwareError>;
}

/// [`VoltageController`] backed by a hardware channel.
pub struct ChannelVoltage {
    hardware: Arc<dyn HardwareChannel>,
    channel: u32,
    idle_voltage: f32,
    ring_voltage: f32,
}

impl ChannelVoltage {
    pub fn new(hardware: Arc<dyn HardwareChannel>, channel: u32, idle_voltage: f32, ring_voltage: f32) -> Self {
        Self {
            hardware,
            channel,
            idle_voltage,
            ring_voltage,
        }
    }
}

#[async_trait]
impl VoltageController for ChannelVoltage {
    async fn apply(&self, level: VoltageLevel) -> std::result::Result<(), HardwareError> {
        let volts = match level {
            VoltageLevel::Idle => self.idle_voltage,
            VoltageLevel::Ring => self.ring_voltage,
        };
        self.hardware.set_voltage(self.channel, volts).await?;
        debug!("Channel {} set to {:?} voltage ({} V)", self.channel, level, volts);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingOutcome {
    /// Every repeat played out; `cycles` full passes
    Completed { cycles: u32 },
    /// Stopped by the cancellation token after `cycles` full passes
    Cancelled { cycles: u32 },
}

/// Reports whether the first ring-voltage command succeeded
pub type StartSignal = oneshot::Sender<std::result::Result<(), HardwareError>>;

/// Plays a [`RingPattern`] through a [`VoltageController`].
///
/// Whatever ends the sequence (completion, cancellation or a hardware
/// error) the line is set back to idle voltage before `run` returns.
pub struct RingPatternGenerator {
    controller: Arc<dyn VoltageController>,
}

impl RingPatternGenerator {
    pub fn new(controller: Arc<dyn VoltageController>) -> Self {
        Self { controller }
    }

    pub async fn run(
        &self,
        pattern: &RingPattern,
        cancel: &CancellationToken,
    ) -> std::result::Result<RingOutcome, HardwareError> {
        self.run_with_start_signal(pattern, cancel, None).await
    }

    /// Same as [`run`](Self::run), additionally reporting the outcome of
    /// the first ring-voltage command through `started`.
    pub async fn run_with_start_signal(
        &self,
        pattern: &RingPattern,
        cancel: &CancellationToken,
        mut started: Option<StartSignal>,
    ) -> std::result::Result<RingOutcome, HardwareError> {
        let result = self.play(pattern, cancel, &mut started).await;

        // Nothing was applied if we never got to the first step
        if let Some(started) = started.take() {
            let _ = started.send(result.as_ref().map(|_| ()).map_err(|e| e.clone()));
        }

        let restore = self.controller.apply(VoltageLevel::Idle).await;
        match (result, restore) {
            (Ok(outcome), Ok(())) => {
                info!("Ring sequence finished: {:?}", outcome);
                Ok(outcome)
            }
            (Ok(_), Err(e)) => {
                error!("Failed to restore idle voltage after ring: {}", e);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(restore_err)) => {
                error!("Failed to restore idle voltage after ring error: {}", restore_err);
                Err(e)
            }
        }
    }

    async fn play(
        &self,
        pattern: &RingPattern,
        cancel: &CancellationToken,
        started: &mut Option<StartSignal>,
    ) -> std::result::Result<RingOutcome, HardwareError> {
        let mut cycles = 0u32;
        while pattern.repeat_count == 0 || cycles < pattern.repeat_count {
            for step in &pattern.cadence {
                if cancel.is_cancelled() {
                    return Ok(RingOutcome::Cancelled { cycles });
                }

                let applied = self.controller.apply(VoltageLevel::Ring).await;
                if let Some(started) = started.take() {
                    let _ = started.send(applied.clone());
                }
                applied?;
                if !hold(step.on_ms, cancel).await {
                    return Ok(RingOutcome::Cancelled { cycles });
                }

                self.controller.apply(VoltageLevel::Idle).await?;
                if step.off_ms > 0 && !hold(step.off_ms, cancel).await {
                    return Ok(RingOutcome::Cancelled { cycles });
                }
            }
            cycles += 1;
            debug!("Completed ring cycle {} of {}", cycles, pattern.repeat_count);
        }
        Ok(RingOutcome::Completed { cycles })
    }
}

/// Sleep for `ms`, returning false if cancelled first
async fn hold(ms: u32, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms as u64)) => true,
        _ = cancel.cancelled() => false,
    }
}
