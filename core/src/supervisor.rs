//! Line orchestration: audio pump, voltage poll and the command surface.

use crate::audio::{normalize_for_playback, pcm_from_le_bytes, pcm_to_le_bytes};
use crate::config::LineConfig;
use crate::dtmf::{DetectorConfig, DetectorStats, DtmfDetector, DtmfEvent};
use crate::error::{HardwareError, LineError, Result};
use crate::event::{EventSink, LineEvent, PhoneEvent, RingStopReason};
use crate::hardware::HardwareChannel;
use crate::ring::{
    ChannelVoltage, RingOutcome, RingPattern, RingPatternGenerator, RingRequest, StartSignal,
    VoltageController, VoltageLevel,
};
use crate::state::{
    CallStatistics, LineState, LineStateMachine, Metadata, StateSubscriber, StateTransition,
    SubscriptionId,
};
use crate::tone::ToneGenerator;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// First retry after an audio read failure; later retries use the
/// configured backoff.
const FIRST_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Snapshot returned by [`HardwareSupervisor::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct LineStatus {
    pub channel: u32,
    pub state: LineState,
    /// Last polled voltage, `None` before the first successful poll
    pub line_voltage: Option<f32>,
    pub off_hook: bool,
    pub ring_active: bool,
    pub call_stats: CallStatistics,
    pub last_dtmf: Option<DtmfEvent>,
    pub dtmf_history: Vec<DtmfEvent>,
    pub last_error: Option<String>,
    pub detector: DetectorStats,
}

struct ActiveRing {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct HookMonitor {
    voltage: Option<f32>,
    off_hook: bool,
}

/// Drives one FXS line.
///
/// Runs an audio pump and a voltage poll on their own tasks, plus a ring
/// task while ringing. At most one ring sequence exists at a time; a new
/// one cancels and awaits the previous one first.
pub struct HardwareSupervisor {
    config: LineConfig,
    hardware: Arc<dyn HardwareChannel>,
    voltage: Arc<dyn VoltageController>,
    state: Arc<LineStateMachine>,
    events: EventSink,
    tones: ToneGenerator,
    ring: tokio::sync::Mutex<Option<ActiveRing>>,
    ring_active: AtomicBool,
    monitor: Mutex<HookMonitor>,
    detector_stats: Mutex<DetectorStats>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HardwareSupervisor {
    pub fn new(config: LineConfig, hardware: Arc<dyn HardwareChannel>) -> Result<Arc<Self>> {
        config.validate()?;
        let voltage = Arc::new(ChannelVoltage::new(
            hardware.clone(),
            config.channel,
            config.idle_voltage,
            config.ring_voltage,
        ));
        Ok(Arc::new(Self {
            state: Arc::new(LineStateMachine::new(
                config.transition_history_size,
                config.dtmf_history_size,
            )),
            tones: ToneGenerator::new(config.sample_rate),
            events: EventSink::default(),
            voltage,
            hardware,
            ring: tokio::sync::Mutex::new(None),
            ring_active: AtomicBool::new(false),
            monitor: Mutex::new(HookMonitor::default()),
            detector_stats: Mutex::new(DetectorStats::default()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        }))
    }

    pub fn config(&self) -> &LineConfig {
        &self.config
    }

    pub fn state_machine(&self) -> &Arc<LineStateMachine> {
        &self.state
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PhoneEvent> {
        self.events.subscribe()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn StateSubscriber>) -> SubscriptionId {
        self.state.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.unsubscribe(id)
    }

    /// Put the line at idle voltage, leave `Initializing` and start the
    /// background loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.voltage.apply(VoltageLevel::Idle).await {
            let reason = format!("Hardware initialization failed: {}", e);
            if let Err(rejected) = self.state.set_state(LineState::Error, reason, Metadata::new()) {
                warn!("Could not enter error state: {}", rejected);
            }
            return Err(e.into());
        }
        self.state.initialize()?;

        let detector = DtmfDetector::new(DetectorConfig::from(&self.config));
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).audio_pump(detector)));
        tasks.push(tokio::spawn(Arc::clone(self).voltage_poll()));
        info!("Line {} started", self.config.channel);
        Ok(())
    }

    /// Stop every task and leave the line at idle voltage.
    pub async fn shutdown(&self) {
        info!("Shutting down line {}", self.config.channel);
        self.shutdown.cancel();
        self.cancel_ring().await;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Line task ended abnormally: {}", e);
            }
        }

        if let Err(e) = self.voltage.apply(VoltageLevel::Idle).await {
            error!("Failed to restore idle voltage on shutdown: {}", e);
        }
    }

    /// Start ringing. Only allowed from `Idle`.
    ///
    /// Returns once the first ring voltage is on the line; a failure to
    /// apply it fails the command and leaves the line idle.
    pub async fn ring(self: &Arc<Self>, request: RingRequest) -> Result<()> {
        let pattern = request.resolve()?;
        let description = request.describe();

        let mut active = self.ring.lock().await;
        if let Some(previous) = active.take() {
            debug!("Cancelling previous ring sequence");
            previous.cancel.cancel();
            if let Err(e) = previous.handle.await {
                warn!("Previous ring task ended abnormally: {}", e);
            }
        }

        let mut metadata = Metadata::new();
        metadata.insert("pattern".to_string(), description.clone());
        let reason = format!("Ring requested ({})", description);
        if self
            .state
            .set_state_if(LineState::Idle, LineState::Ringing, reason, metadata)?
            .is_none()
        {
            return Err(LineError::InvalidState {
                command: "ring",
                state: self.state.current_state(),
            });
        }

        self.events.emit(LineEvent::RingStart {
            pattern: description,
        });
        self.ring_active.store(true, Ordering::SeqCst);

        let cancel = self.shutdown.child_token();
        let (started_tx, started_rx) = oneshot::channel();
        let handle = tokio::spawn(Arc::clone(self).ring_sequence(pattern, cancel.clone(), started_tx));

        match started_rx.await {
            Ok(Ok(())) => {
                *active = Some(ActiveRing { cancel, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.await;
                Err(e.into())
            }
            Err(_) => {
                let _ = handle.await;
                Err(HardwareError::new("ring", "ring task ended before applying voltage").into())
            }
        }
    }

    /// Cancel the active ring sequence and wait for idle voltage.
    pub async fn stop_ring(&self) -> Result<()> {
        if self.cancel_ring().await {
            Ok(())
        } else {
            Err(LineError::InvalidState {
                command: "stop ring",
                state: self.state.current_state(),
            })
        }
    }

    /// Returns whether a running sequence was stopped.
    async fn cancel_ring(&self) -> bool {
        let mut active = self.ring.lock().await;
        let Some(ring) = active.take() else {
            return false;
        };
        let running = !ring.handle.is_finished();
        ring.cancel.cancel();
        if let Err(e) = ring.handle.await {
            warn!("Ring task ended abnormally: {}", e);
        }
        running
    }

    async fn ring_sequence(self: Arc<Self>, pattern: RingPattern, cancel: CancellationToken, started: StartSignal) {
        let generator = RingPatternGenerator::new(self.voltage.clone());
        let result = generator
            .run_with_start_signal(&pattern, &cancel, Some(started))
            .await;
        self.ring_active.store(false, Ordering::SeqCst);

        let reason = match &result {
            Ok(RingOutcome::Completed { .. }) => "Ring pattern completed",
            Ok(RingOutcome::Cancelled { .. }) => "Ring stopped",
            Err(_) => "Ring failed",
        };
        let returned_to_idle = match self
            .state
            .set_state_if(LineState::Ringing, LineState::Idle, reason, Metadata::new())
        {
            Ok(transition) => transition.is_some(),
            Err(e) => {
                warn!("Could not leave ringing state: {}", e);
                false
            }
        };

        let stop_reason = match result {
            Err(e) => {
                let message = format!("Ring sequence failed: {}", e);
                self.state.record_error(message.clone());
                self.events.emit(LineEvent::Error { message });
                RingStopReason::Failed
            }
            Ok(_) if !returned_to_idle && self.state.current_state() == LineState::OffHook => {
                RingStopReason::Answered
            }
            Ok(RingOutcome::Completed { .. }) => RingStopReason::Completed,
            Ok(RingOutcome::Cancelled { .. }) => RingStopReason::Cancelled,
        };
        self.events.emit(LineEvent::RingStop {
            reason: stop_reason,
        });
    }

    /// Write caller-supplied PCM to the line after DC removal and peak
    /// normalization. Allowed while off-hook or in a call.
    pub async fn play_audio(&self, pcm: &[u8]) -> Result<usize> {
        self.require_audio_path("play audio")?;
        let samples = pcm_from_le_bytes(pcm)?;
        if samples.is_empty() {
            return Err(LineError::InvalidArgument("no audio samples supplied".into()));
        }
        let normalized = normalize_for_playback(&samples);
        self.write_audio(&pcm_to_le_bytes(&normalized)).await
    }

    /// Synthesize a sine tone and play it. Same state rule as `play_audio`.
    pub async fn generate_tone(&self, frequency: f32, duration_ms: u32) -> Result<usize> {
        self.require_audio_path("generate tone")?;
        let samples = self.tones.tone(frequency, duration_ms)?;
        info!("Playing {} Hz tone for {} ms", frequency, duration_ms);
        self.write_audio(&pcm_to_le_bytes(&samples)).await
    }

    fn require_audio_path(&self, command: &'static str) -> Result<()> {
        match self.state.current_state() {
            LineState::OffHook | LineState::InCall => Ok(()),
            state => Err(LineError::InvalidState { command, state }),
        }
    }

    async fn write_audio(&self, bytes: &[u8]) -> Result<usize> {
        match self.hardware.write_audio_frame(bytes).await {
            Ok(written) => {
                debug!("Wrote {} of {} audio bytes", written, bytes.len());
                Ok(written)
            }
            Err(e) => {
                self.state.record_error(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Ask for a transition on behalf of an external caller.
    ///
    /// Ringing is entered through [`ring`](Self::ring) only. Leaving
    /// `Ringing` this way stops the ring sequence.
    pub async fn request_transition(
        &self,
        target: LineState,
        reason: impl Into<String>,
    ) -> Result<StateTransition> {
        if target == LineState::Ringing {
            return Err(LineError::InvalidArgument(
                "ringing is started with a ring request".into(),
            ));
        }
        let transition = self.state.set_state(target, reason, Metadata::new())?;
        if transition.from_state == LineState::Ringing {
            self.cancel_ring().await;
        }
        Ok(transition)
    }

    pub fn get_status(&self) -> LineStatus {
        let snapshot = self.state.snapshot(crate::STATUS_DTMF_ENTRIES);
        let (line_voltage, off_hook) = {
            let monitor = self.monitor.lock();
            (monitor.voltage, monitor.off_hook)
        };
        LineStatus {
            channel: self.config.channel,
            state: snapshot.state,
            line_voltage,
            off_hook,
            ring_active: self.ring_active.load(Ordering::SeqCst),
            call_stats: snapshot.call_stats,
            last_dtmf: snapshot.last_dtmf,
            dtmf_history: snapshot.dtmf_history,
            last_error: snapshot.last_error,
            detector: *self.detector_stats.lock(),
        }
    }

    pub fn dtmf_history(&self, limit: Option<usize>) -> Vec<DtmfEvent> {
        self.state.dtmf_history(limit)
    }

    pub fn transition_history(&self) -> Vec<StateTransition> {
        self.state.transition_history()
    }

    /// Sleep unless shutdown comes first; false means stop.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }

    async fn audio_pump(self: Arc<Self>, mut detector: DtmfDetector) {
        let frame_bytes = self.config.frame_bytes();
        let mut ticker = tokio::time::interval(self.config.audio_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.cancelled() => break,
            }

            match self.hardware.read_audio_frame(frame_bytes).await {
                Ok(bytes) => {
                    if failures > 0 {
                        info!("Audio reads recovered after {} failures", failures);
                        failures = 0;
                    }
                    self.process_audio(&mut detector, &bytes);
                }
                Err(e) => {
                    failures += 1;
                    error!("Audio read failed ({} in a row): {}", failures, e);
                    if failures == 1 {
                        self.report_hardware_error(&e);
                    }
                    let delay = if failures == 1 {
                        FIRST_RETRY_DELAY.min(self.config.error_backoff())
                    } else {
                        self.config.error_backoff()
                    };
                    if !self.pause(delay).await {
                        break;
                    }
                }
            }
        }
        debug!("Audio pump stopped");
    }

    fn process_audio(&self, detector: &mut DtmfDetector, bytes: &[u8]) {
        let result = pcm_from_le_bytes(bytes)
            .and_then(|samples| detector.process_frame(&samples));
        *self.detector_stats.lock() = detector.stats();

        match result {
            Ok(Some(event)) => self.dispatch_dtmf(event),
            Ok(None) => {}
            Err(e) => debug!("Dropped audio frame: {}", e),
        }
    }

    fn dispatch_dtmf(&self, event: DtmfEvent) {
        info!(
            "DTMF digit {} ({} ms, {:.1} dBm)",
            event.digit, event.duration_ms, event.signal_level_dbm
        );
        self.state.handle_dtmf_event(&event);
        self.events.emit(LineEvent::from(&event));
    }

    async fn voltage_poll(self: Arc<Self>) {
        let mut failing = false;
        loop {
            let delay = match self.hardware.get_voltage(self.config.channel).await {
                Ok(volts) => {
                    if failing {
                        info!("Voltage reads recovered");
                        failing = false;
                    }
                    self.on_voltage_sample(volts).await;
                    self.config.voltage_poll_interval()
                }
                Err(e) => {
                    error!("Voltage read failed: {}", e);
                    if !failing {
                        self.report_hardware_error(&e);
                        failing = true;
                    }
                    self.config.error_backoff()
                }
            };
            if !self.pause(delay).await {
                break;
            }
        }
        debug!("Voltage poll stopped");
    }

    fn report_hardware_error(&self, e: &HardwareError) {
        self.state.record_error(e.to_string());
        self.events.emit(LineEvent::Error {
            message: e.to_string(),
        });
    }

    async fn on_voltage_sample(&self, volts: f32) {
        debug!("Line voltage {:.1} V", volts);
        self.events.emit(LineEvent::VoltageSample { volts });

        let below = volts < self.config.off_hook_threshold();
        let edge = {
            let mut monitor = self.monitor.lock();
            monitor.voltage = Some(volts);
            if below == monitor.off_hook {
                None
            } else {
                monitor.off_hook = below;
                Some(below)
            }
        };

        match edge {
            Some(true) => self.on_off_hook(volts).await,
            Some(false) => self.on_hook(volts),
            // Handset still up after an earlier proposal was refused
            None if below && self.state.current_state() == LineState::Idle => {
                self.propose_off_hook(volts).await
            }
            None => {}
        }
    }

    async fn on_off_hook(&self, volts: f32) {
        info!("Off-hook detected at {:.1} V", volts);
        self.events.emit(LineEvent::OffHook { voltage: volts });
        self.propose_off_hook(volts).await;
    }

    /// One validated transition decides both cases, so a ring that starts
    /// between the hook edge and the commit is still cancelled.
    async fn propose_off_hook(&self, volts: f32) {
        let mut metadata = Metadata::new();
        metadata.insert("voltage".to_string(), format!("{:.1}", volts));

        match self.state.set_state(LineState::OffHook, "Off-hook detected", metadata) {
            Ok(transition) if transition.from_state == LineState::Ringing => {
                info!("Ring answered");
                self.cancel_ring().await;
            }
            Ok(_) => {}
            Err(e) => warn!("Off-hook proposal rejected: {}", e),
        }
    }

    fn on_hook(&self, volts: f32) {
        info!("On-hook detected at {:.1} V", volts);
        self.events.emit(LineEvent::OnHook { voltage: volts });

        let current = self.state.current_state();
        if matches!(current, LineState::OffHook | LineState::InCall) {
            let mut metadata = Metadata::new();
            metadata.insert("voltage".to_string(), format!("{:.1}", volts));
            if let Err(e) = self.state.set_state(LineState::Idle, "On-hook detected", metadata) {
                warn!("On-hook proposal rejected: {}", e);
            }
        }
    }
}
