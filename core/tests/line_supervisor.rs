// Scenario tests for the supervisor running against the simulated line.
// All timed tests use paused tokio time, so ring holds and poll intervals
// elapse instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use fxsline_core::error::ErrorClass;
use fxsline_core::event::RingStopReason;
use fxsline_core::ring::{RingPattern, RingStep};
use fxsline_core::{
    DtmfDigit, HardwareSupervisor, LineConfig, LineEvent, LineState, PhoneEvent, RingPatternKind,
    RingRequest, SimulatedLine,
};
use tokio::sync::broadcast;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn start_line() -> (Arc<HardwareSupervisor>, Arc<SimulatedLine>) {
    init_logging();
    let config = LineConfig::default();
    let sim = Arc::new(SimulatedLine::new(0.0));
    let line = HardwareSupervisor::new(config, sim.clone()).expect("Failed to create supervisor");
    line.start().await.expect("Failed to start line");
    (line, sim)
}

async fn wait(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn drain(rx: &mut broadcast::Receiver<PhoneEvent>) -> Vec<LineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.event);
    }
    events
}

fn ring_stop_reasons(events: &[LineEvent]) -> Vec<RingStopReason> {
    events
        .iter()
        .filter_map(|event| match event {
            LineEvent::RingStop { reason } => Some(*reason),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_start_applies_idle_voltage() {
    let (line, sim) = start_line().await;
    assert_eq!(line.get_status().state, LineState::Idle);
    assert_eq!(sim.applied_voltage(), 48.0);

    wait(100).await;
    let status = line.get_status();
    assert_eq!(status.line_voltage, Some(48.0));
    assert!(!status.off_hook);

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_failure_enters_error_state() {
    init_logging();
    let sim = Arc::new(SimulatedLine::new(0.0));
    sim.fail_voltage_writes(1);
    let line = HardwareSupervisor::new(LineConfig::default(), sim.clone()).unwrap();

    let err = line.start().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Hardware);
    assert_eq!(line.get_status().state, LineState::Error);
    assert!(line.get_status().last_error.is_some());
}

#[test]
fn test_invalid_config_rejected() {
    let config = LineConfig {
        detection_threshold_dbm: 5.0,
        ..LineConfig::default()
    };
    let sim = Arc::new(SimulatedLine::new(0.0));
    let err = HardwareSupervisor::new(config, sim).err().expect("config should be rejected");
    assert_eq!(err.class(), ErrorClass::InvalidInput);
}

#[tokio::test(start_paused = true)]
async fn test_ring_then_stop_restores_idle_voltage() {
    let (line, sim) = start_line().await;
    let mut events = line.subscribe_events();

    line.ring(RingRequest::Pattern(RingPatternKind::Normal))
        .await
        .expect("Failed to ring");
    assert_eq!(sim.applied_voltage(), 90.0);
    assert_eq!(line.get_status().state, LineState::Ringing);
    assert!(line.get_status().ring_active);

    wait(500).await;
    line.stop_ring().await.expect("Failed to stop ring");

    assert_eq!(sim.applied_voltage(), 48.0);
    let status = line.get_status();
    assert!(!status.ring_active);
    assert_eq!(status.state, LineState::Idle);

    let last = line.transition_history().pop().unwrap();
    assert_eq!(last.from_state, LineState::Ringing);
    assert_eq!(last.to_state, LineState::Idle);

    assert_eq!(ring_stop_reasons(&drain(&mut events)), vec![RingStopReason::Cancelled]);

    // Nothing left to stop
    let err = line.stop_ring().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidState);

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ring_pattern_runs_to_completion() {
    let (line, sim) = start_line().await;
    let mut events = line.subscribe_events();

    line.ring(RingRequest::Pattern(RingPatternKind::Timer)).await.unwrap();
    wait(2000).await;

    assert_eq!(line.get_status().state, LineState::Idle);
    assert_eq!(sim.applied_voltage(), 48.0);
    let rings = sim.voltage_log().iter().filter(|v| **v == 90.0).count();
    assert_eq!(rings, 3);
    assert_eq!(ring_stop_reasons(&drain(&mut events)), vec![RingStopReason::Completed]);

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ring_by_duration() {
    let (line, sim) = start_line().await;

    line.ring(RingRequest::Duration(1500)).await.unwrap();
    wait(1000).await;
    assert_eq!(sim.applied_voltage(), 90.0);
    wait(1000).await;
    assert_eq!(sim.applied_voltage(), 48.0);
    assert_eq!(line.get_status().state, LineState::Idle);

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_new_ring_replaces_active_one() {
    let (line, sim) = start_line().await;
    let mut events = line.subscribe_events();

    line.ring(RingRequest::Pattern(RingPatternKind::Normal)).await.unwrap();
    wait(300).await;

    // The previous sequence is cancelled and cleaned up before the new one
    line.ring(RingRequest::Pattern(RingPatternKind::Single)).await.unwrap();
    assert_eq!(line.get_status().state, LineState::Ringing);
    wait(1000).await;

    assert_eq!(sim.voltage_log(), vec![48.0, 90.0, 48.0, 90.0, 48.0, 48.0]);
    assert_eq!(
        ring_stop_reasons(&drain(&mut events)),
        vec![RingStopReason::Cancelled, RingStopReason::Completed]
    );

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ring_hardware_failure_is_reported() {
    let (line, sim) = start_line().await;
    sim.fail_voltage_writes(1);

    let err = line.ring(RingRequest::Pattern(RingPatternKind::Normal)).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Hardware);

    let status = line.get_status();
    assert_eq!(status.state, LineState::Idle);
    assert!(!status.ring_active);
    assert!(status.last_error.is_some());
    assert_eq!(sim.applied_voltage(), 48.0);

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_off_hook_answers_ring() {
    let (line, sim) = start_line().await;
    let mut events = line.subscribe_events();

    line.ring(RingRequest::Pattern(RingPatternKind::Normal)).await.unwrap();
    sim.set_off_hook(true);
    wait(1100).await;

    let status = line.get_status();
    assert_eq!(status.state, LineState::OffHook);
    assert!(status.off_hook);
    assert!(!status.ring_active);
    assert_eq!(sim.applied_voltage(), 48.0);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, LineEvent::OffHook { .. })));
    assert_eq!(ring_stop_reasons(&events), vec![RingStopReason::Answered]);

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_call_lifecycle_updates_statistics() {
    let (line, sim) = start_line().await;

    sim.set_off_hook(true);
    wait(1100).await;
    assert_eq!(line.get_status().state, LineState::OffHook);

    // Ringing is refused while the handset is up
    let err = line.ring(RingRequest::default()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidState);

    line.request_transition(LineState::InCall, "Call connected").await.unwrap();
    wait(3000).await;

    sim.set_off_hook(false);
    wait(1100).await;

    let status = line.get_status();
    assert_eq!(status.state, LineState::Idle);
    assert!(!status.off_hook);
    assert_eq!(status.call_stats.total_calls, 1);
    assert_eq!(status.call_stats.successful_calls, 1);
    assert_eq!(status.call_stats.failed_calls, 0);
    assert!(status.call_stats.last_call_timestamp.is_some());

    let states: Vec<_> = line.transition_history().iter().map(|t| t.to_state).collect();
    assert_eq!(
        states,
        vec![LineState::Idle, LineState::OffHook, LineState::InCall, LineState::Idle]
    );

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dtmf_reaches_history_and_events_in_order() {
    let (line, sim) = start_line().await;
    let mut events = line.subscribe_events();

    let digits = DtmfDigit::parse_sequence("159#").unwrap();
    sim.inject_dtmf(&digits, 8000, 100, 60).unwrap();
    wait(1000).await;

    let history: String = line.dtmf_history(None).iter().map(|e| e.digit.as_char()).collect();
    assert_eq!(history, "159#");

    let from_events: String = drain(&mut events)
        .iter()
        .filter_map(|e| match e {
            LineEvent::Dtmf { digit, .. } => Some(digit.as_char()),
            _ => None,
        })
        .collect();
    assert_eq!(from_events, "159#");

    let status = line.get_status();
    assert_eq!(status.last_dtmf.map(|e| e.digit.as_char()), Some('#'));
    assert_eq!(status.call_stats.dtmf_digits_received, 4);
    assert_eq!(status.detector.tones_detected, 4);
    assert!(status.detector.frames_processed >= 40);

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_status_keeps_last_ten_digits() {
    let (line, sim) = start_line().await;

    let digits = DtmfDigit::parse_sequence("0123456789AB").unwrap();
    sim.inject_dtmf(&digits, 8000, 80, 60).unwrap();
    wait(3000).await;

    let status = line.get_status();
    let recent: String = status.dtmf_history.iter().map(|e| e.digit.as_char()).collect();
    assert_eq!(recent, "23456789AB");
    assert_eq!(line.dtmf_history(Some(3)).len(), 3);
    assert_eq!(line.dtmf_history(None).len(), 12);

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_audio_commands_require_off_hook() {
    let (line, sim) = start_line().await;
    let pcm: Vec<u8> = [1000i16, -1000, 2000, -2000]
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect();

    let err = line.play_audio(&pcm).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidState);
    let err = line.generate_tone(440.0, 100).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidState);

    sim.set_off_hook(true);
    wait(1100).await;

    let written = line.play_audio(&pcm).await.unwrap();
    assert_eq!(written, pcm.len());
    let out = sim.written_audio();
    let peak = out
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]).unsigned_abs())
        .max()
        .unwrap();
    assert!(peak > 30000, "playback should be peak-normalized, got {}", peak);

    let written = line.generate_tone(440.0, 100).await.unwrap();
    assert_eq!(written, 800 * 2);

    let err = line.play_audio(&pcm[..3]).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidInput);
    let err = line.generate_tone(5000.0, 100).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidInput);

    sim.fail_audio_writes(1);
    let err = line.play_audio(&pcm).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Hardware);

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_voltage_poll_backs_off_and_recovers() {
    init_logging();
    let sim = Arc::new(SimulatedLine::new(0.0));
    sim.fail_voltage_reads(2);
    let line = HardwareSupervisor::new(LineConfig::default(), sim.clone()).unwrap();
    line.start().await.unwrap();
    let mut events = line.subscribe_events();

    // Failures at 0 s and 5 s, success at 10 s
    wait(7000).await;
    assert_eq!(line.get_status().line_voltage, None);
    assert!(line.get_status().last_error.is_some());

    wait(4000).await;
    assert_eq!(line.get_status().line_voltage, Some(48.0));
    assert_eq!(line.get_status().state, LineState::Idle);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, LineEvent::VoltageSample { volts } if *volts == 48.0)));

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_audio_read_failures_do_not_stop_detection() {
    let (line, sim) = start_line().await;
    sim.fail_audio_reads(3);

    // 1 s then 5 s backoff before reads succeed again
    wait(12_000).await;
    let digits = DtmfDigit::parse_sequence("7").unwrap();
    sim.inject_dtmf(&digits, 8000, 100, 60).unwrap();
    wait(500).await;

    let last = line.get_status().last_dtmf.map(|e| e.digit.as_char());
    assert_eq!(last, Some('7'));

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_requested_transitions_are_validated() {
    let (line, _sim) = start_line().await;

    let err = line.request_transition(LineState::InCall, "skip ahead").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidState);
    assert_eq!(line.get_status().state, LineState::Idle);

    let err = line.request_transition(LineState::Ringing, "no pattern").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidInput);

    line.ring(RingRequest::default()).await.unwrap();
    line.request_transition(LineState::Idle, "Caller hung up").await.unwrap();
    assert!(!line.get_status().ring_active);

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_ringing() {
    let (line, sim) = start_line().await;
    line.ring(RingRequest::Pattern(RingPatternKind::Continuous)).await.unwrap();

    line.shutdown().await;
    assert_eq!(sim.applied_voltage(), 48.0);
    assert!(!line.get_status().ring_active);
}

#[tokio::test(start_paused = true)]
async fn test_off_hook_stops_endless_ring() {
    let (line, sim) = start_line().await;
    let endless = RingPattern::new(vec![RingStep { on_ms: 400, off_ms: 200 }], 0).unwrap();

    line.ring(RingRequest::Custom(endless)).await.unwrap();
    sim.set_off_hook(true);
    wait(1100).await;

    assert_eq!(line.get_status().state, LineState::OffHook);
    assert!(!line.get_status().ring_active);
    let rings_at_answer = sim.voltage_log().iter().filter(|v| **v == 90.0).count();

    wait(5000).await;
    let rings_later = sim.voltage_log().iter().filter(|v| **v == 90.0).count();
    assert_eq!(rings_at_answer, rings_later);
    assert_eq!(sim.applied_voltage(), 48.0);

    line.shutdown().await;
}

// Real threads so the hook edge and the ring request can interleave.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lifting_during_ring_request_never_leaves_ring_running() {
    init_logging();
    let config = LineConfig {
        voltage_poll_interval_ms: 10,
        ..LineConfig::default()
    };
    let sim = Arc::new(SimulatedLine::new(0.0));
    let line = HardwareSupervisor::new(config, sim.clone()).unwrap();
    line.start().await.unwrap();
    let endless = RingPattern::new(vec![RingStep { on_ms: 1000, off_ms: 0 }], 0).unwrap();

    for round in 0..20 {
        let ringer = {
            let line = line.clone();
            let request = RingRequest::Custom(endless.clone());
            tokio::spawn(async move { line.ring(request).await })
        };
        sim.set_off_hook(true);
        // Either outcome is fine: rung then answered, or refused as off-hook
        let _ = ringer.await.unwrap();
        wait(100).await;

        let status = line.get_status();
        assert_eq!(status.state, LineState::OffHook, "round {}", round);
        assert!(!status.ring_active, "ring left running in round {}", round);
        assert_eq!(sim.applied_voltage(), 48.0, "round {}", round);

        sim.set_off_hook(false);
        wait(100).await;
        assert_eq!(line.get_status().state, LineState::Idle, "round {}", round);
    }

    line.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_off_hook_is_proposed_again() {
    let (line, sim) = start_line().await;

    line.request_transition(LineState::Error, "Maintenance").await.unwrap();
    sim.set_off_hook(true);
    wait(1100).await;
    // Error -> OffHook is not in the table
    assert_eq!(line.get_status().state, LineState::Error);
    assert!(line.get_status().off_hook);

    line.request_transition(LineState::Idle, "Recovered").await.unwrap();
    wait(1100).await;
    assert_eq!(line.get_status().state, LineState::OffHook);

    let err = line.ring(RingRequest::default()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidState);

    line.shutdown().await;
}
