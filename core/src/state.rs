//! Phone line state machine.
//!
//! State, transition history, call statistics and DTMF history live behind
//! one lock so reads and writes are linearizable. Subscribers are fed
//! through per-subscriber queues: the queue push happens under the lock
//! (which fixes delivery order to commit order) while subscriber code runs
//! on its own task, outside the lock.

use crate::dtmf::DtmfEvent;
use crate::error::StateTransitionError;
use crate::history::BoundedHistory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineState {
    Initializing,
    Idle,
    OffHook,
    Ringing,
    InCall,
    Error,
}

impl LineState {
    pub const ALL: [LineState; 6] = [
        LineState::Initializing,
        LineState::Idle,
        LineState::OffHook,
        LineState::Ringing,
        LineState::InCall,
        LineState::Error,
    ];

    /// States reachable from `self` in one step
    pub fn allowed_transitions(self) -> &'static [LineState] {
        use LineState::*;
        match self {
            Initializing => &[Idle, Error],
            Idle => &[Ringing, OffHook, Error],
            Ringing => &[Idle, OffHook, Error],
            OffHook => &[Idle, InCall, Error],
            InCall => &[OffHook, Idle, Error],
            Error => &[Initializing, Idle],
        }
    }

    pub fn can_transition_to(self, to: LineState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LineState::Initializing => "initializing",
            LineState::Idle => "idle",
            LineState::OffHook => "off_hook",
            LineState::Ringing => "ringing",
            LineState::InCall => "in_call",
            LineState::Error => "error",
        }
    }
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Metadata = BTreeMap<String, String>;

/// Immutable record of an accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from_state: LineState,
    pub to_state: LineState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallStatistics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Mean duration of completed calls, seconds
    pub average_duration: f64,
    pub last_call_timestamp: Option<DateTime<Utc>>,
    pub dtmf_digits_received: u64,
}

/// Point-in-time copy of everything the state machine owns.
#[derive(Debug, Clone, Serialize)]
pub struct LineSnapshot {
    pub state: LineState,
    pub call_stats: CallStatistics,
    pub last_dtmf: Option<DtmfEvent>,
    pub dtmf_history: Vec<DtmfEvent>,
    pub last_error: Option<String>,
    pub transitions_recorded: usize,
}

pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Receives committed transitions, in commit order.
#[async_trait]
pub trait StateSubscriber: Send + Sync + 'static {
    async fn on_state_change(&self, change: &StateTransition) -> Result<(), SubscriberError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Inner {
    state: LineState,
    transitions: BoundedHistory<StateTransition>,
    call_stats: CallStatistics,
    call_started: Option<Instant>,
    dtmf_history: BoundedHistory<DtmfEvent>,
    last_error: Option<String>,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<StateTransition>)>,
}

pub struct LineStateMachine {
    inner: Mutex<Inner>,
    next_subscription: AtomicU64,
}

impl LineStateMachine {
    pub fn new(transition_history_size: usize, dtmf_history_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: LineState::Initializing,
                transitions: BoundedHistory::new(transition_history_size),
                call_stats: CallStatistics::default(),
                call_started: None,
                dtmf_history: BoundedHistory::new(dtmf_history_size),
                last_error: None,
                subscribers: Vec::new(),
            }),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn current_state(&self) -> LineState {
        self.inner.lock().state
    }

    /// Leave `Initializing` once the hardware is ready.
    pub fn initialize(&self) -> Result<StateTransition, StateTransitionError> {
        self.set_state(LineState::Idle, "Initialization complete", Metadata::new())
    }

    /// Validated transition to `new_state`.
    ///
    /// On rejection nothing changes. On success the transition is recorded,
    /// statistics are updated and subscribers are queued a copy.
    pub fn set_state(
        &self,
        new_state: LineState,
        reason: impl Into<String>,
        metadata: Metadata,
    ) -> Result<StateTransition, StateTransitionError> {
        let mut inner = self.inner.lock();
        Self::commit(&mut inner, new_state, reason.into(), metadata)
    }

    /// Like [`set_state`](Self::set_state) but only if the line is currently
    /// `expected`; returns `Ok(None)` without touching anything otherwise.
    pub fn set_state_if(
        &self,
        expected: LineState,
        new_state: LineState,
        reason: impl Into<String>,
        metadata: Metadata,
    ) -> Result<Option<StateTransition>, StateTransitionError> {
        let mut inner = self.inner.lock();
        if inner.state != expected {
            return Ok(None);
        }
        Self::commit(&mut inner, new_state, reason.into(), metadata).map(Some)
    }

    fn commit(
        inner: &mut Inner,
        new_state: LineState,
        reason: String,
        metadata: Metadata,
    ) -> Result<StateTransition, StateTransitionError> {
        let old_state = inner.state;
        if !old_state.can_transition_to(new_state) {
            warn!("Rejected state transition {} -> {} ({})", old_state, new_state, reason);
            return Err(StateTransitionError {
                from: old_state,
                to: new_state,
            });
        }

        inner.state = new_state;
        let transition = StateTransition {
            from_state: old_state,
            to_state: new_state,
            timestamp: Utc::now(),
            reason,
            metadata,
        };
        inner.transitions.push(transition.clone());
        Self::update_call_stats(inner, old_state, new_state, transition.timestamp);

        if new_state == LineState::Error {
            inner.last_error = Some(transition.reason.clone());
        }

        info!(
            "State changed: {} -> {} ({})",
            old_state, new_state, transition.reason
        );

        // Queue for subscribers; drop the ones whose task has gone away
        inner.subscribers.retain(|(id, tx)| {
            let delivered = tx.send(transition.clone()).is_ok();
            if !delivered {
                debug!("Dropping closed state subscriber {:?}", id);
            }
            delivered
        });

        Ok(transition)
    }

    fn update_call_stats(
        inner: &mut Inner,
        old_state: LineState,
        new_state: LineState,
        now: DateTime<Utc>,
    ) {
        if old_state != LineState::InCall && new_state == LineState::InCall {
            inner.call_stats.total_calls += 1;
            inner.call_started = Some(Instant::now());
        } else if old_state == LineState::InCall && new_state != LineState::InCall {
            let stats = &mut inner.call_stats;
            if new_state == LineState::Idle {
                stats.successful_calls += 1;
            } else {
                stats.failed_calls += 1;
            }
            stats.last_call_timestamp = Some(now);

            let completed = (stats.successful_calls + stats.failed_calls) as f64;
            let duration = inner
                .call_started
                .take()
                .map(|started| started.elapsed().as_secs_f64())
                .unwrap_or(0.0);
            stats.average_duration += (duration - stats.average_duration) / completed;
        }
    }

    /// Record a detected digit. Accepted in any line state.
    pub fn handle_dtmf_event(&self, event: &DtmfEvent) {
        let mut inner = self.inner.lock();
        inner.dtmf_history.push(event.clone());
        inner.call_stats.dtmf_digits_received += 1;
        debug!(
            "DTMF {} recorded while {} ({} in history)",
            event.digit,
            inner.state,
            inner.dtmf_history.len()
        );
    }

    /// Remember a failure for status reporting without changing state.
    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("Line error: {}", message);
        self.inner.lock().last_error = Some(message);
    }

    pub fn transition_history(&self) -> Vec<StateTransition> {
        self.inner.lock().transitions.to_vec()
    }

    /// Oldest-first DTMF history, optionally only the newest `limit` entries
    pub fn dtmf_history(&self, limit: Option<usize>) -> Vec<DtmfEvent> {
        let inner = self.inner.lock();
        match limit {
            Some(limit) => inner.dtmf_history.last_n(limit),
            None => inner.dtmf_history.to_vec(),
        }
    }

    pub fn last_dtmf(&self) -> Option<DtmfEvent> {
        self.inner.lock().dtmf_history.latest().cloned()
    }

    pub fn call_statistics(&self) -> CallStatistics {
        self.inner.lock().call_stats.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    pub fn snapshot(&self, dtmf_entries: usize) -> LineSnapshot {
        let inner = self.inner.lock();
        LineSnapshot {
            state: inner.state,
            call_stats: inner.call_stats.clone(),
            last_dtmf: inner.dtmf_history.latest().cloned(),
            dtmf_history: inner.dtmf_history.last_n(dtmf_entries),
            last_error: inner.last_error.clone(),
            transitions_recorded: inner.transitions.len(),
        }
    }

    /// Raw ordered feed of committed transitions.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<StateTransition>) {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.subscribers.push((id, tx));
        debug!("Added state subscriber {:?}, total {}", id, inner.subscribers.len());
        (id, rx)
    }

    /// Register a subscriber driven by its own task.
    ///
    /// Errors returned by the subscriber are logged and never reach the
    /// caller of `set_state`. Must be called inside a tokio runtime.
    pub fn subscribe(&self, subscriber: Arc<dyn StateSubscriber>) -> SubscriptionId {
        let (id, mut rx) = self.subscribe_channel();
        tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                if let Err(e) = subscriber.on_state_change(&change).await {
                    warn!(
                        "State subscriber {:?} failed on {} -> {}: {}",
                        id, change.from_state, change.to_state, e
                    );
                }
            }
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sub, _)| *sub != id);
        before != inner.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtmf::DtmfDigit;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn machine_in(state: LineState) -> LineStateMachine {
        let machine = LineStateMachine::new(100, 100);
        let path: &[LineState] = match state {
            LineState::Initializing => &[],
            LineState::Idle => &[LineState::Idle],
            LineState::OffHook => &[LineState::Idle, LineState::OffHook],
            LineState::Ringing => &[LineState::Idle, LineState::Ringing],
            LineState::InCall => &[LineState::Idle, LineState::OffHook, LineState::InCall],
            LineState::Error => &[LineState::Error],
        };
        for &next in path {
            machine.set_state(next, "setup", Metadata::new()).unwrap();
        }
        assert_eq!(machine.current_state(), state);
        machine
    }

    fn dtmf(c: char) -> DtmfEvent {
        DtmfEvent {
            digit: DtmfDigit::try_from(c).unwrap(),
            duration_ms: 60,
            timestamp: Utc::now(),
            signal_level_dbm: -12.0,
        }
    }

    #[test]
    fn test_transition_table_exhaustive() {
        for from in LineState::ALL {
            for to in LineState::ALL {
                let machine = machine_in(from);
                let before = machine.transition_history().len();
                let result = machine.set_state(to, "test", Metadata::new());

                if from.can_transition_to(to) {
                    let transition = result.unwrap();
                    assert_eq!(transition.from_state, from);
                    assert_eq!(transition.to_state, to);
                    assert_eq!(machine.current_state(), to);
                    assert_eq!(machine.transition_history().len(), before + 1);
                } else {
                    assert_eq!(result.unwrap_err(), StateTransitionError { from, to });
                    assert_eq!(machine.current_state(), from);
                    assert_eq!(machine.transition_history().len(), before);
                }
            }
        }
    }

    #[test]
    fn test_table_matches_line_rules() {
        use LineState::*;
        assert!(Idle.can_transition_to(Ringing));
        assert!(!Idle.can_transition_to(InCall));
        assert!(!Ringing.can_transition_to(InCall));
        assert!(Error.can_transition_to(Initializing));
        assert!(!Error.can_transition_to(OffHook));
        for state in LineState::ALL {
            assert!(!state.can_transition_to(state), "{} self-loop", state);
        }
    }

    #[test]
    fn test_successful_call_statistics() {
        let machine = machine_in(LineState::Idle);
        machine.set_state(LineState::OffHook, "handset lifted", Metadata::new()).unwrap();
        machine.set_state(LineState::InCall, "connected", Metadata::new()).unwrap();
        machine.set_state(LineState::Idle, "hung up", Metadata::new()).unwrap();

        let stats = machine.call_statistics();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.successful_calls, 1);
        assert_eq!(stats.failed_calls, 0);
        assert!(stats.last_call_timestamp.is_some());
        assert!(stats.average_duration >= 0.0);
    }

    #[test]
    fn test_failed_call_statistics() {
        let machine = machine_in(LineState::InCall);
        machine.set_state(LineState::Error, "line fault", Metadata::new()).unwrap();

        let stats = machine.call_statistics();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.successful_calls, 0);
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(machine.last_error().as_deref(), Some("line fault"));

        // Back to OffHook from InCall also counts as not completed cleanly
        let machine = machine_in(LineState::InCall);
        machine.set_state(LineState::OffHook, "far end dropped", Metadata::new()).unwrap();
        assert_eq!(machine.call_statistics().failed_calls, 1);
    }

    #[test]
    fn test_set_state_if_checks_expected() {
        let machine = machine_in(LineState::OffHook);
        let skipped = machine
            .set_state_if(LineState::Ringing, LineState::Idle, "ring finished", Metadata::new())
            .unwrap();
        assert!(skipped.is_none());
        assert_eq!(machine.current_state(), LineState::OffHook);

        let applied = machine
            .set_state_if(LineState::OffHook, LineState::Idle, "on hook", Metadata::new())
            .unwrap();
        assert!(applied.is_some());
        assert_eq!(machine.current_state(), LineState::Idle);
    }

    #[test]
    fn test_transition_history_bounded() {
        let machine = LineStateMachine::new(10, 10);
        machine.initialize().unwrap();
        for _ in 0..20 {
            machine.set_state(LineState::Ringing, "ring", Metadata::new()).unwrap();
            machine.set_state(LineState::Idle, "stop", Metadata::new()).unwrap();
        }
        let history = machine.transition_history();
        assert_eq!(history.len(), 10);
        assert_eq!(history.last().unwrap().to_state, LineState::Idle);
    }

    #[test]
    fn test_dtmf_history_evicts_oldest() {
        let machine = LineStateMachine::new(10, 10);
        let digits = "0123456789A";
        for c in digits.chars() {
            machine.handle_dtmf_event(&dtmf(c));
        }

        let history = machine.dtmf_history(None);
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].digit.as_char(), '1');
        assert_eq!(machine.last_dtmf().unwrap().digit.as_char(), 'A');
        assert_eq!(machine.call_statistics().dtmf_digits_received, 11);
        assert_eq!(machine.dtmf_history(Some(3)).len(), 3);
    }

    #[test]
    fn test_dtmf_accepted_in_any_state() {
        for state in LineState::ALL {
            let machine = machine_in(state);
            machine.handle_dtmf_event(&dtmf('5'));
            assert_eq!(machine.current_state(), state);
            assert_eq!(machine.dtmf_history(None).len(), 1);
        }
    }

    #[test]
    fn test_metadata_recorded() {
        let machine = machine_in(LineState::Idle);
        let metadata = Metadata::from([("pattern".to_string(), "normal".to_string())]);
        machine.set_state(LineState::Ringing, "ring requested", metadata.clone()).unwrap();
        let last = machine.transition_history().pop().unwrap();
        assert_eq!(last.metadata, metadata);
        assert_eq!(last.reason, "ring requested");
    }

    #[tokio::test]
    async fn test_channel_subscriber_sees_commit_order() {
        let machine = LineStateMachine::new(100, 100);
        let (_, mut rx) = machine.subscribe_channel();

        machine.initialize().unwrap();
        machine.set_state(LineState::OffHook, "lift", Metadata::new()).unwrap();
        let _ = machine.set_state(LineState::Ringing, "invalid", Metadata::new());
        machine.set_state(LineState::InCall, "connect", Metadata::new()).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap().to_state);
        }
        assert_eq!(seen, vec![LineState::Idle, LineState::OffHook, LineState::InCall]);
        assert!(rx.try_recv().is_err());
    }

    struct Failing;

    #[async_trait]
    impl StateSubscriber for Failing {
        async fn on_state_change(&self, _change: &StateTransition) -> Result<(), SubscriberError> {
            Err("subscriber exploded".into())
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl StateSubscriber for Counting {
        async fn on_state_change(&self, _change: &StateTransition) -> Result<(), SubscriberError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let machine = LineStateMachine::new(100, 100);
        let count = Arc::new(AtomicUsize::new(0));
        machine.subscribe(Arc::new(Failing));
        machine.subscribe(Arc::new(Counting(count.clone())));

        machine.initialize().unwrap();
        machine.set_state(LineState::Ringing, "ring", Metadata::new()).unwrap();
        assert_eq!(machine.current_state(), LineState::Ringing);

        for _ in 0..100 {
            if count.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_dropped_receivers() {
        let machine = LineStateMachine::new(100, 100);
        let (id, _rx) = machine.subscribe_channel();
        let (_, dropped) = machine.subscribe_channel();
        drop(dropped);
        assert_eq!(machine.subscriber_count(), 2);

        machine.initialize().unwrap();
        assert_eq!(machine.subscriber_count(), 1);

        assert!(machine.unsubscribe(id));
        assert!(!machine.unsubscribe(id));
        assert_eq!(machine.subscriber_count(), 0);
    }

    #[test]
    fn test_concurrent_transitions_are_sequential() {
        let machine = Arc::new(machine_in(LineState::Idle));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let machine = machine.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let _ = machine.set_state(LineState::Ringing, "ring", Metadata::new());
                        let _ = machine.set_state(LineState::Idle, "stop", Metadata::new());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every recorded transition starts where the previous one ended
        let history = machine.transition_history();
        for pair in history.windows(2) {
            assert_eq!(pair[0].to_state, pair[1].from_state);
        }
    }
}
