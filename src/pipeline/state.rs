//! Pipeline state machine and the acoustic feedback gate
//!
//! One authoritative `PipelineState` lives behind a single mutex; every
//! mutation goes through this module. The microphone gate enforces the core
//! feedback invariant: no microphone reactivation until the cooldown has
//! fully elapsed after synthesized audio finished, even if the state itself
//! reads `Idle` early.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::events::{EventChannel, VoiceEvent};
use crate::{Result, TalkbackError};

/// Pipeline state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PipelineState {
    /// Waiting for speech
    #[default]
    Idle,
    /// Speech detected, accumulating a segment
    Listening,
    /// Segment complete, transcription running
    ProcessingSpeech,
    /// Language model generating a response
    GeneratingResponse,
    /// Synthesized speech playing
    PlayingSynthesis,
    /// Post-synthesis quiet period
    Cooldown,
    /// A service failed; an explicit reset is required
    Error(String),
}

impl PipelineState {
    pub fn is_idle(&self) -> bool {
        matches!(self, PipelineState::Idle)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PipelineState::Error(_))
    }

    /// States in which incoming audio must be dropped outright
    pub fn blocks_audio(&self) -> bool {
        matches!(
            self,
            PipelineState::GeneratingResponse
                | PipelineState::PlayingSynthesis
                | PipelineState::Cooldown
                | PipelineState::Error(_)
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "Idle"),
            PipelineState::Listening => write!(f, "Listening"),
            PipelineState::ProcessingSpeech => write!(f, "ProcessingSpeech"),
            PipelineState::GeneratingResponse => write!(f, "GeneratingResponse"),
            PipelineState::PlayingSynthesis => write!(f, "PlayingSynthesis"),
            PipelineState::Cooldown => write!(f, "Cooldown"),
            PipelineState::Error(reason) => write!(f, "Error({})", reason),
        }
    }
}

fn transition_allowed(from: &PipelineState, to: &PipelineState) -> bool {
    use PipelineState::*;
    matches!(
        (from, to),
        (_, Error(_))
            | (Idle, Listening)
            | (Idle, Cooldown)
            | (Listening, Idle)
            | (Listening, ProcessingSpeech)
            | (ProcessingSpeech, Idle)
            | (ProcessingSpeech, GeneratingResponse)
            | (ProcessingSpeech, Listening)
            | (GeneratingResponse, PlayingSynthesis)
            | (GeneratingResponse, Idle)
            | (GeneratingResponse, Cooldown)
            | (PlayingSynthesis, Cooldown)
            | (PlayingSynthesis, Idle)
            | (Cooldown, Idle)
            | (Error(_), Idle)
    )
}

/// Callback invoked synchronously for every committed transition.
pub type StateObserver = Box<dyn Fn(&PipelineState, &PipelineState) + Send + Sync>;

struct StateMachineInner {
    current: PipelineState,
    last_synthesis_end: Option<Instant>,
}

/// Single-owner state machine for the pipeline.
///
/// All reads and writes serialize on one mutex, so an explicit transition
/// and the scheduled cooldown expiry can never both commit for the same
/// state: the loser finds its precondition gone and no-ops.
pub struct PipelineStateMachine {
    inner: Mutex<StateMachineInner>,
    observer: Mutex<Option<StateObserver>>,
    events: EventChannel,
    cooldown: Duration,
    strict: bool,
}

impl PipelineStateMachine {
    pub fn new(cooldown: Duration, strict: bool, events: EventChannel) -> Self {
        Self {
            inner: Mutex::new(StateMachineInner {
                current: PipelineState::Idle,
                last_synthesis_end: None,
            }),
            observer: Mutex::new(None),
            events,
            cooldown,
            strict,
        }
    }

    /// Register the state-change observer.
    ///
    /// The observer runs synchronously under the commit lock and must not
    /// call back into this machine.
    pub fn set_observer(&self, observer: StateObserver) {
        *self.observer.lock() = Some(observer);
    }

    pub fn current(&self) -> PipelineState {
        self.inner.lock().current.clone()
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Request a transition to `to`.
    ///
    /// Transitions outside the fixed table are refused in strict mode (state
    /// unchanged) and allowed with a warning in permissive mode. Entering
    /// `Cooldown` records the synthesis-end timestamp.
    pub fn transition(&self, to: PipelineState) -> Result<()> {
        let mut inner = self.inner.lock();
        let from = inner.current.clone();

        if !transition_allowed(&from, &to) {
            if self.strict {
                warn!(%from, %to, "refusing invalid state transition");
                return Err(TalkbackError::InvalidTransition { from, to });
            }
            warn!(%from, %to, "permissive mode: allowing out-of-table transition");
        }

        self.commit_locked(&mut inner, to);
        Ok(())
    }

    fn commit_locked(&self, inner: &mut StateMachineInner, to: PipelineState) {
        let from = std::mem::replace(&mut inner.current, to.clone());

        if to == PipelineState::Cooldown {
            inner.last_synthesis_end = Some(Instant::now());
        }

        debug!(%from, %to, "state transition committed");
        self.events.publish(VoiceEvent::StateChanged {
            from: from.clone(),
            to: to.clone(),
        });
        if let Some(observer) = self.observer.lock().as_ref() {
            observer(&from, &to);
        }
    }

    /// Whether the microphone may deliver audio to the detector.
    ///
    /// True only in `Idle` or `Listening`, and only once the cooldown has
    /// fully elapsed since the last synthesis end.
    pub fn can_activate_microphone(&self) -> bool {
        let inner = self.inner.lock();
        let state_allows = matches!(
            inner.current,
            PipelineState::Idle | PipelineState::Listening
        );
        state_allows && self.cooldown_elapsed(&inner)
    }

    /// Whether synthesized audio may start playing.
    pub fn can_play_synthesis(&self) -> bool {
        self.inner.lock().current == PipelineState::GeneratingResponse
    }

    fn cooldown_elapsed(&self, inner: &StateMachineInner) -> bool {
        inner
            .last_synthesis_end
            .map_or(true, |end| end.elapsed() >= self.cooldown)
    }

    /// Spawn the autonomous cooldown expiry task.
    ///
    /// After the cooldown interval the task commits `Cooldown -> Idle`
    /// unless another transition already moved the state away, in which
    /// case it silently no-ops. Must be called from within a tokio runtime.
    pub fn schedule_cooldown_expiry(self: Arc<Self>) {
        let after = self.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            self.finish_cooldown();
        });
    }

    /// Commit `Cooldown -> Idle` if the state is still `Cooldown`.
    pub fn finish_cooldown(&self) {
        let mut inner = self.inner.lock();
        if inner.current != PipelineState::Cooldown {
            debug!(current = %inner.current, "cooldown expiry no-op, state moved on");
            return;
        }
        self.commit_locked(&mut inner, PipelineState::Idle);
    }

    /// Force the machine back to `Idle`, clearing cooldown bookkeeping.
    ///
    /// Always legal and idempotent; calling twice in a row is safe.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.last_synthesis_end = None;
        if inner.current != PipelineState::Idle {
            self.commit_locked(&mut inner, PipelineState::Idle);
        }
    }

    /// Timestamp of the last synthesis end, if any.
    pub fn last_synthesis_end(&self) -> Option<Instant> {
        self.inner.lock().last_synthesis_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn machine(cooldown_ms: u64) -> PipelineStateMachine {
        PipelineStateMachine::new(
            Duration::from_millis(cooldown_ms),
            true,
            EventChannel::new(64),
        )
    }

    /// Drive a fresh machine to `target` through table-legal transitions.
    fn drive_to(machine: &PipelineStateMachine, target: &PipelineState) {
        use PipelineState::*;
        let path: Vec<PipelineState> = match target {
            Idle => vec![],
            Listening => vec![Listening],
            ProcessingSpeech => vec![Listening, ProcessingSpeech],
            GeneratingResponse => vec![Listening, ProcessingSpeech, GeneratingResponse],
            PlayingSynthesis => vec![
                Listening,
                ProcessingSpeech,
                GeneratingResponse,
                PlayingSynthesis,
            ],
            Cooldown => vec![Cooldown],
            Error(_) => vec![Error("test".into())],
        };
        for step in path {
            machine.transition(step).unwrap();
        }
        assert_eq!(&machine.current(), target);
    }

    fn all_states() -> Vec<PipelineState> {
        use PipelineState::*;
        vec![
            Idle,
            Listening,
            ProcessingSpeech,
            GeneratingResponse,
            PlayingSynthesis,
            Cooldown,
            Error("test".into()),
        ]
    }

    #[test]
    fn every_pair_outside_the_table_is_refused_without_state_change() {
        for from in all_states() {
            for to in all_states() {
                let sm = machine(0);
                drive_to(&sm, &from);

                let allowed = transition_allowed(&from, &to);
                let result = sm.transition(to.clone());

                if allowed {
                    assert!(result.is_ok(), "{} -> {} should be allowed", from, to);
                    assert_eq!(sm.current(), to);
                } else {
                    assert!(result.is_err(), "{} -> {} should be refused", from, to);
                    assert_eq!(sm.current(), from, "state must be unchanged on refusal");
                }
            }
        }
    }

    #[test]
    fn any_state_may_enter_error_and_error_only_recovers_to_idle() {
        for from in all_states() {
            let sm = machine(0);
            drive_to(&sm, &from);
            sm.transition(PipelineState::Error("boom".into())).unwrap();
            assert!(sm.current().is_error());
        }

        let sm = machine(0);
        sm.transition(PipelineState::Error("boom".into())).unwrap();
        assert!(sm.transition(PipelineState::Listening).is_err());
        sm.transition(PipelineState::Idle).unwrap();
        assert!(sm.current().is_idle());
    }

    #[test]
    fn permissive_mode_allows_out_of_table_transitions() {
        let sm = PipelineStateMachine::new(Duration::ZERO, false, EventChannel::new(8));
        sm.transition(PipelineState::PlayingSynthesis).unwrap();
        assert_eq!(sm.current(), PipelineState::PlayingSynthesis);
    }

    #[test]
    fn microphone_gate_holds_for_the_full_cooldown() {
        let sm = machine(50);
        assert!(sm.can_activate_microphone());

        sm.transition(PipelineState::Cooldown).unwrap();
        assert!(!sm.can_activate_microphone());

        // Even after the state returns to Idle, the gate holds until the
        // cooldown interval has elapsed
        sm.finish_cooldown();
        assert!(sm.current().is_idle());
        assert!(!sm.can_activate_microphone());

        std::thread::sleep(Duration::from_millis(60));
        assert!(sm.can_activate_microphone());
    }

    #[test]
    fn synthesis_gate_is_open_only_while_generating() {
        let sm = machine(0);
        assert!(!sm.can_play_synthesis());
        drive_to(&sm, &PipelineState::GeneratingResponse);
        assert!(sm.can_play_synthesis());
        sm.transition(PipelineState::PlayingSynthesis).unwrap();
        assert!(!sm.can_play_synthesis());
    }

    #[test]
    fn entering_cooldown_records_synthesis_end() {
        let sm = machine(100);
        assert!(sm.last_synthesis_end().is_none());
        sm.transition(PipelineState::Cooldown).unwrap();
        assert!(sm.last_synthesis_end().is_some());
    }

    #[test]
    fn reset_is_idempotent_and_clears_bookkeeping() {
        let sm = machine(100);
        drive_to(&sm, &PipelineState::PlayingSynthesis);
        sm.transition(PipelineState::Cooldown).unwrap();

        sm.reset();
        assert!(sm.current().is_idle());
        assert!(sm.last_synthesis_end().is_none());
        assert!(sm.can_activate_microphone());

        sm.reset();
        assert!(sm.current().is_idle());
    }

    #[test]
    fn every_committed_transition_publishes_state_changed() {
        let events = EventChannel::new(16);
        let mut sub = events.subscribe();
        let sm = PipelineStateMachine::new(Duration::ZERO, true, events);

        sm.transition(PipelineState::Listening).unwrap();
        sm.transition(PipelineState::ProcessingSpeech).unwrap();

        match sub.try_recv() {
            Some(VoiceEvent::StateChanged { from, to }) => {
                assert_eq!(from, PipelineState::Idle);
                assert_eq!(to, PipelineState::Listening);
            }
            other => panic!("expected StateChanged, got {:?}", other),
        }
        assert!(matches!(
            sub.try_recv(),
            Some(VoiceEvent::StateChanged { .. })
        ));
    }

    #[test]
    fn refused_transitions_publish_nothing() {
        let events = EventChannel::new(16);
        let mut sub = events.subscribe();
        let sm = PipelineStateMachine::new(Duration::ZERO, true, events);

        assert!(sm.transition(PipelineState::PlayingSynthesis).is_err());
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn observer_sees_transitions_in_commit_order() {
        let sm = Arc::new(machine(0));
        let seen: Arc<Mutex<Vec<(PipelineState, PipelineState)>>> =
            Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        sm.set_observer(Box::new(move |from, to| {
            sink.lock().push((from.clone(), to.clone()));
        }));

        sm.transition(PipelineState::Listening).unwrap();
        sm.transition(PipelineState::ProcessingSpeech).unwrap();
        sm.transition(PipelineState::Idle).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (PipelineState::Idle, PipelineState::Listening));
        assert_eq!(
            seen[2],
            (PipelineState::ProcessingSpeech, PipelineState::Idle)
        );
    }

    #[tokio::test]
    async fn scheduled_expiry_returns_cooldown_to_idle() {
        let sm = Arc::new(machine(20));
        sm.transition(PipelineState::Cooldown).unwrap();
        Arc::clone(&sm).schedule_cooldown_expiry();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sm.current().is_idle());
    }

    #[tokio::test]
    async fn scheduled_expiry_no_ops_when_state_moved_on() {
        let sm = Arc::new(machine(20));
        sm.transition(PipelineState::Cooldown).unwrap();
        Arc::clone(&sm).schedule_cooldown_expiry();

        // Explicit transitions win the race; the timer must not clobber them
        sm.transition(PipelineState::Idle).unwrap();
        sm.transition(PipelineState::Listening).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sm.current(), PipelineState::Listening);
    }
}
