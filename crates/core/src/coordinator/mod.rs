//! Single-flight executor for resolved responses.
//!
//! [`Coordinator::execute`] is the only way into a cycle. It atomically moves
//! the shared [`CoordinatorState`] from `Idle` to `Active`, sends the movement
//! command on the caller's task, and hands the rest of the cycle (speech, mouth
//! pulses, neutral reset) to a background worker. A request arriving while a
//! cycle is active is dropped, never queued.

mod cycle;

pub use cycle::{CycleEnd, CycleReport, CycleTiming};

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::io::speech::SpeechService;
use crate::io::transport::{MotorSink, SendOutcome, TransportError};
use crate::types::{CoordinatorState, Phase, ResolvedResponse, SymbolicCommand};

/// Result of an `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Accepted(Uuid),
    /// A cycle was already running, or the coordinator is shutting down.
    Dropped,
}

impl ExecuteOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Motor sink wrapper that never fails the caller and remembers the last
/// command sent, so shutdown knows whether a movement is outstanding.
pub(crate) struct MotorLink {
    sink: Arc<dyn MotorSink>,
    last: Mutex<Option<SymbolicCommand>>,
}

impl MotorLink {
    fn new(sink: Arc<dyn MotorSink>) -> Self {
        Self {
            sink,
            last: Mutex::new(None),
        }
    }

    /// Best-effort send. Errors are logged and swallowed.
    pub(crate) fn send(&self, command: SymbolicCommand) -> Option<SendOutcome> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(command);
        match self.sink.send(command) {
            Ok(outcome) => {
                tracing::debug!(command = %command, ?outcome, "motor command");
                Some(outcome)
            }
            Err(e) => {
                tracing::warn!(command = %command, error = %e, "motor command failed");
                None
            }
        }
    }

    fn try_send(&self, command: SymbolicCommand) -> Result<SendOutcome, TransportError> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(command);
        self.sink.send(command)
    }

    fn last(&self) -> Option<SymbolicCommand> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct CycleJob {
    resolved: ResolvedResponse,
    span: tracing::Span,
}

struct Shared {
    state: Mutex<CoordinatorState>,
    phase_tx: watch::Sender<Phase>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_enter(&self) -> Option<Uuid> {
        let mut state = self.lock();
        let id = state.try_enter()?;
        self.phase_tx.send_replace(Phase::Active);
        Some(id)
    }

    fn leave(&self) {
        let mut state = self.lock();
        state.leave();
        self.phase_tx.send_replace(Phase::Idle);
    }
}

/// Returns the state to `Idle` however the cycle ends, unwinding included.
struct LeaveOnDrop(Arc<Shared>);

impl Drop for LeaveOnDrop {
    fn drop(&mut self) {
        self.0.leave();
    }
}

/// Cheap, cloneable handle used by the foreground to start cycles.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
    link: Arc<MotorLink>,
    jobs: mpsc::Sender<CycleJob>,
    phase_rx: watch::Receiver<Phase>,
    token: CancellationToken,
    simulated: bool,
}

/// Owner of the background worker. Consumed by [`CoordinatorTask::shutdown`].
pub struct CoordinatorTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
    link: Arc<MotorLink>,
    speech: Arc<dyn SpeechService>,
}

impl Coordinator {
    /// Spawn the worker. `token` stops it; pass a child of the runtime token.
    pub fn spawn(
        motor: Arc<dyn MotorSink>,
        speech: Arc<dyn SpeechService>,
        timing: CycleTiming,
        token: CancellationToken,
    ) -> (Self, CoordinatorTask) {
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
        let shared = Arc::new(Shared {
            state: Mutex::new(CoordinatorState::default()),
            phase_tx,
        });
        let simulated = motor.is_simulated();
        let link = Arc::new(MotorLink::new(motor));
        // One slot: the state gate admits at most one job at a time.
        let (jobs, rx) = mpsc::channel(1);

        let handle = tokio::spawn(worker(
            rx,
            Arc::clone(&shared),
            Arc::clone(&link),
            Arc::clone(&speech),
            timing,
            token.clone(),
        ));

        let coordinator = Self {
            shared,
            link: Arc::clone(&link),
            jobs,
            phase_rx,
            token: token.clone(),
            simulated,
        };
        let task = CoordinatorTask {
            token,
            handle,
            link,
            speech,
        };
        (coordinator, task)
    }

    /// Start a cycle for `resolved`, or drop it if one is already running.
    /// Never blocks on playback and never fails.
    pub fn execute(&self, resolved: ResolvedResponse) -> ExecuteOutcome {
        if self.token.is_cancelled() {
            tracing::debug!(text = %resolved.text, "coordinator stopping, dropping request");
            return ExecuteOutcome::Dropped;
        }
        let Some(cycle_id) = self.shared.try_enter() else {
            tracing::debug!(text = %resolved.text, "cycle active, dropping request");
            return ExecuteOutcome::Dropped;
        };

        let span = tracing::info_span!("cycle", id = %cycle_id);
        {
            let _entered = span.enter();
            tracing::info!(
                movement = ?resolved.movement_code,
                pulses = resolved.mouth_pulse_count,
                source = ?resolved.source,
                "cycle start"
            );
            if let Some(command) = resolved.movement_code {
                self.link.send(command);
            }
        }

        match self.jobs.try_send(CycleJob { resolved, span }) {
            Ok(()) => ExecuteOutcome::Accepted(cycle_id),
            Err(e) => {
                let job = match e {
                    mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
                };
                tracing::warn!(id = %cycle_id, "coordinator worker unavailable, abandoning cycle");
                if job.resolved.movement_code.is_some_and(|c| !c.is_neutral()) {
                    self.link.send(SymbolicCommand::Reset);
                }
                self.shared.leave();
                ExecuteOutcome::Dropped
            }
        }
    }

    /// Speak `text` with `pulses` mouth pulses and no body movement.
    pub fn speak(&self, text: impl Into<String>, pulses: u32) -> ExecuteOutcome {
        self.execute(ResolvedResponse::spoken(text, pulses))
    }

    /// Send a command outside any cycle. Not gated by the single-flight state.
    pub fn send_direct(&self, command: SymbolicCommand) -> Result<SendOutcome, TransportError> {
        let outcome = self.link.try_send(command);
        match &outcome {
            Ok(o) => tracing::info!(command = %command, outcome = ?o, "direct command"),
            Err(e) => tracing::warn!(command = %command, error = %e, "direct command failed"),
        }
        outcome
    }

    pub fn state(&self) -> CoordinatorState {
        *self.shared.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// True when the motor sink has no hardware behind it.
    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    /// Resolve once the coordinator is idle (immediately if it already is).
    pub async fn wait_idle(&self) {
        let mut rx = self.phase_rx.clone();
        // Err only if the sender is gone, in which case no cycle can be running.
        let _ = rx.wait_for(|phase| *phase == Phase::Idle).await;
    }
}

impl CoordinatorTask {
    /// Stop the worker, return the hardware to neutral if a movement is
    /// outstanding, then release speech and transport.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "coordinator worker ended abnormally");
        }
        match self.link.last() {
            Some(SymbolicCommand::Reset) | None => {}
            Some(_) => {
                tracing::info!("neutral reset on shutdown");
                self.link.send(SymbolicCommand::Reset);
            }
        }
        self.speech.close().await;
        self.link.sink.close();
        tracing::info!("coordinator stopped");
    }
}

async fn worker(
    mut rx: mpsc::Receiver<CycleJob>,
    shared: Arc<Shared>,
    link: Arc<MotorLink>,
    speech: Arc<dyn SpeechService>,
    timing: CycleTiming,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            job = rx.recv() => {
                let Some(CycleJob { resolved, span }) = job else {
                    break;
                };
                let _leave = LeaveOnDrop(Arc::clone(&shared));
                cycle::run(&resolved, &link, speech.as_ref(), timing, &token)
                    .instrument(span)
                    .await;
            }
        }
    }
    // A job admitted just before cancellation never ran; release its slot.
    rx.close();
    while let Ok(job) = rx.try_recv() {
        let _entered = job.span.enter();
        tracing::info!("cycle abandoned at shutdown");
        shared.leave();
    }
    tracing::debug!("coordinator worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::speech::SimulatedSpeech;
    use crate::io::transport::{RecordingSink, SerialTransport};
    use crate::types::ResolutionSource;
    use std::time::Duration;
    use tokio::time::Instant;

    use SymbolicCommand::{Dance, Reset, Talk, Wiggle};

    fn response(text: &str, movement: Option<SymbolicCommand>, pulses: u32) -> ResolvedResponse {
        ResolvedResponse {
            text: text.into(),
            movement_code: movement,
            mouth_pulse_count: pulses,
            source: ResolutionSource::Fallback,
        }
    }

    fn setup(
        speech: SimulatedSpeech,
    ) -> (Coordinator, CoordinatorTask, Arc<RecordingSink>, Arc<SimulatedSpeech>) {
        let sink = Arc::new(RecordingSink::new());
        let speech = Arc::new(speech);
        let (coordinator, task) = Coordinator::spawn(
            sink.clone(),
            speech.clone(),
            CycleTiming::default(),
            CancellationToken::new(),
        );
        (coordinator, task, sink, speech)
    }

    /// Offsets from `t0` of every `Talk` pulse.
    fn pulse_offsets(sink: &RecordingSink, t0: Instant) -> Vec<Duration> {
        sink.timeline()
            .into_iter()
            .filter(|(_, c)| *c == Talk)
            .map(|(at, _)| at - t0)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn movement_then_pulses_then_reset() {
        let (coordinator, task, sink, speech) =
            setup(SimulatedSpeech::fixed(Duration::from_secs(4)));
        let t0 = Instant::now();
        assert!(coordinator.execute(response("Let's dance together now!", Some(Dance), 2)).is_accepted());
        // movement is sent synchronously, before execute returns
        assert_eq!(sink.commands(), vec![Dance]);
        assert!(coordinator.is_active());

        coordinator.wait_idle().await;
        assert_eq!(sink.commands(), vec![Dance, Talk, Talk, Reset]);
        assert_eq!(
            pulse_offsets(&sink, t0),
            vec![Duration::ZERO, Duration::from_millis(1500)]
        );
        assert_eq!(speech.spoken(), vec!["Let's dance together now!".to_string()]);
        assert!(!coordinator.is_active());
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_pulse_waits_for_playback() {
        let (coordinator, task, sink, _speech) =
            setup(SimulatedSpeech::fixed(Duration::from_secs(3)));
        let t0 = Instant::now();
        coordinator.execute(response("Hi!", Some(Wiggle), 1));
        coordinator.wait_idle().await;
        let timeline = sink.timeline();
        assert_eq!(sink.commands(), vec![Wiggle, Talk, Reset]);
        let (reset_at, _) = timeline[2];
        assert!(reset_at - t0 >= Duration::from_secs(3));
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_bounds_long_playback() {
        let (coordinator, task, sink, speech) =
            setup(SimulatedSpeech::fixed(Duration::from_secs(60)));
        let t0 = Instant::now();
        coordinator.execute(response("a very long story", None, 0));
        coordinator.wait_idle().await;
        assert_eq!(Instant::now() - t0, Duration::from_secs(10));
        assert_eq!(sink.commands(), vec![Reset]);
        assert!(!speech.is_playing());
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn neutral_movement_is_not_doubled() {
        let (coordinator, task, sink, _speech) =
            setup(SimulatedSpeech::fixed(Duration::from_secs(1)));
        coordinator.execute(response("Resting now.", Some(Reset), 0));
        coordinator.wait_idle().await;
        assert_eq!(sink.commands(), vec![Reset]);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_execute_is_dropped() {
        let (coordinator, task, sink, speech) =
            setup(SimulatedSpeech::fixed(Duration::from_secs(2)));
        assert!(coordinator.execute(response("first", Some(Dance), 1)).is_accepted());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            coordinator.execute(response("second", Some(Wiggle), 3)),
            ExecuteOutcome::Dropped
        );
        coordinator.wait_idle().await;
        assert_eq!(sink.commands(), vec![Dance, Talk, Reset]);
        assert_eq!(speech.spoken(), vec!["first".to_string()]);

        // idle again: the next request is accepted
        assert!(coordinator.execute(response("third", None, 0)).is_accepted());
        coordinator.wait_idle().await;
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn speech_failure_still_completes_cycle() {
        let (coordinator, task, sink, _speech) = setup(SimulatedSpeech::failing());
        coordinator.execute(response("doomed", Some(Dance), 3));
        coordinator.wait_idle().await;
        assert_eq!(sink.commands(), vec![Dance, Reset]);
        assert!(!coordinator.is_active());
        assert!(coordinator.execute(response("again", None, 1)).is_accepted());
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failures_do_not_escape() {
        let sink = Arc::new(RecordingSink::failing());
        let (coordinator, task) = Coordinator::spawn(
            sink.clone(),
            Arc::new(SimulatedSpeech::fixed(Duration::from_secs(1))),
            CycleTiming::default(),
            CancellationToken::new(),
        );
        assert!(coordinator.execute(response("hi", Some(Dance), 1)).is_accepted());
        coordinator.wait_idle().await;
        assert_eq!(sink.commands(), vec![Dance, Talk, Reset]);
        assert!(coordinator.send_direct(Wiggle).is_err());
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn direct_commands_bypass_the_gate() {
        let (coordinator, task, sink, _speech) =
            setup(SimulatedSpeech::fixed(Duration::from_secs(2)));
        coordinator.execute(response("busy", None, 0));
        assert!(coordinator.is_active());
        assert_eq!(coordinator.send_direct(Wiggle).unwrap(), SendOutcome::Delivered);
        coordinator.wait_idle().await;
        assert_eq!(sink.commands(), vec![Wiggle, Reset]);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_cycle_resets_and_closes() {
        let (coordinator, task, sink, speech) =
            setup(SimulatedSpeech::fixed(Duration::from_secs(8)));
        coordinator.execute(response("still talking", Some(Dance), 2));
        tokio::time::sleep(Duration::from_secs(1)).await;
        task.shutdown().await;
        assert_eq!(sink.commands().last(), Some(&Reset));
        assert_eq!(sink.commands().iter().filter(|c| **c == Reset).count(), 1);
        assert!(sink.is_closed());
        assert!(!speech.is_playing());
        assert!(!coordinator.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_resets_outstanding_direct_movement() {
        let (coordinator, task, sink, _speech) =
            setup(SimulatedSpeech::fixed(Duration::from_secs(1)));
        coordinator.send_direct(Wiggle).unwrap();
        task.shutdown().await;
        assert_eq!(sink.commands(), vec![Wiggle, Reset]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_without_movement_sends_nothing() {
        let (_coordinator, task, sink, _speech) =
            setup(SimulatedSpeech::fixed(Duration::from_secs(1)));
        task.shutdown().await;
        assert!(sink.commands().is_empty());
        assert!(sink.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn execute_after_shutdown_is_dropped() {
        let (coordinator, task, sink, _speech) =
            setup(SimulatedSpeech::fixed(Duration::from_secs(1)));
        task.shutdown().await;
        assert_eq!(
            coordinator.execute(response("late", Some(Dance), 1)),
            ExecuteOutcome::Dropped
        );
        assert!(sink.commands().is_empty());
        assert!(!coordinator.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn execute_after_cancel_is_dropped_and_stays_idle() {
        let token = CancellationToken::new();
        let sink = Arc::new(RecordingSink::new());
        let (coordinator, task) = Coordinator::spawn(
            sink.clone(),
            Arc::new(SimulatedSpeech::fixed(Duration::from_secs(1))),
            CycleTiming::default(),
            token.clone(),
        );
        token.cancel();
        assert_eq!(coordinator.execute(response("hi", None, 1)), ExecuteOutcome::Dropped);
        task.shutdown().await;

        assert!(!coordinator.is_active());
        let idle = tokio::time::timeout(Duration::from_secs(1), coordinator.wait_idle()).await;
        assert!(idle.is_ok());
        assert!(sink.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_releases_job_queued_at_cancellation() {
        let (phase_tx, _phase_rx) = watch::channel(Phase::Idle);
        let shared = Arc::new(Shared {
            state: Mutex::new(CoordinatorState::default()),
            phase_tx,
        });
        let sink = Arc::new(RecordingSink::new());
        let link = Arc::new(MotorLink::new(sink.clone()));
        let (jobs, rx) = mpsc::channel(1);

        // admitted and queued, then cancelled before the worker picked it up
        assert!(shared.try_enter().is_some());
        assert!(
            jobs.try_send(CycleJob {
                resolved: response("queued", Some(Dance), 1),
                span: tracing::Span::none(),
            })
            .is_ok()
        );
        let token = CancellationToken::new();
        token.cancel();

        worker(
            rx,
            Arc::clone(&shared),
            link,
            Arc::new(SimulatedSpeech::fixed(Duration::from_secs(1))),
            CycleTiming::default(),
            token,
        )
        .await;

        assert!(!shared.lock().is_active());
        assert!(sink.commands().is_empty());
        assert!(jobs.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_transport_completes_cycle() {
        let (coordinator, task) = Coordinator::spawn(
            Arc::new(SerialTransport::simulated()),
            Arc::new(SimulatedSpeech::fixed(Duration::from_secs(1))),
            CycleTiming::default(),
            CancellationToken::new(),
        );
        assert!(coordinator.is_simulated());
        assert!(coordinator.execute(response("sim", Some(Dance), 1)).is_accepted());
        coordinator.wait_idle().await;
        assert_eq!(coordinator.send_direct(Dance).unwrap(), SendOutcome::Simulated);
        task.shutdown().await;
    }
}
