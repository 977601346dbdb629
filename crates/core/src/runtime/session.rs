use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::shutdown::ShutdownGuard;
use crate::config::WormCfg;
use crate::controller::{Flow, InputMode, InputModeController};
use crate::coordinator::{Coordinator, CoordinatorTask, CycleTiming, ExecuteOutcome};
use crate::io::input::{self, InputReceiver, InputSender};
use crate::io::output::{self, OutputMessage, OutputReceiver, OutputSender};
use crate::io::speech::SpeechService;
use crate::io::transport::MotorSink;
use crate::io::voice::VoiceListener;
use crate::resolver::{ResolveMode, ResponseResolver};

/// Pulses for the greeting spoken at startup.
const STARTUP_PULSES: u32 = 2;
/// Extra time on top of the cycle ceiling to let the goodbye finish.
const QUIT_GRACE: Duration = Duration::from_secs(1);

/// One interactive session: owns the coordinator worker, the input mode
/// controller and the optional voice listener, and routes input events
/// between them until the user quits or a signal arrives.
pub struct Runtime {
    shutdown: ShutdownGuard,
    input_rx: InputReceiver,
    /// Handed to the voice listener whenever voice mode starts.
    input_tx: InputSender,
    output_tx: OutputSender,
    controller: InputModeController,
    coordinator: Coordinator,
    task: CoordinatorTask,
    listener: Option<VoiceListener>,
    listener_command: Option<String>,
    start_in_voice: bool,
    quit_grace: Duration,
}

impl Runtime {
    /// Create a new Runtime. Returns (Runtime, input_sender, output_receiver).
    /// Push typed lines into the sender; consume replies from the receiver.
    /// Spawns the coordinator worker, so it must be called inside a tokio runtime.
    pub fn new(
        cfg: &WormCfg,
        resolver: ResponseResolver,
        motor: Arc<dyn MotorSink>,
        speech: Arc<dyn SpeechService>,
    ) -> (Self, InputSender, OutputReceiver) {
        Self::with_shutdown(cfg, resolver, motor, speech, ShutdownGuard::new())
    }

    pub fn with_shutdown(
        cfg: &WormCfg,
        resolver: ResponseResolver,
        motor: Arc<dyn MotorSink>,
        speech: Arc<dyn SpeechService>,
        shutdown: ShutdownGuard,
    ) -> (Self, InputSender, OutputReceiver) {
        let (input_tx, input_rx) = input::channel(64);
        let (output_tx, output_rx) = output::channel(64);
        let (coordinator, task) = Coordinator::spawn(
            motor,
            speech,
            CycleTiming::from_cfg(cfg),
            shutdown.token().child_token(),
        );
        let controller =
            InputModeController::new(resolver, coordinator.clone(), output_tx.clone(), cfg);
        let runtime = Self {
            shutdown,
            input_rx,
            input_tx: input_tx.clone(),
            output_tx,
            controller,
            coordinator,
            task,
            listener: None,
            listener_command: None,
            start_in_voice: false,
            quit_grace: cfg.cycle_ceiling() + QUIT_GRACE,
        };
        (runtime, input_tx, output_rx)
    }

    /// Speech-to-text program used in voice mode (one utterance per stdout line).
    /// Without one, asking for voice mode reports that voice is unavailable.
    pub fn with_listener_command(mut self, command: impl Into<String>) -> Self {
        let command = command.into();
        self.controller.set_voice_available(!command.trim().is_empty());
        self.listener_command = Some(command);
        self
    }

    /// Enter voice mode right after the greeting.
    pub fn with_voice_start(mut self, voice: bool) -> Self {
        self.start_in_voice = voice;
        self
    }

    pub fn with_resolve_mode(mut self, mode: ResolveMode) -> Self {
        self.controller.set_resolve_mode(mode);
        self
    }

    /// Returns the cancellation token for spawning child tasks.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Greet, then handle input until quit, input close or cancellation.
    /// Always leaves the hardware at neutral and releases speech and transport.
    pub async fn run(mut self) {
        self.shutdown.spawn_signal_listener();
        let token = self.shutdown.token();
        tracing::info!(simulated = self.coordinator.is_simulated(), "worm runtime started");

        self.greet().await;
        if self.start_in_voice {
            self.controller.set_mode(InputMode::Voice);
            self.sync_listener().await;
        }

        let quit = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("shutdown signal received, leaving input loop");
                    break false;
                }
                utterance = self.input_rx.recv() => {
                    let Some(utterance) = utterance else {
                        tracing::info!("input closed");
                        break true;
                    };
                    let span = tracing::debug_span!("input", id = %utterance.id, source = ?utterance.source);
                    let flow = self.controller.handle(&utterance).instrument(span).await;
                    self.sync_listener().await;
                    if flow == Flow::Quit {
                        break true;
                    }
                }
            }
        };

        if let Some(listener) = self.listener.take() {
            listener.stop().await;
        }
        if quit {
            // let the goodbye play out; the ceiling bounds it anyway
            if tokio::time::timeout(self.quit_grace, self.coordinator.wait_idle())
                .await
                .is_err()
            {
                tracing::warn!("last cycle still running at quit, cancelling");
            }
        }
        self.task.shutdown().await;
        self.shutdown.trigger();
        tracing::info!("worm runtime stopped");
    }

    async fn greet(&self) {
        let text = self.controller.resolver().catalog().startup_message().to_owned();
        let message = match self.coordinator.speak(text.clone(), STARTUP_PULSES) {
            ExecuteOutcome::Accepted(_) => OutputMessage::reply(text),
            ExecuteOutcome::Dropped => OutputMessage::notice(text),
        };
        if self.output_tx.send(message).await.is_err() {
            tracing::debug!("output channel closed");
        }
    }

    /// Start or stop the voice listener to match the controller's mode.
    async fn sync_listener(&mut self) {
        if self.listener.as_ref().is_some_and(|l| !l.is_running()) {
            if let Some(listener) = self.listener.take() {
                listener.stop().await;
            }
            if self.controller.mode() == InputMode::Voice {
                self.controller.voice_unavailable().await;
            }
        }

        match (self.controller.mode(), self.listener.is_some()) {
            (InputMode::Voice, false) => {
                let Some(command) = self.listener_command.as_deref() else {
                    self.controller.voice_unavailable().await;
                    return;
                };
                match VoiceListener::start(command, self.input_tx.clone(), &self.shutdown.token()) {
                    Ok(listener) => self.listener = Some(listener),
                    Err(e) => {
                        tracing::warn!(error = %e, "voice listener failed to start");
                        self.controller.voice_unavailable().await;
                    }
                }
            }
            (InputMode::Text, true) => {
                if let Some(listener) = self.listener.take() {
                    listener.stop().await;
                }
            }
            _ => {}
        }
    }
}
