use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::config::WormCfg;

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("failed to start speech program: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("speech unavailable: {0}")]
    Unavailable(String),
    #[error("playback failed: {0}")]
    Playback(String),
}

/// Opaque "play text, report busy" service.
///
/// `play` starts playback and returns without waiting for it to finish; callers
/// poll `is_playing` to learn when the audio has ended.
#[async_trait]
pub trait SpeechService: Send + Sync {
    fn name(&self) -> &str;

    async fn play(&self, text: &str) -> Result<(), SpeechError>;

    fn is_playing(&self) -> bool;

    async fn stop(&self);

    async fn close(&self);
}

/// How long simulated playback lasts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeechPacing {
    /// Estimate from word count at this many words per minute.
    WordsPerMinute(u32),
    /// Every utterance lasts exactly this long.
    Fixed(Duration),
}

impl SpeechPacing {
    pub fn duration_for(self, text: &str) -> Duration {
        match self {
            Self::Fixed(d) => d,
            Self::WordsPerMinute(wpm) => {
                let words = text.split_whitespace().count().max(1) as u64;
                Duration::from_millis(words * 60_000 / u64::from(wpm.max(1)))
            }
        }
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    playing_until: Option<Instant>,
    spoken: Vec<String>,
}

/// Speech service with no audio. Playback is a timer on the tokio clock, so
/// paused-time tests control it exactly.
#[derive(Debug)]
pub struct SimulatedSpeech {
    pacing: SpeechPacing,
    state: Mutex<SimulatedState>,
    fail: bool,
}

impl SimulatedSpeech {
    pub fn new(pacing: SpeechPacing) -> Self {
        Self {
            pacing,
            state: Mutex::new(SimulatedState::default()),
            fail: false,
        }
    }

    pub fn fixed(duration: Duration) -> Self {
        Self::new(SpeechPacing::Fixed(duration))
    }

    /// Every `play` fails with [`SpeechError::Playback`] after being recorded.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(SpeechPacing::Fixed(Duration::ZERO))
        }
    }

    /// Texts passed to `play`, in order.
    pub fn spoken(&self) -> Vec<String> {
        self.lock().spoken.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SpeechService for SimulatedSpeech {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn play(&self, text: &str) -> Result<(), SpeechError> {
        let mut state = self.lock();
        state.spoken.push(text.to_owned());
        if self.fail {
            return Err(SpeechError::Playback("simulated speech set to fail".into()));
        }
        let duration = self.pacing.duration_for(text);
        tracing::info!(duration_ms = duration.as_millis() as u64, "[SPEECH] {text}");
        state.playing_until = Some(Instant::now() + duration);
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.lock()
            .playing_until
            .is_some_and(|until| Instant::now() < until)
    }

    async fn stop(&self) {
        self.lock().playing_until = None;
    }

    async fn close(&self) {
        self.stop().await;
    }
}

/// Speaks through an external text-to-speech program.
///
/// The template is split on whitespace into program and arguments; in each
/// argument `{text}` is replaced by the utterance, `{rate}` by the speech rate
/// in words per minute and `{volume}` by the volume as a 0-100 percentage.
/// Example: `espeak -s {rate} -a {volume} {text}`.
pub struct CommandSpeech {
    template: Vec<String>,
    rate: u32,
    volume_percent: u32,
    child: Mutex<Option<Child>>,
}

impl CommandSpeech {
    pub fn new(template: &str, cfg: &WormCfg) -> Result<Self, SpeechError> {
        let template: Vec<String> = template.split_whitespace().map(str::to_owned).collect();
        if template.is_empty() {
            return Err(SpeechError::Unavailable("empty speech command".into()));
        }
        Ok(Self {
            template,
            rate: cfg.speech_rate,
            volume_percent: (cfg.volume.clamp(0.0, 1.0) * 100.0).round() as u32,
            child: Mutex::new(None),
        })
    }

    pub fn argv(&self, text: &str) -> Vec<String> {
        let rate = self.rate.to_string();
        let volume = self.volume_percent.to_string();
        self.template
            .iter()
            .map(|arg| {
                arg.replace("{rate}", &rate)
                    .replace("{volume}", &volume)
                    .replace("{text}", text)
            })
            .collect()
    }

    fn take_child(&self) -> Option<Child> {
        self.child.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[async_trait]
impl SpeechService for CommandSpeech {
    fn name(&self) -> &str {
        &self.template[0]
    }

    async fn play(&self, text: &str) -> Result<(), SpeechError> {
        self.stop().await;
        let argv = self.argv(text);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SpeechError::Unavailable("empty speech command".into()))?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(SpeechError::Spawn)?;
        tracing::info!(program = %program, "[SPEECH] {text}");
        *self.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        Ok(())
    }

    fn is_playing(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                if !status.success() {
                    tracing::warn!(%status, "speech program exited with failure");
                }
                *guard = None;
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "speech program try_wait failed");
                *guard = None;
                false
            }
        }
    }

    async fn stop(&self) {
        if let Some(mut child) = self.take_child() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "speech program already gone");
            }
        }
    }

    async fn close(&self) {
        self.stop().await;
    }
}
