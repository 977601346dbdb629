use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::MotorLink;
use crate::config::WormCfg;
use crate::io::speech::SpeechService;
use crate::types::{ResolvedResponse, SymbolicCommand};

/// Timing knobs of one execution cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTiming {
    /// Pulses after the first are spread over this window.
    pub pulse_window: Duration,
    /// Cadence of the playback/pulse poll.
    pub poll: Duration,
    /// Hard upper bound on one cycle's wait.
    pub ceiling: Duration,
}

impl Default for CycleTiming {
    fn default() -> Self {
        Self {
            pulse_window: Duration::from_secs(3),
            poll: Duration::from_millis(500),
            ceiling: Duration::from_secs(10),
        }
    }
}

impl CycleTiming {
    pub fn from_cfg(cfg: &WormCfg) -> Self {
        Self {
            pulse_window: cfg.pulse_window(),
            poll: cfg.pulse_poll(),
            ceiling: cfg.cycle_ceiling(),
        }
    }

    /// Spacing between pulses for a count of `n`. Zero below two pulses.
    pub fn pulse_interval(&self, n: u32) -> Duration {
        if n < 2 { Duration::ZERO } else { self.pulse_window / n }
    }
}

/// Why the wait/pulse loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    PlaybackIdle,
    Ceiling,
    SpeechFailed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub pulses: u32,
    pub end: CycleEnd,
    pub reset_sent: bool,
}

/// Everything after the movement command: speech, pulses, neutral reset.
/// Never fails; every fault is logged and ends the cycle early.
pub(super) async fn run(
    resolved: &ResolvedResponse,
    link: &MotorLink,
    speech: &dyn SpeechService,
    timing: CycleTiming,
    token: &CancellationToken,
) -> CycleReport {
    let mut pulses = 0;
    let end = match start_speech(resolved, speech).await {
        Ok(()) => {
            let (sent, end) =
                pulse_loop(resolved.mouth_pulse_count, link, speech, timing, token).await;
            pulses = sent;
            end
        }
        Err(()) => CycleEnd::SpeechFailed,
    };

    let reset_sent = resolved.movement_code != Some(SymbolicCommand::Reset);
    if reset_sent {
        link.send(SymbolicCommand::Reset);
    }
    tracing::info!(pulses, end = ?end, reset_sent, "cycle complete");
    CycleReport {
        pulses,
        end,
        reset_sent,
    }
}

async fn start_speech(resolved: &ResolvedResponse, speech: &dyn SpeechService) -> Result<(), ()> {
    if !resolved.has_speech() {
        return Ok(());
    }
    speech.play(&resolved.text).await.map_err(|e| {
        tracing::warn!(error = %e, service = speech.name(), "speech failed, ending cycle");
    })
}

/// Emits up to `n` mouth pulses while playback runs. The first pulse goes out
/// immediately; pulse `k` (0-based) is due once `interval * k` has elapsed and
/// is only sent while audio is still playing.
async fn pulse_loop(
    n: u32,
    link: &MotorLink,
    speech: &dyn SpeechService,
    timing: CycleTiming,
    token: &CancellationToken,
) -> (u32, CycleEnd) {
    let started = Instant::now();
    let deadline = started + timing.ceiling;
    let interval = timing.pulse_interval(n);

    let mut sent = 0;
    if n >= 1 {
        link.send(SymbolicCommand::Talk);
        sent = 1;
    }

    let mut poll = tokio::time::interval_at(started + timing.poll, timing.poll);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if !speech.is_playing() {
            return (sent, CycleEnd::PlaybackIdle);
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                speech.stop().await;
                return (sent, CycleEnd::Cancelled);
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(ceiling_ms = timing.ceiling.as_millis() as u64, "cycle ceiling reached, stopping speech");
                speech.stop().await;
                return (sent, CycleEnd::Ceiling);
            }
            _ = poll.tick() => {
                if sent < n && speech.is_playing() && started.elapsed() >= interval * sent {
                    link.send(SymbolicCommand::Talk);
                    sent += 1;
                }
            }
        }
    }
}
