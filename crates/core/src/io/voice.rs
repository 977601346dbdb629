use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::input::{self, InputSender};
use super::speech::SpeechError;

/// Streams decoded utterances from an external speech-to-text program.
///
/// The program is expected to print one utterance per line on stdout. Each
/// non-empty line is forwarded to the input channel as a spoken utterance.
pub struct VoiceListener {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl VoiceListener {
    pub fn start(
        command: &str,
        tx: InputSender,
        parent: &CancellationToken,
    ) -> Result<Self, SpeechError> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| SpeechError::Unavailable("empty listener command".into()))?;
        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(SpeechError::Spawn)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpeechError::Unavailable("listener stdout not captured".into()))?;

        let token = parent.child_token();
        let task_token = token.clone();
        let program = program.to_owned();
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let text = line.trim();
                            if text.is_empty() {
                                continue;
                            }
                            tracing::debug!(utterance = text, "voice input decoded");
                            if input::submit_spoken(&tx, text).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            tracing::warn!(program = %program, "voice listener exited");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(program = %program, error = %e, "voice listener read failed");
                            break;
                        }
                    },
                }
            }
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "voice listener already stopped");
            }
        });
        tracing::info!(command, "voice listener started");
        Ok(Self { token, handle })
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "voice listener task failed");
        }
        tracing::info!("voice listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UtteranceSource;
    use std::time::Duration;

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let (tx, _rx) = input::channel(4);
        let token = CancellationToken::new();
        assert!(matches!(
            VoiceListener::start("worm-no-such-stt-binary", tx.clone(), &token),
            Err(SpeechError::Spawn(_))
        ));
        assert!(matches!(
            VoiceListener::start("   ", tx, &token),
            Err(SpeechError::Unavailable(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwards_stdout_lines() {
        let (tx, mut rx) = input::channel(4);
        let token = CancellationToken::new();
        let listener = VoiceListener::start("printf worm\\n\\nhello", tx, &token).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.content, "worm");
        assert_eq!(first.source, UtteranceSource::Spoken);
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.content, "hello");
        listener.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_cancels_long_running_listener() {
        let (tx, _rx) = input::channel(4);
        let token = CancellationToken::new();
        let listener = VoiceListener::start("sleep 30", tx, &token).unwrap();
        assert!(listener.is_running());
        tokio::time::timeout(Duration::from_secs(5), listener.stop())
            .await
            .unwrap();
    }
}
