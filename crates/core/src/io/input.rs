use tokio::sync::mpsc;

use crate::types::Utterance;

/// Input channel sender. The REPL and the voice listener push utterances here.
pub type InputSender = mpsc::Sender<Utterance>;
/// Input channel receiver. The runtime consumes from here.
pub type InputReceiver = mpsc::Receiver<Utterance>;

/// Create an input channel with the given buffer size.
pub fn channel(buffer: usize) -> (InputSender, InputReceiver) {
    mpsc::channel(buffer)
}

/// Submit a typed line.
pub async fn submit_text(
    tx: &InputSender,
    text: impl Into<String>,
) -> Result<(), mpsc::error::SendError<Utterance>> {
    tx.send(Utterance::typed(text)).await
}

/// Submit a decoded speech utterance.
pub async fn submit_spoken(
    tx: &InputSender,
    text: impl Into<String>,
) -> Result<(), mpsc::error::SendError<Utterance>> {
    tx.send(Utterance::spoken(text)).await
}
