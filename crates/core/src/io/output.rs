use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Text the worm is saying.
    Reply,
    /// Status line for the operator (mode switches, help, warnings).
    Notice,
}

/// An outbound line for the REPL printer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMessage {
    pub content: String,
    pub kind: OutputKind,
    /// Last message for a typed line; the REPL shows the next prompt after it.
    pub ends_turn: bool,
}

impl OutputMessage {
    pub fn reply(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: OutputKind::Reply,
            ends_turn: false,
        }
    }

    pub fn notice(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: OutputKind::Notice,
            ends_turn: false,
        }
    }

    pub fn ending_turn(mut self) -> Self {
        self.ends_turn = true;
        self
    }
}

/// Output channel sender. The runtime pushes replies here.
pub type OutputSender = mpsc::Sender<OutputMessage>;
/// Output channel receiver. The REPL consumes from here.
pub type OutputReceiver = mpsc::Receiver<OutputMessage>;

/// Create an output channel with the given buffer size.
pub fn channel(buffer: usize) -> (OutputSender, OutputReceiver) {
    mpsc::channel(buffer)
}
