use rand::Rng;
use rand::rngs::StdRng;

use crate::catalog::{SystemMessage, normalize_utterance};
use crate::config::WormCfg;
use crate::coordinator::{Coordinator, ExecuteOutcome};
use crate::io::output::{OutputMessage, OutputSender};
use crate::resolver::{ResolveMode, ResponseResolver, contains_phrase, tokenize};
use crate::types::{ResolvedResponse, Utterance, UtteranceSource};

pub const HELP_TEXT: &str = "\
Type anything to talk to the worm.
  b fl fr bl br sl sr om cm t d s w identify   send a movement directly
  voice                                        switch to voice input (say the wake word first)
  text | stop listening | back to text mode    back to typing
  help                                         this overview
  quit | exit | stop                           say goodbye and end the session";

const QUIT_WORDS: &[&str] = &["quit", "exit", "stop"];
const VOICE_WORD: &str = "voice";
const HELP_WORD: &str = "help";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Blocking line input only.
    Text,
    /// Decoded speech, gated by the wake word. Typed lines still work.
    Voice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Utterances that change controller state instead of being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPhrase {
    Quit,
    EnterVoice,
    EnterText,
    Help,
}

/// What to do with one decoded voice utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceAction {
    /// No wake word or greeting: not addressed to the worm.
    Ignore,
    Control(ControlPhrase),
    /// Wake word alone: answer with the "how can I help" line.
    Prompt,
    /// Text to resolve (wake word removed).
    Forward(String),
}

/// Drives the resolver/coordinator pair from typed lines and decoded speech.
pub struct InputModeController<R: Rng = StdRng> {
    mode: InputMode,
    resolver: ResponseResolver<R>,
    coordinator: Coordinator,
    resolve_mode: ResolveMode,
    output: OutputSender,
    wake_word: String,
    greeting_tokens: Vec<String>,
    exit_phrases: Vec<String>,
    voice_available: bool,
}

impl<R: Rng + Send> InputModeController<R> {
    pub fn new(
        resolver: ResponseResolver<R>,
        coordinator: Coordinator,
        output: OutputSender,
        cfg: &WormCfg,
    ) -> Self {
        Self {
            mode: InputMode::Text,
            resolver,
            coordinator,
            resolve_mode: ResolveMode::Canned,
            output,
            wake_word: cfg.wake_word.trim().to_lowercase(),
            greeting_tokens: cfg.greeting_tokens.iter().map(|t| t.trim().to_lowercase()).collect(),
            exit_phrases: cfg.exit_phrases.iter().map(|p| normalize_utterance(p)).collect(),
            voice_available: false,
        }
    }

    pub fn with_voice_available(mut self, available: bool) -> Self {
        self.voice_available = available;
        self
    }

    pub fn set_voice_available(&mut self, available: bool) {
        self.voice_available = available;
    }

    pub fn set_resolve_mode(&mut self, mode: ResolveMode) {
        self.resolve_mode = mode;
    }

    /// Switch mode without speaking a confirmation (startup flags).
    pub fn set_mode(&mut self, mode: InputMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn resolver(&self) -> &ResponseResolver<R> {
        &self.resolver
    }

    /// Entry point for every input event.
    pub async fn handle(&mut self, utterance: &Utterance) -> Flow {
        match utterance.source {
            UtteranceSource::Typed => self.handle_line(&utterance.content).await,
            UtteranceSource::Spoken => self.handle_utterance(&utterance.content).await,
        }
    }

    /// A typed line. Accepted in both modes; always publishes exactly one
    /// turn-ending message.
    pub async fn handle_line(&mut self, line: &str) -> Flow {
        let (flow, message) = match self.control_phrase(line) {
            Some(control) => self.apply_control(control),
            None => (Flow::Continue, self.respond(line).await),
        };
        self.emit(message.ending_turn()).await;
        flow
    }

    /// A decoded voice utterance. Ignored outside voice mode and while a cycle
    /// is running (the worm must not answer its own voice).
    pub async fn handle_utterance(&mut self, text: &str) -> Flow {
        if self.mode != InputMode::Voice {
            tracing::debug!(utterance = text, "voice input outside voice mode, ignoring");
            return Flow::Continue;
        }
        if self.coordinator.is_active() {
            tracing::debug!(utterance = text, "speaking, ignoring voice input");
            return Flow::Continue;
        }

        let (flow, message) = match self.classify_voice(text) {
            VoiceAction::Ignore => {
                tracing::debug!(utterance = text, "no wake word, ignoring");
                return Flow::Continue;
            }
            VoiceAction::Control(control) => self.apply_control(control),
            VoiceAction::Prompt => {
                let text = self
                    .resolver
                    .catalog()
                    .system_message(SystemMessage::HowCanIHelp)
                    .to_owned();
                (Flow::Continue, self.say(text))
            }
            VoiceAction::Forward(rest) => {
                self.emit(OutputMessage::notice(format!("heard: {rest}"))).await;
                (Flow::Continue, self.respond(&rest).await)
            }
        };
        self.emit(message).await;
        flow
    }

    /// Pure classification of a voice utterance. Control phrases are recognised
    /// before wake gating so "stop listening" works on its own.
    pub fn classify_voice(&self, text: &str) -> VoiceAction {
        if let Some(control) = self.control_phrase(text) {
            return VoiceAction::Control(control);
        }
        let normalized = normalize_utterance(text);
        let words = tokenize(&normalized);
        let woken = contains_phrase(&words, &self.wake_word);
        let greeted = self
            .greeting_tokens
            .iter()
            .any(|g| contains_phrase(&words, g));
        if !woken && !greeted {
            return VoiceAction::Ignore;
        }
        if self.resolver.catalog().custom(&normalized).is_some() {
            return VoiceAction::Forward(normalized);
        }

        let wake = tokenize(&self.wake_word);
        let rest = strip_phrase(&words, &wake).join(" ");
        if rest.is_empty() {
            VoiceAction::Prompt
        } else {
            VoiceAction::Forward(rest)
        }
    }

    /// The listener could not be started: fall back to typing and say so.
    pub async fn voice_unavailable(&mut self) {
        self.mode = InputMode::Text;
        let text = self
            .resolver
            .catalog()
            .system_message(SystemMessage::VoiceUnavailable)
            .to_owned();
        let message = self.say(text);
        self.emit(message).await;
    }

    fn control_phrase(&self, text: &str) -> Option<ControlPhrase> {
        let normalized = normalize_utterance(text);
        let phrase = normalized.trim_end_matches(['.', '!', '?']);
        if QUIT_WORDS.contains(&phrase) {
            Some(ControlPhrase::Quit)
        } else if phrase == VOICE_WORD {
            Some(ControlPhrase::EnterVoice)
        } else if self.exit_phrases.iter().any(|p| p == phrase) {
            Some(ControlPhrase::EnterText)
        } else if phrase == HELP_WORD {
            Some(ControlPhrase::Help)
        } else {
            None
        }
    }

    fn apply_control(&mut self, control: ControlPhrase) -> (Flow, OutputMessage) {
        let catalog = self.resolver.catalog();
        match control {
            ControlPhrase::Quit => {
                let text = catalog.system_message(SystemMessage::Goodbye).to_owned();
                tracing::info!("session ending");
                (Flow::Quit, self.say(text))
            }
            ControlPhrase::EnterVoice if self.mode == InputMode::Voice => (
                Flow::Continue,
                OutputMessage::notice("already in voice mode"),
            ),
            ControlPhrase::EnterVoice if !self.voice_available => {
                let text = catalog.system_message(SystemMessage::VoiceUnavailable).to_owned();
                (Flow::Continue, self.say(text))
            }
            ControlPhrase::EnterVoice => {
                let text = catalog.system_message(SystemMessage::VoiceModeReady).to_owned();
                self.mode = InputMode::Voice;
                tracing::info!(wake_word = %self.wake_word, "voice mode");
                (Flow::Continue, self.say(text))
            }
            ControlPhrase::EnterText => {
                let text = catalog.system_message(SystemMessage::TypingModeNow).to_owned();
                self.mode = InputMode::Text;
                tracing::info!("text mode");
                (Flow::Continue, self.say(text))
            }
            ControlPhrase::Help => (Flow::Continue, OutputMessage::notice(HELP_TEXT)),
        }
    }

    /// Resolve and dispatch one utterance.
    async fn respond(&mut self, text: &str) -> OutputMessage {
        let Some(resolved) = self.resolver.resolve_with(text, self.resolve_mode).await else {
            return OutputMessage::notice("");
        };

        if resolved.is_direct_command() {
            let Some(command) = resolved.movement_code else {
                return OutputMessage::notice("");
            };
            return match self.coordinator.send_direct(command) {
                Ok(_) => OutputMessage::notice(format!("-> {command} ({})", command.describe())),
                Err(_) => {
                    let text = self
                        .resolver
                        .catalog()
                        .system_message(SystemMessage::CommandFailed)
                        .to_owned();
                    self.say(text)
                }
            };
        }

        self.execute(resolved)
    }

    fn execute(&self, resolved: ResolvedResponse) -> OutputMessage {
        let text = resolved.text.clone();
        let movement = resolved.movement_code;
        match self.coordinator.execute(resolved) {
            ExecuteOutcome::Accepted(_) if !text.trim().is_empty() => OutputMessage::reply(text),
            ExecuteOutcome::Accepted(_) => OutputMessage::notice(match movement {
                Some(command) => format!("-> {command}"),
                None => String::new(),
            }),
            ExecuteOutcome::Dropped => OutputMessage::notice("(still busy with the last response)"),
        }
    }

    /// Controller-originated speech: one pulse, no body movement.
    fn say(&self, text: String) -> OutputMessage {
        match self.coordinator.speak(text.clone(), 1) {
            ExecuteOutcome::Accepted(_) => OutputMessage::reply(text),
            ExecuteOutcome::Dropped => OutputMessage::notice(text),
        }
    }

    async fn emit(&self, message: OutputMessage) {
        if self.output.send(message).await.is_err() {
            tracing::debug!("output channel closed");
        }
    }
}

/// `words` with every occurrence of the `phrase` token run removed.
fn strip_phrase(words: &[String], phrase: &[String]) -> Vec<String> {
    if phrase.is_empty() {
        return words.to_vec();
    }
    let mut out = Vec::with_capacity(words.len());
    let mut i = 0;
    while i < words.len() {
        if words[i..].starts_with(phrase) {
            i += phrase.len();
        } else {
            out.push(words[i].clone());
            i += 1;
        }
    }
    out
}
