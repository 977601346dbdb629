use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ── Movement vocabulary ─────────────────────────────────────────

/// Closed command vocabulary understood by the motor controller.
/// Each variant maps to exactly one ASCII token on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolicCommand {
    /// Neutral/reset: all channels back to rest.
    Reset,
    ForwardLeft,
    ForwardRight,
    BackLeft,
    BackRight,
    SideLeft,
    SideRight,
    OpenMouth,
    CloseMouth,
    /// One mouth pulse.
    Talk,
    Dance,
    Sadness,
    Wiggle,
    Identify,
}

impl SymbolicCommand {
    pub const ALL: [SymbolicCommand; 14] = [
        Self::Reset,
        Self::ForwardLeft,
        Self::ForwardRight,
        Self::BackLeft,
        Self::BackRight,
        Self::SideLeft,
        Self::SideRight,
        Self::OpenMouth,
        Self::CloseMouth,
        Self::Talk,
        Self::Dance,
        Self::Sadness,
        Self::Wiggle,
        Self::Identify,
    ];

    /// Wire token sent to the transport (newline appended by the transport).
    pub fn token(self) -> &'static str {
        match self {
            Self::Reset => "b",
            Self::ForwardLeft => "fl",
            Self::ForwardRight => "fr",
            Self::BackLeft => "bl",
            Self::BackRight => "br",
            Self::SideLeft => "sl",
            Self::SideRight => "sr",
            Self::OpenMouth => "om",
            Self::CloseMouth => "cm",
            Self::Talk => "t",
            Self::Dance => "d",
            Self::Sadness => "s",
            Self::Wiggle => "w",
            Self::Identify => "identify",
        }
    }

    /// Parse a wire token, case- and whitespace-insensitive.
    /// `sadness` is accepted as an alias of `s`.
    pub fn from_token(token: &str) -> Option<Self> {
        let t = token.trim().to_lowercase();
        if t == "sadness" {
            return Some(Self::Sadness);
        }
        Self::ALL.into_iter().find(|c| c.token() == t)
    }

    pub fn is_neutral(self) -> bool {
        self == Self::Reset
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Reset => "reset all channels to neutral",
            Self::ForwardLeft => "tilt front left",
            Self::ForwardRight => "tilt front right",
            Self::BackLeft => "tilt back left",
            Self::BackRight => "tilt back right",
            Self::SideLeft => "side channel left",
            Self::SideRight => "side channel right",
            Self::OpenMouth => "open mouth",
            Self::CloseMouth => "close mouth",
            Self::Talk => "single mouth pulse",
            Self::Dance => "dance",
            Self::Sadness => "sadness movement",
            Self::Wiggle => "continuous wiggle",
            Self::Identify => "identify (diagnostic)",
        }
    }
}

impl fmt::Display for SymbolicCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown movement token: {0:?}")]
pub struct UnknownCommand(pub String);

impl FromStr for SymbolicCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_token(s).ok_or_else(|| UnknownCommand(s.to_owned()))
    }
}

impl Serialize for SymbolicCommand {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.token())
    }
}

impl<'de> Deserialize<'de> for SymbolicCommand {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ── Catalog entries ─────────────────────────────────────────────

/// One canned response. Immutable once loaded; owned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseEntry {
    pub text: String,
    #[serde(rename = "movement", skip_serializing_if = "Option::is_none")]
    pub movement_code: Option<SymbolicCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    /// Configured pulse count; derived from word count when absent.
    #[serde(rename = "mouth_movements", skip_serializing_if = "Option::is_none")]
    pub mouth_pulses: Option<u32>,
}

impl ResponseEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            movement_code: None,
            emotion: None,
            trigger: None,
            mouth_pulses: None,
        }
    }

    pub fn with_movement(mut self, movement: SymbolicCommand) -> Self {
        self.movement_code = Some(movement);
        self
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn with_pulses(mut self, pulses: u32) -> Self {
        self.mouth_pulses = Some(pulses);
        self
    }

    pub fn with_emotion(mut self, emotion: impl Into<String>) -> Self {
        self.emotion = Some(emotion.into());
        self
    }
}

// ── Resolution ──────────────────────────────────────────────────

/// Which resolver tier produced a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionSource {
    DirectCommand,
    CustomTrigger,
    Category { name: String },
    Fallback,
    Generative,
    /// Hard-coded text used when `fallbacks` is empty.
    Default,
    /// Produced by the input controller itself (mode confirmations, greetings).
    System,
}

/// Output of one resolution call. Not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResponse {
    pub text: String,
    pub movement_code: Option<SymbolicCommand>,
    pub mouth_pulse_count: u32,
    pub source: ResolutionSource,
}

impl ResolvedResponse {
    /// Pure movement, no speech.
    pub fn direct(command: SymbolicCommand) -> Self {
        Self {
            text: String::new(),
            movement_code: Some(command),
            mouth_pulse_count: 0,
            source: ResolutionSource::DirectCommand,
        }
    }

    /// Speech produced by the controller with no body movement.
    pub fn spoken(text: impl Into<String>, pulses: u32) -> Self {
        Self {
            text: text.into(),
            movement_code: None,
            mouth_pulse_count: pulses,
            source: ResolutionSource::System,
        }
    }

    pub fn is_direct_command(&self) -> bool {
        self.source == ResolutionSource::DirectCommand
    }

    pub fn has_speech(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// Pulse count derived from the spoken text: up to 5 words → 1 pulse, more → 2.
pub fn pulses_for_text(text: &str) -> u32 {
    match text.split_whitespace().count() {
        0 => 0,
        1..=5 => 1,
        _ => 2,
    }
}

// ── Coordinator state ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Active,
}

/// Snapshot of the single coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoordinatorState {
    pub phase: Phase,
    pub active_since: Option<DateTime<Utc>>,
    pub cycle_id: Option<Uuid>,
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            active_since: None,
            cycle_id: None,
        }
    }
}

impl CoordinatorState {
    /// Check-and-set `Idle → Active`. Returns the new cycle id, or `None` when a
    /// cycle is already running. Callers must hold the guarding lock.
    pub fn try_enter(&mut self) -> Option<Uuid> {
        if self.phase == Phase::Active {
            return None;
        }
        let id = Uuid::new_v4();
        self.phase = Phase::Active;
        self.active_since = Some(Utc::now());
        self.cycle_id = Some(id);
        Some(id)
    }

    pub fn leave(&mut self) {
        *self = Self::default();
    }

    pub fn is_active(&self) -> bool {
        self.phase == Phase::Active
    }
}

// ── Input events ────────────────────────────────────────────────

/// Where an utterance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UtteranceSource {
    /// Line typed at the prompt.
    Typed,
    /// Decoded by the speech-to-text listener.
    Spoken,
}

/// One unit of input for the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub id: Uuid,
    pub source: UtteranceSource,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Utterance {
    pub fn typed(content: impl Into<String>) -> Self {
        Self::new(UtteranceSource::Typed, content)
    }

    pub fn spoken(content: impl Into<String>) -> Self {
        Self::new(UtteranceSource::Spoken, content)
    }

    fn new(source: UtteranceSource, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip_through_parser() {
        for cmd in SymbolicCommand::ALL {
            assert_eq!(SymbolicCommand::from_token(cmd.token()), Some(cmd));
        }
    }

    #[test]
    fn token_parsing_is_case_and_space_insensitive() {
        assert_eq!(SymbolicCommand::from_token("  FL \n"), Some(SymbolicCommand::ForwardLeft));
        assert_eq!(SymbolicCommand::from_token("Sadness"), Some(SymbolicCommand::Sadness));
        assert_eq!(SymbolicCommand::from_token("dance"), None);
        assert_eq!(SymbolicCommand::from_token(""), None);
    }

    #[test]
    fn command_serde_uses_wire_tokens() {
        let json = serde_json::to_string(&SymbolicCommand::Dance).unwrap();
        assert_eq!(json, "\"d\"");
        let parsed: SymbolicCommand = serde_json::from_str("\"identify\"").unwrap();
        assert_eq!(parsed, SymbolicCommand::Identify);
        assert!(serde_json::from_str::<SymbolicCommand>("\"jump\"").is_err());
    }

    #[test]
    fn pulse_rule_by_word_count() {
        assert_eq!(pulses_for_text(""), 0);
        assert_eq!(pulses_for_text("   "), 0);
        assert_eq!(pulses_for_text("Hi!"), 1);
        assert_eq!(pulses_for_text("one two three four five"), 1);
        assert_eq!(pulses_for_text("one two three four five six"), 2);
    }

    #[test]
    fn try_enter_is_single_flight() {
        let mut state = CoordinatorState::default();
        let first = state.try_enter();
        assert!(first.is_some());
        assert!(state.is_active());
        assert!(state.active_since.is_some());
        assert!(state.try_enter().is_none());
        assert_eq!(state.cycle_id, first);

        state.leave();
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.active_since.is_none());
        assert!(state.try_enter().is_some());
    }

    #[test]
    fn resolved_constructors() {
        let direct = ResolvedResponse::direct(SymbolicCommand::Wiggle);
        assert!(direct.is_direct_command());
        assert!(!direct.has_speech());
        assert_eq!(direct.mouth_pulse_count, 0);

        let spoken = ResolvedResponse::spoken("Goodbye friend!", 1);
        assert!(spoken.has_speech());
        assert_eq!(spoken.movement_code, None);
        assert_eq!(spoken.source, ResolutionSource::System);
    }
}
