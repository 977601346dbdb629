use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::WormCfg;
use crate::types::SymbolicCommand;
use worm_llm::provider::{ChatMessage, CompletionRequest, LlmError, LlmProvider};

const PERSONA_PROMPT: &str = "You are WORM, a small, friendly, curious robot worm. \
    You are enthusiastic about learning and helping, playful but genuinely helpful. \
    You move with servo motors and show feelings through movement. \
    You love chatting about technology, robotics and whatever the user cares about, \
    and you sometimes make gentle worm puns. Keep replies short enough to say aloud.";

const REPLY_FORMAT: &str = "Reply with a single JSON object and nothing else: \
    {\"text\": \"what you say\", \"emotion\": \"happy|excited|sad|neutral|playful|thoughtful\", \
    \"movement\": \"optional hint such as dance, wiggle, forward, back, left, right, talk\", \
    \"confidence\": 0.0-1.0}";

/// Exchanges sent along with each request.
const CONTEXT_EXCHANGES: usize = 5;
const PLAIN_TEXT_CONFIDENCE: f32 = 0.8;

/// Parsed generative reply before it is mapped to a command.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerativeReply {
    pub text: String,
    pub emotion: Option<String>,
    pub movement: Option<String>,
    pub confidence: f32,
}

impl GenerativeReply {
    pub fn command(&self) -> SymbolicCommand {
        map_hint(self.movement.as_deref(), self.emotion.as_deref())
    }
}

#[derive(Debug, Clone)]
struct Exchange {
    user: String,
    assistant: String,
}

/// Free-form conversation through an [`LlmProvider`], with a bounded history.
pub struct GenerativeFallback {
    provider: Arc<dyn LlmProvider>,
    history: VecDeque<Exchange>,
    history_limit: usize,
    max_response_length: usize,
}

impl GenerativeFallback {
    pub fn new(provider: Arc<dyn LlmProvider>, cfg: &WormCfg) -> Self {
        Self {
            provider,
            history: VecDeque::new(),
            history_limit: cfg.history_limit,
            max_response_length: cfg.max_response_length,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn build_messages(&self, utterance: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(format!("{PERSONA_PROMPT}\n\n{REPLY_FORMAT}"))];
        let skip = self.history.len().saturating_sub(CONTEXT_EXCHANGES);
        for exchange in self.history.iter().skip(skip) {
            messages.push(ChatMessage::user(exchange.user.clone()));
            messages.push(ChatMessage::assistant(exchange.assistant.clone()));
        }
        messages.push(ChatMessage::user(utterance));
        messages
    }

    pub async fn generate(&mut self, utterance: &str) -> Result<GenerativeReply, LlmError> {
        let request = CompletionRequest {
            messages: self.build_messages(utterance),
            max_tokens: 200,
            temperature: 0.7,
            json_mode: true,
        };
        let response = self.provider.complete(request).await?;
        tracing::debug!(
            provider = self.provider.name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "generative reply received"
        );

        let mut reply = parse_reply(&response.content)?;
        reply.text = truncate_words(&reply.text, self.max_response_length);

        self.history.push_back(Exchange {
            user: utterance.to_owned(),
            assistant: reply.text.clone(),
        });
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        Ok(reply)
    }
}

#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    emotion: Option<String>,
    #[serde(default)]
    movement: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Accepts a JSON object (optionally fenced) or plain text.
pub fn parse_reply(raw: &str) -> Result<GenerativeReply, LlmError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LlmError::MalformedReply("empty reply".into()));
    }

    let candidate = if trimmed.starts_with("```") {
        let lines: Vec<&str> = trimmed.lines().collect();
        let end = lines
            .iter()
            .rposition(|l| l.trim_start().starts_with("```"))
            .unwrap_or(lines.len())
            .max(1);
        lines[1..end].join("\n")
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        trimmed[start..=end].to_string()
    } else {
        trimmed.to_string()
    };

    match serde_json::from_str::<RawReply>(&candidate) {
        Ok(parsed) => {
            let text = parsed
                .text
                .map(|t| t.trim().to_owned())
                .filter(|t| !t.is_empty())
                .ok_or_else(|| LlmError::MalformedReply(format!("reply has no text: {trimmed}")))?;
            Ok(GenerativeReply {
                text,
                emotion: non_empty(parsed.emotion),
                movement: non_empty(parsed.movement),
                confidence: parsed
                    .confidence
                    .unwrap_or(PLAIN_TEXT_CONFIDENCE)
                    .clamp(0.0, 1.0),
            })
        }
        Err(_) if !trimmed.starts_with('{') && !trimmed.starts_with("```") => Ok(GenerativeReply {
            text: trimmed.to_owned(),
            emotion: None,
            movement: None,
            confidence: PLAIN_TEXT_CONFIDENCE,
        }),
        Err(e) => Err(LlmError::MalformedReply(e.to_string())),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

/// Map a movement hint and/or emotion tag to a command. The first recognised
/// value wins, hint before emotion; nothing recognised gives `Talk`.
pub fn map_hint(movement: Option<&str>, emotion: Option<&str>) -> SymbolicCommand {
    movement
        .and_then(map_word)
        .or_else(|| emotion.and_then(map_word))
        .unwrap_or(SymbolicCommand::Talk)
}

fn map_word(word: &str) -> Option<SymbolicCommand> {
    let key = word.trim().to_lowercase().replace([' ', '-'], "_");
    let command = match key.as_str() {
        "happy" | "excited" | "playful" | "dance" => SymbolicCommand::Dance,
        "sad" => SymbolicCommand::Sadness,
        "neutral" | "thoughtful" | "talk" => SymbolicCommand::Talk,
        "wiggle" | "move" => SymbolicCommand::Wiggle,
        "forward" => SymbolicCommand::ForwardLeft,
        "back" => SymbolicCommand::BackLeft,
        "left" => SymbolicCommand::SideLeft,
        "right" => SymbolicCommand::SideRight,
        "open_mouth" => SymbolicCommand::OpenMouth,
        "close_mouth" => SymbolicCommand::CloseMouth,
        "reset" => SymbolicCommand::Reset,
        other => return SymbolicCommand::from_token(other),
    };
    Some(command)
}

/// Cut `text` to at most `max` characters, backing off to the last word boundary.
pub fn truncate_words(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_owned();
    }
    let prefix: String = text.chars().take(max).collect();
    let cut = match prefix.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => &prefix[..idx],
        _ => prefix.as_str(),
    };
    cut.trim_end_matches(|c: char| c.is_whitespace() || c == ',').to_owned()
}
