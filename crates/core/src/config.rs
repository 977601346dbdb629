use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::resolver::KeywordTable;

pub const DEFAULT_SETTINGS_FILE: &str = "worm_settings.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("settings io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("settings key {0:?} passes through a non-table value")]
    NotATable(String),
    #[error("settings key is empty or has an empty segment: {0:?}")]
    EmptyKey(String),
}

/// Nested settings document with dotted-path access (`audio.volume`).
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    doc: Value,
    path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            doc: default_document(),
            path: None,
        }
    }
}

impl Settings {
    /// Defaults with `overlay` deep-merged on top.
    pub fn from_value(overlay: Value) -> Self {
        let mut doc = default_document();
        merge(&mut doc, overlay);
        Self { doc, path: None }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let overlay: Value = serde_json::from_str(&raw)?;
        let mut settings = Self::from_value(overlay);
        settings.path = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Missing file gives defaults silently, an unreadable one with a warning.
    /// Either way the path is remembered so `save` writes back to it.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "settings file not found, using defaults");
            return Self {
                path: Some(path.to_path_buf()),
                ..Self::default()
            };
        }
        match Self::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "settings unreadable, using defaults");
                Self {
                    path: Some(path.to_path_buf()),
                    ..Self::default()
                }
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let body = serde_json::to_string_pretty(&self.doc)?;
        std::fs::write(path, body).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn as_value(&self) -> &Value {
        &self.doc
    }

    /// Raw lookup. `None` when any segment is absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.doc, |node, segment| node.as_object()?.get(segment))
    }

    /// Typed lookup. Missing segments, `null` and type mismatches all yield `default`.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key)
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(default)
    }

    /// Set a value, creating intermediate tables as needed.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        let segments: Vec<&str> = key.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ConfigError::EmptyKey(key.to_owned()));
        }
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| ConfigError::EmptyKey(key.to_owned()))?;

        let mut node = &mut self.doc;
        let mut walked = String::new();
        for segment in parents {
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(segment);
            let table = node
                .as_object_mut()
                .ok_or_else(|| ConfigError::NotATable(walked.clone()))?;
            node = table
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let table = node
            .as_object_mut()
            .ok_or_else(|| ConfigError::NotATable(walked.clone()))?;
        table.insert(last.to_string(), value);
        Ok(())
    }
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn default_document() -> Value {
    let keyword_table =
        serde_json::to_value(KeywordTable::default()).unwrap_or_else(|_| Value::Array(Vec::new()));
    json!({
        "audio": {
            "volume": 0.8,
            "speech_rate": 150,
            "speech_command": null,
        },
        "movement": {
            "pulse_window_secs": 3.0,
            "pulse_poll_ms": 500,
            "cycle_ceiling_secs": 10.0,
        },
        "ai": {
            "use_ai_fallback": true,
            "ai_confidence_threshold": 0.6,
            "max_response_length": 200,
            "history_limit": 10,
        },
        "voice": {
            "wake_word": "worm",
            "greeting_tokens": ["hello", "hey"],
            "exit_phrases": ["text", "stop listening", "back to text mode"],
            "listener_command": null,
        },
        "transport": {
            "port": null,
            "baud_rate": 115200,
        },
        "debug": {
            "simulation_mode": false,
        },
        "resolver": {
            "keyword_table": keyword_table,
        },
    })
}

/// Typed snapshot of the settings the core reads. Built once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WormCfg {
    // audio
    pub volume: f32,
    pub speech_rate: u32,
    /// TTS program template (`{text}`, `{rate}`, `{volume}`); simulated speech when unset.
    pub speech_command: Option<String>,

    // pulse timing
    pub pulse_window_secs: f64,
    pub pulse_poll_ms: u64,
    pub cycle_ceiling_secs: f64,

    // generative fallback
    pub use_ai_fallback: bool,
    pub ai_confidence_threshold: f32,
    pub max_response_length: usize,
    pub history_limit: usize,

    // voice mode
    pub wake_word: String,
    pub greeting_tokens: Vec<String>,
    pub exit_phrases: Vec<String>,
    /// STT program printing one utterance per line; voice mode is unavailable when unset.
    pub listener_command: Option<String>,

    // transport
    pub serial_port: Option<String>,
    pub baud_rate: u32,
    pub simulation_mode: bool,

    pub keyword_table: KeywordTable,
}

impl Default for WormCfg {
    fn default() -> Self {
        Self {
            volume: 0.8,
            speech_rate: 150,
            speech_command: None,
            pulse_window_secs: 3.0,
            pulse_poll_ms: 500,
            cycle_ceiling_secs: 10.0,
            use_ai_fallback: true,
            ai_confidence_threshold: 0.6,
            max_response_length: 200,
            history_limit: 10,
            wake_word: "worm".into(),
            greeting_tokens: vec!["hello".into(), "hey".into()],
            exit_phrases: vec![
                "text".into(),
                "stop listening".into(),
                "back to text mode".into(),
            ],
            listener_command: None,
            serial_port: None,
            baud_rate: 115_200,
            simulation_mode: false,
            keyword_table: KeywordTable::default(),
        }
    }
}

impl WormCfg {
    pub fn from_settings(s: &Settings) -> Self {
        let d = Self::default();
        Self {
            volume: s.get_or("audio.volume", d.volume),
            speech_rate: s.get_or("audio.speech_rate", d.speech_rate),
            speech_command: s.get_or("audio.speech_command", d.speech_command),
            pulse_window_secs: s.get_or("movement.pulse_window_secs", d.pulse_window_secs),
            pulse_poll_ms: s.get_or("movement.pulse_poll_ms", d.pulse_poll_ms),
            cycle_ceiling_secs: s.get_or("movement.cycle_ceiling_secs", d.cycle_ceiling_secs),
            use_ai_fallback: s.get_or("ai.use_ai_fallback", d.use_ai_fallback),
            ai_confidence_threshold: s.get_or("ai.ai_confidence_threshold", d.ai_confidence_threshold),
            max_response_length: s.get_or("ai.max_response_length", d.max_response_length),
            history_limit: s.get_or("ai.history_limit", d.history_limit),
            wake_word: s.get_or("voice.wake_word", d.wake_word),
            greeting_tokens: s.get_or("voice.greeting_tokens", d.greeting_tokens),
            exit_phrases: s.get_or("voice.exit_phrases", d.exit_phrases),
            listener_command: s.get_or("voice.listener_command", d.listener_command),
            serial_port: s.get_or("transport.port", d.serial_port),
            baud_rate: s.get_or("transport.baud_rate", d.baud_rate),
            simulation_mode: s.get_or("debug.simulation_mode", d.simulation_mode),
            keyword_table: s.get_or("resolver.keyword_table", d.keyword_table),
        }
    }

    /// Apply `WORM_SERIAL_PORT` / `WORM_BAUD_RATE` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(port) = lookup("WORM_SERIAL_PORT").filter(|p| !p.trim().is_empty()) {
            self.serial_port = Some(port.trim().to_owned());
        }
        if let Some(baud) = lookup("WORM_BAUD_RATE") {
            match baud.trim().parse() {
                Ok(rate) => self.baud_rate = rate,
                Err(_) => tracing::warn!(value = %baud, "ignoring invalid WORM_BAUD_RATE"),
            }
        }
        self
    }

    pub fn pulse_window(&self) -> Duration {
        secs(self.pulse_window_secs)
    }

    pub fn pulse_poll(&self) -> Duration {
        Duration::from_millis(self.pulse_poll_ms.max(1))
    }

    pub fn cycle_ceiling(&self) -> Duration {
        secs(self.cycle_ceiling_secs)
    }
}

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
