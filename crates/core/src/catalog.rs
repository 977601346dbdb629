use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::path::{Path, PathBuf};

use crate::types::{ResponseEntry, SymbolicCommand};

pub const DEFAULT_CATALOG_FILE: &str = "worm_responses.json";

const FALLBACKS: &str = "fallbacks";
const CUSTOM: &str = "custom";
const STARTUP_MESSAGE: &str = "startup_message";
const SYSTEM_MESSAGES: &str = "system_messages";

const DEFAULT_STARTUP_MESSAGE: &str = "Hello there!";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("catalog shape error: {0}")]
    Shape(String),
    #[error("not found in catalog: {0}")]
    NotFound(String),
}

/// Short texts the controller speaks on its own behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMessage {
    VoiceModeReady,
    TypingModeNow,
    Goodbye,
    CommandFailed,
    HowCanIHelp,
    VoiceUnavailable,
}

impl SystemMessage {
    pub fn key(self) -> &'static str {
        match self {
            Self::VoiceModeReady => "voice_mode_ready",
            Self::TypingModeNow => "typing_mode_now",
            Self::Goodbye => "goodbye",
            Self::CommandFailed => "command_failed",
            Self::HowCanIHelp => "how_can_i_help",
            Self::VoiceUnavailable => "voice_unavailable",
        }
    }

    pub fn default_text(self) -> &'static str {
        match self {
            Self::VoiceModeReady => "Voice mode ready!",
            Self::TypingModeNow => "Typing mode now!",
            Self::Goodbye => "Goodbye friend!",
            Self::CommandFailed => "Oops, something went wrong!",
            Self::HowCanIHelp => "How can I help?",
            Self::VoiceUnavailable => "I can't hear right now, let's keep typing.",
        }
    }
}

/// Entries of one category: either split into subcategories or a flat list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryEntries {
    Flat(Vec<ResponseEntry>),
    Grouped(BTreeMap<String, Vec<ResponseEntry>>),
}

impl CategoryEntries {
    pub fn len(&self) -> usize {
        match self {
            Self::Flat(entries) => entries.len(),
            Self::Grouped(groups) => groups.values().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Box<dyn Iterator<Item = &ResponseEntry> + '_> {
        match self {
            Self::Flat(entries) => Box::new(entries.iter()),
            Self::Grouped(groups) => Box::new(groups.values().flatten()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub total_responses: usize,
    pub categories: usize,
    pub custom_triggers: usize,
    pub fallbacks: usize,
}

/// In-memory store of canned responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseCatalog {
    categories: BTreeMap<String, CategoryEntries>,
    fallbacks: Vec<ResponseEntry>,
    /// Keyed by normalized trigger.
    custom: BTreeMap<String, ResponseEntry>,
    startup_message: Option<String>,
    system_messages: BTreeMap<String, String>,
}

/// Lowercase and collapse whitespace. Used for trigger keys and direct-command checks.
pub fn normalize_utterance(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl ResponseCatalog {
    /// Minimal catalog used when the persisted one cannot be loaded:
    /// only a non-empty `fallbacks` list.
    pub fn minimal() -> Self {
        Self {
            fallbacks: vec![
                ResponseEntry::new("Hmm, interesting!"),
                ResponseEntry::new("Tell me more!"),
                ResponseEntry::new("I'm just a little worm, but I'm listening."),
            ],
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_json_str(&raw)?;
        tracing::info!(
            path = %path.display(),
            responses = catalog.response_count(),
            "catalog loaded"
        );
        Ok(catalog)
    }

    /// Never fails: a missing or corrupt file degrades to [`ResponseCatalog::minimal`].
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "catalog unavailable, using minimal default");
                Self::minimal()
            }
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let doc: Value = serde_json::from_str(raw)?;
        Self::from_value(doc)
    }

    pub fn from_value(doc: Value) -> Result<Self, CatalogError> {
        let Value::Object(root) = doc else {
            return Err(CatalogError::Shape("top level must be an object".into()));
        };

        let mut catalog = Self::default();
        for (key, value) in root {
            match key.as_str() {
                FALLBACKS => catalog.fallbacks = parse_list(&value, FALLBACKS),
                CUSTOM => catalog.custom = parse_custom(&value),
                STARTUP_MESSAGE => match value {
                    Value::String(text) if !text.trim().is_empty() => {
                        catalog.startup_message = Some(text)
                    }
                    _ => tracing::warn!("startup_message is not a non-empty string, ignoring"),
                },
                SYSTEM_MESSAGES => catalog.system_messages = parse_system_messages(&value),
                _ => match parse_category(&value, &key) {
                    Some(entries) => {
                        catalog.categories.insert(key, entries);
                    }
                    None => tracing::warn!(category = %key, "category is neither a list nor a table, skipping"),
                },
            }
        }
        Ok(catalog)
    }

    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        if let Some(text) = &self.startup_message {
            root.insert(STARTUP_MESSAGE.into(), Value::String(text.clone()));
        }
        for (name, entries) in &self.categories {
            let value = match entries {
                CategoryEntries::Flat(list) => entries_to_json(list),
                CategoryEntries::Grouped(groups) => Value::Object(
                    groups
                        .iter()
                        .map(|(sub, list)| (sub.clone(), entries_to_json(list)))
                        .collect(),
                ),
            };
            root.insert(name.clone(), value);
        }
        if !self.custom.is_empty() {
            let custom = self
                .custom
                .iter()
                .map(|(trigger, entry)| (trigger.clone(), entry_to_json(entry)))
                .collect();
            root.insert(CUSTOM.into(), Value::Object(custom));
        }
        root.insert(FALLBACKS.into(), entries_to_json(&self.fallbacks));
        if !self.system_messages.is_empty() {
            let messages = self
                .system_messages
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            root.insert(SYSTEM_MESSAGES.into(), Value::Object(messages));
        }
        Value::Object(root)
    }

    pub fn save(&self, path: &Path) -> Result<(), CatalogError> {
        let body = serde_json::to_string_pretty(&self.to_json())?;
        std::fs::write(path, body).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    // ── Lookup ──────────────────────────────────────────────────

    pub fn category(&self, name: &str) -> Option<&CategoryEntries> {
        self.categories.get(name)
    }

    pub fn categories(&self) -> impl Iterator<Item = (&str, &CategoryEntries)> {
        self.categories.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn category_names(&self) -> Vec<&str> {
        self.categories.keys().map(String::as_str).collect()
    }

    pub fn fallbacks(&self) -> &[ResponseEntry] {
        &self.fallbacks
    }

    /// Exact trigger lookup; `utterance` is normalized first.
    pub fn custom(&self, utterance: &str) -> Option<&ResponseEntry> {
        self.custom.get(&normalize_utterance(utterance))
    }

    pub fn custom_entries(&self) -> impl Iterator<Item = (&str, &ResponseEntry)> {
        self.custom.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn startup_message(&self) -> &str {
        self.startup_message
            .as_deref()
            .unwrap_or(DEFAULT_STARTUP_MESSAGE)
    }

    pub fn system_message(&self, message: SystemMessage) -> &str {
        self.system_messages
            .get(message.key())
            .map(String::as_str)
            .unwrap_or_else(|| message.default_text())
    }

    pub fn response_count(&self) -> usize {
        self.categories.values().map(CategoryEntries::len).sum::<usize>()
            + self.fallbacks.len()
            + self.custom.len()
    }

    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            total_responses: self.response_count(),
            categories: self.categories.len(),
            custom_triggers: self.custom.len(),
            fallbacks: self.fallbacks.len(),
        }
    }

    // ── Maintenance ─────────────────────────────────────────────

    /// Add an entry. `fallbacks` ignores `subcategory`; `custom` requires the
    /// entry to carry a trigger and replaces any entry with the same trigger.
    pub fn add_response(
        &mut self,
        category: &str,
        subcategory: Option<&str>,
        entry: ResponseEntry,
    ) -> Result<(), CatalogError> {
        if entry.text.trim().is_empty() {
            return Err(CatalogError::Shape("response text must not be empty".into()));
        }
        match category {
            FALLBACKS => self.fallbacks.push(entry),
            CUSTOM => {
                let trigger = entry
                    .trigger
                    .as_deref()
                    .map(normalize_utterance)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| CatalogError::Shape("custom responses need a trigger".into()))?;
                self.custom.insert(trigger, entry);
            }
            STARTUP_MESSAGE | SYSTEM_MESSAGES => {
                return Err(CatalogError::Shape(format!("{category} is reserved")));
            }
            _ => {
                let slot = self.categories.entry(category.to_owned());
                match (slot, subcategory) {
                    (Entry::Vacant(v), None) => {
                        v.insert(CategoryEntries::Flat(vec![entry]));
                    }
                    (Entry::Vacant(v), Some(sub)) => {
                        v.insert(CategoryEntries::Grouped(BTreeMap::from([(
                            sub.to_owned(),
                            vec![entry],
                        )])));
                    }
                    (Entry::Occupied(mut o), sub) => {
                        match (o.get_mut(), sub) {
                            (CategoryEntries::Flat(list), None) => list.push(entry),
                            (CategoryEntries::Grouped(groups), Some(sub)) => {
                                groups.entry(sub.to_owned()).or_default().push(entry)
                            }
                            (CategoryEntries::Flat(_), Some(_)) => {
                                return Err(CatalogError::Shape(format!(
                                    "{category} is a flat list, it has no subcategories"
                                )));
                            }
                            (CategoryEntries::Grouped(_), None) => {
                                return Err(CatalogError::Shape(format!(
                                    "{category} has subcategories, one must be named"
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove the entry at `index` (display order) and return it.
    pub fn remove_response(
        &mut self,
        category: &str,
        subcategory: Option<&str>,
        index: usize,
    ) -> Result<ResponseEntry, CatalogError> {
        let not_found = || {
            let path = match subcategory {
                Some(sub) => format!("{category}.{sub}[{index}]"),
                None => format!("{category}[{index}]"),
            };
            CatalogError::NotFound(path)
        };
        match category {
            FALLBACKS => take_at(&mut self.fallbacks, index).ok_or_else(not_found),
            CUSTOM => {
                let key = self.custom.keys().nth(index).cloned().ok_or_else(not_found)?;
                self.custom.remove(&key).ok_or_else(not_found)
            }
            _ => {
                let entries = self.categories.get_mut(category).ok_or_else(not_found)?;
                let list = match (entries, subcategory) {
                    (CategoryEntries::Flat(list), None) => list,
                    (CategoryEntries::Grouped(groups), Some(sub)) => {
                        groups.get_mut(sub).ok_or_else(not_found)?
                    }
                    _ => return Err(not_found()),
                };
                take_at(list, index).ok_or_else(not_found)
            }
        }
    }
}

fn take_at(list: &mut Vec<ResponseEntry>, index: usize) -> Option<ResponseEntry> {
    (index < list.len()).then(|| list.remove(index))
}

// ── Parsing ─────────────────────────────────────────────────────

fn parse_entry(value: &Value, context: &str) -> Option<ResponseEntry> {
    let Some(obj) = value.as_object() else {
        tracing::warn!(context, "response entry is not an object, skipping");
        return None;
    };
    let text = match obj.get("text").and_then(Value::as_str) {
        Some(text) if !text.trim().is_empty() => text.to_owned(),
        _ => {
            tracing::warn!(context, "response entry without text, skipping");
            return None;
        }
    };

    let movement_code = match obj.get("movement").and_then(Value::as_str) {
        Some(token) => {
            let parsed = SymbolicCommand::from_token(token);
            if parsed.is_none() {
                tracing::warn!(context, token, "unknown movement token, dropping movement");
            }
            parsed
        }
        None => None,
    };

    let mouth_pulses = obj
        .get("mouth_movements")
        .or_else(|| obj.get("mouth_pulses"))
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX));

    Some(ResponseEntry {
        text,
        movement_code,
        emotion: string_field(obj, "emotion"),
        trigger: string_field(obj, "trigger"),
        mouth_pulses,
    })
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn parse_list(value: &Value, context: &str) -> Vec<ResponseEntry> {
    match value.as_array() {
        Some(items) => items.iter().filter_map(|v| parse_entry(v, context)).collect(),
        None => {
            tracing::warn!(context, "expected a list of responses");
            Vec::new()
        }
    }
}

fn parse_category(value: &Value, name: &str) -> Option<CategoryEntries> {
    match value {
        Value::Array(_) => Some(CategoryEntries::Flat(parse_list(value, name))),
        Value::Object(groups) => {
            let mut parsed = BTreeMap::new();
            for (sub, list) in groups {
                if !list.is_array() {
                    tracing::warn!(category = name, subcategory = %sub, "subcategory is not a list, skipping");
                    continue;
                }
                let context = format!("{name}.{sub}");
                parsed.insert(sub.clone(), parse_list(list, &context));
            }
            Some(CategoryEntries::Grouped(parsed))
        }
        _ => None,
    }
}

/// `custom` accepts `{trigger: entry}`, `{trigger: [entries]}` and
/// `{group: [entries with "trigger"]}`. The entry's own trigger wins over the key.
/// The first entry seen for a trigger is kept.
fn parse_custom(value: &Value) -> BTreeMap<String, ResponseEntry> {
    let mut custom = BTreeMap::new();
    let Some(map) = value.as_object() else {
        tracing::warn!("custom must be a table, ignoring");
        return custom;
    };
    for (key, item) in map {
        let candidates: Vec<&Value> = match item {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for candidate in candidates {
            let Some(mut entry) = parse_entry(candidate, CUSTOM) else {
                continue;
            };
            let trigger = entry.trigger.clone().unwrap_or_else(|| key.clone());
            let normalized = normalize_utterance(&trigger);
            if normalized.is_empty() {
                continue;
            }
            entry.trigger = Some(trigger);
            if custom.contains_key(&normalized) {
                tracing::warn!(trigger = %normalized, "duplicate custom trigger, keeping the first");
                continue;
            }
            custom.insert(normalized, entry);
        }
    }
    custom
}

fn parse_system_messages(value: &Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_owned())))
                .collect()
        })
        .unwrap_or_default()
}

fn entry_to_json(entry: &ResponseEntry) -> Value {
    serde_json::to_value(entry).unwrap_or(Value::Null)
}

fn entries_to_json(list: &[ResponseEntry]) -> Value {
    Value::Array(list.iter().map(entry_to_json).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ResponseCatalog {
        ResponseCatalog::from_value(json!({
            "startup_message": "Wiggle time!",
            "greetings": {
                "casual": [{ "text": "Hey there!" }, { "text": "Howdy!", "movement": "w" }],
                "formal": [{ "text": "Good day." }]
            },
            "jokes": [{ "text": "Why did the worm cross the road?", "mouth_movements": 3 }],
            "custom": {
                "hello worm": { "text": "Hi!", "movement": "d" },
                "tricks": [{ "text": "Watch this!", "trigger": "Do A Trick" }]
            },
            "fallbacks": [{ "text": "Hmm?" }],
            "system_messages": { "goodbye": "See you later!" }
        }))
        .unwrap()
    }

    #[test]
    fn parses_all_shapes() {
        let catalog = sample();
        assert_eq!(catalog.category_names(), vec!["greetings", "jokes"]);
        assert!(matches!(catalog.category("greetings"), Some(CategoryEntries::Grouped(g)) if g.len() == 2));
        assert!(matches!(catalog.category("jokes"), Some(CategoryEntries::Flat(l)) if l[0].mouth_pulses == Some(3)));
        assert_eq!(catalog.fallbacks().len(), 1);
        assert_eq!(catalog.startup_message(), "Wiggle time!");
        assert_eq!(catalog.system_message(SystemMessage::Goodbye), "See you later!");
        assert_eq!(
            catalog.system_message(SystemMessage::TypingModeNow),
            SystemMessage::TypingModeNow.default_text()
        );
        assert_eq!(catalog.response_count(), 3 + 1 + 2 + 1);
    }

    #[test]
    fn custom_triggers_are_normalized() {
        let catalog = sample();
        let hi = catalog.custom("  Hello   WORM ").unwrap();
        assert_eq!(hi.text, "Hi!");
        assert_eq!(hi.movement_code, Some(SymbolicCommand::Dance));
        assert_eq!(catalog.custom("do a trick").unwrap().text, "Watch this!");
        assert!(catalog.custom("tricks").is_none());
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let catalog = ResponseCatalog::from_value(json!({
            "misc": [
                { "movement": "d" },
                { "text": "   " },
                "just a string",
                { "text": "kept", "movement": "jump" }
            ],
            "broken": 42,
            "fallbacks": [{ "text": "ok" }]
        }))
        .unwrap();
        let Some(CategoryEntries::Flat(misc)) = catalog.category("misc") else {
            panic!("misc should be flat");
        };
        assert_eq!(misc.len(), 1);
        assert_eq!(misc[0].text, "kept");
        assert_eq!(misc[0].movement_code, None);
        assert!(catalog.category("broken").is_none());
    }

    #[test]
    fn mouth_pulses_alias_accepted() {
        let catalog = ResponseCatalog::from_value(json!({
            "fallbacks": [{ "text": "a b", "mouth_pulses": 4 }]
        }))
        .unwrap();
        assert_eq!(catalog.fallbacks()[0].mouth_pulses, Some(4));
    }

    #[test]
    fn top_level_must_be_object() {
        assert!(matches!(
            ResponseCatalog::from_json_str("[1, 2]"),
            Err(CatalogError::Shape(_))
        ));
        assert!(matches!(
            ResponseCatalog::from_json_str("{ nope"),
            Err(CatalogError::Parse(_))
        ));
    }

    #[test]
    fn load_or_default_synthesizes_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ResponseCatalog::load_or_default(&dir.path().join("missing.json"));
        assert!(!catalog.fallbacks().is_empty());
        assert!(catalog.category_names().is_empty());

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{{{{").unwrap();
        assert_eq!(ResponseCatalog::load_or_default(&corrupt), ResponseCatalog::minimal());
    }

    #[test]
    fn save_then_load_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responses.json");
        let catalog = sample();
        catalog.save(&path).unwrap();
        let reloaded = ResponseCatalog::load(&path).unwrap();
        assert_eq!(reloaded, catalog);
    }

    #[test]
    fn add_and_remove_responses() {
        let mut catalog = sample();
        catalog
            .add_response("greetings", Some("casual"), ResponseEntry::new("Yo!"))
            .unwrap();
        catalog.add_response("jokes", None, ResponseEntry::new("Knock knock.")).unwrap();
        catalog.add_response("brand_new", None, ResponseEntry::new("Fresh.")).unwrap();
        catalog
            .add_response("custom", None, ResponseEntry::new("Bye!").with_trigger("Bye Worm"))
            .unwrap();
        assert_eq!(catalog.custom("bye worm").unwrap().text, "Bye!");

        assert!(matches!(
            catalog.add_response("jokes", Some("x"), ResponseEntry::new("no")),
            Err(CatalogError::Shape(_))
        ));
        assert!(matches!(
            catalog.add_response("greetings", None, ResponseEntry::new("no")),
            Err(CatalogError::Shape(_))
        ));
        assert!(matches!(
            catalog.add_response("custom", None, ResponseEntry::new("no trigger")),
            Err(CatalogError::Shape(_))
        ));
        assert!(matches!(
            catalog.add_response("jokes", None, ResponseEntry::new(" ")),
            Err(CatalogError::Shape(_))
        ));

        let removed = catalog.remove_response("jokes", None, 1).unwrap();
        assert_eq!(removed.text, "Knock knock.");
        let removed = catalog.remove_response("greetings", Some("casual"), 2).unwrap();
        assert_eq!(removed.text, "Yo!");
        assert!(matches!(
            catalog.remove_response("greetings", Some("casual"), 9),
            Err(CatalogError::NotFound(_))
        ));
        assert!(matches!(
            catalog.remove_response("nope", None, 0),
            Err(CatalogError::NotFound(_))
        ));
    }

    #[test]
    fn stats_count_every_bucket() {
        let stats = sample().stats();
        assert_eq!(
            stats,
            CatalogStats {
                total_responses: 7,
                categories: 2,
                custom_triggers: 2,
                fallbacks: 1,
            }
        );
    }
}
