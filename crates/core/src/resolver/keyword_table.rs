use serde::{Deserialize, Serialize};

/// One row of the classification table: any keyword hit selects `category`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub category: String,
    pub keywords: Vec<String>,
}

/// Ordered (keyword-set → category) table. Rows are evaluated top to bottom and
/// the first row with a keyword present in the utterance wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeywordTable {
    rules: Vec<KeywordRule>,
}

impl Default for KeywordTable {
    fn default() -> Self {
        Self::new()
            .with_rule("commands", ["dance", "move", "wiggle", "motion"])
            .with_rule("greetings", ["hello", "hi", "hey", "greetings"])
            .with_rule("questions", ["what", "who", "how", "why"])
            .with_rule("emotions", ["happy", "good", "great", "awesome"])
    }
}

impl KeywordTable {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule<I, S>(mut self, category: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.push(KeywordRule {
            category: category.into(),
            keywords: keywords.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn rules(&self) -> &[KeywordRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First matching category for `utterance`, if any.
    ///
    /// Matching is on whole word tokens, so `hi` does not fire inside `this`.
    /// Multi-word keywords must appear as a contiguous token run.
    pub fn classify(&self, utterance: &str) -> Option<&str> {
        let words = tokenize(utterance);
        if words.is_empty() {
            return None;
        }
        self.rules
            .iter()
            .find(|rule| rule.keywords.iter().any(|kw| contains_phrase(&words, kw)))
            .map(|rule| rule.category.as_str())
    }
}

/// Lowercased word tokens. Apostrophes stay inside words (`what's`).
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
        .collect()
}

/// True when `phrase` occurs in `words` as a contiguous token run.
pub fn contains_phrase(words: &[String], phrase: &str) -> bool {
    let needle = tokenize(phrase);
    if needle.is_empty() || needle.len() > words.len() {
        return false;
    }
    words.windows(needle.len()).any(|w| w == needle.as_slice())
}
