mod generative;
mod keyword_table;

pub use generative::{GenerativeFallback, GenerativeReply, map_hint, parse_reply, truncate_words};
pub use keyword_table::{KeywordRule, KeywordTable, contains_phrase, tokenize};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use crate::catalog::{CategoryEntries, ResponseCatalog, normalize_utterance};
use crate::types::{
    ResolutionSource, ResolvedResponse, ResponseEntry, SymbolicCommand, pulses_for_text,
};

/// Spoken when nothing matched and the catalog has no fallbacks.
/// Mouth pulses for a custom-trigger entry without its own count.
pub const CUSTOM_TRIGGER_PULSES: u32 = 1;
pub const DEFAULT_RESPONSE_TEXT: &str = "I'm not sure what to say, but I'm glad you're here!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    /// Tiers 1-4 only.
    #[default]
    Canned,
    /// Tiers 1-2, then the generative collaborator, then tier 4.
    Generative,
}

/// Maps utterances to responses. The random source is injected so a fixed
/// seed reproduces every pick.
pub struct ResponseResolver<R: Rng = StdRng> {
    catalog: Arc<ResponseCatalog>,
    keywords: KeywordTable,
    rng: R,
    generative: Option<GenerativeFallback>,
    confidence_threshold: f32,
}

impl ResponseResolver<StdRng> {
    pub fn new(catalog: Arc<ResponseCatalog>, keywords: KeywordTable) -> Self {
        Self::with_rng(catalog, keywords, StdRng::from_entropy())
    }

    pub fn seeded(catalog: Arc<ResponseCatalog>, keywords: KeywordTable, seed: u64) -> Self {
        Self::with_rng(catalog, keywords, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> ResponseResolver<R> {
    pub fn with_rng(catalog: Arc<ResponseCatalog>, keywords: KeywordTable, rng: R) -> Self {
        Self {
            catalog,
            keywords,
            rng,
            generative: None,
            confidence_threshold: 0.6,
        }
    }

    pub fn with_generative(mut self, fallback: GenerativeFallback, confidence_threshold: f32) -> Self {
        self.generative = Some(fallback);
        self.confidence_threshold = confidence_threshold;
        self
    }

    pub fn catalog(&self) -> &ResponseCatalog {
        &self.catalog
    }

    pub fn generative(&self) -> Option<&GenerativeFallback> {
        self.generative.as_ref()
    }

    /// Canned resolution (tiers 1-4). `None` only for empty/whitespace input.
    pub fn resolve(&mut self, utterance: &str) -> Option<ResolvedResponse> {
        let normalized = normalize_utterance(utterance);
        if normalized.is_empty() {
            return None;
        }
        let resolved = self
            .leading_tiers(&normalized)
            .or_else(|| self.category_tier(&normalized))
            .unwrap_or_else(|| self.fallback_tier());
        log_resolution(&resolved);
        Some(resolved)
    }

    /// Resolution honoring `mode`. Generative mode keeps direct commands and
    /// custom triggers ahead of the collaborator; a missing provider, a provider
    /// error or a low-confidence reply all land on the fallback tier.
    pub async fn resolve_with(&mut self, utterance: &str, mode: ResolveMode) -> Option<ResolvedResponse> {
        if mode == ResolveMode::Canned || self.generative.is_none() {
            return self.resolve(utterance);
        }
        let normalized = normalize_utterance(utterance);
        if normalized.is_empty() {
            return None;
        }
        if let Some(resolved) = self.leading_tiers(&normalized) {
            log_resolution(&resolved);
            return Some(resolved);
        }

        let threshold = self.confidence_threshold;
        let outcome = match self.generative.as_mut() {
            Some(fallback) => Some(fallback.generate(utterance.trim()).await),
            None => None,
        };
        let resolved = match outcome {
            Some(Ok(reply)) if reply.confidence >= threshold => ResolvedResponse {
                movement_code: Some(reply.command()),
                mouth_pulse_count: pulses_for_text(&reply.text),
                text: reply.text,
                source: ResolutionSource::Generative,
            },
            Some(Ok(reply)) => {
                tracing::info!(
                    confidence = reply.confidence,
                    threshold,
                    "generative reply below confidence threshold, using fallback"
                );
                self.fallback_tier()
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "generative fallback failed, using canned fallback");
                self.fallback_tier()
            }
            None => self.fallback_tier(),
        };
        log_resolution(&resolved);
        Some(resolved)
    }

    /// Tier 1 (direct command) then tier 2 (custom trigger).
    fn leading_tiers(&self, normalized: &str) -> Option<ResolvedResponse> {
        if let Some(command) = SymbolicCommand::from_token(normalized) {
            return Some(ResolvedResponse::direct(command));
        }
        self.catalog.custom(normalized).map(|entry| ResolvedResponse {
            text: entry.text.clone(),
            movement_code: entry.movement_code,
            mouth_pulse_count: entry.mouth_pulses.unwrap_or(CUSTOM_TRIGGER_PULSES),
            source: ResolutionSource::CustomTrigger,
        })
    }

    /// Tier 3: keyword classification, then a uniform pick inside the category.
    fn category_tier(&mut self, normalized: &str) -> Option<ResolvedResponse> {
        let name = self.keywords.classify(normalized)?;
        let entry = match self.catalog.category(name)? {
            CategoryEntries::Flat(list) => list.choose(&mut self.rng)?,
            CategoryEntries::Grouped(groups) => {
                if groups.is_empty() {
                    return None;
                }
                let pick = self.rng.gen_range(0..groups.len());
                groups.values().nth(pick)?.choose(&mut self.rng)?
            }
        };
        Some(from_entry(
            entry,
            ResolutionSource::Category {
                name: name.to_owned(),
            },
        ))
    }

    /// Tier 4: uniform pick from `fallbacks`, else the hard-coded default.
    fn fallback_tier(&mut self) -> ResolvedResponse {
        match self.catalog.fallbacks().choose(&mut self.rng) {
            Some(entry) => from_entry(entry, ResolutionSource::Fallback),
            None => ResolvedResponse {
                text: DEFAULT_RESPONSE_TEXT.to_owned(),
                movement_code: None,
                mouth_pulse_count: 1,
                source: ResolutionSource::Default,
            },
        }
    }
}

fn from_entry(entry: &ResponseEntry, source: ResolutionSource) -> ResolvedResponse {
    ResolvedResponse {
        text: entry.text.clone(),
        movement_code: entry.movement_code,
        mouth_pulse_count: entry
            .mouth_pulses
            .unwrap_or_else(|| pulses_for_text(&entry.text)),
        source,
    }
}

fn log_resolution(resolved: &ResolvedResponse) {
    tracing::debug!(
        source = ?resolved.source,
        movement = ?resolved.movement_code,
        pulses = resolved.mouth_pulse_count,
        "utterance resolved"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use worm_llm::provider::MockProvider;

    use crate::config::WormCfg;

    fn catalog(doc: serde_json::Value) -> Arc<ResponseCatalog> {
        Arc::new(ResponseCatalog::from_value(doc).unwrap())
    }

    fn resolver(doc: serde_json::Value) -> ResponseResolver {
        ResponseResolver::seeded(catalog(doc), KeywordTable::default(), 7)
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let mut r = resolver(json!({ "fallbacks": [{ "text": "fb" }] }));
        assert_eq!(r.resolve(""), None);
        assert_eq!(r.resolve(" \t\n"), None);
    }

    #[test]
    fn direct_commands_ignore_catalog() {
        let mut r = resolver(json!({
            "custom": { "d": { "text": "shadowed" } },
            "fallbacks": []
        }));
        let resolved = r.resolve("  D ").unwrap();
        assert_eq!(resolved, ResolvedResponse::direct(SymbolicCommand::Dance));
        assert_eq!(r.resolve("IDENTIFY").unwrap().movement_code, Some(SymbolicCommand::Identify));
    }

    #[test]
    fn custom_trigger_defaults_to_one_pulse() {
        let mut r = resolver(json!({
            "custom": {
                "tell me a story": { "text": "Once upon a time there was a very long worm" },
                "count": { "text": "One two three", "mouth_movements": 3 }
            }
        }));
        let story = r.resolve("Tell me a story").unwrap();
        assert_eq!(story.mouth_pulse_count, 1);
        assert_eq!(story.source, ResolutionSource::CustomTrigger);
        assert_eq!(r.resolve("count").unwrap().mouth_pulse_count, 3);
    }

    #[test]
    fn category_entry_pulses_derive_from_words() {
        let mut r = resolver(json!({
            "greetings": [{ "text": "Hello hello hello my wiggly friend" }],
            "fallbacks": [{ "text": "fb" }]
        }));
        let resolved = r.resolve("hi").unwrap();
        assert_eq!(resolved.mouth_pulse_count, 2);
        assert_eq!(
            resolved.source,
            ResolutionSource::Category {
                name: "greetings".into()
            }
        );
    }

    #[test]
    fn empty_subcategory_falls_back() {
        let mut r = resolver(json!({
            "questions": { "only": [] },
            "fallbacks": [{ "text": "fb" }]
        }));
        let resolved = r.resolve("why").unwrap();
        assert_eq!(resolved.text, "fb");
        assert_eq!(resolved.source, ResolutionSource::Fallback);
    }

    #[test]
    fn matched_but_absent_category_falls_back() {
        let mut r = resolver(json!({ "fallbacks": [{ "text": "fb", "movement": "w" }] }));
        let resolved = r.resolve("hello there").unwrap();
        assert_eq!(resolved.source, ResolutionSource::Fallback);
        assert_eq!(resolved.movement_code, Some(SymbolicCommand::Wiggle));
    }

    #[test]
    fn same_seed_same_picks() {
        let doc = json!({
            "greetings": {
                "a": [{ "text": "a1" }, { "text": "a2" }, { "text": "a3" }],
                "b": [{ "text": "b1" }, { "text": "b2" }]
            },
            "fallbacks": [{ "text": "f1" }, { "text": "f2" }, { "text": "f3" }]
        });
        let mut first = ResponseResolver::seeded(catalog(doc.clone()), KeywordTable::default(), 42);
        let mut second = ResponseResolver::seeded(catalog(doc), KeywordTable::default(), 42);
        for utterance in ["hello", "hey", "zzz", "hi there", "qqq"] {
            assert_eq!(first.resolve(utterance), second.resolve(utterance));
        }
    }

    #[test]
    fn picks_cover_every_entry() {
        let mut r = resolver(json!({
            "fallbacks": [{ "text": "f1" }, { "text": "f2" }, { "text": "f3" }]
        }));
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..200 {
            seen.insert(r.resolve("nothing matches this").unwrap().text);
        }
        assert_eq!(seen.len(), 3);
    }

    fn generative_resolver(provider: MockProvider) -> ResponseResolver {
        let cfg = WormCfg::default();
        let fallback = GenerativeFallback::new(Arc::new(provider), &cfg);
        resolver(json!({
            "custom": { "hello worm": { "text": "Hi!", "movement": "d" } },
            "fallbacks": [{ "text": "canned" }]
        }))
        .with_generative(fallback, cfg.ai_confidence_threshold)
    }

    #[tokio::test]
    async fn generative_mode_maps_emotion() {
        let mut r = generative_resolver(MockProvider::new(
            r#"{"text": "I feel blue today", "emotion": "sad", "confidence": 0.9}"#,
        ));
        let resolved = r
            .resolve_with("how do you feel", ResolveMode::Generative)
            .await
            .unwrap();
        assert_eq!(resolved.text, "I feel blue today");
        assert_eq!(resolved.movement_code, Some(SymbolicCommand::Sadness));
        assert_eq!(resolved.source, ResolutionSource::Generative);
        assert_eq!(resolved.mouth_pulse_count, 1);
    }

    #[tokio::test]
    async fn generative_mode_keeps_leading_tiers() {
        let mut r = generative_resolver(MockProvider::new("unused"));
        let custom = r.resolve_with("Hello Worm", ResolveMode::Generative).await.unwrap();
        assert_eq!(custom.source, ResolutionSource::CustomTrigger);
        let direct = r.resolve_with("sl", ResolveMode::Generative).await.unwrap();
        assert!(direct.is_direct_command());
        assert_eq!(r.generative().map(GenerativeFallback::history_len), Some(0));
    }

    #[tokio::test]
    async fn low_confidence_and_errors_use_fallback() {
        let mut low = generative_resolver(MockProvider::new(r#"{"text": "maybe?", "confidence": 0.2}"#));
        let resolved = low.resolve_with("ponder", ResolveMode::Generative).await.unwrap();
        assert_eq!(resolved.text, "canned");
        assert_eq!(resolved.source, ResolutionSource::Fallback);

        let mut failing = generative_resolver(MockProvider::failing());
        let resolved = failing.resolve_with("ponder", ResolveMode::Generative).await.unwrap();
        assert_eq!(resolved.source, ResolutionSource::Fallback);
    }

    #[tokio::test]
    async fn generative_without_provider_is_canned() {
        let mut r = resolver(json!({ "fallbacks": [{ "text": "canned" }] }));
        let resolved = r.resolve_with("ponder", ResolveMode::Generative).await.unwrap();
        assert_eq!(resolved.source, ResolutionSource::Fallback);
        assert_eq!(r.resolve_with("   ", ResolveMode::Generative).await, None);
    }
}
