//! Deterministic prompt interpreter.
//!
//! Tokenises on anything that is not alphanumeric or `_`, recognises a
//! leading entity word ("person", "building", ...) and a `/`-separated path
//! hint, and keeps the remaining non-stop-words as search terms.

use async_trait::async_trait;

use super::{QueryInterpreter, StructuredQuery};
use crate::model::{EntityType, TaxonomyPath};
use crate::{BiographError, Result};

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "by", "for", "from", "had", "has", "her",
    "his", "in", "into", "is", "it", "its", "of", "on", "or", "she", "he", "that", "the", "their",
    "this", "to", "under", "was", "were", "who", "with",
];

/// Lower-case `text` and split it into alphanumeric tokens.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn entity_word(token: &str) -> Option<EntityType> {
    match token {
        "person" | "people" | "woman" | "man" => Some(EntityType::Person),
        "building" | "buildings" => Some(EntityType::Building),
        "organisation" | "organisations" | "organization" | "organizations" | "company"
        | "charity" => Some(EntityType::Organisation),
        "event" | "events" => Some(EntityType::Event),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordInterpreter;

impl KeywordInterpreter {
    pub fn parse(&self, prompt: &str, entity_hint: Option<&EntityType>) -> Result<StructuredQuery> {
        if prompt.trim().is_empty() {
            return Err(BiographError::Parse("prompt is empty".into()));
        }

        let mut taxonomy_hint = None;
        let mut rest = Vec::new();
        for word in prompt.split_whitespace() {
            let trimmed = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '_');
            if taxonomy_hint.is_none() && trimmed.contains('/') {
                let path = TaxonomyPath::parse(trimmed);
                if !path.is_empty() {
                    taxonomy_hint = Some(path);
                    continue;
                }
            }
            rest.push(word);
        }

        let mut entity_type = entity_hint.cloned();
        let mut terms: Vec<String> = Vec::new();
        for token in tokenize(&rest.join(" ")) {
            if let Some(found) = entity_word(&token) {
                if entity_type.is_none() {
                    entity_type = Some(found);
                }
                continue;
            }
            if token.chars().count() < 2 || STOP_WORDS.contains(&token.as_str()) {
                continue;
            }
            if !terms.contains(&token) {
                terms.push(token);
            }
        }

        if terms.is_empty() && taxonomy_hint.is_none() {
            return Err(BiographError::Parse(format!(
                "no usable terms in prompt {prompt:?}"
            )));
        }
        Ok(StructuredQuery {
            entity_type,
            taxonomy_hint,
            terms,
        })
    }
}

#[async_trait]
impl QueryInterpreter for KeywordInterpreter {
    async fn interpret(
        &self,
        prompt: &str,
        entity_hint: Option<&EntityType>,
    ) -> Result<StructuredQuery> {
        self.parse(prompt, entity_hint)
    }
}
