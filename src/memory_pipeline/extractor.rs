// src/memory_pipeline/extractor.rs
//! MemoryExtractor: turns an assistant turn into candidate
//! facts/entities/tasks. Follows a single-purpose prompt, call, parse,
//! fall-back-to-a-safe-default-on-parse-failure shape rather than being
//! left as an unimplemented stub.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::providers::{ChatMessage, LlmProvider};

#[derive(Debug, Clone)]
pub struct ExtractedFact {
    pub content: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedMemory {
    pub facts: Vec<ExtractedFact>,
    pub entities: Vec<String>,
    pub tasks: Vec<String>,
    pub confidence: f32,
}

#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    /// `assistant_message` is the turn under analysis; `seed_topics` carries
    /// the session's running topics as retrieval-expansion context.
    async fn extract(&self, assistant_message: &str, seed_topics: &[String]) -> anyhow::Result<ExtractedMemory>;
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    facts: Vec<RawFact>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    tasks: Vec<String>,
    #[serde(default)]
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct RawFact {
    content: String,
    #[serde(default)]
    confidence: f32,
}

const EXTRACTION_PROMPT: &str = r#"You extract durable facts from a single assistant reply in an ongoing conversation.
Return ONLY a JSON object of the form:
{"facts": [{"content": "...", "confidence": 0.0}], "entities": ["..."], "tasks": ["..."], "confidence": 0.0}
"facts" are standalone, verifiable statements worth remembering across sessions.
"entities" are named people/projects/concepts mentioned.
"tasks" are open action items the user or assistant committed to.
Omit anything not clearly supported by the text. If nothing qualifies, return empty arrays."#;

/// Concrete adapter: one chat-completion call against the configured
/// `LlmProvider` with a fixed extraction prompt (the contradiction
/// classifier uses the identical shape for its own fixed prompt).
pub struct LlmMemoryExtractor {
    llm: std::sync::Arc<dyn LlmProvider>,
    model: String,
}

impl LlmMemoryExtractor {
    pub fn new(llm: std::sync::Arc<dyn LlmProvider>, model: String) -> Self {
        Self { llm, model }
    }
}

#[async_trait]
impl MemoryExtractor for LlmMemoryExtractor {
    async fn extract(&self, assistant_message: &str, seed_topics: &[String]) -> anyhow::Result<ExtractedMemory> {
        let mut user_content = String::from(EXTRACTION_PROMPT);
        if !seed_topics.is_empty() {
            user_content.push_str("\n\nKnown topics so far: ");
            user_content.push_str(&seed_topics.join(", "));
        }
        user_content.push_str("\n\nAssistant reply:\n");
        user_content.push_str(assistant_message);

        let messages = vec![ChatMessage { role: "user".to_string(), content: user_content }];
        let result = self.llm.complete(&self.model, &messages, 0.0, 512).await?;

        match parse_extraction(&result.content) {
            Some(parsed) => Ok(parsed),
            None => {
                warn!("memory extractor returned unparseable output, treating as empty");
                Ok(ExtractedMemory::default())
            }
        }
    }
}

fn parse_extraction(raw: &str) -> Option<ExtractedMemory> {
    let json_slice = extract_json_object(raw)?;
    let parsed: RawExtraction = serde_json::from_str(json_slice).ok()?;
    Some(ExtractedMemory {
        facts: parsed
            .facts
            .into_iter()
            .map(|f| ExtractedFact { content: f.content, confidence: f.confidence })
            .collect(),
        entities: parsed.entities,
        tasks: parsed.tasks,
        confidence: parsed.confidence,
    })
}

/// LLMs routinely wrap JSON in prose or code fences; take the outermost
/// `{...}` span rather than requiring an exact-match response.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_extraction() {
        let raw = r#"Sure, here you go:
        {"facts": [{"content": "User prefers dark mode", "confidence": 0.9}],
         "entities": ["dark mode"], "tasks": [], "confidence": 0.8}"#;
        let parsed = parse_extraction(raw).unwrap();
        assert_eq!(parsed.facts.len(), 1);
        assert_eq!(parsed.facts[0].content, "User prefers dark mode");
        assert_eq!(parsed.entities, vec!["dark mode".to_string()]);
    }

    #[test]
    fn returns_none_for_garbage() {
        assert!(parse_extraction("not json at all").is_none());
    }
}
