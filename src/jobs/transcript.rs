//! Transcript artifact written by the managed service.
//!
//! The artifact is JSON with the full transcript plus per-item timing and
//! confidence. Numeric fields arrive either as JSON numbers or as strings.

use serde::{Deserialize, Deserializer, Serialize};

/// Root of the artifact document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptArtifact {
    #[serde(rename = "jobName", default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    pub results: TranscriptResults,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptResults {
    #[serde(default)]
    pub transcripts: Vec<TranscriptText>,
    #[serde(default)]
    pub items: Vec<TranscriptItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptText {
    pub transcript: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemKind {
    #[default]
    Pronunciation,
    Punctuation,
    Other,
}

impl From<String> for ItemKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "pronunciation" => ItemKind::Pronunciation,
            "punctuation" => ItemKind::Punctuation,
            _ => ItemKind::Other,
        }
    }
}

impl From<ItemKind> for String {
    fn from(kind: ItemKind) -> Self {
        match kind {
            ItemKind::Pronunciation => "pronunciation",
            ItemKind::Punctuation => "punctuation",
            ItemKind::Other => "other",
        }
        .to_string()
    }
}

/// A recognized token with timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptItem {
    #[serde(rename = "type", default)]
    pub kind: ItemKind,
    #[serde(default, deserialize_with = "flexible_f64", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, deserialize_with = "flexible_f64", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    #[serde(default, deserialize_with = "flexible_f64", skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub content: String,
}

/// Word used to build artifacts (simulated service, debug endpoints).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptWord {
    pub content: String,
    pub confidence: f64,
    pub start_time: f64,
    pub end_time: f64,
}

/// Values written onto a completed job row.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSummary {
    pub text: String,
    pub confidence: f64,
    pub duration_seconds: f64,
}

fn flexible_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(value)) => Ok(Some(value)),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => text.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

impl TranscriptArtifact {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Build an artifact from a transcript and its words.
    pub fn from_words(job_name: impl Into<String>, transcript: impl Into<String>, words: &[TranscriptWord]) -> Self {
        let items = words
            .iter()
            .map(|word| TranscriptItem {
                kind: ItemKind::Pronunciation,
                start_time: Some(word.start_time),
                end_time: Some(word.end_time),
                alternatives: vec![Alternative {
                    confidence: Some(word.confidence),
                    content: word.content.clone(),
                }],
            })
            .collect();

        Self {
            job_name: Some(job_name.into()),
            results: TranscriptResults {
                transcripts: vec![TranscriptText {
                    transcript: transcript.into(),
                }],
                items,
            },
        }
    }

    /// Concatenated text, mean token confidence and end time of the last
    /// recognized token. Punctuation never counts as a token.
    pub fn summarize(&self) -> TranscriptSummary {
        let text = self
            .results
            .transcripts
            .iter()
            .map(|t| t.transcript.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let pronunciations: Vec<&TranscriptItem> = self
            .results
            .items
            .iter()
            .filter(|item| item.kind == ItemKind::Pronunciation)
            .collect();

        let confidences: Vec<f64> = pronunciations
            .iter()
            .filter_map(|item| item.alternatives.first().and_then(|alt| alt.confidence))
            .collect();
        let confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        };

        let duration_seconds = pronunciations
            .iter()
            .rev()
            .find_map(|item| item.end_time)
            .unwrap_or(0.0);

        TranscriptSummary {
            text,
            confidence: confidence.clamp(0.0, 1.0),
            duration_seconds: duration_seconds.max(0.0),
        }
    }
}
