//! Response verification: cheap rule checks plus an optional LLM
//! reviewer, composed so the first failure wins.
//!
//! Verification is advisory by construction. A broken reviewer must
//! never block delivery, so every parse or transport failure collapses
//! to a neutral pass.

use crate::config::VerificationConfig;
use crate::llm::{ChatMessage, LlmService};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};

/// Reviewer rating vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rating {
    Good,
    NeedsFix,
    Redo,
}

impl Rating {
    pub fn as_str(self) -> &'static str {
        match self {
            Rating::Good => "GOOD",
            Rating::NeedsFix => "NEEDS_FIX",
            Rating::Redo => "REDO",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GOOD" => Some(Rating::Good),
            "NEEDS_FIX" => Some(Rating::NeedsFix),
            "REDO" => Some(Rating::Redo),
            _ => None,
        }
    }
}

/// One verifier's judgement.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub passed: bool,
    pub rating: Rating,
    pub feedback: Option<String>,
    pub confidence: f64,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            rating: Rating::Good,
            feedback: None,
            confidence: 1.0,
        }
    }

    fn fail(rating: Rating, feedback: impl Into<String>) -> Self {
        Self {
            passed: false,
            rating,
            feedback: Some(feedback.into()),
            confidence: 1.0,
        }
    }

    /// Neutral pass used when the reviewer itself is broken.
    fn neutral() -> Self {
        Self {
            passed: true,
            rating: Rating::Good,
            feedback: None,
            confidence: 0.5,
        }
    }
}

/// Context handed to verifiers alongside the request/response pair.
pub struct VerifyContext<'a> {
    pub history: &'a [ChatMessage],
    pub attempt: usize,
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, request: &str, response: &str, context: &VerifyContext<'_>) -> Verdict;
}

/// Evaluates sub-verifiers in order and returns the first failure.
pub struct CompositeVerifier {
    verifiers: Vec<Box<dyn Verifier>>,
}

impl CompositeVerifier {
    pub fn new(verifiers: Vec<Box<dyn Verifier>>) -> Self {
        Self { verifiers }
    }

    /// Build the verifier stack a config asks for.
    pub fn from_config(config: &VerificationConfig, reviewer: Arc<LlmService>) -> Self {
        let mut verifiers: Vec<Box<dyn Verifier>> = Vec::new();
        if config.rules.enabled {
            verifiers.push(Box::new(RuleVerifier));
        }
        if config.llm_review.enabled {
            verifiers.push(Box::new(LlmVerifier::new(
                reviewer,
                config.confidence_threshold,
            )));
        }
        Self::new(verifiers)
    }
}

#[async_trait]
impl Verifier for CompositeVerifier {
    async fn verify(&self, request: &str, response: &str, context: &VerifyContext<'_>) -> Verdict {
        for verifier in &self.verifiers {
            let verdict = verifier.verify(request, response, context).await;
            if !verdict.passed {
                return verdict;
            }
        }
        Verdict::pass()
    }
}

static GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(hi|hello|hey|thanks|thank you|ok|bye)[!.]?$").expect("greeting regex")
});
static APOLOGY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(i'?m sorry|i apologi[sz]e|sorry,|i can'?t\b|i cannot\b|as an ai\b)")
        .expect("apology regex")
});
static CODE_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(write|create|implement|code|function|class|script|program)\b")
        .expect("code-request regex")
});

/// Characters a long response may legitimately end with.
const TERMINATORS: [char; 8] = ['.', '!', '?', '\n', '`', '"', ')', ']'];
const TRUNCATION_LENGTH: usize = 100;
const SHORT_ANSWER_LENGTH: usize = 10;

/// Whether a response should go through verification at all.
pub fn should_verify(user_text: &str, response: &str, config: &VerificationConfig) -> bool {
    if !config.enabled {
        return false;
    }
    if config.skip_for_short_responses
        && response.chars().count() < config.short_response_threshold
    {
        return false;
    }
    if GREETING.is_match(user_text.trim()) {
        return false;
    }
    true
}

/// Deterministic checks: completeness, code-quality, direct-answer.
/// Each fails on first hit with confidence 1.0.
pub struct RuleVerifier;

impl RuleVerifier {
    fn completeness(response: &str) -> Option<Verdict> {
        let stripped = response.trim();
        if stripped.is_empty() {
            return Some(Verdict::fail(
                Rating::Redo,
                "The response is empty. Produce a complete answer.",
            ));
        }
        if APOLOGY.is_match(stripped) {
            return Some(Verdict::fail(
                Rating::NeedsFix,
                "The response opens with an apology or refusal instead of answering.",
            ));
        }
        if response.chars().count() > TRUNCATION_LENGTH
            && response
                .chars()
                .last()
                .is_some_and(|last| !TERMINATORS.contains(&last))
        {
            return Some(Verdict::fail(
                Rating::NeedsFix,
                "The response appears truncated; finish the final sentence.",
            ));
        }
        None
    }

    fn code_quality(request: &str, response: &str) -> Option<Verdict> {
        if CODE_REQUEST.is_match(request) && !response.contains("```") {
            return Some(Verdict::fail(
                Rating::NeedsFix,
                "The request asks for code but the response has no fenced code block.",
            ));
        }
        None
    }

    fn direct_answer(request: &str, response: &str) -> Option<Verdict> {
        if request.trim_end().ends_with('?')
            && response.trim().chars().count() < SHORT_ANSWER_LENGTH
        {
            return Some(Verdict::fail(
                Rating::NeedsFix,
                "The question deserves a substantive answer, not a fragment.",
            ));
        }
        None
    }
}

#[async_trait]
impl Verifier for RuleVerifier {
    async fn verify(&self, request: &str, response: &str, _context: &VerifyContext<'_>) -> Verdict {
        Self::completeness(response)
            .or_else(|| Self::code_quality(request, response))
            .or_else(|| Self::direct_answer(request, response))
            .unwrap_or_else(Verdict::pass)
    }
}

const REVIEWER_SYSTEM_PROMPT: &str = "You are a strict reviewer of assistant responses. \
Judge whether the response fully and correctly addresses the user's request. \
Reply with exactly one JSON object of the form \
{\"rating\": \"GOOD|NEEDS_FIX|REDO\", \"feedback\": \"<what to improve>\", \"confidence\": 0.0-1.0} \
and nothing else.";

/// LLM reviewer. Passes only on `GOOD` with confidence at or above the
/// threshold; any failure of the reviewer itself is a neutral pass.
pub struct LlmVerifier {
    llm: Arc<LlmService>,
    confidence_threshold: f64,
}

impl LlmVerifier {
    pub fn new(llm: Arc<LlmService>, confidence_threshold: f64) -> Self {
        Self {
            llm,
            confidence_threshold,
        }
    }

    fn parse_review(&self, text: &str) -> Option<Verdict> {
        #[derive(Deserialize)]
        struct Review {
            rating: String,
            #[serde(default)]
            feedback: Option<String>,
            #[serde(default)]
            confidence: Option<f64>,
        }

        let object = first_json_object(text)?;
        let review: Review = serde_json::from_str(object).ok()?;
        let rating = Rating::parse(&review.rating)?;
        let confidence = review.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
        let passed = rating == Rating::Good && confidence >= self.confidence_threshold;

        Some(Verdict {
            passed,
            rating,
            feedback: review.feedback.filter(|feedback| !feedback.trim().is_empty()),
            confidence,
        })
    }
}

#[async_trait]
impl Verifier for LlmVerifier {
    async fn verify(&self, request: &str, response: &str, _context: &VerifyContext<'_>) -> Verdict {
        let user = format!("User request:\n{request}\n\nAssistant response:\n{response}");
        match self.llm.complete(REVIEWER_SYSTEM_PROMPT, &user).await {
            Ok(text) => self.parse_review(&text).unwrap_or_else(|| {
                tracing::debug!("llm reviewer returned no parseable verdict");
                Verdict::neutral()
            }),
            Err(error) => {
                tracing::warn!(%error, "llm reviewer call failed");
                Verdict::neutral()
            }
        }
    }
}

/// First balanced JSON object in `text`, honouring string literals.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, character) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match character {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[start..start + index + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
