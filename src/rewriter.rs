//! Article rewriting and response parsing.
//!
//! The model is asked for a JSON object, but replies drift: code fences,
//! chatty preambles, Markdown headings, or plain prose. The reply is run
//! through a chain of pure parsers, tried in order until one produces a
//! rewrite that passes [`is_valid`]:
//!
//! 1. [`parse_structured`]: JSON object (bare, fenced or embedded) or
//!    `Title:` / `Body:` labels
//! 2. [`parse_heuristic`]: first line is the title, the rest is the body
//! 3. [`parse_raw`]: the whole reply is the body, the source title is kept
//!
//! If every tier fails the rewrite is a [`RobotError::Generation`].

use crate::api::TextGenerator;
use crate::dedup::article_identifier;
use crate::error::{Result, RobotError};
use crate::models::{Article, ContentScores, DraftArticle, DraftStatus, ParseTier};
use crate::prompts::PromptVariant;
use crate::utils::{looks_truncated, truncate_for_log};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const MAX_TITLE_CHARS: usize = 200;

static FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)```").expect("fence regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Title and body pulled out of a model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRewrite {
    pub title: String,
    pub body: String,
    pub meta_description: Option<String>,
    pub keywords: Vec<String>,
    pub scores: ContentScores,
    pub tier: ParseTier,
}

impl ParsedRewrite {
    fn plain(title: String, body: String, tier: ParseTier) -> Self {
        Self {
            title,
            body,
            meta_description: None,
            keywords: Vec::new(),
            scores: ContentScores::default(),
            tier,
        }
    }
}

type ParserTier = fn(&Article, &str) -> Option<ParsedRewrite>;

const TIERS: [ParserTier; 3] = [parse_structured, parse_heuristic, parse_raw];

fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

fn keywords_field(value: &Value) -> Vec<String> {
    match value.get("keywords").or_else(|| value.get("tags")) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(list)) => list
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn score_field(value: &Value, key: &str) -> Option<u32> {
    let raw = value.get(key)?;
    let score = raw
        .as_f64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))?;
    Some(score.round().clamp(0.0, 100.0) as u32)
}

fn from_json(value: &Value) -> Option<ParsedRewrite> {
    let title = str_field(value, &["title", "headline"])?;
    let body = str_field(value, &["body", "content", "html"])?;
    Some(ParsedRewrite {
        title,
        body,
        meta_description: str_field(value, &["meta_description", "description"]),
        keywords: keywords_field(value),
        scores: ContentScores {
            quality: score_field(value, "quality_score"),
            originality: score_field(value, "originality_score"),
            seo: score_field(value, "seo_score"),
        },
        tier: ParseTier::Structured,
    })
}

fn parse_labelled(text: &str) -> Option<ParsedRewrite> {
    let mut title = None;
    let mut body_start = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim().trim_matches('*').trim();
        let lower = trimmed.to_ascii_lowercase();
        if title.is_none() && lower.starts_with("title:") {
            title = Some(
                trimmed["title:".len()..]
                    .trim_matches('*')
                    .trim()
                    .to_string(),
            );
        } else if title.is_some() && lower.starts_with("body:") {
            let label_at = offset + line.to_ascii_lowercase().find("body:")?;
            body_start = Some(label_at + "body:".len());
            break;
        }
        offset += line.len();
    }
    let title = title.filter(|t| !t.is_empty())?;
    let body = text[body_start?..]
        .trim()
        .trim_start_matches('*')
        .trim()
        .to_string();
    Some(ParsedRewrite::plain(title, body, ParseTier::Structured))
}

/// First JSON object found in the reply: bare, fenced, or embedded in prose.
fn json_object(response: &str) -> Option<Value> {
    let text = response.trim();
    let mut candidates: Vec<String> = vec![text.to_string()];
    if let Some(inner) = FENCED.captures(text).and_then(|c| c.get(1)) {
        candidates.push(inner.as_str().trim().to_string());
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            let object = &text[start..=end];
            candidates.push(object.to_string());
            candidates.push(WHITESPACE.replace_all(object, " ").into_owned());
        }
    }

    for candidate in &candidates {
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) if value.is_object() => return Some(value),
            Ok(_) => {}
            Err(e) if looks_truncated(&e) => {
                debug!(error = %e, "Structured candidate looks truncated");
            }
            Err(_) => {}
        }
    }
    None
}

/// Whether the reply is in the structured format, usable or not.
///
/// The looser tiers must not reinterpret such a reply: a JSON object or a
/// labelled block that failed validation is a failed rewrite, not prose.
fn looks_structured(response: &str) -> bool {
    json_object(response).is_some() || parse_labelled(response.trim()).is_some()
}

/// Strict tier: a JSON object, or explicit `Title:` and `Body:` labels.
pub fn parse_structured(_article: &Article, response: &str) -> Option<ParsedRewrite> {
    match json_object(response) {
        Some(value) => from_json(&value),
        None => parse_labelled(response.trim()),
    }
}

fn clean_title(line: &str) -> String {
    let mut title = line.trim().trim_start_matches('#').trim();
    if title
        .get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("title:"))
    {
        title = title[6..].trim();
    }
    title
        .trim_matches(|c| c == '*' || c == '"' || c == '\'')
        .trim()
        .to_string()
}

/// Loose tier: first non-empty line is a headline-shaped title, the rest is the body.
pub fn parse_heuristic(_article: &Article, response: &str) -> Option<ParsedRewrite> {
    if looks_structured(response) {
        return None;
    }
    let mut lines = response.trim().lines();
    let first = lines.by_ref().find(|l| !l.trim().is_empty())?;
    let title = clean_title(first);
    if title.is_empty() || title.chars().count() > MAX_TITLE_CHARS || title.ends_with('.') {
        return None;
    }
    let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    Some(ParsedRewrite::plain(title, body, ParseTier::Heuristic))
}

/// Last resort: keep the source title and take the reply verbatim.
pub fn parse_raw(article: &Article, response: &str) -> Option<ParsedRewrite> {
    if looks_structured(response) {
        return None;
    }
    Some(ParsedRewrite::plain(
        article.title.trim().to_string(),
        response.trim().to_string(),
        ParseTier::Raw,
    ))
}

/// Non-empty title and body, and a body that does not echo the source text.
pub fn is_valid(parsed: &ParsedRewrite, article: &Article) -> bool {
    let body = parsed.body.trim();
    let source = article.body.trim();
    !parsed.title.trim().is_empty()
        && !body.is_empty()
        && (source.is_empty() || !body.contains(source))
}

/// Run the parser chain and return the first valid result.
///
/// # Errors
///
/// [`RobotError::Generation`] when no tier yields a valid rewrite.
pub fn parse_response(article: &Article, response: &str) -> Result<ParsedRewrite> {
    for tier in TIERS {
        if let Some(parsed) = tier(article, response) {
            if is_valid(&parsed, article) {
                return Ok(parsed);
            }
            debug!(tier = parsed.tier.as_str(), "Parser tier output failed validation");
        }
    }
    Err(RobotError::Generation(format!(
        "no usable rewrite in response: {}",
        truncate_for_log(response.trim(), 120)
    )))
}

pub struct Rewriter {
    generator: Arc<dyn TextGenerator>,
    content_char_limit: usize,
    min_quality_score: Option<u32>,
}

impl Rewriter {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        content_char_limit: usize,
        min_quality_score: Option<u32>,
    ) -> Self {
        Self {
            generator,
            content_char_limit,
            min_quality_score,
        }
    }

    /// Rewrite `article` in the style of `variant`.
    ///
    /// # Returns
    ///
    /// A `pending` [`DraftArticle`] that has not been stored yet.
    ///
    /// # Errors
    ///
    /// [`RobotError::Backend`] if the model could not be reached, and
    /// [`RobotError::Generation`] if its reply is unusable or scored itself
    /// under the configured quality threshold.
    #[instrument(level = "info", skip_all, fields(url = %article.url, variant = %variant.id))]
    pub async fn rewrite(
        &self,
        article: &Article,
        variant: &PromptVariant,
    ) -> Result<DraftArticle> {
        let prompt = variant.render(article, self.content_char_limit);
        let response = self.generator.generate(&prompt).await?;
        debug!(response = %truncate_for_log(&response, 400), "Model reply");

        let parsed = parse_response(article, &response)?;
        if parsed.tier != ParseTier::Structured {
            warn!(
                tier = parsed.tier.as_str(),
                "Model reply was not structured; used fallback parser"
            );
        }
        if let (Some(min), Some(score)) = (self.min_quality_score, parsed.scores.quality) {
            if score < min {
                return Err(RobotError::Generation(format!(
                    "quality score {score} below threshold {min}"
                )));
            }
        }

        let now = Utc::now();
        let draft = DraftArticle {
            id: Uuid::new_v4().to_string(),
            article_id: article_identifier(article),
            source_url: article.url.clone(),
            source_title: article.title.clone(),
            source_feed: article.feed_id.clone(),
            title: parsed.title,
            body: parsed.body,
            meta_description: parsed.meta_description,
            keywords: parsed.keywords,
            variant_id: variant.id.clone(),
            parse_tier: parsed.tier,
            scores: parsed.scores,
            image: None,
            status: DraftStatus::Pending,
            post_id: None,
            reviewer_notes: None,
            reviewed_at: None,
            created_at: now,
            updated_at: now,
        };
        info!(
            draft_id = %draft.id,
            tier = draft.parse_tier.as_str(),
            title = %draft.title,
            "Rewrite complete"
        );
        Ok(draft)
    }
}
