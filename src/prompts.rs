//! Prompt variants and A/B selection.
//!
//! Five rewriting styles ship with the robot. With A/B testing enabled the
//! [`PromptSelector`] hands them out by rotation or weighted random draw and
//! records, per variant, how many drafts it produced and how reviewers and the
//! CMS treated them. With A/B testing off every article gets the single
//! default style, or the operator's `custom_prompt`.
//!
//! Templates use four placeholders: `{title}`, `{source}`, `{url}` and
//! `{content}`.

use crate::config::{RobotConfig, SelectionPolicyKind};
use crate::error::Result;
use crate::models::{Article, ContentScores, Outcome, PromptVariantStat};
use crate::store::RecordStore;
use rand::{Rng, rng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

pub const DEFAULT_VARIANT_ID: &str = "default";
pub const CUSTOM_VARIANT_ID: &str = "custom";

/// Minimum uses before a variant is eligible as "best".
pub const BEST_VARIANT_MIN_USES: u64 = 5;

const ARTICLE_BLOCK: &str =
    "SOURCE ARTICLE\nTitle: {title}\nSource: {source}\nURL: {url}\nContent:\n{content}";

const OUTPUT_FORMAT: &str = r#"Write an original article in English; do not copy sentences from the source.
Reply with a single JSON object and nothing else:
{
  "title": "...",
  "meta_description": "at most 160 characters",
  "body": "<h2>...</h2><p>...</p>",
  "keywords": ["...", "..."],
  "quality_score": 0,
  "originality_score": 0,
  "seo_score": 0
}
Rate your own article from 0 to 100 in each *_score field."#;

const STYLES: &[(&str, &str, &str)] = &[
    (
        "journalistic",
        "Journalistic",
        "You are an award-winning business journalist writing for professional readers.\n\
         Style: formal, investigative, data-driven. Tone: neutral and analytical.\n\
         Structure: a strong lead (who, what, when, where, why), context, expert analysis, \
         figures, and grounded projections. No personal opinion; cite the original source.",
    ),
    (
        "casual",
        "Casual",
        "You are a creator who explains the news to a general audience.\n\
         Style: conversational storytelling. Tone: friendly and upbeat.\n\
         Open with a hook, explain jargon with everyday analogies, give practical takeaways, \
         and close on an encouraging note.",
    ),
    (
        "viral",
        "Viral",
        "You write highly shareable news pieces for social media audiences.\n\
         Style: punchy, short paragraphs, curiosity-driven headline without clickbait lies.\n\
         Lead with the most surprising fact and end with a question that invites discussion.",
    ),
    (
        "seo",
        "SEO",
        "You are an SEO editor producing search-optimised news articles.\n\
         Use a keyword-rich title under 60 characters, descriptive <h2> subheadings, \
         short paragraphs, and a meta description that states the main fact. \
         Repeat the primary keyword naturally in the first paragraph.",
    ),
    (
        "deep_analysis",
        "Deep analysis",
        "You are a senior analyst writing a long-form explainer.\n\
         Cover background, causes, stakeholders, second-order effects, and what to watch next. \
         Weigh competing interpretations and flag what remains uncertain.",
    ),
];

const DEFAULT_STYLE: &str = "You are a news editor. Rewrite the article below as a clear, \
     accurate and original piece for a general audience, keeping every fact and figure intact.";

#[derive(Debug, Clone, PartialEq)]
pub struct PromptVariant {
    pub id: String,
    pub name: String,
    pub template: String,
}

impl PromptVariant {
    fn from_style(id: &str, name: &str, style: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            template: format!("{style}\n\n{ARTICLE_BLOCK}\n\n{OUTPUT_FORMAT}"),
        }
    }

    /// Fill the placeholders for `article`, clipping its body to `content_limit` characters.
    pub fn render(&self, article: &Article, content_limit: usize) -> String {
        let content: String = article.body.chars().take(content_limit).collect();
        self.template
            .replace("{title}", &article.title)
            .replace("{source}", &article.feed_id)
            .replace("{url}", &article.url)
            .replace("{content}", &content)
    }
}

/// The five built-in A/B variants.
pub fn builtin_variants() -> Vec<PromptVariant> {
    STYLES
        .iter()
        .map(|(id, name, style)| PromptVariant::from_style(id, name, style))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionPolicy {
    RoundRobin,
    /// One weight per variant, same order as the variant list.
    Weighted(Vec<u32>),
}

/// Map `roll` in `0..sum(weights)` onto an index.
fn pick_weighted(weights: &[u32], roll: u64) -> usize {
    let mut acc = 0u64;
    for (i, w) in weights.iter().enumerate() {
        acc += u64::from(*w);
        if roll < acc {
            return i;
        }
    }
    weights.len().saturating_sub(1)
}

pub struct PromptSelector {
    variants: Vec<PromptVariant>,
    default: PromptVariant,
    ab_enabled: bool,
    policy: SelectionPolicy,
    cursor: AtomicUsize,
    store: Arc<dyn RecordStore>,
}

impl PromptSelector {
    pub fn from_config(config: &RobotConfig, store: Arc<dyn RecordStore>) -> Self {
        let variants = builtin_variants();
        let default = match &config.custom_prompt {
            Some(template) => PromptVariant {
                id: CUSTOM_VARIANT_ID.to_string(),
                name: "Custom".to_string(),
                template: template.clone(),
            },
            None => PromptVariant::from_style(DEFAULT_VARIANT_ID, "Default", DEFAULT_STYLE),
        };
        let policy = match config.selection_policy {
            SelectionPolicyKind::RoundRobin => SelectionPolicy::RoundRobin,
            SelectionPolicyKind::Weighted => SelectionPolicy::Weighted(
                variants
                    .iter()
                    .map(|v| config.variant_weights.get(&v.id).copied().unwrap_or(1))
                    .collect(),
            ),
        };
        Self {
            variants,
            default,
            ab_enabled: config.ab_testing,
            policy,
            cursor: AtomicUsize::new(0),
            store,
        }
    }

    pub fn ab_enabled(&self) -> bool {
        self.ab_enabled
    }

    /// Choose the style for the next article.
    pub fn select_style(&self) -> &PromptVariant {
        if !self.ab_enabled || self.variants.is_empty() {
            return &self.default;
        }
        let index = match &self.policy {
            SelectionPolicy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % self.variants.len()
            }
            SelectionPolicy::Weighted(weights) => {
                let total: u64 = weights.iter().map(|w| u64::from(*w)).sum();
                if total == 0 {
                    0
                } else {
                    pick_weighted(weights, rng().random_range(0..total))
                }
            }
        };
        let variant = &self.variants[index];
        debug!(variant = %variant.id, "Selected prompt variant");
        variant
    }

    /// Count a draft created with `variant_id`, folding in its scores.
    pub async fn record_use(&self, variant_id: &str, scores: &ContentScores) -> Result<()> {
        self.store.record_variant_use(variant_id, scores).await
    }

    pub async fn record_outcome(&self, variant_id: &str, outcome: Outcome) -> Result<()> {
        self.store.record_variant_outcome(variant_id, outcome).await
    }

    /// Snapshot of every variant's counters. Read-only.
    pub async fn get_stats(&self) -> Result<BTreeMap<String, PromptVariantStat>> {
        Ok(self
            .store
            .variant_stats()
            .await?
            .into_iter()
            .map(|s| (s.variant_id.clone(), s))
            .collect())
    }

    /// Best-performing variant among those used at least `min_uses` times.
    ///
    /// Ranked by [`PromptVariantStat::performance_score`]; ties go to the
    /// variant with more uses.
    pub async fn best_variant(&self, min_uses: u64) -> Result<Option<PromptVariantStat>> {
        Ok(self
            .store
            .variant_stats()
            .await?
            .into_iter()
            .filter(|s| s.uses >= min_uses)
            .max_by(|a, b| {
                a.performance_score()
                    .total_cmp(&b.performance_score())
                    .then(a.uses.cmp(&b.uses))
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::sample_article;

    fn selector(config: RobotConfig) -> PromptSelector {
        PromptSelector::from_config(&config, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_five_distinct_variants() {
        let variants = builtin_variants();
        assert_eq!(variants.len(), 5);
        let ids: Vec<&str> = variants.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, ["journalistic", "casual", "viral", "seo", "deep_analysis"]);
    }

    #[test]
    fn test_disabled_ab_always_returns_default() {
        let s = selector(RobotConfig::default());
        for _ in 0..10 {
            assert_eq!(s.select_style().id, DEFAULT_VARIANT_ID);
        }
    }

    #[test]
    fn test_custom_prompt_replaces_default() {
        let s = selector(RobotConfig {
            custom_prompt: Some("Rewrite: {title}".into()),
            ..RobotConfig::default()
        });
        let variant = s.select_style();
        assert_eq!(variant.id, CUSTOM_VARIANT_ID);
        let article = sample_article("https://x.com/a");
        assert_eq!(
            variant.render(&article, 100),
            format!("Rewrite: {}", article.title)
        );
    }

    #[test]
    fn test_round_robin_cycles_all_variants() {
        let s = selector(RobotConfig {
            ab_testing: true,
            ..RobotConfig::default()
        });
        let picked: Vec<String> = (0..10).map(|_| s.select_style().id.clone()).collect();
        assert_eq!(picked[0], "journalistic");
        assert_eq!(picked[4], "deep_analysis");
        assert_eq!(picked[5], "journalistic");
        assert_eq!(picked[..5], picked[5..]);
    }

    #[test]
    fn test_weighted_zero_weight_never_chosen() {
        let mut weights = BTreeMap::new();
        for id in ["journalistic", "casual", "viral", "deep_analysis"] {
            weights.insert(id.to_string(), 0);
        }
        let s = selector(RobotConfig {
            ab_testing: true,
            selection_policy: SelectionPolicyKind::Weighted,
            variant_weights: weights,
            ..RobotConfig::default()
        });
        for _ in 0..20 {
            assert_eq!(s.select_style().id, "seo");
        }
    }

    #[test]
    fn test_pick_weighted_boundaries() {
        let weights = [2, 0, 3];
        assert_eq!(pick_weighted(&weights, 0), 0);
        assert_eq!(pick_weighted(&weights, 1), 0);
        assert_eq!(pick_weighted(&weights, 2), 2);
        assert_eq!(pick_weighted(&weights, 4), 2);
    }

    #[test]
    fn test_render_clips_content() {
        let variant = &builtin_variants()[0];
        let mut article = sample_article("https://x.com/a");
        article.body = "é".repeat(50);
        let prompt = variant.render(&article, 10);
        assert!(prompt.contains(&"é".repeat(10)));
        assert!(!prompt.contains(&"é".repeat(11)));
        assert!(prompt.contains("https://x.com/a"));
        assert!(!prompt.contains("{content}"));
    }

    #[tokio::test]
    async fn test_best_variant_requires_min_uses() {
        let store = Arc::new(MemoryStore::new());
        let s = PromptSelector::from_config(&RobotConfig::default(), store.clone());

        let none = ContentScores::default();
        for _ in 0..5 {
            s.record_use("seo", &none).await.unwrap();
        }
        s.record_outcome("seo", Outcome::Approved).await.unwrap();
        s.record_outcome("seo", Outcome::Rejected).await.unwrap();

        s.record_use("viral", &none).await.unwrap();
        s.record_outcome("viral", Outcome::Approved).await.unwrap();

        let best = s.best_variant(BEST_VARIANT_MIN_USES).await.unwrap().unwrap();
        assert_eq!(best.variant_id, "seo");
        assert!(s.best_variant(6).await.unwrap().is_none());

        let stats = s.get_stats().await.unwrap();
        assert_eq!(stats["viral"].approvals, 1);
        assert_eq!(stats["seo"].uses, 5);
    }

    #[tokio::test]
    async fn test_best_variant_weighs_scores() {
        let store = Arc::new(MemoryStore::new());
        let s = PromptSelector::from_config(&RobotConfig::default(), store.clone());

        let low = ContentScores {
            quality: Some(40),
            originality: Some(40),
            seo: Some(40),
        };
        let high = ContentScores {
            quality: Some(90),
            originality: Some(85),
            seo: Some(80),
        };
        for _ in 0..5 {
            s.record_use("casual", &low).await.unwrap();
            s.record_use("seo", &high).await.unwrap();
        }
        for id in ["casual", "seo"] {
            s.record_outcome(id, Outcome::Approved).await.unwrap();
        }

        let best = s.best_variant(BEST_VARIANT_MIN_USES).await.unwrap().unwrap();
        assert_eq!(best.variant_id, "seo");
        assert_eq!(best.avg_quality(), Some(90.0));
    }
}
