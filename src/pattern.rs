//! Deterministic keyword classifier that picks a cognitive pattern for a task.

use crate::config::{OrchestratorConfig, PatternProfile};
use crate::types::{CognitivePattern, Complexity, OrchestratorError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Confidence reported when no rule matched.
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Ordered rule table; the first matching rule wins.
const RULES: &[(&str, CognitivePattern, &str)] = &[
    ("debugging", CognitivePattern::Convergent, r"debug|fix"),
    ("design", CognitivePattern::Systems, r"design|architect"),
    ("creative", CognitivePattern::Divergent, r"creative|innovat"),
    ("review", CognitivePattern::Critical, r"review|audit"),
    ("research", CognitivePattern::Lateral, r"research|analy[sz]"),
];

/// Result of classifying a task description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub pattern: CognitivePattern,
    pub memory_budget_mb: u32,
    pub expected_accuracy: f64,
    pub confidence: f64,
    /// Name of the rule that fired, `None` for the fallback
    pub matched_rule: Option<String>,
    pub complexity: Complexity,
    pub simd_optimized: bool,
}

#[derive(Debug)]
struct Rule {
    name: &'static str,
    pattern: CognitivePattern,
    matcher: Regex,
}

#[derive(Debug)]
pub struct PatternSelector {
    rules: Vec<Rule>,
    profiles: BTreeMap<CognitivePattern, PatternProfile>,
    confidence: f64,
    fallback: CognitivePattern,
}

impl PatternSelector {
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        let rules = RULES
            .iter()
            .map(|(name, pattern, expr)| {
                let matcher = Regex::new(&format!("(?i){}", expr)).map_err(|e| {
                    OrchestratorError::Config(format!("invalid rule '{}': {}", name, e))
                })?;
                Ok(Rule {
                    name: *name,
                    pattern: *pattern,
                    matcher,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let profiles = CognitivePattern::ALL
            .iter()
            .map(|pattern| (*pattern, config.pattern_profile(*pattern)))
            .collect();

        Ok(Self {
            rules,
            profiles,
            confidence: config.classifier.confidence,
            fallback: CognitivePattern::Convergent,
        })
    }

    pub fn classify(&self, description: &str, complexity: Complexity) -> Classification {
        let matched = self
            .rules
            .iter()
            .find(|rule| rule.matcher.is_match(description));

        let (pattern, matched_rule, confidence) = match matched {
            Some(rule) => (rule.pattern, Some(rule.name.to_string()), self.confidence),
            None => (self.fallback, None, FALLBACK_CONFIDENCE),
        };
        let profile = self
            .profiles
            .get(&pattern)
            .copied()
            .unwrap_or_else(|| OrchestratorConfig::default().pattern_profile(pattern));

        debug!(
            "Classified task as {} (rule: {:?}, complexity: {})",
            pattern, matched_rule, complexity
        );
        Classification {
            pattern,
            memory_budget_mb: profile.memory_budget_mb,
            expected_accuracy: profile.expected_accuracy,
            confidence,
            matched_rule,
            complexity,
            simd_optimized: profile.simd_optimized,
        }
    }
}
