//! Keyword, regex and semantic rules.
//!
//! Rules run independently of the ML/LLM path, in ascending `position`
//! order, and are purely additive: a match can raise an item's priority or
//! add a category, never lower or replace what the classifier decided.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::models::{FastClassification, Priority};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleType {
    /// Matches when any (or, with `match_all`, every) term occurs in title or content.
    Keyword {
        terms: Vec<String>,
        #[serde(default)]
        match_all: bool,
    },
    /// Case-insensitive regex over title and content.
    Regex { pattern: String },
    /// Matches when the fast classifier scored `category` at or above `min_confidence`.
    Semantic {
        category: String,
        #[serde(default = "default_min_confidence")]
        min_confidence: f64,
    },
}

fn default_min_confidence() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub rule_type: RuleType,
    pub priority: Option<Priority>,
    pub category: Option<String>,
    pub position: i64,
}

/// What a rule sees of an item.
pub struct RuleInput<'a> {
    pub title: &'a str,
    pub content: &'a str,
    pub category_confidences: &'a HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOutcome {
    pub matched: Vec<String>,
    pub priority: Option<Priority>,
    pub categories: Vec<String>,
}

impl RuleOutcome {
    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }

    /// Merge into a classification, only ever raising priority.
    pub fn apply(&self, classification: &mut FastClassification) {
        if let Some(p) = self.priority {
            if p > classification.priority {
                classification.priority = p;
                classification.priority_score =
                    classification.priority_score.max(p.default_score());
            }
        }
        for cat in &self.categories {
            if !classification.categories.contains(cat) {
                classification.categories.push(cat.clone());
            }
        }
    }
}

fn rule_matches(rule: &Rule, input: &RuleInput<'_>) -> bool {
    match &rule.rule_type {
        RuleType::Keyword { terms, match_all } => {
            let haystack = format!("{} {}", input.title, input.content).to_lowercase();
            let mut hits = terms
                .iter()
                .filter(|t| !t.trim().is_empty())
                .map(|t| haystack.contains(&t.to_lowercase()));
            if *match_all {
                !terms.is_empty() && hits.all(|hit| hit)
            } else {
                hits.any(|hit| hit)
            }
        }
        RuleType::Regex { pattern } => {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => re.is_match(input.title) || re.is_match(input.content),
                Err(e) => {
                    warn!(rule = %rule.name, error = %e, "skipping rule with invalid regex");
                    false
                }
            }
        }
        RuleType::Semantic {
            category,
            min_confidence,
        } => input
            .category_confidences
            .get(category)
            .is_some_and(|c| *c >= *min_confidence),
    }
}

/// Evaluate `rules` in position order and fold the matches together.
pub fn evaluate_rules(rules: &[Rule], input: &RuleInput<'_>) -> RuleOutcome {
    let mut ordered: Vec<&Rule> = rules.iter().collect();
    ordered.sort_by_key(|r| (r.position, r.id));

    let mut outcome = RuleOutcome::default();
    for rule in ordered {
        if !rule_matches(rule, input) {
            continue;
        }
        outcome.matched.push(rule.name.clone());
        if let Some(p) = rule.priority {
            outcome.priority = Some(outcome.priority.map_or(p, |cur| cur.max(p)));
        }
        if let Some(cat) = &rule.category {
            if !outcome.categories.contains(cat) {
                outcome.categories.push(cat.clone());
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, rule_type: RuleType, priority: Option<Priority>, category: Option<&str>) -> Rule {
        Rule {
            id,
            name: format!("rule-{}", id),
            rule_type,
            priority,
            category: category.map(str::to_string),
            position: id,
        }
    }

    fn classification(priority: Priority) -> FastClassification {
        FastClassification {
            relevant: true,
            confidence: 0.5,
            priority,
            priority_score: priority.default_score(),
            categories: vec!["policy".to_string()],
            needs_deep_analysis: true,
        }
    }

    #[test]
    fn test_keyword_any_and_all() {
        let empty = HashMap::new();
        let input = RuleInput {
            title: "Grid outage reported",
            content: "Regional blackout",
            category_confidences: &empty,
        };
        let any = rule(
            1,
            RuleType::Keyword {
                terms: vec!["OUTAGE".into(), "flood".into()],
                match_all: false,
            },
            None,
            None,
        );
        let all = rule(
            2,
            RuleType::Keyword {
                terms: vec!["outage".into(), "flood".into()],
                match_all: true,
            },
            None,
            None,
        );
        assert!(rule_matches(&any, &input));
        assert!(!rule_matches(&all, &input));
    }

    #[test]
    fn test_regex_and_invalid_regex() {
        let empty = HashMap::new();
        let input = RuleInput {
            title: "Advisory",
            content: "Fixes cve-2024-12345 in the parser",
            category_confidences: &empty,
        };
        let ok = rule(1, RuleType::Regex { pattern: r"CVE-\d{4}-\d+".into() }, None, None);
        let bad = rule(2, RuleType::Regex { pattern: "(".into() }, None, None);
        assert!(rule_matches(&ok, &input));
        assert!(!rule_matches(&bad, &input));
    }

    #[test]
    fn test_semantic_threshold_inclusive() {
        let mut scores = HashMap::new();
        scores.insert("security".to_string(), 0.6);
        let input = RuleInput {
            title: "",
            content: "",
            category_confidences: &scores,
        };
        let at = rule(
            1,
            RuleType::Semantic {
                category: "security".into(),
                min_confidence: 0.6,
            },
            None,
            None,
        );
        let above = rule(
            2,
            RuleType::Semantic {
                category: "security".into(),
                min_confidence: 0.61,
            },
            None,
            None,
        );
        assert!(rule_matches(&at, &input));
        assert!(!rule_matches(&above, &input));
    }

    #[test]
    fn test_rules_only_raise_priority() {
        let empty = HashMap::new();
        let input = RuleInput {
            title: "outage",
            content: "",
            category_confidences: &empty,
        };
        let rules = vec![
            rule(
                1,
                RuleType::Keyword {
                    terms: vec!["outage".into()],
                    match_all: false,
                },
                Some(Priority::Low),
                Some("infrastructure"),
            ),
            rule(
                2,
                RuleType::Keyword {
                    terms: vec!["outage".into()],
                    match_all: false,
                },
                Some(Priority::Critical),
                None,
            ),
        ];
        let outcome = evaluate_rules(&rules, &input);
        assert_eq!(outcome.matched, vec!["rule-1", "rule-2"]);
        assert_eq!(outcome.priority, Some(Priority::Critical));

        let mut high = classification(Priority::High);
        outcome.apply(&mut high);
        assert_eq!(high.priority, Priority::Critical);
        assert_eq!(high.categories, vec!["policy", "infrastructure"]);

        let low_only = evaluate_rules(&rules[..1], &input);
        let mut medium = classification(Priority::Medium);
        low_only.apply(&mut medium);
        assert_eq!(medium.priority, Priority::Medium);
    }
}
