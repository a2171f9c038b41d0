//! Ordered first-match-wins bucketing of a numeric value into labels.
//!
//! A [`RuleSet`] carries no built-in thresholds. Rules are tested in the order
//! given and the first satisfied predicate decides the label; the default
//! label is returned when nothing matches.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Predicate on a single numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Predicate {
    Lt(f64),
    Lte(f64),
    Gt(f64),
    Gte(f64),
    Eq(f64),
    /// Half-open range `[min, max)`.
    Between { min: f64, max: f64 },
}

impl Predicate {
    pub fn test(&self, value: f64) -> bool {
        match *self {
            Predicate::Lt(b) => value < b,
            Predicate::Lte(b) => value <= b,
            Predicate::Gt(b) => value > b,
            Predicate::Gte(b) => value >= b,
            Predicate::Eq(b) => value == b,
            Predicate::Between { min, max } => value >= min && value < max,
        }
    }

    fn bounds(&self) -> Vec<f64> {
        match *self {
            Predicate::Lt(b)
            | Predicate::Lte(b)
            | Predicate::Gt(b)
            | Predicate::Gte(b)
            | Predicate::Eq(b) => vec![b],
            Predicate::Between { min, max } => vec![min, max],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub when: Predicate,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub default: String,
}

/// Return the label of the first rule whose predicate holds, else `default`.
pub fn classify<'a>(value: f64, rules: &'a [Rule], default: &'a str) -> &'a str {
    rules
        .iter()
        .find(|r| r.when.test(value))
        .map_or(default, |r| r.label.as_str())
}

impl RuleSet {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default: default.into(),
        }
    }

    /// Append a rule. Later rules only apply when earlier ones did not match.
    pub fn when(mut self, predicate: Predicate, label: impl Into<String>) -> Self {
        self.rules.push(Rule {
            when: predicate,
            label: label.into(),
        });
        self
    }

    pub fn classify(&self, value: f64) -> &str {
        classify(value, &self.rules, &self.default)
    }

    /// Reject thresholds that can never compare sensibly.
    pub fn validate(&self) -> Result<()> {
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.when.bounds().iter().any(|b| !b.is_finite()) {
                return Err(Error::InvalidRules(format!(
                    "rule {i} ('{}') has a non-finite bound",
                    rule.label
                )));
            }
            if let Predicate::Between { min, max } = rule.when {
                if min > max {
                    return Err(Error::InvalidRules(format!(
                        "rule {i} ('{}') has min {min} greater than max {max}",
                        rule.label
                    )));
                }
            }
        }
        Ok(())
    }

    /// Parse `{"rules": [{"when": {"lte": 0.05}, "label": "Excellent"}], "default": "Poor"}`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let rules: RuleSet = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidRules(e.to_string()))?;
        rules.validate()?;
        Ok(rules)
    }
}
