//! Preset analytical pipelines over the `business` and `review` collections.
//!
//! Every threshold, category and keyword pattern lives in a params struct with
//! a serde-friendly default, so callers can override any of them from config.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::classify::{Predicate, RuleSet};
use crate::collection::CollectionProvider;
use crate::engine::Engine;
use crate::error::Result;
use crate::pipeline::{Pipeline, SortOrder};

pub const BUSINESS: &str = "business";
pub const REVIEW: &str = "review";

/// `{"$classify": {"input": "$<field>", "rules": [...], "default": ...}}`
fn classify_expression(field: &str, rules: &RuleSet) -> Result<Value> {
    let mut body = serde_json::to_value(rules)?;
    body["input"] = json!(format!("${field}"));
    Ok(json!({ "$classify": body }))
}

fn regex_filter(pattern: &str, case_insensitive: bool) -> Value {
    if case_insensitive {
        json!({ "$regex": pattern, "$options": "i" })
    } else {
        json!({ "$regex": pattern })
    }
}

// ---------------------------------------------------------------------------
// Reputation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationParams {
    pub category: String,
    pub min_stars: f64,
    /// Exclusive lower bound.
    pub min_review_count: u64,
}

impl Default for ReputationParams {
    fn default() -> Self {
        Self {
            category: "Restaurants".into(),
            min_stars: 4.6,
            min_review_count: 500,
        }
    }
}

/// Well-rated, well-reviewed businesses ranked by `round(stars * review_count)`.
pub fn reputation_pipeline(params: &ReputationParams) -> Result<Pipeline> {
    Pipeline::builder()
        .match_query(json!({
            "categories": params.category,
            "stars": { "$gte": params.min_stars },
            "review_count": { "$gt": params.min_review_count },
        }))
        .add_fields(json!({
            "reputationScore": { "$round": [{ "$multiply": ["$stars", "$review_count"] }, 0] }
        }))
        .project(json!({ "_id": 0, "name": 1, "city": 1, "reputationScore": 1 }))
        .sort(&[("reputationScore", SortOrder::Desc)])
        .build()
}

// ---------------------------------------------------------------------------
// Wait complaints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitComplaintParams {
    pub category: String,
    pub open_only: bool,
    pub pattern: String,
    pub case_insensitive: bool,
}

impl Default for WaitComplaintParams {
    fn default() -> Self {
        Self {
            category: "Acupuncture".into(),
            open_only: true,
            pattern: "(wait(ed|ing)?|slow service)".into(),
            case_insensitive: true,
        }
    }
}

/// Count reviews per business whose text matches the wait-related pattern.
pub fn wait_complaints_pipeline(params: &WaitComplaintParams) -> Result<Pipeline> {
    let mut filter = json!({ "categories": params.category });
    if params.open_only {
        filter["is_open"] = json!(true);
    }
    Pipeline::builder()
        .match_query(filter)
        .lookup(REVIEW, "business_id", "business_id", "reviews")
        .unwind("reviews")
        .match_query(json!({
            "reviews.text": regex_filter(&params.pattern, params.case_insensitive)
        }))
        .group(
            json!("$name"),
            json!({
                "city": { "$first": "$city" },
                "waitReviewCount": { "$sum": 1 },
            }),
        )
        .project(json!({ "_id": 0, "businessName": "$_id", "city": 1, "waitReviewCount": 1 }))
        .sort(&[("waitReviewCount", SortOrder::Desc)])
        .build()
}

// ---------------------------------------------------------------------------
// Complaint risk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParams {
    /// Restrict to one category; `None` scores every business.
    pub category: Option<String>,
    pub pattern: String,
    pub case_insensitive: bool,
    pub rules: RuleSet,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            category: None,
            pattern: "(rude|dirty|refund|terrible|worst|wait(ed|ing)?|never again)".into(),
            case_insensitive: true,
            rules: RuleSet::new("low")
                .when(Predicate::Gte(0.25), "high")
                .when(Predicate::Gte(0.10), "medium"),
        }
    }
}

/// Share of a business's reviews that read as complaints, bucketed into a risk level.
pub fn complaint_risk_pipeline(params: &RiskParams) -> Result<Pipeline> {
    let mut builder = Pipeline::builder();
    if let Some(category) = &params.category {
        builder = builder.match_query(json!({ "categories": category }));
    }
    builder
        .lookup(REVIEW, "business_id", "business_id", "reviews")
        .unwind("reviews")
        .match_query(json!({
            "reviews.text": regex_filter(&params.pattern, params.case_insensitive)
        }))
        .group(
            json!("$business_id"),
            json!({
                "name": { "$first": "$name" },
                "city": { "$first": "$city" },
                "review_count": { "$first": "$review_count" },
                "complaints": { "$sum": 1 },
                "avgComplaintStars": { "$avg": "$reviews.stars" },
            }),
        )
        .add_fields(json!({
            "complaintRatio": { "$divide": ["$complaints", "$review_count"] }
        }))
        .add_fields(json!({
            "riskLevel": classify_expression("complaintRatio", &params.rules)?
        }))
        .project(json!({
            "_id": 0,
            "name": 1,
            "city": 1,
            "complaints": 1,
            "avgComplaintStars": 1,
            "complaintRatio": 1,
            "riskLevel": 1,
        }))
        .sort(&[("complaintRatio", SortOrder::Desc)])
        .build()
}

// ---------------------------------------------------------------------------
// Customer experience
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperienceParams {
    pub category: String,
    /// Only businesses classified with this label are reported.
    pub label: String,
    pub one_star: i64,
    pub rules: RuleSet,
}

impl Default for ExperienceParams {
    fn default() -> Self {
        Self {
            category: "Health & Medical".into(),
            label: "Poor".into(),
            one_star: 1,
            rules: RuleSet::new("Poor")
                .when(Predicate::Lte(0.05), "Excellent")
                .when(Predicate::Lte(0.15), "Good")
                .when(Predicate::Lte(0.25), "Fair"),
        }
    }
}

/// One-star review ratio per business, classified and joined back to business details.
pub fn customer_experience_pipeline(params: &ExperienceParams) -> Result<Pipeline> {
    Pipeline::builder()
        .group(
            json!("$business_id"),
            json!({
                "totalReviews": { "$sum": 1 },
                "oneStarReviews": {
                    "$sum": { "$cond": [{ "$eq": ["$stars", params.one_star] }, 1, 0] }
                },
            }),
        )
        .add_fields(json!({
            "oneStarRatio": { "$divide": ["$oneStarReviews", "$totalReviews"] }
        }))
        .add_fields(json!({
            "customerExperience": classify_expression("oneStarRatio", &params.rules)?
        }))
        .lookup(BUSINESS, "_id", "business_id", "biz")
        .unwind("biz")
        .match_query(json!({
            "customerExperience": params.label,
            "biz.categories": params.category,
        }))
        .collapse("biz.name")
        .project(json!({
            "_id": 0,
            "businessName": "$biz.name",
            "city": "$biz.city",
            "oneStarRatio": 1,
            "customerExperience": 1,
        }))
        .sort(&[("oneStarRatio", SortOrder::Desc)])
        .build()
}

// ---------------------------------------------------------------------------
// Task dispatch
// ---------------------------------------------------------------------------

/// A preset pipeline together with its parameters, loadable from JSON as
/// `{"task": "complaint_risk", "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", content = "params", rename_all = "snake_case")]
pub enum Task {
    Reputation(ReputationParams),
    WaitComplaints(WaitComplaintParams),
    ComplaintRisk(RiskParams),
    CustomerExperience(ExperienceParams),
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::Reputation(_) => "reputation",
            Task::WaitComplaints(_) => "wait_complaints",
            Task::ComplaintRisk(_) => "complaint_risk",
            Task::CustomerExperience(_) => "customer_experience",
        }
    }

    /// Collection the pipeline reads from.
    pub fn source(&self) -> &'static str {
        match self {
            Task::CustomerExperience(_) => REVIEW,
            _ => BUSINESS,
        }
    }

    pub fn pipeline(&self) -> Result<Pipeline> {
        match self {
            Task::Reputation(p) => reputation_pipeline(p),
            Task::WaitComplaints(p) => wait_complaints_pipeline(p),
            Task::ComplaintRisk(p) => complaint_risk_pipeline(p),
            Task::CustomerExperience(p) => customer_experience_pipeline(p),
        }
    }

    pub fn run<P: CollectionProvider>(&self, engine: &Engine<P>) -> Result<Vec<Value>> {
        info!(task = self.name(), source = self.source(), "running preset task");
        engine.aggregate(self.source(), &self.pipeline()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipelines_are_valid() {
        for task in [
            Task::Reputation(ReputationParams::default()),
            Task::WaitComplaints(WaitComplaintParams::default()),
            Task::ComplaintRisk(RiskParams::default()),
            Task::CustomerExperience(ExperienceParams::default()),
        ] {
            let pipeline = task.pipeline().unwrap();
            assert!(!pipeline.is_empty(), "{} produced no stages", task.name());
        }
    }

    #[test]
    fn sources() {
        assert_eq!(Task::Reputation(Default::default()).source(), BUSINESS);
        assert_eq!(Task::CustomerExperience(Default::default()).source(), REVIEW);
    }

    #[test]
    fn task_from_json_with_partial_params() {
        let task: Task = serde_json::from_value(json!({
            "task": "reputation",
            "params": {"min_stars": 4.0}
        }))
        .unwrap();
        let Task::Reputation(params) = task else {
            panic!("expected reputation task");
        };
        assert_eq!(params.min_stars, 4.0);
        assert_eq!(params.category, "Restaurants");
    }

    #[test]
    fn custom_rules_reach_the_pipeline() {
        let params = RiskParams {
            rules: RuleSet::new("calm").when(Predicate::Gt(0.9), "alarming"),
            ..Default::default()
        };
        assert!(complaint_risk_pipeline(&params).is_ok());
    }

    #[test]
    fn invalid_rules_are_rejected() {
        let params = ExperienceParams {
            rules: RuleSet::new("x").when(Predicate::Lte(f64::NAN), "y"),
            ..Default::default()
        };
        assert!(customer_experience_pipeline(&params).is_err());
    }

    #[test]
    fn wait_pattern_is_case_insensitive_by_default() {
        let pipeline = wait_complaints_pipeline(&WaitComplaintParams::default()).unwrap();
        assert_eq!(pipeline.foreign_collections(), vec![REVIEW]);
    }
}
