use oxipipe::tasks::{
    self, ExperienceParams, ReputationParams, RiskParams, WaitComplaintParams, BUSINESS, REVIEW,
};
use oxipipe::{Catalog, Collection, Engine, Task};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

fn catalog(businesses: Vec<Value>, reviews: Vec<Value>) -> Catalog {
    Catalog::new()
        .with(Collection::new(BUSINESS, businesses).unwrap())
        .with(Collection::new(REVIEW, reviews).unwrap())
}

fn reviews_for(business_id: &str, count: usize, text: &str, stars: i64) -> Vec<Value> {
    (0..count)
        .map(|_| json!({"business_id": business_id, "text": text, "stars": stars}))
        .collect()
}

#[test]
fn reputation_scenario() {
    let engine = Engine::new(catalog(
        vec![
            json!({"name": "A", "categories": ["Restaurants"], "stars": 4.7, "review_count": 600}),
            json!({"name": "B", "categories": ["Restaurants"], "stars": 4.5, "review_count": 600}),
        ],
        vec![],
    ));
    let out = Task::Reputation(ReputationParams::default())
        .run(&engine)
        .unwrap();
    assert_eq!(out, vec![json!({"name": "A", "reputationScore": 2820})]);
}

#[test]
fn reputation_ranks_descending_and_excludes_low_review_counts() {
    let engine = Engine::new(catalog(
        vec![
            json!({"name": "Small", "city": "Tampa", "categories": ["Restaurants"], "stars": 5.0, "review_count": 500}),
            json!({"name": "Mid", "city": "Reno", "categories": ["Restaurants", "Bars"], "stars": 4.6, "review_count": 700}),
            json!({"name": "Top", "city": "Boise", "categories": ["Restaurants"], "stars": 4.8, "review_count": 1000}),
            json!({"name": "Shop", "city": "Boise", "categories": ["Shopping"], "stars": 5.0, "review_count": 2000}),
        ],
        vec![],
    ));
    let out = engine
        .aggregate(BUSINESS, &tasks::reputation_pipeline(&ReputationParams::default()).unwrap())
        .unwrap();
    assert_eq!(
        out,
        vec![
            json!({"name": "Top", "city": "Boise", "reputationScore": 4800}),
            json!({"name": "Mid", "city": "Reno", "reputationScore": 3220}),
        ]
    );
}

#[test]
fn risk_scenario() {
    let mut reviews = reviews_for("hi", 40, "The staff was rude and it was dirty", 1);
    reviews.extend(reviews_for("hi", 60, "Lovely place", 5));
    reviews.extend(reviews_for("lo", 5, "Terrible service", 2));
    reviews.extend(reviews_for("lo", 95, "Great", 5));

    let engine = Engine::new(catalog(
        vec![
            json!({"business_id": "lo", "name": "Low Risk", "city": "Reno", "review_count": 100}),
            json!({"business_id": "hi", "name": "High Risk", "city": "Tampa", "review_count": 100}),
        ],
        reviews,
    ));
    let out = Task::ComplaintRisk(RiskParams::default())
        .run(&engine)
        .unwrap();
    assert_eq!(
        out,
        vec![
            json!({
                "name": "High Risk",
                "city": "Tampa",
                "complaints": 40,
                "avgComplaintStars": 1,
                "complaintRatio": 0.4,
                "riskLevel": "high"
            }),
            json!({
                "name": "Low Risk",
                "city": "Reno",
                "complaints": 5,
                "avgComplaintStars": 2,
                "complaintRatio": 0.05,
                "riskLevel": "low"
            }),
        ]
    );
}

#[test]
fn risk_zero_review_count_yields_zero_ratio() {
    let engine = Engine::new(catalog(
        vec![json!({"business_id": "b", "name": "Odd", "city": "X", "review_count": 0})],
        reviews_for("b", 1, "worst ever", 1),
    ));
    let out = Task::ComplaintRisk(RiskParams::default())
        .run(&engine)
        .unwrap();
    assert_eq!(out[0]["complaintRatio"], json!(0));
    assert_eq!(out[0]["riskLevel"], "low");
}

#[test]
fn wait_complaints_counts_matching_reviews_per_business() {
    let mut reviews = reviews_for("n", 3, "We WAITED forever", 2);
    reviews.extend(reviews_for("n", 2, "fine", 4));
    reviews.extend(reviews_for("c", 1, "slow service today", 3));
    reviews.extend(reviews_for("closed", 4, "waiting", 1));

    let engine = Engine::new(catalog(
        vec![
            json!({"business_id": "n", "name": "Needle & Flow", "city": "Los Angeles", "is_open": true, "categories": ["Acupuncture"]}),
            json!({"business_id": "c", "name": "Chi Wellness", "city": "Fresno", "is_open": true, "categories": ["Acupuncture", "Health & Medical"]}),
            json!({"business_id": "closed", "name": "Gone", "city": "Fresno", "is_open": false, "categories": ["Acupuncture"]}),
        ],
        reviews,
    ));
    let out = Task::WaitComplaints(WaitComplaintParams::default())
        .run(&engine)
        .unwrap();
    assert_eq!(
        out,
        vec![
            json!({"businessName": "Needle & Flow", "city": "Los Angeles", "waitReviewCount": 3}),
            json!({"businessName": "Chi Wellness", "city": "Fresno", "waitReviewCount": 1}),
        ]
    );
}

#[test]
fn customer_experience_reports_poor_medical_businesses() {
    let mut reviews = Vec::new();
    // 1 of 2 one-star: 0.5, Poor
    reviews.extend(reviews_for("wc", 1, "", 1));
    reviews.extend(reviews_for("wc", 1, "", 5));
    // 3 of 10 one-star: 0.3, Poor
    reviews.extend(reviews_for("sf", 3, "", 1));
    reviews.extend(reviews_for("sf", 7, "", 4));
    // 1 of 20: 0.05, Excellent
    reviews.extend(reviews_for("ok", 1, "", 1));
    reviews.extend(reviews_for("ok", 19, "", 5));
    // Poor but not medical
    reviews.extend(reviews_for("bar", 2, "", 1));

    let engine = Engine::new(catalog(
        vec![
            json!({"business_id": "wc", "name": "WellCare Clinic", "city": "Montecito", "categories": ["Health & Medical"]}),
            json!({"business_id": "sf", "name": "Sunrise Family Practice", "city": "Fresno", "categories": ["Doctors", "Health & Medical"]}),
            json!({"business_id": "ok", "name": "Fine Clinic", "city": "Reno", "categories": ["Health & Medical"]}),
            json!({"business_id": "bar", "name": "Dive Bar", "city": "Reno", "categories": ["Bars"]}),
        ],
        reviews,
    ));
    let out = Task::CustomerExperience(ExperienceParams::default())
        .run(&engine)
        .unwrap();
    assert_eq!(
        out,
        vec![
            json!({"businessName": "WellCare Clinic", "city": "Montecito", "oneStarRatio": 0.5, "customerExperience": "Poor"}),
            json!({"businessName": "Sunrise Family Practice", "city": "Fresno", "oneStarRatio": 0.3, "customerExperience": "Poor"}),
        ]
    );
}

#[test]
fn customer_experience_collapses_duplicate_business_documents() {
    // Two business documents share an id; the join fans out and collapse folds it back.
    let engine = Engine::new(catalog(
        vec![
            json!({"business_id": "d", "name": "Dup Clinic", "city": "A", "categories": ["Health & Medical"]}),
            json!({"business_id": "d", "name": "Dup Clinic", "city": "B", "categories": ["Health & Medical"]}),
        ],
        reviews_for("d", 2, "", 1),
    ));
    let out = Task::CustomerExperience(ExperienceParams::default())
        .run(&engine)
        .unwrap();
    assert_eq!(
        out,
        vec![json!({"businessName": "Dup Clinic", "city": "A", "oneStarRatio": 1, "customerExperience": "Poor"})]
    );
}

#[test]
fn task_loaded_from_json_overrides_thresholds() {
    let task: Task = serde_json::from_value(json!({
        "task": "customer_experience",
        "params": {"label": "Excellent"}
    }))
    .unwrap();
    let engine = Engine::new(catalog(
        vec![json!({"business_id": "ok", "name": "Fine Clinic", "city": "Reno", "categories": ["Health & Medical"]})],
        reviews_for("ok", 3, "", 5),
    ));
    let out = task.run(&engine).unwrap();
    assert_eq!(
        out,
        vec![json!({"businessName": "Fine Clinic", "city": "Reno", "oneStarRatio": 0, "customerExperience": "Excellent"})]
    );
}
