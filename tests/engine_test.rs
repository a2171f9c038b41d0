use std::time::Duration;

use oxipipe::{Catalog, Collection, Engine, EngineConfig, Error, ErrorKind, Pipeline};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

fn businesses(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            json!({
                "business_id": format!("b{i}"),
                "name": format!("Business {}", i % 7),
                "city": (["Tampa", "Reno", "Boise"][i % 3]),
                "stars": (i % 5) as f64 + 0.5,
                "review_count": i * 3,
                "categories": if i % 2 == 0 { json!(["Restaurants"]) } else { json!(["Health & Medical", "Doctors"]) },
            })
        })
        .collect()
}

fn reviews(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            json!({
                "review_id": format!("r{i}"),
                "business_id": format!("b{}", i % 11),
                "stars": (i % 5) + 1,
                "text": if i % 4 == 0 { "we waited an hour" } else { "fine" },
                "date": format!("2023-0{}-1{} 12:00:00", (i % 9) + 1, i % 10),
            })
        })
        .collect()
}

fn catalog() -> Catalog {
    Catalog::new()
        .with(Collection::new("business", businesses(30)).unwrap())
        .with(Collection::new("review", reviews(200)).unwrap())
}

fn mixed_pipeline() -> Value {
    json!([
        {"$match": {"categories": "Health & Medical"}},
        {"$lookup": {"from": "review", "localField": "business_id",
                     "foreignField": "business_id", "as": "reviews"}},
        {"$unwind": "$reviews"},
        {"$group": {
            "_id": "$city",
            "reviews": {"$sum": 1},
            "avgStars": {"$avg": "$reviews.stars"},
            "firstName": {"$first": "$name"}
        }},
        {"$addFields": {"avgStars": {"$round": ["$avgStars", 2]}}},
        {"$sort": {"reviews": -1, "_id": 1}}
    ])
}

#[test]
fn invalid_pipeline_is_rejected_before_execution() {
    let engine = Engine::new(catalog());
    let err = engine
        .aggregate_json("business", &json!([{"$match": {"a": 1}}, {"$bogus": {}}]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.stage_index(), Some(1));
}

#[test]
fn unknown_lookup_collection_is_a_validation_error() {
    let engine = Engine::new(catalog());
    let err = engine
        .aggregate_json(
            "business",
            &json!([{"$lookup": {"from": "users", "localField": "a",
                                 "foreignField": "b", "as": "c"}}]),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("users"));
}

#[test]
fn unknown_source_collection() {
    let engine = Engine::new(catalog());
    let err = engine.aggregate_json("users", &json!([])).unwrap_err();
    assert!(matches!(err, Error::CollectionNotFound(name) if name == "users"));
}

#[test]
fn type_errors_surface_with_stage() {
    let engine = Engine::new(catalog());
    let err = engine
        .aggregate_json(
            "business",
            &json!([{"$group": {"_id": null, "total": {"$sum": "$city"}}}]),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Evaluation);
    assert_eq!(err.stage_index(), Some(0));
    assert!(err.to_string().contains("$sum"));
}

#[test]
fn timeout_aborts_execution() {
    let catalog = Catalog::new()
        .with(Collection::new("business", businesses(20_000)).unwrap())
        .with(Collection::new("review", vec![]).unwrap());
    let engine = Engine::with_config(
        catalog,
        EngineConfig::default().with_timeout(Duration::ZERO),
    );
    let err = engine
        .aggregate_json(
            "business",
            &json!([{"$match": {"name": {"$regex": "business [0-9]", "$options": "i"}}}]),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[test]
fn generous_timeout_does_not_interfere() {
    let engine = Engine::with_config(
        catalog(),
        EngineConfig::default().with_timeout(Duration::from_secs(60)),
    );
    assert!(engine.aggregate_json("business", &mixed_pipeline()).is_ok());
}

#[test]
fn execution_is_deterministic() {
    let engine = Engine::new(catalog());
    let pipeline = Pipeline::parse(&mixed_pipeline()).unwrap();
    let first = engine.aggregate("business", &pipeline).unwrap();
    for _ in 0..5 {
        assert_eq!(engine.aggregate("business", &pipeline).unwrap(), first);
    }
    assert!(!first.is_empty());
}

#[test]
fn concurrent_executions_share_one_engine() {
    let engine = Engine::new(catalog());
    let pipeline = Pipeline::parse(&mixed_pipeline()).unwrap();
    let expected = engine.aggregate("business", &pipeline).unwrap();

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| engine.aggregate("business", &pipeline).unwrap()))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    });
}

#[test]
fn sort_by_date_strings_is_chronological() {
    let engine = Engine::new(
        Catalog::new().with(
            Collection::new(
                "review",
                vec![
                    json!({"id": 1, "date": "2023-10-02 08:00:00"}),
                    json!({"id": 2, "date": "2023-10-02T07:00:00Z"}),
                    json!({"id": 3, "date": "2023-02-15"}),
                ],
            )
            .unwrap(),
        ),
    );
    let out = engine
        .aggregate_json(
            "review",
            &json!([{"$sort": {"date": 1}}, {"$project": {"_id": 0, "id": 1}}]),
        )
        .unwrap();
    let ids: Vec<_> = out.iter().map(|d| d["id"].clone()).collect();
    // Byte order would put id 1 before id 2.
    assert_eq!(ids, vec![json!(3), json!(2), json!(1)]);
}

#[test]
fn skip_limit_and_count() {
    let engine = Engine::new(catalog());
    let out = engine
        .aggregate_json(
            "review",
            &json!([
                {"$match": {"text": {"$regex": "wait"}}},
                {"$sort": {"review_id": 1}},
                {"$skip": 10},
                {"$limit": 5},
                {"$count": "n"}
            ]),
        )
        .unwrap();
    assert_eq!(out, vec![json!({"n": 5})]);

    let empty = engine
        .aggregate_json("review", &json!([{"$match": {"stars": 99}}, {"$count": "n"}]))
        .unwrap();
    assert_eq!(empty, vec![json!({"n": 0})]);
}

#[test]
fn builder_and_json_pipelines_agree() {
    let engine = Engine::new(catalog());
    let built = Pipeline::builder()
        .match_query(json!({"categories": "Health & Medical"}))
        .lookup("review", "business_id", "business_id", "reviews")
        .unwind("reviews")
        .group(
            json!("$city"),
            json!({
                "reviews": {"$sum": 1},
                "avgStars": {"$avg": "$reviews.stars"},
                "firstName": {"$first": "$name"}
            }),
        )
        .add_fields(json!({"avgStars": {"$round": ["$avgStars", 2]}}))
        .sort(&[("reviews", oxipipe::SortOrder::Desc), ("_id", oxipipe::SortOrder::Asc)])
        .build()
        .unwrap();
    assert_eq!(
        engine.aggregate("business", &built).unwrap(),
        engine.aggregate_json("business", &mixed_pipeline()).unwrap()
    );
}

#[test]
fn id_only_projection_returns_ids() {
    let engine = Engine::new(
        Catalog::new().with(
            Collection::new("business", vec![json!({"_id": 7, "name": "A", "city": "X"})]).unwrap(),
        ),
    );
    let out = engine
        .aggregate_json("business", &json!([{"$project": {"_id": 1}}]))
        .unwrap();
    assert_eq!(out, vec![json!({"_id": 7})]);

    let err = engine
        .aggregate_json("business", &json!([{"$project": {"_id": 1, "name": 0}}]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.stage_index(), Some(0));
    assert_eq!(engine.provider().list_collections(), vec!["business".to_string()]);
}
