use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::expr::{Expression, parse_expression};
use crate::query::{Query, parse_query};
use crate::validate;

// ---------------------------------------------------------------------------
// Stage parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub enum Accumulator {
    Count,
    Sum(Expression),
    Avg(Expression),
    First(Expression),
}

impl Accumulator {
    pub fn expression(&self) -> Option<&Expression> {
        match self {
            Accumulator::Count => None,
            Accumulator::Sum(e) | Accumulator::Avg(e) | Accumulator::First(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProjectionField {
    Include,
    Exclude,
    Compute(Expression),
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Stage {
    Match(Query),
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
    Unwind {
        path: String,
        /// `None` defers to the engine's configured policy.
        preserve_null: Option<bool>,
    },
    Group {
        key: Expression,
        accumulators: Vec<(String, Accumulator)>,
    },
    AddFields(Vec<(String, Expression)>),
    Project(Vec<(String, ProjectionField)>),
    Sort(Vec<(String, SortOrder)>),
    Skip(u64),
    Limit(u64),
    Count(String),
    /// One document per key, keeping the first document seen for each key.
    Collapse {
        key: Expression,
    },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Lookup { .. } => "$lookup",
            Stage::Unwind { .. } => "$unwind",
            Stage::Group { .. } => "$group",
            Stage::AddFields(_) => "$addFields",
            Stage::Project(_) => "$project",
            Stage::Sort(_) => "$sort",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
            Stage::Count(_) => "$count",
            Stage::Collapse { .. } => "$collapse",
        }
    }

    /// Stages that must see their whole input before emitting anything.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Stage::Group { .. } | Stage::Sort(_) | Stage::Count(_) | Stage::Collapse { .. }
        )
    }
}

/// True when a projection selects fields (as opposed to removing them).
/// `{_id: 1}` on its own selects `_id`.
pub(crate) fn projection_is_inclusive(fields: &[(String, ProjectionField)]) -> bool {
    fields
        .iter()
        .any(|(_, pf)| !matches!(pf, ProjectionField::Exclude))
}

// ---------------------------------------------------------------------------
// Stage parsing helpers
// ---------------------------------------------------------------------------

fn output_name(stage: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('$') {
        return Err(Error::InvalidPipeline(format!(
            "{stage} field name '{name}' must be non-empty and not start with $"
        )));
    }
    Ok(())
}

fn field_path(stage: &str, val: &Value) -> Result<String> {
    match val.as_str() {
        Some(s) if s.starts_with('$') && s.len() > 1 => Ok(s[1..].to_string()),
        _ => Err(Error::InvalidPipeline(format!(
            "{stage} path must be a string starting with $"
        ))),
    }
}

fn parse_accumulator(val: &Value) -> Result<Accumulator> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("accumulator must be an object".into()))?;
    let mut entries = obj.iter();
    let (Some((op, arg)), None) = (entries.next(), entries.next()) else {
        return Err(Error::InvalidPipeline(
            "accumulator must have exactly one operator".into(),
        ));
    };
    match op.as_str() {
        "$sum" => Ok(Accumulator::Sum(parse_expression(arg)?)),
        "$avg" => Ok(Accumulator::Avg(parse_expression(arg)?)),
        "$first" => Ok(Accumulator::First(parse_expression(arg)?)),
        "$count" => {
            if arg.as_object().is_some_and(|m| m.is_empty()) {
                Ok(Accumulator::Count)
            } else {
                Err(Error::InvalidPipeline("$count accumulator takes {}".into()))
            }
        }
        _ => Err(Error::InvalidPipeline(format!("unknown accumulator: {op}"))),
    }
}

fn parse_group_stage(val: &Value) -> Result<Stage> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$group must be an object".into()))?;

    let id_val = obj
        .get("_id")
        .ok_or_else(|| Error::InvalidPipeline("$group requires '_id' field".into()))?;
    let key = parse_expression(id_val)?;

    let mut accumulators = Vec::new();
    for (name, body) in obj {
        if name == "_id" {
            continue;
        }
        output_name("$group", name)?;
        if name.contains('.') {
            return Err(Error::InvalidPipeline(format!(
                "$group output field '{name}' cannot contain '.'"
            )));
        }
        accumulators.push((name.clone(), parse_accumulator(body)?));
    }

    Ok(Stage::Group { key, accumulators })
}

fn parse_sort(val: &Value) -> Result<Vec<(String, SortOrder)>> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$sort must be an object".into()))?;
    if obj.is_empty() {
        return Err(Error::InvalidPipeline("$sort requires at least one key".into()));
    }
    let mut fields = Vec::new();
    for (field, dir) in obj {
        let order = match dir.as_i64() {
            Some(1) => SortOrder::Asc,
            Some(-1) => SortOrder::Desc,
            _ => {
                return Err(Error::InvalidPipeline(
                    "sort direction must be 1 or -1".into(),
                ));
            }
        };
        fields.push((field.clone(), order));
    }
    Ok(fields)
}

fn parse_project(val: &Value) -> Result<Vec<(String, ProjectionField)>> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$project must be an object".into()))?;
    if obj.is_empty() {
        return Err(Error::InvalidPipeline("$project requires at least one field".into()));
    }
    let mut fields = Vec::new();
    for (field, body) in obj {
        output_name("$project", field)?;
        let pf = match body {
            Value::Number(n) if n.as_i64() == Some(1) => ProjectionField::Include,
            Value::Number(n) if n.as_i64() == Some(0) => ProjectionField::Exclude,
            Value::Bool(true) => ProjectionField::Include,
            Value::Bool(false) => ProjectionField::Exclude,
            _ => ProjectionField::Compute(parse_expression(body)?),
        };
        fields.push((field.clone(), pf));
    }

    let inclusive = projection_is_inclusive(&fields);
    let excludes_other = fields
        .iter()
        .any(|(name, pf)| name != "_id" && matches!(pf, ProjectionField::Exclude));
    if inclusive && excludes_other {
        return Err(Error::InvalidPipeline(
            "$project cannot mix inclusion and exclusion (except _id)".into(),
        ));
    }
    Ok(fields)
}

fn parse_unwind(val: &Value) -> Result<(String, Option<bool>)> {
    match val {
        Value::String(_) => Ok((field_path("$unwind", val)?, None)),
        Value::Object(obj) => {
            if let Some(key) = obj
                .keys()
                .find(|k| *k != "path" && *k != "preserveNullAndEmptyArrays")
            {
                return Err(Error::InvalidPipeline(format!(
                    "$unwind option '{key}' is not supported"
                )));
            }
            let path = obj.get("path").ok_or_else(|| {
                Error::InvalidPipeline("$unwind requires 'path' string".into())
            })?;
            let preserve = match obj.get("preserveNullAndEmptyArrays") {
                None => None,
                Some(Value::Bool(b)) => Some(*b),
                Some(_) => {
                    return Err(Error::InvalidPipeline(
                        "preserveNullAndEmptyArrays must be a boolean".into(),
                    ));
                }
            };
            Ok((field_path("$unwind", path)?, preserve))
        }
        _ => Err(Error::InvalidPipeline(
            "$unwind must be a string or object".into(),
        )),
    }
}

fn parse_lookup(val: &Value) -> Result<Stage> {
    let obj = val
        .as_object()
        .ok_or_else(|| Error::InvalidPipeline("$lookup must be an object".into()))?;
    if obj.contains_key("pipeline") || obj.contains_key("let") {
        return Err(Error::InvalidPipeline(
            "$lookup supports equality joins only (from/localField/foreignField/as)".into(),
        ));
    }
    let get = |key: &str| -> Result<String> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidPipeline(format!("$lookup requires '{key}' string")))
    };
    let as_field = get("as")?;
    output_name("$lookup", &as_field)?;
    Ok(Stage::Lookup {
        from: get("from")?,
        local_field: get("localField")?,
        foreign_field: get("foreignField")?,
        as_field,
    })
}

fn parse_count_bound(stage: &str, val: &Value) -> Result<u64> {
    val.as_u64().ok_or_else(|| {
        Error::InvalidPipeline(format!("{stage} must be a non-negative integer, got {val}"))
    })
}

fn parse_stage(stage_name: &str, stage_body: &Value) -> Result<Stage> {
    match stage_name {
        "$match" => Ok(Stage::Match(parse_query(stage_body)?)),
        "$lookup" => parse_lookup(stage_body),
        "$unwind" => {
            let (path, preserve_null) = parse_unwind(stage_body)?;
            Ok(Stage::Unwind {
                path,
                preserve_null,
            })
        }
        "$group" => parse_group_stage(stage_body),
        "$addFields" | "$set" => {
            let obj = stage_body.as_object().ok_or_else(|| {
                Error::InvalidPipeline(format!("{stage_name} must be an object"))
            })?;
            if obj.is_empty() {
                return Err(Error::InvalidPipeline(format!(
                    "{stage_name} requires at least one field"
                )));
            }
            let mut fields = Vec::with_capacity(obj.len());
            for (k, v) in obj {
                output_name(stage_name, k)?;
                fields.push((k.clone(), parse_expression(v)?));
            }
            Ok(Stage::AddFields(fields))
        }
        "$project" => Ok(Stage::Project(parse_project(stage_body)?)),
        "$sort" => Ok(Stage::Sort(parse_sort(stage_body)?)),
        "$skip" => Ok(Stage::Skip(parse_count_bound("$skip", stage_body)?)),
        "$limit" => Ok(Stage::Limit(parse_count_bound("$limit", stage_body)?)),
        "$count" => {
            let field = stage_body
                .as_str()
                .ok_or_else(|| Error::InvalidPipeline("$count must be a string".into()))?;
            output_name("$count", field)?;
            Ok(Stage::Count(field.to_string()))
        }
        "$collapse" => {
            let key = match stage_body {
                Value::Object(obj) => obj.get("by").ok_or_else(|| {
                    Error::InvalidPipeline("$collapse requires 'by'".into())
                })?,
                other => other,
            };
            field_path("$collapse", key)?;
            Ok(Stage::Collapse {
                key: parse_expression(key)?,
            })
        }
        "$out" | "$merge" => Err(Error::InvalidPipeline(format!(
            "{stage_name} is not supported: pipelines never write to collections"
        ))),
        _ => Err(Error::InvalidPipeline(format!("unknown stage: {stage_name}"))),
    }
}

/// Map a stage-level parse error onto the stage position that caused it.
fn at_stage(index: usize, stage: &'static str, err: Error) -> Error {
    let reason = match err {
        Error::InvalidPipeline(msg)
        | Error::InvalidQuery(msg)
        | Error::InvalidExpression(msg)
        | Error::InvalidRules(msg) => msg,
        other => other.to_string(),
    };
    Error::InvalidStage {
        index,
        stage,
        reason,
    }
}

fn static_stage_name(name: &str) -> &'static str {
    match name {
        "$match" => "$match",
        "$lookup" => "$lookup",
        "$unwind" => "$unwind",
        "$group" => "$group",
        "$addFields" => "$addFields",
        "$set" => "$set",
        "$project" => "$project",
        "$sort" => "$sort",
        "$skip" => "$skip",
        "$limit" => "$limit",
        "$count" => "$count",
        "$collapse" => "$collapse",
        _ => "unknown",
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A validated, ordered list of stages.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Parse and validate a JSON pipeline descriptor (an array of one-key stage objects).
    pub fn parse(pipeline_json: &Value) -> Result<Self> {
        let arr = pipeline_json
            .as_array()
            .ok_or_else(|| Error::InvalidPipeline("pipeline must be an array".into()))?;

        let mut stages = Vec::with_capacity(arr.len());
        for (index, stage_val) in arr.iter().enumerate() {
            let obj = stage_val.as_object().ok_or_else(|| Error::InvalidStage {
                index,
                stage: "unknown",
                reason: "each pipeline stage must be an object".into(),
            })?;
            let mut entries = obj.iter();
            let (Some((stage_name, stage_body)), None) = (entries.next(), entries.next()) else {
                return Err(Error::InvalidStage {
                    index,
                    stage: "unknown",
                    reason: "each pipeline stage must have exactly one key".into(),
                });
            };
            let stage = parse_stage(stage_name, stage_body)
                .map_err(|e| at_stage(index, static_stage_name(stage_name), e))?;
            stages.push(stage);
        }

        Self::from_stages(stages)
    }

    /// Build from already-constructed stages, running the same validation as [`parse`](Self::parse).
    pub fn from_stages(stages: Vec<Stage>) -> Result<Self> {
        validate::check_fields(&stages)?;
        Ok(Pipeline { stages })
    }

    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// If the first stage is `$match`, return its query and the index to
    /// continue execution from (1). Otherwise return `(None, 0)`.
    pub fn take_leading_match(&self) -> (Option<&Query>, usize) {
        if let Some(Stage::Match(query)) = self.stages.first() {
            (Some(query), 1)
        } else {
            (None, 0)
        }
    }

    /// Names of every collection joined by a `$lookup` stage.
    pub fn foreign_collections(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter_map(|s| match s {
                Stage::Lookup { from, .. } => Some(from.as_str()),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Incrementally assembles a JSON descriptor; [`build`](Self::build) parses
/// and validates it in one go.
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    stages: Vec<Value>,
}

impl PipelineBuilder {
    /// Append a raw `{"$stage": body}` descriptor.
    pub fn stage(mut self, stage: Value) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn match_query(self, query: Value) -> Self {
        self.stage(json!({ "$match": query }))
    }

    pub fn lookup(self, from: &str, local_field: &str, foreign_field: &str, as_field: &str) -> Self {
        self.stage(json!({ "$lookup": {
            "from": from,
            "localField": local_field,
            "foreignField": foreign_field,
            "as": as_field,
        }}))
    }

    pub fn unwind(self, path: &str) -> Self {
        self.stage(json!({ "$unwind": format!("${path}") }))
    }

    pub fn unwind_preserving(self, path: &str) -> Self {
        self.stage(json!({ "$unwind": {
            "path": format!("${path}"),
            "preserveNullAndEmptyArrays": true,
        }}))
    }

    /// `accumulators` is an object of `name: {"$op": expr}` entries.
    pub fn group(self, key: Value, accumulators: Value) -> Self {
        let mut body = serde_json::Map::new();
        body.insert("_id".into(), key);
        if let Value::Object(accs) = accumulators {
            body.extend(accs);
        }
        self.stage(json!({ "$group": body }))
    }

    pub fn add_fields(self, fields: Value) -> Self {
        self.stage(json!({ "$addFields": fields }))
    }

    pub fn project(self, fields: Value) -> Self {
        self.stage(json!({ "$project": fields }))
    }

    pub fn sort(self, keys: &[(&str, SortOrder)]) -> Self {
        let mut body = serde_json::Map::new();
        for (field, order) in keys {
            let dir = match order {
                SortOrder::Asc => 1,
                SortOrder::Desc => -1,
            };
            body.insert((*field).to_string(), json!(dir));
        }
        self.stage(json!({ "$sort": body }))
    }

    pub fn skip(self, n: u64) -> Self {
        self.stage(json!({ "$skip": n }))
    }

    pub fn limit(self, n: u64) -> Self {
        self.stage(json!({ "$limit": n }))
    }

    pub fn count(self, field: &str) -> Self {
        self.stage(json!({ "$count": field }))
    }

    pub fn collapse(self, key_path: &str) -> Self {
        self.stage(json!({ "$collapse": format!("${key_path}") }))
    }

    pub fn descriptor(&self) -> Value {
        Value::Array(self.stages.clone())
    }

    pub fn build(self) -> Result<Pipeline> {
        Pipeline::parse(&Value::Array(self.stages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_error(pipeline: Value) -> (usize, String) {
        match Pipeline::parse(&pipeline) {
            Err(Error::InvalidStage { index, reason, .. }) => (index, reason),
            other => panic!("expected InvalidStage, got {other:?}"),
        }
    }

    #[test]
    fn parse_empty_pipeline() {
        let p = Pipeline::parse(&json!([])).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn parse_pipeline_not_array_errors() {
        assert!(matches!(
            Pipeline::parse(&json!({"$match": {}})),
            Err(Error::InvalidPipeline(_))
        ));
    }

    #[test]
    fn parse_reports_stage_index() {
        let (index, reason) = stage_error(json!([
            {"$match": {"a": 1}},
            {"$sort": {"a": 1}},
            {"$unknown": {}}
        ]));
        assert_eq!(index, 2);
        assert!(reason.contains("unknown stage"));
    }

    #[test]
    fn parse_stage_shape_errors() {
        assert_eq!(stage_error(json!(["not an object"])).0, 0);
        assert_eq!(stage_error(json!([{"$match": {}, "$sort": {"a": 1}}])).0, 0);
    }

    #[test]
    fn negative_limit_is_invalid() {
        let (index, reason) = stage_error(json!([{"$limit": -1}]));
        assert_eq!(index, 0);
        assert!(reason.contains("non-negative"));
    }

    #[test]
    fn limit_zero_is_valid() {
        assert!(Pipeline::parse(&json!([{"$limit": 0}])).is_ok());
    }

    #[test]
    fn group_validation() {
        stage_error(json!([{"$group": {"total": {"$sum": "$v"}}}]));
        stage_error(json!([{"$group": {"_id": null, "x": {"$badacc": "$v"}}}]));
        stage_error(json!([{"$group": {"_id": null, "x": {"$sum": 1, "$avg": 2}}}]));
        stage_error(json!([{"$group": {"_id": null, "a.b": {"$sum": 1}}}]));
    }

    #[test]
    fn group_accepts_count_forms() {
        let p = Pipeline::parse(&json!([{"$group": {
            "_id": "$business_id",
            "n": {"$count": {}},
            "m": {"$sum": 1}
        }}]))
        .unwrap();
        let Stage::Group { accumulators, .. } = &p.stages()[0] else {
            panic!("expected group");
        };
        assert!(matches!(accumulators[0].1, Accumulator::Count));
        assert!(matches!(accumulators[1].1, Accumulator::Sum(_)));
    }

    #[test]
    fn project_mixing_is_invalid() {
        stage_error(json!([{"$project": {"a": 1, "b": 0}}]));
        assert!(Pipeline::parse(&json!([{"$project": {"_id": 0, "a": 1}}])).is_ok());
        stage_error(json!([{"$project": {"_id": 1, "name": 0}}]));
    }

    #[test]
    fn id_only_projection_is_inclusive() {
        let p = Pipeline::parse(&json!([{"$project": {"_id": 1}}])).unwrap();
        let Stage::Project(fields) = &p.stages()[0] else {
            panic!("expected $project");
        };
        assert!(projection_is_inclusive(fields));

        let p = Pipeline::parse(&json!([{"$project": {"_id": 0}}])).unwrap();
        let Stage::Project(fields) = &p.stages()[0] else {
            panic!("expected $project");
        };
        assert!(!projection_is_inclusive(fields));
    }

    #[test]
    fn lookup_requires_all_fields() {
        let (_, reason) = stage_error(json!([{"$lookup": {"from": "review", "as": "r"}}]));
        assert!(reason.contains("localField"));
        stage_error(json!([{"$lookup": {"from": "review", "pipeline": [], "as": "r"}}]));
    }

    #[test]
    fn unwind_forms() {
        let p = Pipeline::parse(&json!([
            {"$unwind": "$reviews"},
            {"$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true}}
        ]))
        .unwrap();
        assert!(matches!(
            &p.stages()[0],
            Stage::Unwind { path, preserve_null: None } if path == "reviews"
        ));
        assert!(matches!(
            &p.stages()[1],
            Stage::Unwind { preserve_null: Some(true), .. }
        ));
        stage_error(json!([{"$unwind": "reviews"}]));
        stage_error(json!([{"$unwind": {"path": "$a", "includeArrayIndex": "i"}}]));
    }

    #[test]
    fn unsupported_operator_is_a_stage_error() {
        let (index, reason) = stage_error(json!([
            {"$match": {"a": 1}},
            {"$addFields": {"x": {"$pow": ["$a", 2]}}}
        ]));
        assert_eq!(index, 1);
        assert!(reason.contains("$pow"));
    }

    #[test]
    fn out_is_rejected() {
        stage_error(json!([{"$out": "results"}]));
    }

    #[test]
    fn collapse_forms() {
        assert!(Pipeline::parse(&json!([{"$collapse": "$biz.name"}])).is_ok());
        assert!(Pipeline::parse(&json!([{"$collapse": {"by": "$biz.name"}}])).is_ok());
        stage_error(json!([{"$collapse": "biz.name"}]));
    }

    #[test]
    fn leading_match() {
        let p = Pipeline::parse(&json!([{"$match": {"a": 1}}, {"$sort": {"a": 1}}])).unwrap();
        let (leading, start) = p.take_leading_match();
        assert!(leading.is_some());
        assert_eq!(start, 1);

        let p = Pipeline::parse(&json!([{"$sort": {"a": 1}}])).unwrap();
        assert_eq!(p.take_leading_match().1, 0);
    }

    #[test]
    fn builder_produces_same_pipeline_as_json() {
        let built = Pipeline::builder()
            .match_query(json!({"is_open": true}))
            .lookup("review", "business_id", "business_id", "reviews")
            .unwind("reviews")
            .group(json!("$name"), json!({"n": {"$sum": 1}}))
            .sort(&[("n", SortOrder::Desc)])
            .limit(3);
        assert_eq!(
            built.descriptor(),
            json!([
                {"$match": {"is_open": true}},
                {"$lookup": {"from": "review", "localField": "business_id",
                             "foreignField": "business_id", "as": "reviews"}},
                {"$unwind": "$reviews"},
                {"$group": {"_id": "$name", "n": {"$sum": 1}}},
                {"$sort": {"n": -1}},
                {"$limit": 3}
            ])
        );
        let p = built.build().unwrap();
        assert_eq!(p.len(), 6);
        assert_eq!(p.foreign_collections(), vec!["review"]);
    }
}
