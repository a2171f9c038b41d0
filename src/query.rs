use regex::{Regex, RegexBuilder};
use serde_json::Value as JsonValue;

use crate::document::{self, Resolved};
use crate::error::{Error, Result};
use crate::value::OrdValue;

// ---------------------------------------------------------------------------
// Query AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum QueryOp {
    Eq(OrdValue),
    Ne(OrdValue),
    Gt(OrdValue),
    Gte(OrdValue),
    Lt(OrdValue),
    Lte(OrdValue),
    In(Vec<OrdValue>),
    Nin(Vec<OrdValue>),
    Exists(bool),
    Regex(Regex),
    Not(Vec<QueryOp>),
}

#[derive(Debug, Clone)]
pub enum Query {
    Field { field: String, op: QueryOp },
    And(Vec<Query>),
    Or(Vec<Query>),
    Nor(Vec<Query>),
    Not(Box<Query>),
    All, // match everything
}

// ---------------------------------------------------------------------------
// Parsing: JSON → Query AST
// ---------------------------------------------------------------------------

pub fn parse_query(query: &JsonValue) -> Result<Query> {
    let obj = query
        .as_object()
        .ok_or_else(|| Error::InvalidQuery("query must be a JSON object".into()))?;

    let mut conditions: Vec<Query> = Vec::new();

    for (key, value) in obj {
        match key.as_str() {
            "$and" => conditions.push(Query::And(parse_query_list("$and", value)?)),
            "$or" => conditions.push(Query::Or(parse_query_list("$or", value)?)),
            "$nor" => conditions.push(Query::Nor(parse_query_list("$nor", value)?)),
            "$not" => conditions.push(Query::Not(Box::new(parse_query(value)?))),
            op if op.starts_with('$') => {
                return Err(Error::InvalidQuery(format!("unknown top-level operator: {op}")));
            }
            field => {
                for op in parse_field_condition(value)? {
                    conditions.push(Query::Field {
                        field: field.to_string(),
                        op,
                    });
                }
            }
        }
    }

    match conditions.len() {
        0 => Ok(Query::All),
        1 => Ok(conditions.remove(0)),
        _ => Ok(Query::And(conditions)),
    }
}

fn parse_query_list(op: &str, value: &JsonValue) -> Result<Vec<Query>> {
    let arr = value
        .as_array()
        .ok_or_else(|| Error::InvalidQuery(format!("{op} must be an array")))?;
    if arr.is_empty() {
        return Err(Error::InvalidQuery(format!("{op} must not be empty")));
    }
    arr.iter().map(parse_query).collect()
}

/// Parse the right-hand side of `field: <condition>`.
fn parse_field_condition(value: &JsonValue) -> Result<Vec<QueryOp>> {
    let Some(ops) = value.as_object() else {
        return Ok(vec![QueryOp::Eq(OrdValue::from_json(value))]);
    };
    let operator_keys = ops.keys().filter(|k| k.starts_with('$')).count();
    if operator_keys == 0 {
        // Plain document equality
        return Ok(vec![QueryOp::Eq(OrdValue::from_json(value))]);
    }
    if operator_keys != ops.len() {
        return Err(Error::InvalidQuery(
            "cannot mix operators and plain fields in one condition".into(),
        ));
    }

    let mut parsed = Vec::new();
    if let Some(pattern) = ops.get("$regex") {
        parsed.push(parse_regex(pattern, ops.get("$options"))?);
    } else if ops.contains_key("$options") {
        return Err(Error::InvalidQuery("$options requires $regex".into()));
    }
    for (op_key, op_val) in ops {
        if op_key == "$regex" || op_key == "$options" {
            continue;
        }
        parsed.push(parse_op(op_key, op_val)?);
    }
    Ok(parsed)
}

fn parse_op(op_key: &str, op_val: &JsonValue) -> Result<QueryOp> {
    match op_key {
        "$eq" => Ok(QueryOp::Eq(OrdValue::from_json(op_val))),
        "$ne" => Ok(QueryOp::Ne(OrdValue::from_json(op_val))),
        "$gt" => Ok(QueryOp::Gt(OrdValue::from_json(op_val))),
        "$gte" => Ok(QueryOp::Gte(OrdValue::from_json(op_val))),
        "$lt" => Ok(QueryOp::Lt(OrdValue::from_json(op_val))),
        "$lte" => Ok(QueryOp::Lte(OrdValue::from_json(op_val))),
        "$in" | "$nin" => {
            let arr = op_val
                .as_array()
                .ok_or_else(|| Error::InvalidQuery(format!("{op_key} must be an array")))?;
            let vals = arr.iter().map(OrdValue::from_json).collect();
            Ok(if op_key == "$in" {
                QueryOp::In(vals)
            } else {
                QueryOp::Nin(vals)
            })
        }
        "$exists" => {
            let b = op_val
                .as_bool()
                .ok_or_else(|| Error::InvalidQuery("$exists must be a boolean".into()))?;
            Ok(QueryOp::Exists(b))
        }
        "$not" => {
            let is_operator_object = op_val
                .as_object()
                .is_some_and(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')));
            if !is_operator_object {
                return Err(Error::InvalidQuery("$not must be an operator object".into()));
            }
            Ok(QueryOp::Not(parse_field_condition(op_val)?))
        }
        _ => Err(Error::InvalidQuery(format!("unknown operator: {op_key}"))),
    }
}

fn parse_regex(pattern: &JsonValue, options: Option<&JsonValue>) -> Result<QueryOp> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| Error::InvalidQuery("$regex must be a string".into()))?;
    let options = match options {
        None => "",
        Some(o) => o
            .as_str()
            .ok_or_else(|| Error::InvalidQuery("$options must be a string".into()))?,
    };
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => {
                return Err(Error::InvalidQuery(format!("unsupported regex option: {other}")));
            }
        };
    }
    let re = builder
        .build()
        .map_err(|e| Error::InvalidQuery(format!("invalid regex: {e}")))?;
    Ok(QueryOp::Regex(re))
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a query against a document.
///
/// A field that is absent never satisfies an operator; only `$exists`
/// tests select documents lacking the field. This holds under `$not` and
/// `$nor` too: negating a clause over an absent field does not match.
pub fn matches_value(query: &Query, data: &JsonValue) -> bool {
    match query {
        Query::All => true,
        Query::Field { field, op } => op_matches(op, &document::resolve(data, field)),
        Query::And(subs) => subs.iter().all(|s| matches_value(s, data)),
        Query::Or(subs) => subs.iter().any(|s| matches_value(s, data)),
        Query::Nor(subs) => subs.iter().all(|s| negation_matches(s, data)),
        Query::Not(sub) => negation_matches(sub, data),
    }
}

fn negation_matches(query: &Query, data: &JsonValue) -> bool {
    !reads_absent(query, data) && !matches_value(query, data)
}

/// True when the query applies a value operator to a field the document lacks.
fn reads_absent(query: &Query, data: &JsonValue) -> bool {
    match query {
        Query::All => false,
        Query::Field { field, op } => {
            !exists_only(op) && document::resolve(data, field).is_missing()
        }
        Query::And(subs) | Query::Or(subs) | Query::Nor(subs) => {
            subs.iter().any(|s| reads_absent(s, data))
        }
        Query::Not(sub) => reads_absent(sub, data),
    }
}

fn exists_only(op: &QueryOp) -> bool {
    match op {
        QueryOp::Exists(_) => true,
        QueryOp::Not(ops) => ops.iter().all(exists_only),
        _ => false,
    }
}

fn op_matches(op: &QueryOp, resolved: &Resolved<'_>) -> bool {
    if resolved.is_missing() {
        return match op {
            QueryOp::Exists(expected) => !expected,
            QueryOp::Not(ops) if ops.iter().all(exists_only) => {
                !ops.iter().all(|o| op_matches(o, resolved))
            }
            _ => false,
        };
    }
    let candidates = resolved.candidates();
    match op {
        QueryOp::Exists(expected) => *expected,
        QueryOp::Ne(v) => !candidates.iter().any(|c| OrdValue::from_json(c) == *v),
        QueryOp::Nin(vals) => !candidates
            .iter()
            .any(|c| vals.contains(&OrdValue::from_json(c))),
        QueryOp::Not(ops) => !ops.iter().all(|o| op_matches(o, resolved)),
        _ => candidates.iter().any(|c| scalar_matches(op, c)),
    }
}

fn scalar_matches(op: &QueryOp, value: &JsonValue) -> bool {
    if let QueryOp::Regex(re) = op {
        return value.as_str().is_some_and(|s| re.is_match(s));
    }
    let iv = OrdValue::from_json(value);
    match op {
        QueryOp::Eq(v) => iv == *v,
        QueryOp::Gt(v) => comparable(&iv, v) && iv > *v,
        QueryOp::Gte(v) => comparable(&iv, v) && iv >= *v,
        QueryOp::Lt(v) => comparable(&iv, v) && iv < *v,
        QueryOp::Lte(v) => comparable(&iv, v) && iv <= *v,
        QueryOp::In(vals) => vals.contains(&iv),
        _ => false,
    }
}

/// Range operators only compare values of the same type class, so
/// `{stars: {$gte: 4.6}}` never matches a string.
fn comparable(a: &OrdValue, b: &OrdValue) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
        || (matches!(a, OrdValue::Integer(_) | OrdValue::Float(_))
            && matches!(b, OrdValue::Integer(_) | OrdValue::Float(_)))
}

impl Query {
    /// Field paths this query reads.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Query::All => {}
            Query::Field { field, .. } => out.push(field),
            Query::And(subs) | Query::Or(subs) | Query::Nor(subs) => {
                subs.iter().for_each(|s| s.collect_fields(out))
            }
            Query::Not(sub) => sub.collect_fields(out),
        }
    }
}
