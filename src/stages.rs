use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::collection::Collection;
use crate::document::{self, Resolved};
use crate::error::{Error, Result};
use crate::expr::{Expression, operand};
use crate::pipeline::{Accumulator, ProjectionField, SortOrder, projection_is_inclusive};
use crate::query::{Query, matches_value};
use crate::value::{OrdValue, number_to_value};

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

/// Wall-clock budget for one execution, checked between stages and per document.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub(crate) fn new(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub(crate) fn check(&self) -> Result<()> {
        match self.limit {
            Some(limit) if self.started.elapsed() > limit => Err(Error::Timeout(limit)),
            _ => Ok(()),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

pub(crate) fn exec_match(docs: Vec<Value>, query: &Query, deadline: &Deadline) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        deadline.check()?;
        if matches_value(query, &doc) {
            out.push(doc);
        }
    }
    Ok(out)
}

pub(crate) fn exec_skip(docs: Vec<Value>, n: u64) -> Vec<Value> {
    docs.into_iter().skip(n as usize).collect()
}

pub(crate) fn exec_limit(docs: Vec<Value>, n: u64) -> Vec<Value> {
    docs.into_iter().take(n as usize).collect()
}

pub(crate) fn exec_count(docs: Vec<Value>, field_name: &str) -> Vec<Value> {
    let mut out = Map::new();
    out.insert(field_name.to_string(), Value::from(docs.len() as u64));
    vec![Value::Object(out)]
}

// ---------------------------------------------------------------------------
// Join and fan-out
// ---------------------------------------------------------------------------

/// Equality join. The foreign side is indexed once; each input document gets
/// `as_field` set to the matching foreign documents in their collection order.
pub(crate) fn exec_lookup(
    docs: Vec<Value>,
    foreign: &Collection,
    local_field: &str,
    foreign_field: &str,
    as_field: &str,
    deadline: &Deadline,
) -> Result<Vec<Value>> {
    let mut index: HashMap<OrdValue, Vec<usize>> = HashMap::new();
    for (pos, fdoc) in foreign.docs().iter().enumerate() {
        for key in document::resolve(fdoc, foreign_field).candidates() {
            let slots = index.entry(OrdValue::from_json(key)).or_default();
            if slots.last() != Some(&pos) {
                slots.push(pos);
            }
        }
    }

    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        deadline.check()?;
        let mut hits: Vec<usize> = document::resolve(&doc, local_field)
            .candidates()
            .into_iter()
            .filter_map(|key| index.get(&OrdValue::from_json(key)))
            .flatten()
            .copied()
            .collect();
        hits.sort_unstable();
        hits.dedup();

        let matched: Vec<Value> = hits.iter().map(|&i| foreign.docs()[i].clone()).collect();
        document::set_field(&mut doc, as_field, Value::Array(matched));
        out.push(doc);
    }
    Ok(out)
}

enum UnwindTarget {
    Elements(Vec<Value>),
    Empty,
    Scalar,
}

pub(crate) fn exec_unwind(
    docs: Vec<Value>,
    path: &str,
    preserve_null: bool,
    deadline: &Deadline,
) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        deadline.check()?;
        let target = match document::get_direct(&doc, path) {
            Some(Value::Array(items)) if !items.is_empty() => UnwindTarget::Elements(items.clone()),
            Some(Value::Array(_)) | Some(Value::Null) | None => UnwindTarget::Empty,
            Some(_) => UnwindTarget::Scalar,
        };
        match target {
            UnwindTarget::Elements(items) => {
                for item in items {
                    let mut new_doc = doc.clone();
                    document::set_field(&mut new_doc, path, item);
                    out.push(new_doc);
                }
            }
            UnwindTarget::Empty if preserve_null => out.push(doc),
            UnwindTarget::Empty => {}
            UnwindTarget::Scalar => out.push(doc),
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

enum AccumulatorState {
    Count(u64),
    Sum(f64),
    Avg { sum: f64, count: u64 },
    First(Option<Value>),
}

impl AccumulatorState {
    fn new(acc: &Accumulator) -> Self {
        match acc {
            Accumulator::Count => AccumulatorState::Count(0),
            Accumulator::Sum(_) => AccumulatorState::Sum(0.0),
            Accumulator::Avg(_) => AccumulatorState::Avg { sum: 0.0, count: 0 },
            Accumulator::First(_) => AccumulatorState::First(None),
        }
    }

    fn update(&mut self, acc: &Accumulator, doc: &Value) -> Result<()> {
        match (acc, self) {
            (Accumulator::Count, AccumulatorState::Count(n)) => *n += 1,
            (Accumulator::Sum(expr), AccumulatorState::Sum(s)) => {
                if let Some(n) = operand("$sum", &expr.eval(doc)?)? {
                    *s += n;
                }
            }
            (Accumulator::Avg(expr), AccumulatorState::Avg { sum, count }) => {
                if let Some(n) = operand("$avg", &expr.eval(doc)?)? {
                    *sum += n;
                    *count += 1;
                }
            }
            (Accumulator::First(expr), AccumulatorState::First(current)) => {
                if current.is_none() {
                    *current = Some(expr.eval(doc)?);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Value {
        match self {
            AccumulatorState::Count(n) => Value::from(n),
            AccumulatorState::Sum(s) => number_to_value(s),
            AccumulatorState::Avg { count: 0, .. } => Value::Null,
            AccumulatorState::Avg { sum, count } => number_to_value(sum / count as f64),
            AccumulatorState::First(v) => v.unwrap_or(Value::Null),
        }
    }
}

/// Hash-partition by key. Output groups appear in first-seen key order.
pub(crate) fn exec_group(
    docs: Vec<Value>,
    key: &Expression,
    accumulators: &[(String, Accumulator)],
    max_keys: Option<usize>,
    deadline: &Deadline,
) -> Result<Vec<Value>> {
    let mut slots: HashMap<OrdValue, usize> = HashMap::new();
    let mut groups: Vec<(Value, Vec<AccumulatorState>)> = Vec::new();

    for doc in &docs {
        deadline.check()?;
        let key_val = key.eval(doc)?;
        let ord_key = OrdValue::from_json(&key_val);
        let slot = match slots.get(&ord_key) {
            Some(&slot) => slot,
            None => {
                if let Some(limit) = max_keys {
                    if groups.len() >= limit {
                        return Err(Error::GroupLimitExceeded { limit });
                    }
                }
                let states = accumulators
                    .iter()
                    .map(|(_, acc)| AccumulatorState::new(acc))
                    .collect();
                groups.push((key_val, states));
                slots.insert(ord_key, groups.len() - 1);
                groups.len() - 1
            }
        };

        let (_, states) = &mut groups[slot];
        for ((_, acc), state) in accumulators.iter().zip(states.iter_mut()) {
            state.update(acc, doc)?;
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (key_val, states) in groups {
        let mut result = Map::new();
        result.insert("_id".to_string(), key_val);
        for ((name, _), state) in accumulators.iter().zip(states) {
            result.insert(name.clone(), state.finish());
        }
        out.push(Value::Object(result));
    }
    Ok(out)
}

/// Keep the first document for each distinct key, in input order.
pub(crate) fn exec_collapse(
    docs: Vec<Value>,
    key: &Expression,
    max_keys: Option<usize>,
    deadline: &Deadline,
) -> Result<Vec<Value>> {
    let mut seen: HashSet<OrdValue> = HashSet::new();
    let mut out = Vec::new();
    for doc in docs {
        deadline.check()?;
        let ord_key = OrdValue::from_json(&key.eval(&doc)?);
        if seen.contains(&ord_key) {
            continue;
        }
        if let Some(limit) = max_keys {
            if seen.len() >= limit {
                return Err(Error::GroupLimitExceeded { limit });
            }
        }
        seen.insert(ord_key);
        out.push(doc);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Reshaping
// ---------------------------------------------------------------------------

/// Every expression sees the input document, not fields added earlier in the same stage.
pub(crate) fn exec_add_fields(
    docs: Vec<Value>,
    fields: &[(String, Expression)],
    deadline: &Deadline,
) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        deadline.check()?;
        let computed: Vec<Value> = fields
            .iter()
            .map(|(_, expr)| expr.eval(&doc))
            .collect::<Result<_>>()?;
        for ((name, _), val) in fields.iter().zip(computed) {
            document::set_field(&mut doc, name, val);
        }
        out.push(doc);
    }
    Ok(out)
}

pub(crate) fn exec_project(
    docs: Vec<Value>,
    fields: &[(String, ProjectionField)],
    deadline: &Deadline,
) -> Result<Vec<Value>> {
    let inclusive = projection_is_inclusive(fields);
    let exclude_id = fields
        .iter()
        .any(|(f, pf)| f == "_id" && matches!(pf, ProjectionField::Exclude));

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        deadline.check()?;
        if inclusive {
            let mut result = Value::Object(Map::new());
            if !exclude_id {
                if let Some(id) = doc.get("_id") {
                    document::set_field(&mut result, "_id", id.clone());
                }
            }
            for (field, pf) in fields {
                match pf {
                    ProjectionField::Include => match document::resolve(&doc, field) {
                        Resolved::Missing => {}
                        found => document::set_field(&mut result, field, found.to_value()),
                    },
                    ProjectionField::Compute(expr) => {
                        if let Some(val) = expr.eval_present(&doc)? {
                            document::set_field(&mut result, field, val);
                        }
                    }
                    ProjectionField::Exclude => {}
                }
            }
            out.push(result);
        } else {
            let mut result = doc;
            for (field, pf) in fields {
                if matches!(pf, ProjectionField::Exclude) {
                    document::remove_field(&mut result, field);
                }
            }
            out.push(result);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Stable multi-key sort. Keys are extracted once per document; a missing
/// field sorts as `null`.
pub(crate) fn exec_sort(docs: Vec<Value>, sort_fields: &[(String, SortOrder)]) -> Vec<Value> {
    let mut keyed: Vec<(Vec<OrdValue>, Value)> = docs
        .into_iter()
        .map(|doc| {
            let keys = sort_fields
                .iter()
                .map(|(field, _)| OrdValue::from_json(&document::resolve(&doc, field).to_value()))
                .collect();
            (keys, doc)
        })
        .collect();

    keyed.sort_by(|(a, _), (b, _)| {
        for ((av, bv), (_, order)) in a.iter().zip(b).zip(sort_fields) {
            let cmp = av.cmp(bv);
            let cmp = match order {
                SortOrder::Asc => cmp,
                SortOrder::Desc => cmp.reverse(),
            };
            if cmp != std::cmp::Ordering::Equal {
                return cmp;
            }
        }
        std::cmp::Ordering::Equal
    });
    keyed.into_iter().map(|(_, doc)| doc).collect()
}
