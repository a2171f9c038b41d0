use serde_json::{Map, Value};

use crate::classify::{Rule, RuleSet};
use crate::document::{self, Resolved};
use crate::error::{Error, Result};
use crate::value::{OrdValue, is_truthy, number_to_value, type_name};

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone)]
pub enum Expression {
    Literal(Value),
    FieldRef(String),
    Document(Vec<(String, Expression)>),
    Array(Vec<Expression>),
    Add(Vec<Expression>),
    Subtract(Box<Expression>, Box<Expression>),
    Multiply(Vec<Expression>),
    Divide(Box<Expression>, Box<Expression>),
    Round {
        input: Box<Expression>,
        places: i32,
    },
    Compare(CompareOp, Box<Expression>, Box<Expression>),
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Not(Box<Expression>),
    Cond {
        condition: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    IfNull(Box<Expression>, Box<Expression>),
    Switch {
        branches: Vec<(Expression, Expression)>,
        default: Box<Expression>,
    },
    Classify {
        input: Box<Expression>,
        rules: RuleSet,
    },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub fn parse_expression(val: &Value) -> Result<Expression> {
    match val {
        Value::String(s) if s.starts_with('$') => {
            let path = &s[1..];
            if path.is_empty() || path.starts_with('$') {
                return Err(Error::InvalidExpression(format!("invalid field path: {s}")));
            }
            Ok(Expression::FieldRef(path.to_string()))
        }
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => {
            if map.len() != 1 {
                return Err(Error::InvalidExpression(
                    "an operator expression must have exactly one key".into(),
                ));
            }
            let Some((op, arg)) = map.iter().next() else {
                return Err(Error::InvalidExpression("empty operator expression".into()));
            };
            parse_operator(op, arg)
        }
        Value::Object(map) => {
            let fields: Result<Vec<_>> = map
                .iter()
                .map(|(k, v)| Ok((k.clone(), parse_expression(v)?)))
                .collect();
            Ok(Expression::Document(fields?))
        }
        Value::Array(items) => {
            let exprs: Result<Vec<_>> = items.iter().map(parse_expression).collect();
            Ok(Expression::Array(exprs?))
        }
        _ => Ok(Expression::Literal(val.clone())),
    }
}

fn args<'a>(op: &str, arg: &'a Value) -> Result<&'a Vec<Value>> {
    arg.as_array()
        .ok_or_else(|| Error::InvalidExpression(format!("{op} requires an array")))
}

fn pair(op: &str, arg: &Value) -> Result<(Box<Expression>, Box<Expression>)> {
    let arr = args(op, arg)?;
    if arr.len() != 2 {
        return Err(Error::InvalidExpression(format!(
            "{op} requires exactly 2 arguments"
        )));
    }
    Ok((
        Box::new(parse_expression(&arr[0])?),
        Box::new(parse_expression(&arr[1])?),
    ))
}

fn list(op: &str, arg: &Value) -> Result<Vec<Expression>> {
    args(op, arg)?.iter().map(parse_expression).collect()
}

fn object<'a>(op: &str, arg: &'a Value) -> Result<&'a Map<String, Value>> {
    arg.as_object()
        .ok_or_else(|| Error::InvalidExpression(format!("{op} requires an object")))
}

fn required<'a>(op: &str, obj: &'a Map<String, Value>, key: &str) -> Result<&'a Value> {
    obj.get(key)
        .ok_or_else(|| Error::InvalidExpression(format!("{op} requires '{key}'")))
}

fn parse_operator(op: &str, arg: &Value) -> Result<Expression> {
    let compare = |cmp: CompareOp| -> Result<Expression> {
        let (a, b) = pair(op, arg)?;
        Ok(Expression::Compare(cmp, a, b))
    };
    match op {
        "$literal" => Ok(Expression::Literal(arg.clone())),
        "$add" => Ok(Expression::Add(list(op, arg)?)),
        "$multiply" => Ok(Expression::Multiply(list(op, arg)?)),
        "$subtract" => {
            let (a, b) = pair(op, arg)?;
            Ok(Expression::Subtract(a, b))
        }
        "$divide" => {
            let (a, b) = pair(op, arg)?;
            Ok(Expression::Divide(a, b))
        }
        "$round" => parse_round(arg),
        "$eq" => compare(CompareOp::Eq),
        "$ne" => compare(CompareOp::Ne),
        "$gt" => compare(CompareOp::Gt),
        "$gte" => compare(CompareOp::Gte),
        "$lt" => compare(CompareOp::Lt),
        "$lte" => compare(CompareOp::Lte),
        "$and" => Ok(Expression::And(list(op, arg)?)),
        "$or" => Ok(Expression::Or(list(op, arg)?)),
        "$not" => {
            let inner = match arg {
                Value::Array(arr) if arr.len() == 1 => parse_expression(&arr[0])?,
                Value::Array(_) => {
                    return Err(Error::InvalidExpression(
                        "$not requires exactly 1 argument".into(),
                    ));
                }
                other => parse_expression(other)?,
            };
            Ok(Expression::Not(Box::new(inner)))
        }
        "$cond" => parse_cond(arg),
        "$ifNull" => {
            let (a, b) = pair(op, arg)?;
            Ok(Expression::IfNull(a, b))
        }
        "$switch" => parse_switch(arg),
        "$classify" => parse_classify(arg),
        _ => Err(Error::InvalidExpression(format!(
            "unsupported expression operator: {op}"
        ))),
    }
}

fn parse_round(arg: &Value) -> Result<Expression> {
    let (input, places) = match arg {
        Value::Array(arr) if arr.len() == 2 => {
            let places = arr[1]
                .as_i64()
                .filter(|p| (-20..=100).contains(p))
                .ok_or_else(|| {
                    Error::InvalidExpression(
                        "$round place must be an integer between -20 and 100".into(),
                    )
                })?;
            (parse_expression(&arr[0])?, places as i32)
        }
        Value::Array(arr) if arr.len() == 1 => (parse_expression(&arr[0])?, 0),
        Value::Array(_) => {
            return Err(Error::InvalidExpression(
                "$round takes 1 or 2 arguments".into(),
            ));
        }
        other => (parse_expression(other)?, 0),
    };
    Ok(Expression::Round {
        input: Box::new(input),
        places,
    })
}

fn parse_cond(arg: &Value) -> Result<Expression> {
    let (c, t, e) = match arg {
        Value::Array(arr) if arr.len() == 3 => (&arr[0], &arr[1], &arr[2]),
        Value::Object(obj) => (
            required("$cond", obj, "if")?,
            required("$cond", obj, "then")?,
            required("$cond", obj, "else")?,
        ),
        _ => {
            return Err(Error::InvalidExpression(
                "$cond requires [if, then, else] or {if, then, else}".into(),
            ));
        }
    };
    Ok(Expression::Cond {
        condition: Box::new(parse_expression(c)?),
        then: Box::new(parse_expression(t)?),
        otherwise: Box::new(parse_expression(e)?),
    })
}

fn parse_switch(arg: &Value) -> Result<Expression> {
    let obj = object("$switch", arg)?;
    let branches_val = args("$switch branches", required("$switch", obj, "branches")?)?;
    let mut branches = Vec::with_capacity(branches_val.len());
    for branch in branches_val {
        let b = object("$switch branch", branch)?;
        branches.push((
            parse_expression(required("$switch branch", b, "case")?)?,
            parse_expression(required("$switch branch", b, "then")?)?,
        ));
    }
    // Requiring a default turns "no branch matched" into a pre-flight error
    // instead of a mid-pipeline one.
    let default = parse_expression(required("$switch", obj, "default")?)?;
    Ok(Expression::Switch {
        branches,
        default: Box::new(default),
    })
}

fn parse_classify(arg: &Value) -> Result<Expression> {
    let obj = object("$classify", arg)?;
    let input = parse_expression(required("$classify", obj, "input")?)?;
    let rules: Vec<Rule> = serde_json::from_value(required("$classify", obj, "rules")?.clone())
        .map_err(|e| Error::InvalidRules(e.to_string()))?;
    let default = required("$classify", obj, "default")?
        .as_str()
        .ok_or_else(|| Error::InvalidRules("$classify default must be a string".into()))?;
    let rules = RuleSet {
        rules,
        default: default.to_string(),
    };
    rules.validate()?;
    Ok(Expression::Classify {
        input: Box::new(input),
        rules,
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Numeric view of an operand: `null` passes through as `None`, anything
/// other than a number is a type error.
pub(crate) fn operand(op: &'static str, v: &Value) -> Result<Option<f64>> {
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        other => Err(Error::TypeMismatch {
            op,
            expected: "number",
            found: type_name(other),
        }),
    }
}

fn round_half_away(x: f64, places: i32) -> f64 {
    if places == 0 {
        return x.round();
    }
    let factor = 10f64.powi(places);
    (x * factor).round() / factor
}

impl Expression {
    pub fn eval(&self, doc: &Value) -> Result<Value> {
        match self {
            Expression::Literal(v) => Ok(v.clone()),
            Expression::FieldRef(path) => Ok(document::resolve(doc, path).to_value()),
            Expression::Document(fields) => {
                let mut map = Map::new();
                for (name, expr) in fields {
                    if let Some(v) = expr.eval_present(doc)? {
                        map.insert(name.clone(), v);
                    }
                }
                Ok(Value::Object(map))
            }
            Expression::Array(items) => {
                let vals: Result<Vec<_>> = items.iter().map(|e| e.eval(doc)).collect();
                Ok(Value::Array(vals?))
            }
            Expression::Add(exprs) => fold_numbers("$add", exprs, doc, 0.0, |acc, n| acc + n),
            Expression::Multiply(exprs) => {
                fold_numbers("$multiply", exprs, doc, 1.0, |acc, n| acc * n)
            }
            Expression::Subtract(a, b) => {
                let a = operand("$subtract", &a.eval(doc)?)?;
                let b = operand("$subtract", &b.eval(doc)?)?;
                Ok(match (a, b) {
                    (Some(a), Some(b)) => number_to_value(a - b),
                    _ => Value::Null,
                })
            }
            Expression::Divide(a, b) => {
                let a = operand("$divide", &a.eval(doc)?)?;
                let b = operand("$divide", &b.eval(doc)?)?;
                Ok(match (a, b) {
                    // A zero denominator yields a ratio of 0 rather than null or NaN.
                    (Some(_), Some(b)) if b == 0.0 => number_to_value(0.0),
                    (Some(a), Some(b)) => number_to_value(a / b),
                    _ => Value::Null,
                })
            }
            Expression::Round { input, places } => {
                Ok(match operand("$round", &input.eval(doc)?)? {
                    Some(n) => number_to_value(round_half_away(n, *places)),
                    None => Value::Null,
                })
            }
            Expression::Compare(op, a, b) => {
                let a = OrdValue::from_json(&a.eval(doc)?);
                let b = OrdValue::from_json(&b.eval(doc)?);
                let result = match op {
                    CompareOp::Eq => a == b,
                    CompareOp::Ne => a != b,
                    CompareOp::Gt => a > b,
                    CompareOp::Gte => a >= b,
                    CompareOp::Lt => a < b,
                    CompareOp::Lte => a <= b,
                };
                Ok(Value::Bool(result))
            }
            Expression::And(exprs) => {
                for e in exprs {
                    if !is_truthy(&e.eval(doc)?) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expression::Or(exprs) => {
                for e in exprs {
                    if is_truthy(&e.eval(doc)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expression::Not(e) => Ok(Value::Bool(!is_truthy(&e.eval(doc)?))),
            Expression::Cond {
                condition,
                then,
                otherwise,
            } => {
                if is_truthy(&condition.eval(doc)?) {
                    then.eval(doc)
                } else {
                    otherwise.eval(doc)
                }
            }
            Expression::IfNull(a, b) => {
                let v = a.eval(doc)?;
                if v.is_null() { b.eval(doc) } else { Ok(v) }
            }
            Expression::Switch { branches, default } => {
                for (case, then) in branches {
                    if is_truthy(&case.eval(doc)?) {
                        return then.eval(doc);
                    }
                }
                default.eval(doc)
            }
            Expression::Classify { input, rules } => {
                let label = match operand("$classify", &input.eval(doc)?)? {
                    Some(n) => rules.classify(n),
                    None => rules.default.as_str(),
                };
                Ok(Value::String(label.to_string()))
            }
        }
    }

    /// Like [`eval`](Self::eval) but reports a bare reference to an absent
    /// field as `None`, so callers can omit the output field entirely.
    pub fn eval_present(&self, doc: &Value) -> Result<Option<Value>> {
        if let Expression::FieldRef(path) = self {
            return Ok(match document::resolve(doc, path) {
                Resolved::Missing => None,
                found => Some(found.to_value()),
            });
        }
        self.eval(doc).map(Some)
    }

    /// Field paths this expression reads.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expression::Literal(_) => {}
            Expression::FieldRef(path) => out.push(path),
            Expression::Document(fields) => {
                fields.iter().for_each(|(_, e)| e.collect_fields(out))
            }
            Expression::Array(exprs)
            | Expression::Add(exprs)
            | Expression::Multiply(exprs)
            | Expression::And(exprs)
            | Expression::Or(exprs) => exprs.iter().for_each(|e| e.collect_fields(out)),
            Expression::Subtract(a, b)
            | Expression::Divide(a, b)
            | Expression::Compare(_, a, b)
            | Expression::IfNull(a, b) => {
                a.collect_fields(out);
                b.collect_fields(out);
            }
            Expression::Round { input, .. } | Expression::Classify { input, .. } => {
                input.collect_fields(out)
            }
            Expression::Not(e) => e.collect_fields(out),
            Expression::Cond {
                condition,
                then,
                otherwise,
            } => {
                condition.collect_fields(out);
                then.collect_fields(out);
                otherwise.collect_fields(out);
            }
            Expression::Switch { branches, default } => {
                for (case, then) in branches {
                    case.collect_fields(out);
                    then.collect_fields(out);
                }
                default.collect_fields(out);
            }
        }
    }
}

fn fold_numbers(
    op: &'static str,
    exprs: &[Expression],
    doc: &Value,
    init: f64,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value> {
    let mut acc = init;
    let mut saw_null = false;
    for e in exprs {
        match operand(op, &e.eval(doc)?)? {
            Some(n) => acc = f(acc, n),
            None => saw_null = true,
        }
    }
    Ok(if saw_null {
        Value::Null
    } else {
        number_to_value(acc)
    })
}
