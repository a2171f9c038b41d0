use serde_json::{Map, Value};

/// Result of resolving a dotted path against a document.
///
/// `Missing` is distinct from a present `null`. Traversing through an array
/// maps the remaining path over each element and yields `Many`.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved<'a> {
    Missing,
    Single(&'a Value),
    Many(Vec<&'a Value>),
}

impl<'a> Resolved<'a> {
    pub fn is_missing(&self) -> bool {
        matches!(self, Resolved::Missing)
    }

    /// Expression-context value: missing becomes `null`, `Many` becomes an array.
    pub fn to_value(&self) -> Value {
        match self {
            Resolved::Missing => Value::Null,
            Resolved::Single(v) => (*v).clone(),
            Resolved::Many(vs) => Value::Array(vs.iter().map(|v| (*v).clone()).collect()),
        }
    }

    /// Candidate values a predicate is tested against: the value itself plus,
    /// for arrays, each element.
    pub fn candidates(&self) -> Vec<&'a Value> {
        match self {
            Resolved::Missing => Vec::new(),
            Resolved::Single(v) => {
                let mut out = vec![*v];
                if let Value::Array(items) = v {
                    out.extend(items.iter());
                }
                out
            }
            Resolved::Many(vs) => vs.clone(),
        }
    }
}

/// Resolve a dotted path (`a.b.c`) with array-of-documents semantics.
pub fn resolve<'a>(doc: &'a Value, path: &str) -> Resolved<'a> {
    let parts: Vec<&str> = path.split('.').collect();
    resolve_parts(doc, &parts)
}

fn resolve_parts<'a>(current: &'a Value, parts: &[&str]) -> Resolved<'a> {
    let Some((head, rest)) = parts.split_first() else {
        return Resolved::Single(current);
    };
    match current {
        Value::Object(map) => match map.get(*head) {
            Some(next) => resolve_parts(next, rest),
            None => Resolved::Missing,
        },
        Value::Array(items) => {
            if let Ok(idx) = head.parse::<usize>() {
                return match items.get(idx) {
                    Some(next) => resolve_parts(next, rest),
                    None => Resolved::Missing,
                };
            }
            let mut found = Vec::new();
            for item in items.iter().filter(|i| i.is_object()) {
                match resolve_parts(item, parts) {
                    Resolved::Missing => {}
                    Resolved::Single(Value::Array(inner)) => found.extend(inner.iter()),
                    Resolved::Single(v) => found.push(v),
                    Resolved::Many(vs) => found.extend(vs),
                }
            }
            if found.is_empty() {
                Resolved::Missing
            } else {
                Resolved::Many(found)
            }
        }
        _ => Resolved::Missing,
    }
}

/// Plain dotted lookup through nested documents only.
pub fn get_direct<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Set a dotted field, creating intermediate documents as needed.
pub fn set_field(doc: &mut Value, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = doc;
    while let Some(part) = parts.next() {
        let Value::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        let entry = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }
}

/// Remove a dotted field. Returns the removed value, if any.
pub fn remove_field(doc: &mut Value, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.as_object_mut()?.shift_remove(path),
        Some((parent, leaf)) => {
            let mut current = doc;
            for part in parent.split('.') {
                current = current.as_object_mut()?.get_mut(part)?;
            }
            current.as_object_mut()?.shift_remove(leaf)
        }
    }
}

/// First segment of a dotted path.
pub fn root_field(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}
