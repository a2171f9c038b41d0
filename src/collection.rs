use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};

/// A named, read-only set of documents in insertion order.
///
/// Documents are shared behind an `Arc` so concurrent pipeline executions
/// can read the same snapshot without copying it.
#[derive(Debug, Clone)]
pub struct Collection {
    name: String,
    docs: Arc<Vec<Value>>,
}

impl Collection {
    /// Build a collection, rejecting any document that is not a JSON object.
    pub fn new(name: impl Into<String>, docs: Vec<Value>) -> Result<Self> {
        if docs.iter().any(|d| !d.is_object()) {
            return Err(Error::NotAnObject);
        }
        Ok(Self {
            name: name.into(),
            docs: Arc::new(docs),
        })
    }

    /// Parse a JSON array of documents.
    pub fn from_json_str(name: impl Into<String>, json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        match value {
            Value::Array(docs) => Self::new(name, docs),
            _ => Err(Error::InvalidInput(
                "collection source must be a JSON array".into(),
            )),
        }
    }

    /// Parse newline-delimited JSON (one document per line, blank lines skipped).
    pub fn from_json_lines<R: BufRead>(name: impl Into<String>, reader: R) -> Result<Self> {
        let mut docs = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            docs.push(serde_json::from_str(trimmed)?);
        }
        Self::new(name, docs)
    }

    /// Load a collection from disk. Files ending in `.jsonl` / `.ndjson` are read
    /// line by line; anything else is parsed as a JSON array.
    pub fn load(name: impl Into<String>, path: &Path) -> Result<Self> {
        let line_delimited = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("jsonl") || e.eq_ignore_ascii_case("ndjson"));
        if line_delimited {
            let file = std::fs::File::open(path)?;
            Self::from_json_lines(name, std::io::BufReader::new(file))
        } else {
            let text = std::fs::read_to_string(path)?;
            Self::from_json_str(name, &text)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn docs(&self) -> &[Value] {
        &self.docs
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Supplies collections to the engine by name.
///
/// Connection scoping and lifetime belong to the implementor; the engine only
/// borrows what it is given for the duration of one execution.
pub trait CollectionProvider {
    fn collection(&self, name: &str) -> Option<&Collection>;
}

/// In-memory provider keyed by collection name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    collections: HashMap<String, Collection>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collection under its own name, replacing any previous one.
    pub fn insert(&mut self, collection: Collection) {
        self.collections
            .insert(collection.name().to_string(), collection);
    }

    pub fn with(mut self, collection: Collection) -> Self {
        self.insert(collection);
        self
    }

    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.keys().cloned().collect();
        names.sort();
        names
    }
}

impl CollectionProvider for Catalog {
    fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }
}

impl<P: CollectionProvider + ?Sized> CollectionProvider for &P {
    fn collection(&self, name: &str) -> Option<&Collection> {
        (**self).collection(name)
    }
}
