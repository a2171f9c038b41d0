use std::collections::BTreeSet;

use crate::collection::CollectionProvider;
use crate::document::root_field;
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, ProjectionField, Stage, projection_is_inclusive};

/// Top-level fields known to exist on documents flowing between stages.
///
/// Source documents are schemaless so the shape starts `Open`; stages that
/// rebuild documents (`$group`, inclusive `$project`, `$count`) close it.
#[derive(Debug, Clone)]
enum Shape {
    Open,
    Closed(BTreeSet<String>),
}

impl Shape {
    fn contains(&self, path: &str) -> bool {
        match self {
            Shape::Open => true,
            Shape::Closed(fields) => fields.contains(root_field(path)),
        }
    }

    fn add(&mut self, path: &str) {
        if let Shape::Closed(fields) = self {
            fields.insert(root_field(path).to_string());
        }
    }

    fn describe(&self) -> String {
        match self {
            Shape::Open => String::from("<any>"),
            Shape::Closed(fields) => fields.iter().cloned().collect::<Vec<_>>().join(", "),
        }
    }
}

/// Paths a stage reads from its input documents.
fn reads(stage: &Stage) -> Vec<&str> {
    match stage {
        Stage::Match(query) => query.fields(),
        Stage::Lookup { local_field, .. } => vec![local_field.as_str()],
        Stage::Unwind { path, .. } => vec![path.as_str()],
        Stage::Group { key, accumulators } => {
            let mut out = key.fields();
            for (_, acc) in accumulators {
                if let Some(expr) = acc.expression() {
                    out.extend(expr.fields());
                }
            }
            out
        }
        Stage::AddFields(fields) => fields.iter().flat_map(|(_, e)| e.fields()).collect(),
        Stage::Project(fields) => fields
            .iter()
            .flat_map(|(name, pf)| match pf {
                ProjectionField::Include if name != "_id" => vec![name.as_str()],
                ProjectionField::Compute(e) => e.fields(),
                _ => Vec::new(),
            })
            .collect(),
        Stage::Sort(keys) => keys.iter().map(|(f, _)| f.as_str()).collect(),
        Stage::Collapse { key } => key.fields(),
        Stage::Skip(_) | Stage::Limit(_) | Stage::Count(_) => Vec::new(),
    }
}

/// Shape of the documents a stage emits.
fn next_shape(stage: &Stage, shape: Shape) -> Shape {
    match stage {
        Stage::Group { accumulators, .. } => {
            let mut fields = BTreeSet::from([String::from("_id")]);
            fields.extend(accumulators.iter().map(|(n, _)| n.clone()));
            Shape::Closed(fields)
        }
        Stage::Count(name) => Shape::Closed(BTreeSet::from([name.clone()])),
        Stage::Lookup { as_field, .. } => {
            let mut shape = shape;
            shape.add(as_field);
            shape
        }
        Stage::AddFields(fields) => {
            let mut shape = shape;
            for (name, _) in fields {
                shape.add(name);
            }
            shape
        }
        Stage::Project(fields) if projection_is_inclusive(fields) => {
            let id_excluded = fields
                .iter()
                .any(|(n, pf)| n == "_id" && matches!(pf, ProjectionField::Exclude));
            let mut out = BTreeSet::new();
            if !id_excluded && shape.contains("_id") {
                out.insert(String::from("_id"));
            }
            for (name, pf) in fields {
                match pf {
                    ProjectionField::Exclude => {}
                    ProjectionField::Include if name == "_id" => {}
                    _ => {
                        out.insert(root_field(name).to_string());
                    }
                }
            }
            Shape::Closed(out)
        }
        Stage::Project(fields) => match shape {
            Shape::Open => Shape::Open,
            Shape::Closed(mut set) => {
                for (name, pf) in fields {
                    if matches!(pf, ProjectionField::Exclude) && !name.contains('.') {
                        set.remove(name);
                    }
                }
                Shape::Closed(set)
            }
        },
        _ => shape,
    }
}

/// Reject field references that cannot exist given the stages before them.
pub(crate) fn check_fields(stages: &[Stage]) -> Result<()> {
    let mut shape = Shape::Open;
    for (index, stage) in stages.iter().enumerate() {
        if let Some(missing) = reads(stage).into_iter().find(|p| !shape.contains(p)) {
            return Err(Error::InvalidStage {
                index,
                stage: stage.name(),
                reason: format!(
                    "field '{}' does not exist at this point (available: {})",
                    root_field(missing),
                    shape.describe()
                ),
            });
        }
        shape = next_shape(stage, shape);
    }
    Ok(())
}

/// Ensure the source collection and every `$lookup` target can be resolved.
pub(crate) fn check_collections<P: CollectionProvider + ?Sized>(
    pipeline: &Pipeline,
    source: &str,
    provider: &P,
) -> Result<()> {
    if provider.collection(source).is_none() {
        return Err(Error::CollectionNotFound(source.to_string()));
    }
    for (index, stage) in pipeline.stages().iter().enumerate() {
        if let Stage::Lookup { from, .. } = stage {
            if provider.collection(from).is_none() {
                return Err(Error::InvalidStage {
                    index,
                    stage: stage.name(),
                    reason: Error::CollectionNotFound(from.clone()).to_string(),
                });
            }
        }
    }
    Ok(())
}
