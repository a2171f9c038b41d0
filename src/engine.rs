use serde_json::Value;
use tracing::{debug, info_span, warn};

use crate::collection::CollectionProvider;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, Stage};
use crate::query::matches_value;
use crate::stages::{self, Deadline};
use crate::validate;

/// Runs validated pipelines against the collections of a provider.
///
/// The engine holds no per-run state, so a single instance can serve
/// concurrent executions from several threads when the provider is `Sync`.
#[derive(Debug, Clone)]
pub struct Engine<P> {
    provider: P,
    config: EngineConfig,
}

impl<P: CollectionProvider> Engine<P> {
    pub fn new(provider: P) -> Self {
        Self::with_config(provider, EngineConfig::default())
    }

    pub fn with_config(provider: P, config: EngineConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Parse a JSON descriptor and run it against `source`.
    pub fn aggregate_json(&self, source: &str, pipeline_json: &Value) -> Result<Vec<Value>> {
        let pipeline = Pipeline::parse(pipeline_json)?;
        self.aggregate(source, &pipeline)
    }

    /// Run `pipeline` over the documents of `source`, returning the final
    /// document sequence. Source collections are never modified.
    pub fn aggregate(&self, source: &str, pipeline: &Pipeline) -> Result<Vec<Value>> {
        let span = info_span!("aggregate", source, stages = pipeline.len());
        let _enter = span.enter();

        let result = self.run(source, pipeline);
        if let Err(e) = &result {
            warn!(error = %e, kind = ?e.kind(), stage = ?e.stage_index(), "aggregation failed");
        }
        result
    }

    fn run(&self, source: &str, pipeline: &Pipeline) -> Result<Vec<Value>> {
        validate::check_collections(pipeline, source, &self.provider)?;
        let collection = self
            .provider
            .collection(source)
            .ok_or_else(|| Error::CollectionNotFound(source.to_string()))?;

        let deadline = Deadline::new(self.config.timeout());

        // A leading $match filters the borrowed source so only survivors are cloned.
        let (leading_match, start_idx) = pipeline.take_leading_match();
        let mut current = match leading_match {
            Some(query) => {
                let mut matched = Vec::new();
                for doc in collection.docs() {
                    deadline.check().map_err(|e| at_stage(0, "$match", e))?;
                    if matches_value(query, doc) {
                        matched.push(doc.clone());
                    }
                }
                debug!(
                    index = 0,
                    stage = "$match",
                    docs_in = collection.len(),
                    docs_out = matched.len(),
                    "stage complete"
                );
                matched
            }
            None => collection.docs().to_vec(),
        };

        for (index, stage) in pipeline.stages().iter().enumerate().skip(start_idx) {
            let docs_in = current.len();
            current = deadline
                .check()
                .and_then(|()| self.exec_stage(stage, current, &deadline))
                .map_err(|e| at_stage(index, stage.name(), e))?;
            debug!(
                index,
                stage = stage.name(),
                blocking = stage.is_blocking(),
                docs_in,
                docs_out = current.len(),
                "stage complete"
            );
        }

        debug!(
            elapsed_ms = deadline.elapsed().as_millis() as u64,
            results = current.len(),
            "aggregation complete"
        );
        Ok(current)
    }

    fn exec_stage(&self, stage: &Stage, docs: Vec<Value>, deadline: &Deadline) -> Result<Vec<Value>> {
        let max_keys = self.config.max_group_keys;
        match stage {
            Stage::Match(query) => stages::exec_match(docs, query, deadline),
            Stage::Lookup {
                from,
                local_field,
                foreign_field,
                as_field,
            } => {
                let foreign = self
                    .provider
                    .collection(from)
                    .ok_or_else(|| Error::CollectionNotFound(from.clone()))?;
                stages::exec_lookup(docs, foreign, local_field, foreign_field, as_field, deadline)
            }
            Stage::Unwind {
                path,
                preserve_null,
            } => {
                let preserve = preserve_null.unwrap_or(self.config.preserve_empty_unwind);
                stages::exec_unwind(docs, path, preserve, deadline)
            }
            Stage::Group { key, accumulators } => {
                stages::exec_group(docs, key, accumulators, max_keys, deadline)
            }
            Stage::AddFields(fields) => stages::exec_add_fields(docs, fields, deadline),
            Stage::Project(fields) => stages::exec_project(docs, fields, deadline),
            Stage::Sort(fields) => Ok(stages::exec_sort(docs, fields)),
            Stage::Skip(n) => Ok(stages::exec_skip(docs, *n)),
            Stage::Limit(n) => Ok(stages::exec_limit(docs, *n)),
            Stage::Count(field) => Ok(stages::exec_count(docs, field)),
            Stage::Collapse { key } => stages::exec_collapse(docs, key, max_keys, deadline),
        }
    }
}

fn at_stage(index: usize, stage: &'static str, err: Error) -> Error {
    Error::Stage {
        index,
        stage,
        source: Box::new(err),
    }
}
