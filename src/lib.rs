pub mod classify;
pub mod collection;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod expr;
pub mod pipeline;
pub mod query;
mod stages;
pub mod tasks;
mod validate;
pub mod value;

pub use classify::{Predicate, Rule, RuleSet, classify};
pub use collection::{Catalog, Collection, CollectionProvider};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use pipeline::{Pipeline, PipelineBuilder, SortOrder, Stage};
pub use tasks::Task;
