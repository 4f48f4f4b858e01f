//! Processing pipeline
//!
//! schema + trace -> assembled tables -> causal and ordering edges -> optional
//! label filter. [`run`] spreads the independent steps over tokio's blocking
//! pool; [`process`] does the same work on the caller's thread.

use std::path::Path;
use std::sync::Arc;

use trace_types::{Anomaly, DependencyEdge};

use crate::assembler::{AssembledTrace, AssemblerOptions, TraceAssembler, TraceTables};
use crate::config::Config;
use crate::dependencies::{DependencyResolver, Resolution};
use crate::event_stream::{self, RawEvent, StreamError};
use crate::filter::{self, FilterError, LabelFilter};
use crate::labels::LabelRegistry;
use crate::schema::{SchemaError, SchemaIndex};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    pub assembler: AssemblerOptions,
    pub include: Option<String>,
    pub exclude: Option<String>,
    pub causal_edges: bool,
    pub ordering_edges: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            assembler: AssemblerOptions::default(),
            include: None,
            exclude: None,
            causal_edges: true,
            ordering_edges: true,
        }
    }
}

impl From<&Config> for ProcessOptions {
    fn from(config: &Config) -> Self {
        Self {
            assembler: AssemblerOptions {
                emit_unmatched_starts: config.emit_unmatched_starts,
            },
            include: config.include.clone(),
            exclude: config.exclude.clone(),
            causal_edges: config.causal_edges,
            ordering_edges: config.ordering_edges,
        }
    }
}

impl ProcessOptions {
    fn filter(&self) -> Result<Option<LabelFilter>, FilterError> {
        LabelFilter::from_patterns(self.include.as_deref(), self.exclude.as_deref())
    }
}

/// Everything one run produced, before report serialization
#[derive(Debug, Clone, Default)]
pub struct ProcessedTrace {
    pub main_reactor: String,
    pub tables: TraceTables,
    pub labels: LabelRegistry,
    pub causal_edges: Vec<DependencyEdge>,
    pub ordering_edges: Vec<DependencyEdge>,
    /// Assembly anomalies first, then causal-chain anomalies
    pub anomalies: Vec<Anomaly>,
}

/// Runs every step on the current thread.
pub fn process<I>(
    schema: &SchemaIndex,
    events: I,
    options: &ProcessOptions,
) -> Result<ProcessedTrace, PipelineError>
where
    I: IntoIterator<Item = Result<RawEvent, StreamError>>,
{
    let filter = options.filter()?;
    let assembled = TraceAssembler::assemble(schema, options.assembler, events)?;

    let resolver = DependencyResolver::new(schema, &assembled.tables);
    let causal = if options.causal_edges {
        resolver.causal_edges()
    } else {
        Resolution::default()
    };
    let ordering = if options.ordering_edges {
        resolver.ordering_edges()
    } else {
        Vec::new()
    };

    Ok(finalize(
        schema.main_reactor().to_string(),
        assembled,
        causal,
        ordering,
        filter.as_ref(),
    ))
}

/// Loads both inputs from disk and calls [`process`].
pub fn process_files(
    schema_path: &Path,
    trace_path: &Path,
    options: &ProcessOptions,
) -> Result<ProcessedTrace, PipelineError> {
    let schema = SchemaIndex::load(schema_path)?;
    let stream = event_stream::open(trace_path)?;
    process(&schema, stream, options)
}

/// Async pipeline: schema load and stream open run concurrently, assembly is
/// one sequential task, and the two edge passes run concurrently over shared tables.
pub async fn run(config: &Config) -> Result<ProcessedTrace, PipelineError> {
    let options = ProcessOptions::from(config);
    let filter = options.filter()?;

    let schema_path = config.schema.clone();
    let trace_path = config.trace.clone();
    let (schema, stream) = tokio::join!(
        tokio::task::spawn_blocking(move || SchemaIndex::load(&schema_path)),
        tokio::task::spawn_blocking(move || event_stream::open(&trace_path)),
    );
    let schema = Arc::new(schema??);
    let stream = stream??;

    let assembler_options = options.assembler;
    let assembled = {
        let schema = Arc::clone(&schema);
        tokio::task::spawn_blocking(move || {
            TraceAssembler::assemble(&schema, assembler_options, stream)
        })
        .await??
    };

    let AssembledTrace {
        tables,
        labels,
        anomalies,
    } = assembled;
    let tables = Arc::new(tables);

    let causal = {
        let schema = Arc::clone(&schema);
        let tables = Arc::clone(&tables);
        let enabled = options.causal_edges;
        async move {
            if !enabled {
                return Ok(Resolution::default());
            }
            tokio::task::spawn_blocking(move || {
                DependencyResolver::new(&schema, &tables).causal_edges()
            })
            .await
        }
    };
    let ordering = {
        let schema = Arc::clone(&schema);
        let tables = Arc::clone(&tables);
        let enabled = options.ordering_edges;
        async move {
            if !enabled {
                return Ok(Vec::new());
            }
            tokio::task::spawn_blocking(move || {
                DependencyResolver::new(&schema, &tables).ordering_edges()
            })
            .await
        }
    };
    let (causal, ordering) = tokio::join!(causal, ordering);
    let (causal, ordering) = (causal?, ordering?);

    let tables = Arc::try_unwrap(tables).unwrap_or_else(|shared| (*shared).clone());
    Ok(finalize(
        schema.main_reactor().to_string(),
        AssembledTrace {
            tables,
            labels,
            anomalies,
        },
        causal,
        ordering,
        filter.as_ref(),
    ))
}

fn finalize(
    main_reactor: String,
    assembled: AssembledTrace,
    causal: Resolution,
    ordering: Vec<DependencyEdge>,
    filter: Option<&LabelFilter>,
) -> ProcessedTrace {
    let AssembledTrace {
        mut tables,
        labels,
        mut anomalies,
    } = assembled;
    anomalies.extend(causal.anomalies);

    let (labels, causal_edges, ordering_edges) = match filter {
        Some(filter) => {
            let (reindexed, maps) = filter::apply(filter, &mut tables, &labels);
            (
                reindexed,
                maps.remap_edges(&causal.edges),
                maps.remap_edges(&ordering),
            )
        }
        None => (labels, causal.edges, ordering),
    };

    ProcessedTrace {
        main_reactor,
        tables,
        labels,
        causal_edges,
        ordering_edges,
        anomalies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_stream::EventStream;
    use crate::test_support::{finish, start, triggered, TWO_REACTOR_SCHEMA};
    use trace_types::RowRef;

    fn schema() -> SchemaIndex {
        SchemaIndex::from_yaml_str(TWO_REACTOR_SCHEMA).unwrap()
    }

    fn scenario() -> EventStream<event_stream::RecordSource> {
        EventStream::from_records(vec![
            start("A", "r1", 100),
            finish("A", "r1", 150),
            triggered("B", "r2", 150, 0),
        ])
        .unwrap()
    }

    #[test]
    fn test_process_end_to_end() {
        let processed = process(&schema(), scenario(), &ProcessOptions::default()).unwrap();
        assert_eq!(processed.main_reactor, "Main");
        assert_eq!(processed.tables.executions.len(), 1);
        assert_eq!(processed.tables.reactions.len(), 1);
        assert_eq!(
            processed.causal_edges,
            vec![DependencyEdge::new(RowRef::execution(0), RowRef::reaction(0))]
        );
        assert!(processed.ordering_edges.is_empty());
        assert!(processed.anomalies.is_empty());
    }

    #[test]
    fn test_disabled_passes_produce_no_edges() {
        let options = ProcessOptions {
            causal_edges: false,
            ..ProcessOptions::default()
        };
        let processed = process(&schema(), scenario(), &options).unwrap();
        assert!(processed.causal_edges.is_empty());
    }

    #[test]
    fn test_include_filter_drops_edges_to_removed_rows() {
        let options = ProcessOptions {
            include: Some("^A\\.".to_string()),
            ..ProcessOptions::default()
        };
        let processed = process(&schema(), scenario(), &options).unwrap();
        assert!(processed.tables.reactions.is_empty());
        assert_eq!(processed.labels.names(), &["A.r1"]);
        assert!(processed.causal_edges.is_empty());
    }

    #[test]
    fn test_conflicting_filters_fail_before_assembly() {
        let options = ProcessOptions {
            include: Some("A".to_string()),
            exclude: Some("B".to_string()),
            ..ProcessOptions::default()
        };
        let err = process(&schema(), scenario(), &options).unwrap_err();
        assert!(matches!(err, PipelineError::Filter(FilterError::Conflicting)));
    }
}
