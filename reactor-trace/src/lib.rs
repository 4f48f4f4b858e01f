//! Reactor Trace - timeline reconstruction for reactor runtime traces
//!
//! This crate turns a reactor schema and a runtime event trace into three row
//! tables (triggered reactions, scheduled actions, paired executions) plus
//! dependency edges between rows, ready for a presentation layer.

pub mod assembler;
pub mod bands;
pub mod config;
pub mod dependencies;
pub mod event_stream;
pub mod filter;
pub mod labels;
pub mod observability;
pub mod pipeline;
pub mod report;
pub mod schema;

#[cfg(test)]
mod test_support;

pub use assembler::{AssembledTrace, AssemblerOptions, TraceAssembler, TraceTables};
pub use dependencies::{DependencyResolver, Resolution};
pub use event_stream::{EventStream, RawEvent, StreamError, TraceRecord};
pub use labels::{LabelError, LabelRegistry};
pub use pipeline::{process, run, PipelineError, ProcessOptions, ProcessedTrace};
pub use schema::{SchemaError, SchemaIndex};
