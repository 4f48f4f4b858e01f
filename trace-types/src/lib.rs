//! Shared trace table types
//!
//! These types are produced by the reactor-trace core and consumed by:
//! - the `reactor-trace` binary (JSON report output)
//! - presentation layers (timeline plots, worker views, tooltips)
//!
//! Serializable with serde for JSON; TypeScript bindings generated with ts-rs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Entity Kinds
// ============================================================================

/// Kind of a schema-declared entity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "trace.ts")]
pub enum EntityKind {
    Reaction,
    LogicalAction,
    PhysicalAction,
    Startup,
    Shutdown,
    Timer,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reaction => "reaction",
            Self::LogicalAction => "logical_action",
            Self::PhysicalAction => "physical_action",
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Timer => "timer",
        }
    }

    /// Logical and physical actions. Timers and startup/shutdown are not.
    pub fn is_action(&self) -> bool {
        matches!(self, Self::LogicalAction | Self::PhysicalAction)
    }

    /// Startup and shutdown are scheduled like actions but plotted like reactions.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Startup | Self::Shutdown)
    }
}

/// `event_type` column of an instantaneous row
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "trace.ts")]
pub enum EventType {
    Reaction,
    LogicalAction,
    PhysicalAction,
    Timer,
}

impl From<EntityKind> for EventType {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Reaction | EntityKind::Startup | EntityKind::Shutdown => Self::Reaction,
            EntityKind::LogicalAction => Self::LogicalAction,
            EntityKind::PhysicalAction => Self::PhysicalAction,
            EntityKind::Timer => Self::Timer,
        }
    }
}

/// Logical time coordinate: zero-based logical time plus microstep
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, TS,
)]
#[ts(export, export_to = "trace.ts")]
pub struct LogicalTag {
    pub logical_time: i64,
    pub microstep: u64,
}

impl LogicalTag {
    pub fn new(logical_time: i64, microstep: u64) -> Self {
        Self {
            logical_time,
            microstep,
        }
    }
}

// ============================================================================
// Row Tables
// ============================================================================

/// One triggered reaction or scheduled action
///
/// `time_end` always equals `time_start`. `priority` and `level` are only
/// populated for reaction-kind rows whose schema entry declares them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "trace.ts")]
pub struct InstantEventRow {
    /// `reactor.local_name`
    pub name: String,
    pub reactor: String,
    pub local_name: String,
    pub time_start: i64,
    pub time_end: i64,
    pub axis: usize,
    pub event_type: EventType,
    pub priority: Option<i64>,
    pub level: Option<i64>,
    pub triggers: Vec<String>,
    pub effects: Vec<String>,
    pub logical_time: i64,
    pub microstep: u64,
}

impl InstantEventRow {
    pub fn tag(&self) -> LogicalTag {
        LogicalTag::new(self.logical_time, self.microstep)
    }
}

/// One paired start/finish of a reaction execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "trace.ts")]
pub struct ExecutionEventRow {
    pub name: String,
    pub reactor: String,
    pub local_name: String,
    pub time_start: i64,
    pub time_end: i64,
    pub axis: usize,
    pub priority: Option<i64>,
    pub level: Option<i64>,
    pub triggers: Vec<String>,
    pub effects: Vec<String>,
    pub logical_time: Option<i64>,
    pub microstep: Option<u64>,
    pub worker_id: Option<u32>,
}

impl ExecutionEventRow {
    pub fn tag(&self) -> Option<LogicalTag> {
        match (self.logical_time, self.microstep) {
            (Some(logical_time), Some(microstep)) => Some(LogicalTag::new(logical_time, microstep)),
            _ => None,
        }
    }

    pub fn duration(&self) -> i64 {
        self.time_end - self.time_start
    }

    pub fn is_degenerate(&self) -> bool {
        self.time_end == self.time_start
    }
}

/// Which of the three row tables a position indexes into
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "trace.ts")]
pub enum TableKind {
    Reactions,
    Actions,
    Executions,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, TS)]
#[ts(export, export_to = "trace.ts")]
pub struct RowRef {
    pub table: TableKind,
    pub position: usize,
}

impl RowRef {
    pub fn new(table: TableKind, position: usize) -> Self {
        Self { table, position }
    }

    pub fn reaction(position: usize) -> Self {
        Self::new(TableKind::Reactions, position)
    }

    pub fn action(position: usize) -> Self {
        Self::new(TableKind::Actions, position)
    }

    pub fn execution(position: usize) -> Self {
        Self::new(TableKind::Executions, position)
    }
}

/// Directed edge between two rows; only meaningful alongside the tables it indexes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[ts(export, export_to = "trace.ts")]
pub struct DependencyEdge {
    pub source: RowRef,
    pub target: RowRef,
}

impl DependencyEdge {
    pub fn new(source: RowRef, target: RowRef) -> Self {
        Self { source, target }
    }
}

// ============================================================================
// Anomalies
// ============================================================================

/// Per-event problems that were recovered from instead of aborting the run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "trace.ts")]
pub enum AnomalyKind {
    /// Finish event without a pending start
    DanglingEnd,
    /// Start still pending at end of stream, dropped
    UnmatchedStart,
    /// Start still pending at end of stream, emitted with zero width
    DegenerateExecution,
    /// Start replaced by a later start of the same reaction
    SupersededStart,
    UnknownEntity,
    RoutingCycle,
    UnresolvedEffect,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DanglingEnd => "dangling_end",
            Self::UnmatchedStart => "unmatched_start",
            Self::DegenerateExecution => "degenerate_execution",
            Self::SupersededStart => "superseded_start",
            Self::UnknownEntity => "unknown_entity",
            Self::RoutingCycle => "routing_cycle",
            Self::UnresolvedEffect => "unresolved_effect",
        }
    }

    /// Anomalies whose event produced no row.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::DanglingEnd | Self::UnmatchedStart | Self::SupersededStart
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "trace.ts")]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub identifier: String,
    pub ts: Option<i64>,
    pub detail: String,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, identifier: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            ts: None,
            detail: detail.into(),
        }
    }

    pub fn at(mut self, ts: i64) -> Self {
        self.ts = Some(ts);
        self
    }
}

pub fn count_anomalies(anomalies: &[Anomaly]) -> BTreeMap<AnomalyKind, usize> {
    let mut counts = BTreeMap::new();
    for anomaly in anomalies {
        *counts.entry(anomaly.kind).or_insert(0) += 1;
    }
    counts
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "trace.ts")]
pub struct LogicalBand {
    pub index: usize,
    pub logical_time: i64,
    pub microstep: u64,
}

/// Everything one processing run produced
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "trace.ts")]
pub struct TraceReport {
    /// ULID of the processing run
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub main_reactor: String,
    /// Identifier for each axis label, indexed by label
    pub labels: Vec<String>,
    pub reactions: Vec<InstantEventRow>,
    pub actions: Vec<InstantEventRow>,
    pub executions: Vec<ExecutionEventRow>,
    pub causal_edges: Vec<DependencyEdge>,
    pub ordering_edges: Vec<DependencyEdge>,
    pub bands: Vec<LogicalBand>,
    pub band_boundaries: Vec<f64>,
    pub workers: Vec<u32>,
    pub anomalies: Vec<Anomaly>,
    pub anomaly_counts: BTreeMap<AnomalyKind, usize>,
}

impl TraceReport {
    pub fn skipped_rows(&self) -> usize {
        self.anomaly_counts
            .iter()
            .filter(|(kind, _)| kind.is_skip())
            .map(|(_, count)| count)
            .sum()
    }

    pub fn degenerate_rows(&self) -> usize {
        self.anomaly_counts
            .get(&AnomalyKind::DegenerateExecution)
            .copied()
            .unwrap_or(0)
    }
}
