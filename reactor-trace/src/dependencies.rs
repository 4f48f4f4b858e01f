//! Dependency edges between rows
//!
//! Two independent passes over finished tables:
//! - causal chains: follow each row's schema `effects` to the earliest row of
//!   the effected reaction that starts no earlier than the origin ends,
//!   expanding ports through [`SchemaIndex::resolve_port_chain`]
//! - same-logical-time ordering: execution rows sharing a logical tag whose
//!   order is constrained by a declared reaction dependency
//!
//! Both passes only read the tables and can run concurrently.

use std::collections::{HashMap, HashSet};

use trace_types::{Anomaly, AnomalyKind, DependencyEdge, RowRef};

use crate::assembler::TraceTables;
use crate::schema::{RoutingError, SchemaIndex};

/// Edges plus the anomalies recovered while finding them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub edges: Vec<DependencyEdge>,
    pub anomalies: Vec<Anomaly>,
}

/// Per-pass bookkeeping shared by every origin of one causal pass
#[derive(Default)]
struct ChainState {
    visited: HashSet<(RowRef, String)>,
    edges: HashSet<DependencyEdge>,
    port_cache: HashMap<String, Result<Vec<String>, RoutingError>>,
    reported: HashSet<(AnomalyKind, String)>,
    resolution: Resolution,
}

impl ChainState {
    fn report(&mut self, kind: AnomalyKind, identifier: &str, detail: String) {
        if !self.reported.insert((kind, identifier.to_string())) {
            return;
        }
        tracing::warn!(kind = kind.as_str(), identifier, detail = %detail, "Causal chain truncated");
        self.resolution
            .anomalies
            .push(Anomaly::new(kind, identifier, detail));
    }
}

pub struct DependencyResolver<'a> {
    schema: &'a SchemaIndex,
    tables: &'a TraceTables,
    reactions_by_name: HashMap<&'a str, Vec<usize>>,
    executions_by_name: HashMap<&'a str, Vec<usize>>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(schema: &'a SchemaIndex, tables: &'a TraceTables) -> Self {
        let mut reactions_by_name: HashMap<&str, Vec<usize>> = HashMap::new();
        for (position, row) in tables.reactions.iter().enumerate() {
            reactions_by_name.entry(row.name.as_str()).or_default().push(position);
        }
        let mut executions_by_name: HashMap<&str, Vec<usize>> = HashMap::new();
        for (position, row) in tables.executions.iter().enumerate() {
            executions_by_name.entry(row.name.as_str()).or_default().push(position);
        }
        Self {
            schema,
            tables,
            reactions_by_name,
            executions_by_name,
        }
    }

    // ── Causal chains ────────────────────────────────────────────────────────

    /// Full chain reachable from one origin row.
    pub fn causal_chain_from(&self, origin: RowRef) -> Resolution {
        let mut state = ChainState::default();
        self.walk(origin, &mut state);
        state.resolution
    }

    /// Chains from every row of all three tables, deduplicated.
    pub fn causal_edges(&self) -> Resolution {
        let mut state = ChainState::default();
        for origin in self.tables.row_refs() {
            self.walk(origin, &mut state);
        }
        tracing::info!(
            edges = state.resolution.edges.len(),
            anomalies = state.resolution.anomalies.len(),
            "Resolved causal edges"
        );
        state.resolution
    }

    fn walk(&self, origin: RowRef, state: &mut ChainState) {
        let mut pending = vec![origin];
        while let Some(row) = pending.pop() {
            let Some(time_end) = self.tables.time_end(row) else {
                continue;
            };
            for effect in self.tables.effects(row) {
                if !state.visited.insert((row, effect.clone())) {
                    continue;
                }
                if self.schema.is_action(effect) {
                    tracing::trace!(effect = %effect, "Chain stops at action");
                    continue;
                }
                for target in self.targets(effect, time_end, state) {
                    let edge = DependencyEdge::new(row, target);
                    if state.edges.insert(edge) {
                        state.resolution.edges.push(edge);
                    }
                    pending.push(target);
                }
            }
        }
    }

    fn targets(&self, effect: &str, not_before: i64, state: &mut ChainState) -> Vec<RowRef> {
        if let Some(row) = self.first_row_at_or_after(effect, not_before) {
            return vec![row];
        }
        if self.schema.is_port(effect) {
            let chain = state
                .port_cache
                .entry(effect.to_string())
                .or_insert_with(|| self.schema.resolve_port_chain(effect))
                .clone();
            return match chain {
                Ok(reactions) => reactions
                    .iter()
                    .filter_map(|reaction| self.first_row_at_or_after(reaction, not_before))
                    .collect(),
                Err(err @ RoutingError::RoutingCycle { .. }) => {
                    state.report(AnomalyKind::RoutingCycle, effect, err.to_string());
                    Vec::new()
                }
                Err(err @ RoutingError::UnknownPort(_)) => {
                    state.report(AnomalyKind::UnresolvedEffect, effect, err.to_string());
                    Vec::new()
                }
            };
        }
        if self.schema.lookup_qualified(effect).is_none() {
            state.report(
                AnomalyKind::UnresolvedEffect,
                effect,
                "neither a declared entity nor a port".to_string(),
            );
        }
        Vec::new()
    }

    /// Earliest row named `name` with `time_start >= not_before` across the
    /// reaction and execution tables. Equal starts go to the reaction row,
    /// which comes first in table order.
    fn first_row_at_or_after(&self, name: &str, not_before: i64) -> Option<RowRef> {
        let reaction = self.reactions_by_name.get(name).and_then(|positions| {
            let index = positions
                .partition_point(|&p| self.tables.reactions[p].time_start < not_before);
            positions.get(index).map(|&position| RowRef::reaction(position))
        });
        let execution = self.executions_by_name.get(name).and_then(|positions| {
            let index = positions
                .partition_point(|&p| self.tables.executions[p].time_start < not_before);
            positions.get(index).map(|&position| RowRef::execution(position))
        });
        match (reaction, execution) {
            (Some(reaction), Some(execution)) => {
                let reaction_start = self.tables.reactions[reaction.position].time_start;
                let execution_start = self.tables.executions[execution.position].time_start;
                if execution_start < reaction_start {
                    Some(execution)
                } else {
                    Some(reaction)
                }
            }
            (reaction, execution) => reaction.or(execution),
        }
    }

    // ── Same-logical-time ordering ───────────────────────────────────────────

    /// Edge `(i, j)` for execution rows `i < j` sharing a tag where `j` is
    /// declared to depend on `i`. Untagged rows never take part.
    pub fn ordering_edges(&self) -> Vec<DependencyEdge> {
        let executions = &self.tables.executions;
        let mut edges = Vec::new();

        for (i, earlier) in executions.iter().enumerate() {
            let Some(tag) = earlier.tag() else {
                continue;
            };
            for (offset, later) in executions[i + 1..].iter().enumerate() {
                let Some(later_tag) = later.tag() else {
                    continue;
                };
                if later_tag.logical_time > tag.logical_time {
                    break;
                }
                if later_tag == tag && self.schema.depends_on(&later.name, &earlier.name) {
                    edges.push(DependencyEdge::new(
                        RowRef::execution(i),
                        RowRef::execution(i + 1 + offset),
                    ));
                }
            }
        }

        tracing::info!(edges = edges.len(), "Resolved same-logical-time ordering edges");
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{AssemblerOptions, TraceAssembler, TraceTables};
    use crate::event_stream::{EventStream, TraceRecord};
    use crate::test_support::{finish, scheduled, start, triggered, TWO_REACTOR_SCHEMA};

    fn tables_for(schema: &SchemaIndex, records: Vec<TraceRecord>) -> TraceTables {
        let stream = EventStream::from_records(records).unwrap();
        TraceAssembler::assemble(schema, AssemblerOptions::default(), stream)
            .unwrap()
            .tables
    }

    fn two_reactor() -> SchemaIndex {
        SchemaIndex::from_yaml_str(TWO_REACTOR_SCHEMA).unwrap()
    }

    #[test]
    fn test_execution_links_to_triggered_reaction() {
        let schema = two_reactor();
        let tables = tables_for(
            &schema,
            vec![
                start("A", "r1", 100),
                finish("A", "r1", 150),
                triggered("B", "r2", 150, 0),
            ],
        );
        let resolution = DependencyResolver::new(&schema, &tables).causal_edges();
        assert_eq!(
            resolution.edges,
            vec![DependencyEdge::new(RowRef::execution(0), RowRef::reaction(0))]
        );
        assert!(resolution.anomalies.is_empty());
    }

    #[test]
    fn test_target_must_not_start_before_origin_ends() {
        let schema = two_reactor();
        let tables = tables_for(
            &schema,
            vec![
                start("A", "r1", 0),
                triggered("B", "r2", 10, 0),
                finish("A", "r1", 20),
                triggered("B", "r2", 30, 0),
            ],
        );
        let resolution = DependencyResolver::new(&schema, &tables).causal_chain_from(RowRef::execution(0));
        assert_eq!(
            resolution.edges,
            vec![DependencyEdge::new(RowRef::execution(0), RowRef::reaction(1))]
        );
    }

    #[test]
    fn test_target_is_earliest_row_across_tables() {
        let schema = two_reactor();
        // B.r2 is triggered while A.r1 still runs, then executes right after it
        let tables = tables_for(
            &schema,
            vec![
                start("A", "r1", 100),
                triggered("B", "r2", 140, 0),
                finish("A", "r1", 150),
                start("B", "r2", 155),
                finish("B", "r2", 160),
                triggered("B", "r2", 1000, 1),
            ],
        );
        assert_eq!(tables.reactions.len(), 2);
        assert_eq!(tables.executions[1].time_start, 55);

        let resolution = DependencyResolver::new(&schema, &tables).causal_chain_from(RowRef::execution(0));
        assert_eq!(
            resolution.edges,
            vec![DependencyEdge::new(RowRef::execution(0), RowRef::execution(1))]
        );
    }

    #[test]
    fn test_equal_start_prefers_reaction_row() {
        let schema = two_reactor();
        let tables = tables_for(
            &schema,
            vec![
                start("A", "r1", 0),
                finish("A", "r1", 10),
                triggered("B", "r2", 10, 0),
                start("B", "r2", 10),
                finish("B", "r2", 12),
            ],
        );
        let resolution = DependencyResolver::new(&schema, &tables).causal_chain_from(RowRef::execution(0));
        assert_eq!(
            resolution.edges,
            vec![DependencyEdge::new(RowRef::execution(0), RowRef::reaction(0))]
        );
    }

    #[test]
    fn test_chain_stops_at_action_and_never_revisits() {
        let schema = two_reactor();
        let tables = tables_for(
            &schema,
            vec![scheduled("A", "act", 0, 5), triggered("A", "r3", 0, 5)],
        );
        let resolver = DependencyResolver::new(&schema, &tables);
        let resolution = resolver.causal_chain_from(RowRef::action(0));
        assert_eq!(
            resolution.edges,
            vec![DependencyEdge::new(RowRef::action(0), RowRef::reaction(0))]
        );
        // A.r3 reschedules A.act; the chain must end there rather than loop back
        let from_r3 = resolver.causal_chain_from(RowRef::reaction(0));
        assert!(from_r3.edges.is_empty());
    }

    #[test]
    fn test_effect_through_port_chain() {
        let schema = two_reactor();
        let tables = tables_for(
            &schema,
            vec![
                start("A", "r3", 0),
                finish("A", "r3", 5),
                triggered("B", "r4", 6, 0),
                start("B", "r4", 7),
                finish("B", "r4", 9),
            ],
        );
        let resolution = DependencyResolver::new(&schema, &tables).causal_edges();
        assert!(resolution
            .edges
            .contains(&DependencyEdge::new(RowRef::execution(0), RowRef::reaction(0))));
        assert_eq!(resolution.edges.len(), 1);
    }

    #[test]
    fn test_routing_cycle_truncates_chain() {
        let yaml = r#"
top_level_instances: [Main]
reaction_dependencies: []
all_reactor_instances:
  A:
    reactions:
      - { name: r1, priority: 1, level: 0, triggers: [A.t], effects: [A.out] }
    outputs:
      out: { upstream_port: null, downstream_ports: [C.x], trigger_of: null }
  C:
    inputs:
      x: { upstream_port: A.out, downstream_ports: [C.y], trigger_of: null }
      y: { upstream_port: C.x, downstream_ports: [C.x], trigger_of: null }
"#;
        let schema = SchemaIndex::from_yaml_str(yaml).unwrap();
        let tables = tables_for(&schema, vec![start("A", "r1", 0), finish("A", "r1", 1)]);
        let resolution = DependencyResolver::new(&schema, &tables).causal_edges();
        assert!(resolution.edges.is_empty());
        assert_eq!(resolution.anomalies.len(), 1);
        assert_eq!(resolution.anomalies[0].kind, AnomalyKind::RoutingCycle);
        assert_eq!(resolution.anomalies[0].identifier, "A.out");
    }

    #[test]
    fn test_unknown_effect_is_reported_once() {
        let yaml = r#"
top_level_instances: [Main]
reaction_dependencies: []
all_reactor_instances:
  A:
    reactions:
      - { name: r1, priority: 1, level: 0, triggers: [A.t], effects: [Nowhere.x] }
"#;
        let schema = SchemaIndex::from_yaml_str(yaml).unwrap();
        let tables = tables_for(
            &schema,
            vec![
                start("A", "r1", 0),
                finish("A", "r1", 1),
                start("A", "r1", 2),
                finish("A", "r1", 3),
            ],
        );
        let resolution = DependencyResolver::new(&schema, &tables).causal_edges();
        assert_eq!(resolution.anomalies.len(), 1);
        assert_eq!(resolution.anomalies[0].kind, AnomalyKind::UnresolvedEffect);
    }

    const ORDERING_SCHEMA: &str = r#"
top_level_instances: [Main]
all_reactor_instances:
  M:
    reactions:
      - { name: x, priority: 1, level: 0, triggers: [M.t], effects: [] }
      - { name: y, priority: 2, level: 1, triggers: [M.t], effects: [] }
      - { name: z, priority: 3, level: 1, triggers: [M.t], effects: [] }
reaction_dependencies:
  - { from: M.y, to: M.x }
  - { from: M.z, to: M.x }
"#;

    #[test]
    fn test_same_logical_time_ordering() {
        let schema = SchemaIndex::from_yaml_str(ORDERING_SCHEMA).unwrap();
        let mut records = Vec::new();
        for (i, name) in ["x", "y", "z"].into_iter().enumerate() {
            let ts = i as i64 * 10;
            records.push(start("M", name, ts).with_tag(3, 0));
            records.push(finish("M", name, ts + 5));
        }
        let tables = tables_for(&schema, records);
        let edges = DependencyResolver::new(&schema, &tables).ordering_edges();
        assert_eq!(
            edges,
            vec![
                DependencyEdge::new(RowRef::execution(0), RowRef::execution(1)),
                DependencyEdge::new(RowRef::execution(0), RowRef::execution(2)),
            ]
        );
    }

    #[test]
    fn test_ordering_ignores_other_tags_and_untagged_rows() {
        let schema = SchemaIndex::from_yaml_str(ORDERING_SCHEMA).unwrap();
        let tables = tables_for(
            &schema,
            vec![
                start("M", "x", 0).with_tag(3, 0),
                finish("M", "x", 5),
                start("M", "y", 10).with_tag(3, 1),
                finish("M", "y", 15),
                start("M", "z", 20),
                finish("M", "z", 25),
                start("M", "y", 30).with_tag(4, 0),
                finish("M", "y", 35),
            ],
        );
        let edges = DependencyResolver::new(&schema, &tables).ordering_edges();
        assert!(edges.is_empty());
    }
}
