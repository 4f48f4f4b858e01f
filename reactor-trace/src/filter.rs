//! Include/exclude filtering of assembled tables
//!
//! A filter picks surviving identifiers from the registry, the registry is
//! reindexed over them, and every table drops the rows that did not survive.
//! Surviving rows get their `axis` rewritten and edges are remapped through
//! the returned position maps.

use regex::Regex;
use trace_types::{DependencyEdge, RowRef, TableKind};

use crate::assembler::TraceTables;
use crate::labels::LabelRegistry;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("include and exclude patterns are mutually exclusive")]
    Conflicting,
    #[error("invalid filter pattern `{pattern}`: {error}")]
    InvalidPattern {
        pattern: String,
        #[source]
        error: regex::Error,
    },
}

#[derive(Debug, Clone)]
pub enum LabelFilter {
    Include(Regex),
    Exclude(Regex),
}

impl LabelFilter {
    /// `None` when neither pattern is set.
    pub fn from_patterns(
        include: Option<&str>,
        exclude: Option<&str>,
    ) -> Result<Option<Self>, FilterError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|error| FilterError::InvalidPattern {
                pattern: pattern.to_string(),
                error,
            })
        };
        match (include, exclude) {
            (Some(_), Some(_)) => Err(FilterError::Conflicting),
            (Some(pattern), None) => Ok(Some(Self::Include(compile(pattern)?))),
            (None, Some(pattern)) => Ok(Some(Self::Exclude(compile(pattern)?))),
            (None, None) => Ok(None),
        }
    }

    pub fn keeps(&self, identifier: &str) -> bool {
        match self {
            Self::Include(pattern) => pattern.is_match(identifier),
            Self::Exclude(pattern) => !pattern.is_match(identifier),
        }
    }

    /// Identifiers that survive, in label order.
    pub fn surviving<'r>(&self, registry: &'r LabelRegistry) -> Vec<&'r str> {
        registry
            .iter()
            .map(|(_, name)| name)
            .filter(|name| self.keeps(name))
            .collect()
    }
}

/// Old position -> new position, `None` for removed rows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionMaps {
    pub reactions: Vec<Option<usize>>,
    pub actions: Vec<Option<usize>>,
    pub executions: Vec<Option<usize>>,
}

impl PositionMaps {
    pub fn map(&self, row: RowRef) -> Option<RowRef> {
        let positions = match row.table {
            TableKind::Reactions => &self.reactions,
            TableKind::Actions => &self.actions,
            TableKind::Executions => &self.executions,
        };
        positions
            .get(row.position)
            .copied()
            .flatten()
            .map(|position| RowRef::new(row.table, position))
    }

    /// Edges between surviving rows, renumbered; the rest are dropped.
    pub fn remap_edges(&self, edges: &[DependencyEdge]) -> Vec<DependencyEdge> {
        edges
            .iter()
            .filter_map(|edge| Some(DependencyEdge::new(self.map(edge.source)?, self.map(edge.target)?)))
            .collect()
    }
}

fn retain_rows<T>(
    rows: &mut Vec<T>,
    registry: &LabelRegistry,
    name: impl Fn(&T) -> &str,
    set_axis: impl Fn(&mut T, usize),
) -> Vec<Option<usize>> {
    let mut positions = Vec::with_capacity(rows.len());
    let mut kept = 0;
    rows.retain_mut(|row| {
        let label = registry.get(name(row));
        match label {
            Some(axis) => {
                set_axis(row, axis);
                positions.push(Some(kept));
                kept += 1;
                true
            }
            None => {
                positions.push(None);
                false
            }
        }
    });
    positions
}

impl TraceTables {
    /// Keeps the rows named in `registry` and relabels their axes from it.
    pub fn retain(&mut self, registry: &LabelRegistry) -> PositionMaps {
        let maps = PositionMaps {
            reactions: retain_rows(
                &mut self.reactions,
                registry,
                |row| row.name.as_str(),
                |row, axis| row.axis = axis,
            ),
            actions: retain_rows(
                &mut self.actions,
                registry,
                |row| row.name.as_str(),
                |row, axis| row.axis = axis,
            ),
            executions: retain_rows(
                &mut self.executions,
                registry,
                |row| row.name.as_str(),
                |row, axis| row.axis = axis,
            ),
        };
        tracing::debug!(
            labels = registry.len(),
            rows = self.len(),
            "Filtered trace tables"
        );
        maps
    }
}

/// Applies `filter` to `tables`; returns the reindexed registry and the position maps.
pub fn apply(
    filter: &LabelFilter,
    tables: &mut TraceTables,
    labels: &LabelRegistry,
) -> (LabelRegistry, PositionMaps) {
    let reindexed = labels.reindex(filter.surviving(labels));
    let maps = tables.retain(&reindexed);
    tracing::info!(
        before = labels.len(),
        after = reindexed.len(),
        "Applied label filter"
    );
    (reindexed, maps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{AssemblerOptions, TraceAssembler};
    use crate::dependencies::DependencyResolver;
    use crate::event_stream::EventStream;
    use crate::schema::SchemaIndex;
    use crate::test_support::{finish, scheduled, start, triggered, TWO_REACTOR_SCHEMA};

    #[test]
    fn test_include_and_exclude_conflict() {
        let err = LabelFilter::from_patterns(Some("A"), Some("B")).unwrap_err();
        assert!(matches!(err, FilterError::Conflicting));
        assert!(LabelFilter::from_patterns(None, None).unwrap().is_none());
        assert!(matches!(
            LabelFilter::from_patterns(Some("("), None),
            Err(FilterError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_exclude_filter_remaps_axes_and_edges() {
        let schema = SchemaIndex::from_yaml_str(TWO_REACTOR_SCHEMA).unwrap();
        let stream = EventStream::from_records(vec![
            scheduled("A", "act", 0, 0),
            start("A", "r1", 1),
            finish("A", "r1", 5),
            triggered("B", "r2", 6, 0),
        ])
        .unwrap();
        let mut trace =
            TraceAssembler::assemble(&schema, AssemblerOptions::default(), stream).unwrap();
        let edges = DependencyResolver::new(&schema, &trace.tables)
            .causal_edges()
            .edges;
        assert_eq!(
            edges,
            vec![DependencyEdge::new(RowRef::execution(0), RowRef::reaction(0))]
        );

        let filter = LabelFilter::from_patterns(None, Some(r"\.act$"))
            .unwrap()
            .unwrap();
        let (labels, maps) = apply(&filter, &mut trace.tables, &trace.labels);

        assert_eq!(labels.names(), &["A.r1", "B.r2"]);
        assert!(trace.tables.actions.is_empty());
        assert_eq!(trace.tables.executions[0].axis, 0);
        assert_eq!(trace.tables.reactions[0].axis, 1);
        assert_eq!(maps.actions, vec![None]);
        assert_eq!(maps.remap_edges(&edges), edges);
    }

    #[test]
    fn test_edges_touching_removed_rows_are_dropped() {
        let maps = PositionMaps {
            reactions: vec![None, Some(0)],
            actions: vec![],
            executions: vec![Some(0)],
        };
        let edges = vec![
            DependencyEdge::new(RowRef::execution(0), RowRef::reaction(0)),
            DependencyEdge::new(RowRef::execution(0), RowRef::reaction(1)),
        ];
        assert_eq!(
            maps.remap_edges(&edges),
            vec![DependencyEdge::new(RowRef::execution(0), RowRef::reaction(0))]
        );
        assert_eq!(maps.map(RowRef::action(3)), None);
    }

    #[test]
    fn test_include_filter_keeps_label_order() {
        let mut registry = LabelRegistry::new();
        for name in ["B.r2", "A.r1", "A.r3"] {
            registry.label_for(name);
        }
        let filter = LabelFilter::from_patterns(Some(r"^A\."), None)
            .unwrap()
            .unwrap();
        assert_eq!(filter.surviving(&registry), vec!["A.r1", "A.r3"]);
    }
}
