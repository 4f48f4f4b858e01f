//! Logical-time bands and worker lanes for timeline views

use std::collections::{BTreeMap, BTreeSet};

use trace_types::{ExecutionEventRow, LogicalBand, LogicalTag};

use crate::assembler::TraceTables;

/// Distinct logical tags over all tables, each with a dense band index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogicalBands {
    index: BTreeMap<LogicalTag, usize>,
}

impl LogicalBands {
    pub fn from_tables(tables: &TraceTables) -> Self {
        let tags: BTreeSet<LogicalTag> = tables
            .reactions
            .iter()
            .chain(tables.actions.iter())
            .map(|row| row.tag())
            .chain(tables.executions.iter().filter_map(ExecutionEventRow::tag))
            .collect();
        let index = tags
            .into_iter()
            .enumerate()
            .map(|(band, tag)| (tag, band))
            .collect();
        Self { index }
    }

    pub fn band_of(&self, tag: LogicalTag) -> Option<usize> {
        self.index.get(&tag).copied()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn to_bands(&self) -> Vec<LogicalBand> {
        self.index
            .iter()
            .map(|(tag, band)| LogicalBand {
                index: *band,
                logical_time: tag.logical_time,
                microstep: tag.microstep,
            })
            .collect()
    }
}

/// Midpoints where the logical tag changes between consecutive tagged execution rows.
pub fn band_boundaries(executions: &[ExecutionEventRow]) -> Vec<f64> {
    let mut boundaries = Vec::new();
    let mut previous: Option<&ExecutionEventRow> = None;
    for row in executions {
        let Some(tag) = row.tag() else {
            continue;
        };
        if let Some(prev) = previous {
            if prev.tag() != Some(tag) {
                boundaries.push((prev.time_end as f64 + row.time_start as f64) / 2.0);
            }
        }
        previous = Some(row);
    }
    boundaries
}

/// Sorted distinct worker ids.
pub fn worker_lanes(executions: &[ExecutionEventRow]) -> Vec<u32> {
    executions
        .iter()
        .filter_map(|row| row.worker_id)
        .collect::<BTreeSet<u32>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{AssemblerOptions, TraceAssembler};
    use crate::event_stream::EventStream;
    use crate::schema::SchemaIndex;
    use crate::test_support::{finish, scheduled, start, triggered, TWO_REACTOR_SCHEMA};

    fn tables() -> TraceTables {
        let schema = SchemaIndex::from_yaml_str(TWO_REACTOR_SCHEMA).unwrap();
        let stream = EventStream::from_records(vec![
            triggered("A", "r1", 0, 100),
            start("A", "r1", 0).with_worker(2),
            finish("A", "r1", 10),
            scheduled("A", "act", 10, 200),
            triggered("A", "r3", 20, 200),
            start("A", "r3", 20).with_worker(1),
            finish("A", "r3", 30),
            start("B", "r2", 40).with_worker(2),
            finish("B", "r2", 45),
        ])
        .unwrap();
        TraceAssembler::assemble(&schema, AssemblerOptions::default(), stream)
            .unwrap()
            .tables
    }

    #[test]
    fn test_bands_are_sorted_distinct_tags() {
        let bands = LogicalBands::from_tables(&tables());
        assert_eq!(bands.len(), 2);
        assert_eq!(bands.band_of(LogicalTag::new(0, 0)), Some(0));
        assert_eq!(bands.band_of(LogicalTag::new(100, 0)), Some(1));
        assert_eq!(bands.to_bands()[1].logical_time, 100);
    }

    #[test]
    fn test_boundaries_at_tag_changes() {
        let tables = tables();
        // B.r2 has no tag and is skipped
        assert_eq!(band_boundaries(&tables.executions), vec![15.0]);
    }

    #[test]
    fn test_worker_lanes_sorted_and_distinct() {
        assert_eq!(worker_lanes(&tables().executions), vec![1, 2]);
    }
}
