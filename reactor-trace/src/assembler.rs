//! Trace assembler
//!
//! Single pass over an [`EventStream`](crate::event_stream::EventStream) that
//! builds the three row tables:
//! - `reactions`: triggered reactions plus startup/shutdown scheduling
//! - `actions`: scheduled logical/physical actions and timers
//! - `executions`: paired start/finish of a reaction execution
//!
//! Per-event problems are recorded as [`Anomaly`] values and the pass moves on.
//! Only stream-level failures abort assembly.

use std::collections::HashMap;

use trace_types::{
    Anomaly, AnomalyKind, EntityKind, EventType, ExecutionEventRow, InstantEventRow, LogicalTag,
    RowRef, TableKind,
};

use crate::event_stream::{RawEvent, StreamError};
use crate::labels::LabelRegistry;
use crate::schema::{ReactionSchema, SchemaIndex};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerOptions {
    /// Emit starts still open at end of stream as zero-width rows instead of dropping them.
    pub emit_unmatched_starts: bool,
}

// ── Tables ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceTables {
    pub reactions: Vec<InstantEventRow>,
    pub actions: Vec<InstantEventRow>,
    pub executions: Vec<ExecutionEventRow>,
}

impl TraceTables {
    pub fn len(&self) -> usize {
        self.reactions.len() + self.actions.len() + self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn instant(&self, row: RowRef) -> Option<&InstantEventRow> {
        match row.table {
            TableKind::Reactions => self.reactions.get(row.position),
            TableKind::Actions => self.actions.get(row.position),
            TableKind::Executions => None,
        }
    }

    pub fn name(&self, row: RowRef) -> Option<&str> {
        match row.table {
            TableKind::Executions => self.executions.get(row.position).map(|r| r.name.as_str()),
            _ => self.instant(row).map(|r| r.name.as_str()),
        }
    }

    pub fn time_start(&self, row: RowRef) -> Option<i64> {
        match row.table {
            TableKind::Executions => self.executions.get(row.position).map(|r| r.time_start),
            _ => self.instant(row).map(|r| r.time_start),
        }
    }

    pub fn time_end(&self, row: RowRef) -> Option<i64> {
        match row.table {
            TableKind::Executions => self.executions.get(row.position).map(|r| r.time_end),
            _ => self.instant(row).map(|r| r.time_end),
        }
    }

    pub fn effects(&self, row: RowRef) -> &[String] {
        match row.table {
            TableKind::Executions => self
                .executions
                .get(row.position)
                .map(|r| r.effects.as_slice())
                .unwrap_or(&[]),
            _ => self
                .instant(row)
                .map(|r| r.effects.as_slice())
                .unwrap_or(&[]),
        }
    }

    /// Every row, table by table, in table order.
    pub fn row_refs(&self) -> impl Iterator<Item = RowRef> + '_ {
        (0..self.reactions.len())
            .map(RowRef::reaction)
            .chain((0..self.actions.len()).map(RowRef::action))
            .chain((0..self.executions.len()).map(RowRef::execution))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssembledTrace {
    pub tables: TraceTables,
    pub labels: LabelRegistry,
    pub anomalies: Vec<Anomaly>,
}

// ── Assembler ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PendingStart {
    reactor: String,
    reaction: String,
    ts: i64,
    tag: Option<LogicalTag>,
    worker_id: Option<u32>,
}

pub struct TraceAssembler<'a> {
    schema: &'a SchemaIndex,
    options: AssemblerOptions,
    labels: LabelRegistry,
    tables: TraceTables,
    /// `reactor.reaction` -> start waiting for its finish
    open: HashMap<String, PendingStart>,
    /// `reactor.reaction` -> tag of its most recent trigger
    last_triggered: HashMap<String, LogicalTag>,
    anomalies: Vec<Anomaly>,
}

impl<'a> TraceAssembler<'a> {
    pub fn new(schema: &'a SchemaIndex, options: AssemblerOptions) -> Self {
        Self {
            schema,
            options,
            labels: LabelRegistry::new(),
            tables: TraceTables::default(),
            open: HashMap::new(),
            last_triggered: HashMap::new(),
            anomalies: Vec::new(),
        }
    }

    /// Drains `events` and finishes; the first stream error aborts with no partial tables.
    pub fn assemble<I>(
        schema: &'a SchemaIndex,
        options: AssemblerOptions,
        events: I,
    ) -> Result<AssembledTrace, StreamError>
    where
        I: IntoIterator<Item = Result<RawEvent, StreamError>>,
    {
        let mut assembler = Self::new(schema, options);
        for event in events {
            assembler.consume(event?);
        }
        Ok(assembler.finish())
    }

    pub fn consume(&mut self, event: RawEvent) {
        let identifier = event.qualified_name();
        if self.schema.is_redundant(&identifier) {
            tracing::trace!(identifier = %identifier, "Dropping event of redundant entity");
            return;
        }

        match event {
            RawEvent::ReactionStart {
                reactor,
                reaction,
                ts,
                tag,
                worker_id,
            } => self.on_start(identifier, reactor, reaction, ts, tag, worker_id),
            RawEvent::ReactionEnd {
                reactor,
                reaction,
                ts,
                tag,
                worker_id,
            } => self.on_end(identifier, &reactor, &reaction, ts, tag, worker_id),
            RawEvent::ActionScheduled {
                reactor,
                action,
                ts,
                logical_time,
                microstep,
            } => self.on_scheduled(
                identifier,
                &reactor,
                &action,
                ts,
                LogicalTag::new(logical_time, microstep),
            ),
            RawEvent::ReactionTriggered {
                reactor,
                reaction,
                ts,
                logical_time,
                microstep,
            } => self.on_triggered(
                identifier,
                &reactor,
                &reaction,
                ts,
                LogicalTag::new(logical_time, microstep),
            ),
        }
    }

    fn record(&mut self, anomaly: Anomaly) {
        tracing::warn!(
            kind = anomaly.kind.as_str(),
            identifier = %anomaly.identifier,
            ts = ?anomaly.ts,
            detail = %anomaly.detail,
            "Recovered trace anomaly"
        );
        self.anomalies.push(anomaly);
    }

    /// Schema entry for an emitted row; a miss is recorded and the row keeps going.
    fn entry_for(&mut self, identifier: &str, reactor: &str, name: &str, ts: i64) -> Option<&'a ReactionSchema> {
        let schema = self.schema;
        match schema.lookup(reactor, name) {
            Ok(entry) => Some(entry),
            Err(err) => {
                self.record(
                    Anomaly::new(AnomalyKind::UnknownEntity, identifier, err.to_string()).at(ts),
                );
                None
            }
        }
    }

    fn on_start(
        &mut self,
        identifier: String,
        reactor: String,
        reaction: String,
        ts: i64,
        tag: Option<LogicalTag>,
        worker_id: Option<u32>,
    ) {
        let pending = PendingStart {
            reactor,
            reaction,
            ts,
            tag,
            worker_id,
        };
        if let Some(previous) = self.open.insert(identifier.clone(), pending) {
            self.record(
                Anomaly::new(
                    AnomalyKind::SupersededStart,
                    identifier,
                    format!("start at {} replaced by a later start", previous.ts),
                )
                .at(previous.ts),
            );
        }
    }

    fn on_end(
        &mut self,
        identifier: String,
        reactor: &str,
        reaction: &str,
        ts: i64,
        tag: Option<LogicalTag>,
        worker_id: Option<u32>,
    ) {
        let Some(start) = self.open.remove(&identifier) else {
            self.record(
                Anomaly::new(AnomalyKind::DanglingEnd, identifier, "finish without a pending start")
                    .at(ts),
            );
            return;
        };
        let tag = start.tag.or(tag);
        let worker_id = start.worker_id.or(worker_id);
        self.push_execution(identifier, reactor, reaction, start.ts, ts, tag, worker_id);
    }

    #[allow(clippy::too_many_arguments)]
    fn push_execution(
        &mut self,
        identifier: String,
        reactor: &str,
        reaction: &str,
        time_start: i64,
        time_end: i64,
        tag: Option<LogicalTag>,
        worker_id: Option<u32>,
    ) {
        let entry = self.entry_for(&identifier, reactor, reaction, time_start);
        let tag = tag.or_else(|| self.last_triggered.get(&identifier).copied());
        let axis = self.labels.label_for(&identifier);
        tracing::debug!(identifier = %identifier, time_start, time_end, axis, "Execution row");
        self.tables.executions.push(ExecutionEventRow {
            name: identifier,
            reactor: reactor.to_string(),
            local_name: reaction.to_string(),
            time_start,
            time_end,
            axis,
            priority: entry.and_then(|e| e.priority),
            level: entry.and_then(|e| e.level),
            triggers: entry.map(|e| e.triggers.clone()).unwrap_or_default(),
            effects: entry.map(|e| e.effects.clone()).unwrap_or_default(),
            logical_time: tag.map(|t| t.logical_time),
            microstep: tag.map(|t| t.microstep),
            worker_id,
        });
    }

    fn on_scheduled(
        &mut self,
        identifier: String,
        reactor: &str,
        action: &str,
        ts: i64,
        tag: LogicalTag,
    ) {
        let Some(entry) = self.entry_for(&identifier, reactor, action, ts) else {
            return;
        };
        let row = self.instant_row(identifier, reactor, action, ts, tag, Some(entry));
        if entry.kind.is_lifecycle() {
            self.tables.reactions.push(row);
        } else {
            self.tables.actions.push(row);
        }
    }

    fn on_triggered(
        &mut self,
        identifier: String,
        reactor: &str,
        reaction: &str,
        ts: i64,
        tag: LogicalTag,
    ) {
        let entry = self.entry_for(&identifier, reactor, reaction, ts);
        self.last_triggered.insert(identifier.clone(), tag);
        let row = self.instant_row(identifier, reactor, reaction, ts, tag, entry);
        self.tables.reactions.push(row);
    }

    fn instant_row(
        &mut self,
        identifier: String,
        reactor: &str,
        local_name: &str,
        ts: i64,
        tag: LogicalTag,
        entry: Option<&ReactionSchema>,
    ) -> InstantEventRow {
        let kind = entry.map(|e| e.kind).unwrap_or(EntityKind::Reaction);
        let reaction_attrs = entry.filter(|e| e.kind == EntityKind::Reaction);
        let axis = self.labels.label_for(&identifier);
        tracing::debug!(identifier = %identifier, ts, axis, kind = kind.as_str(), "Instant row");
        InstantEventRow {
            name: identifier,
            reactor: reactor.to_string(),
            local_name: local_name.to_string(),
            time_start: ts,
            time_end: ts,
            axis,
            event_type: EventType::from(kind),
            priority: reaction_attrs.and_then(|e| e.priority),
            level: reaction_attrs.and_then(|e| e.level),
            triggers: entry.map(|e| e.triggers.clone()).unwrap_or_default(),
            effects: entry.map(|e| e.effects.clone()).unwrap_or_default(),
            logical_time: tag.logical_time,
            microstep: tag.microstep,
        }
    }

    /// Closes the pass. Starts still open are dropped or emitted zero-width per
    /// [`AssemblerOptions::emit_unmatched_starts`], in `(ts, identifier)` order.
    pub fn finish(mut self) -> AssembledTrace {
        let mut open: Vec<(String, PendingStart)> = std::mem::take(&mut self.open).into_iter().collect();
        open.sort_by(|(a_name, a), (b_name, b)| a.ts.cmp(&b.ts).then_with(|| a_name.cmp(b_name)));

        for (identifier, start) in open {
            if self.options.emit_unmatched_starts {
                self.record(
                    Anomaly::new(
                        AnomalyKind::DegenerateExecution,
                        identifier.clone(),
                        "no finish before end of stream, emitted with zero width",
                    )
                    .at(start.ts),
                );
                self.push_execution(
                    identifier,
                    &start.reactor,
                    &start.reaction,
                    start.ts,
                    start.ts,
                    start.tag,
                    start.worker_id,
                );
            } else {
                self.record(
                    Anomaly::new(
                        AnomalyKind::UnmatchedStart,
                        identifier,
                        "no finish before end of stream, dropped",
                    )
                    .at(start.ts),
                );
            }
        }

        tracing::info!(
            reactions = self.tables.reactions.len(),
            actions = self.tables.actions.len(),
            executions = self.tables.executions.len(),
            labels = self.labels.len(),
            anomalies = self.anomalies.len(),
            "Assembled trace tables"
        );

        AssembledTrace {
            tables: self.tables,
            labels: self.labels,
            anomalies: self.anomalies,
        }
    }
}
