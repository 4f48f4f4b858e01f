//! Event stream over a raw trace
//!
//! Transports deliver [`TraceRecord`]s with absolute clocks. [`EventStream`]
//! normalizes them into [`RawEvent`]s: it peeks the first record to capture the
//! wall-clock origin, captures the logical origin from the first logical time
//! it sees, zeroes every later timestamp against those origins, and rejects a
//! record whose wall-clock timestamp goes backwards.
//!
//! The JSON-lines transport reads one record per line through a buffered
//! reader, so the trace is never held in memory as a whole.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use trace_types::LogicalTag;

const EVENT_PREFIX: &str = "reactor_cpp:";

pub const EVENT_REACTION_STARTS: &str = "reaction_execution_starts";
pub const EVENT_REACTION_FINISHES: &str = "reaction_execution_finishes";
pub const EVENT_SCHEDULE_ACTION: &str = "schedule_action";
pub const EVENT_TRIGGER_REACTION: &str = "trigger_reaction";

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("trace not found: {}", .0.display())]
    TraceNotFound(PathBuf),
    #[error("corrupt trace {trace} at line {line}: {message}")]
    TraceCorrupt {
        trace: String,
        line: usize,
        message: String,
    },
    #[error("failed to read trace {trace}: {error}")]
    Io {
        trace: String,
        #[source]
        error: std::io::Error,
    },
}

// ── Raw events ───────────────────────────────────────────────────────────────

/// A normalized trace event; all times are relative to the stream's origins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    ReactionStart {
        reactor: String,
        reaction: String,
        ts: i64,
        tag: Option<LogicalTag>,
        worker_id: Option<u32>,
    },
    ReactionEnd {
        reactor: String,
        reaction: String,
        ts: i64,
        tag: Option<LogicalTag>,
        worker_id: Option<u32>,
    },
    ActionScheduled {
        reactor: String,
        action: String,
        ts: i64,
        logical_time: i64,
        microstep: u64,
    },
    ReactionTriggered {
        reactor: String,
        reaction: String,
        ts: i64,
        logical_time: i64,
        microstep: u64,
    },
}

impl RawEvent {
    pub fn ts(&self) -> i64 {
        match self {
            Self::ReactionStart { ts, .. }
            | Self::ReactionEnd { ts, .. }
            | Self::ActionScheduled { ts, .. }
            | Self::ReactionTriggered { ts, .. } => *ts,
        }
    }

    pub fn reactor(&self) -> &str {
        match self {
            Self::ReactionStart { reactor, .. }
            | Self::ReactionEnd { reactor, .. }
            | Self::ActionScheduled { reactor, .. }
            | Self::ReactionTriggered { reactor, .. } => reactor,
        }
    }

    /// Reaction or action name within the reactor.
    pub fn local_name(&self) -> &str {
        match self {
            Self::ReactionStart { reaction, .. }
            | Self::ReactionEnd { reaction, .. }
            | Self::ReactionTriggered { reaction, .. } => reaction,
            Self::ActionScheduled { action, .. } => action,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.reactor(), self.local_name())
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ReactionStart { .. } => EVENT_REACTION_STARTS,
            Self::ReactionEnd { .. } => EVENT_REACTION_FINISHES,
            Self::ActionScheduled { .. } => EVENT_SCHEDULE_ACTION,
            Self::ReactionTriggered { .. } => EVENT_TRIGGER_REACTION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Start,
    Finish,
    Schedule,
    Trigger,
}

impl RecordKind {
    fn parse(event: &str) -> Option<Self> {
        match event.strip_prefix(EVENT_PREFIX).unwrap_or(event) {
            EVENT_REACTION_STARTS => Some(Self::Start),
            EVENT_REACTION_FINISHES => Some(Self::Finish),
            EVENT_SCHEDULE_ACTION => Some(Self::Schedule),
            EVENT_TRIGGER_REACTION => Some(Self::Trigger),
            _ => None,
        }
    }
}

// ── Transport records ────────────────────────────────────────────────────────

/// One record as a transport delivers it, with absolute clocks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceRecord {
    #[serde(alias = "name")]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ns: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_microstep: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<u32>,
}

impl TraceRecord {
    pub fn execution(event: &str, reactor: &str, reaction: &str, ts: i64) -> Self {
        Self {
            event: event.to_string(),
            reactor_name: Some(reactor.to_string()),
            reaction_name: Some(reaction.to_string()),
            action_name: None,
            ts,
            timestamp_ns: None,
            timestamp_microstep: None,
            worker_id: None,
        }
    }

    /// Scheduling or triggering record; the name lands in `action_name` for
    /// `schedule_action` and in `reaction_name` otherwise.
    pub fn tagged(
        event: &str,
        reactor: &str,
        name: &str,
        ts: i64,
        logical_time: i64,
        microstep: u64,
    ) -> Self {
        let is_action = RecordKind::parse(event) == Some(RecordKind::Schedule);
        Self {
            event: event.to_string(),
            reactor_name: Some(reactor.to_string()),
            reaction_name: (!is_action).then(|| name.to_string()),
            action_name: is_action.then(|| name.to_string()),
            ts,
            timestamp_ns: Some(logical_time),
            timestamp_microstep: Some(microstep),
            worker_id: None,
        }
    }

    pub fn with_tag(mut self, logical_time: i64, microstep: u64) -> Self {
        self.timestamp_ns = Some(logical_time);
        self.timestamp_microstep = Some(microstep);
        self
    }

    pub fn with_worker(mut self, worker_id: u32) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    /// Execution records may carry a qualified `reaction_name` instead of a
    /// separate `reactor_name`.
    fn execution_identity(&self) -> Result<(String, String), String> {
        let reaction = self
            .reaction_name
            .as_deref()
            .ok_or_else(|| "missing `reaction_name`".to_string())?;
        match self.reactor_name.as_deref() {
            Some(reactor) => {
                let local = reaction
                    .strip_prefix(reactor)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .unwrap_or(reaction);
                Ok((reactor.to_string(), local.to_string()))
            }
            None => reaction
                .rsplit_once('.')
                .filter(|(reactor, local)| !reactor.is_empty() && !local.is_empty())
                .map(|(reactor, local)| (reactor.to_string(), local.to_string()))
                .ok_or_else(|| format!("cannot split reaction name `{reaction}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedRecord {
    pub line: usize,
    pub record: TraceRecord,
}

/// Newline-delimited JSON transport
pub struct JsonLinesReader<R> {
    reader: R,
    trace: String,
    line: usize,
    buffer: String,
}

impl<R: BufRead> JsonLinesReader<R> {
    pub fn new(reader: R, trace: impl Into<String>) -> Self {
        Self {
            reader,
            trace: trace.into(),
            line: 0,
            buffer: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for JsonLinesReader<R> {
    type Item = Result<LocatedRecord, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buffer.clear();
            match self.reader.read_line(&mut self.buffer) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line += 1;
                    let text = self.buffer.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let parsed = serde_json::from_str::<TraceRecord>(text)
                        .map(|record| LocatedRecord {
                            line: self.line,
                            record,
                        })
                        .map_err(|err| StreamError::TraceCorrupt {
                            trace: self.trace.clone(),
                            line: self.line,
                            message: err.to_string(),
                        });
                    return Some(parsed);
                }
                Err(error) => {
                    return Some(Err(StreamError::Io {
                        trace: self.trace.clone(),
                        error,
                    }))
                }
            }
        }
    }
}

pub type RecordSource = std::vec::IntoIter<Result<LocatedRecord, StreamError>>;
pub type FileEventStream = EventStream<JsonLinesReader<BufReader<File>>>;

/// Opens a JSON-lines trace file.
pub fn open(path: impl AsRef<Path>) -> Result<FileEventStream, StreamError> {
    let path = path.as_ref();
    let trace = path.display().to_string();
    let file = File::open(path).map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            StreamError::TraceNotFound(path.to_path_buf())
        } else {
            StreamError::Io {
                trace: trace.clone(),
                error,
            }
        }
    })?;
    let stream = EventStream::new(JsonLinesReader::new(BufReader::new(file), trace.clone()), trace)?;
    tracing::info!(path = %path.display(), wall_origin = ?stream.wall_origin(), "Opened trace");
    Ok(stream)
}

// ── EventStream ──────────────────────────────────────────────────────────────

pub struct EventStream<S> {
    source: S,
    trace: String,
    lookahead: Option<(LocatedRecord, RecordKind)>,
    wall_origin: Option<i64>,
    logical_origin: Option<i64>,
    last_ts: Option<i64>,
    done: bool,
}

impl EventStream<RecordSource> {
    /// In-memory stream; records are numbered from line 1.
    pub fn from_records(records: Vec<TraceRecord>) -> Result<Self, StreamError> {
        let located: Vec<Result<LocatedRecord, StreamError>> = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                Ok(LocatedRecord {
                    line: index + 1,
                    record,
                })
            })
            .collect();
        EventStream::new(located.into_iter(), "<memory>")
    }
}

impl<S> EventStream<S>
where
    S: Iterator<Item = Result<LocatedRecord, StreamError>>,
{
    /// Peeks the first recognized record to fix the wall-clock origin.
    pub fn new(source: S, trace: impl Into<String>) -> Result<Self, StreamError> {
        let mut stream = Self {
            source,
            trace: trace.into(),
            lookahead: None,
            wall_origin: None,
            logical_origin: None,
            last_ts: None,
            done: false,
        };
        stream.lookahead = stream.next_recognized()?;
        stream.wall_origin = stream
            .lookahead
            .as_ref()
            .map(|(located, _)| located.record.ts);
        Ok(stream)
    }

    pub fn wall_origin(&self) -> Option<i64> {
        self.wall_origin
    }

    pub fn logical_origin(&self) -> Option<i64> {
        self.logical_origin
    }

    fn next_recognized(&mut self) -> Result<Option<(LocatedRecord, RecordKind)>, StreamError> {
        for item in self.source.by_ref() {
            let located = item?;
            match RecordKind::parse(&located.record.event) {
                Some(kind) => return Ok(Some((located, kind))),
                None => {
                    tracing::debug!(
                        line = located.line,
                        event = %located.record.event,
                        "Skipping record outside the event vocabulary"
                    );
                }
            }
        }
        Ok(None)
    }

    fn corrupt(&self, line: usize, message: impl Into<String>) -> StreamError {
        StreamError::TraceCorrupt {
            trace: self.trace.clone(),
            line,
            message: message.into(),
        }
    }

    fn normalize(&mut self, located: LocatedRecord, kind: RecordKind) -> Result<RawEvent, StreamError> {
        let LocatedRecord { line, record } = located;

        if let Some(last) = self.last_ts {
            if record.ts < last {
                return Err(self.corrupt(
                    line,
                    format!("timestamp {} precedes previous timestamp {last}", record.ts),
                ));
            }
        }
        self.last_ts = Some(record.ts);

        let wall_origin = *self.wall_origin.get_or_insert(record.ts);
        let ts = record.ts.checked_sub(wall_origin).ok_or_else(|| {
            self.corrupt(
                line,
                format!("timestamp {} is out of range of origin {wall_origin}", record.ts),
            )
        })?;
        let tag = match record.timestamp_ns {
            Some(logical_time) => {
                let origin = *self.logical_origin.get_or_insert(logical_time);
                let relative = logical_time.checked_sub(origin).ok_or_else(|| {
                    self.corrupt(
                        line,
                        format!("logical time {logical_time} is out of range of origin {origin}"),
                    )
                })?;
                Some(LogicalTag::new(
                    relative,
                    record.timestamp_microstep.unwrap_or(0),
                ))
            }
            None => None,
        };

        let event = match kind {
            RecordKind::Start | RecordKind::Finish => {
                let (reactor, reaction) = record
                    .execution_identity()
                    .map_err(|message| self.corrupt(line, message))?;
                if kind == RecordKind::Start {
                    RawEvent::ReactionStart {
                        reactor,
                        reaction,
                        ts,
                        tag,
                        worker_id: record.worker_id,
                    }
                } else {
                    RawEvent::ReactionEnd {
                        reactor,
                        reaction,
                        ts,
                        tag,
                        worker_id: record.worker_id,
                    }
                }
            }
            RecordKind::Schedule | RecordKind::Trigger => {
                let tag = tag.ok_or_else(|| self.corrupt(line, "missing `timestamp_ns`"))?;
                let reactor = record
                    .reactor_name
                    .ok_or_else(|| self.corrupt(line, "missing `reactor_name`"))?;
                if kind == RecordKind::Schedule {
                    let action = record
                        .action_name
                        .ok_or_else(|| self.corrupt(line, "missing `action_name`"))?;
                    RawEvent::ActionScheduled {
                        reactor,
                        action,
                        ts,
                        logical_time: tag.logical_time,
                        microstep: tag.microstep,
                    }
                } else {
                    let reaction = record
                        .reaction_name
                        .ok_or_else(|| self.corrupt(line, "missing `reaction_name`"))?;
                    RawEvent::ReactionTriggered {
                        reactor,
                        reaction,
                        ts,
                        logical_time: tag.logical_time,
                        microstep: tag.microstep,
                    }
                }
            }
        };
        Ok(event)
    }
}

impl<S> Iterator for EventStream<S>
where
    S: Iterator<Item = Result<LocatedRecord, StreamError>>,
{
    type Item = Result<RawEvent, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = match self.lookahead.take() {
            Some(pending) => Ok(Some(pending)),
            None => self.next_recognized(),
        };
        let result = match next {
            Ok(Some((located, kind))) => self.normalize(located, kind),
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}
