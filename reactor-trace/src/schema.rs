//! Static schema index
//!
//! Loads the reactor schema exported alongside a trace (YAML) and answers:
//! - attribute lookup by `(reactor, name)`
//! - which identifiers are actions, and which entities are redundant
//! - the declared reaction dependency graph
//! - port routing from an output port to the reactions it eventually triggers
//!
//! Two field-name conventions exist across schema versions: reactions use
//! `triggers`/`effects`, trigger entries use `effect_of`/`trigger_of`. Both are
//! normalized into `triggers`/`effects` here.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use trace_types::EntityKind;

const KEY_REACTOR_INSTANCES: &str = "all_reactor_instances";
const KEY_REACTION_DEPENDENCIES: &str = "reaction_dependencies";
const KEY_TOP_LEVEL_INSTANCES: &str = "top_level_instances";

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("failed to read schema {path}: {error}")]
    Io {
        path: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to parse schema YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("schema is missing required key `{0}`")]
    MissingKey(&'static str),
    #[error("invalid reactor `{reactor}`: {message}")]
    InvalidReactor { reactor: String, message: String },
    #[error("invalid trigger `{reactor}.{name}`: {message}")]
    InvalidTrigger {
        reactor: String,
        name: String,
        message: String,
    },
    #[error("invalid reaction_dependencies entry {index}: {message}")]
    InvalidDependencies { index: usize, message: String },
    #[error("entity `{0}` is declared more than once")]
    DuplicateEntity(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("routing cycle from port `{origin}` through `{port}`")]
    RoutingCycle { origin: String, port: String },
    #[error("unknown port: {0}")]
    UnknownPort(String),
}

// ── Identifiers ──────────────────────────────────────────────────────────────

/// `(reactor, local name)` pair identifying a reaction, action or port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    pub reactor: String,
    pub name: String,
}

impl EntityId {
    pub fn new(reactor: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            reactor: reactor.into(),
            name: name.into(),
        }
    }

    /// Splits `reactor.name` at the last dot; reactor names may contain dots.
    pub fn parse(qualified: &str) -> Option<Self> {
        let (reactor, name) = qualified.rsplit_once('.')?;
        if reactor.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(reactor, name))
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.reactor, self.name)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.reactor, self.name)
    }
}

// ── Schema model ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionSchema {
    pub id: EntityId,
    pub kind: EntityKind,
    pub priority: Option<i64>,
    pub level: Option<i64>,
    pub triggers: Vec<String>,
    pub effects: Vec<String>,
}

impl ReactionSchema {
    pub fn qualified_name(&self) -> String {
        self.id.qualified()
    }

    /// No triggers and no effects: nothing can cause it and it causes nothing.
    pub fn is_redundant(&self) -> bool {
        self.triggers.is_empty() && self.effects.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEdge {
    pub port_name: String,
    pub upstream_port: Option<String>,
    pub downstream_ports: Vec<String>,
    /// Reactions this port triggers directly
    pub trigger_of: Vec<String>,
}

impl PortEdge {
    /// Output port at the head of a routing chain.
    pub fn is_origin(&self) -> bool {
        self.upstream_port.is_none() && !self.downstream_ports.is_empty()
    }
}

/// Routes for every origin port; cycles are reported instead of failing the whole map.
#[derive(Debug, Clone, Default)]
pub struct PortRoutes {
    pub routes: HashMap<String, Vec<String>>,
    pub failures: Vec<RoutingError>,
}

// ── Raw YAML shapes ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct RawReactor {
    #[serde(default)]
    reactions: Option<Vec<RawReaction>>,
    #[serde(default)]
    triggers: Option<Vec<Mapping>>,
    #[serde(default)]
    inputs: Option<Mapping>,
    #[serde(default)]
    outputs: Option<Mapping>,
}

#[derive(Debug, Deserialize)]
struct RawReaction {
    name: String,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    level: Option<i64>,
    #[serde(default, alias = "effect_of")]
    triggers: Option<Vec<String>>,
    #[serde(default, alias = "trigger_of")]
    effects: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawPort {
    #[serde(default)]
    upstream_port: Option<String>,
    #[serde(default)]
    downstream_ports: Option<Vec<String>>,
    #[serde(default)]
    trigger_of: Option<Vec<String>>,
}

// ── SchemaIndex ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SchemaIndex {
    main_reactor: String,
    entries: HashMap<EntityId, ReactionSchema>,
    order: Vec<EntityId>,
    ports: HashMap<String, PortEdge>,
    port_order: Vec<String>,
    actions: HashSet<String>,
    redundant: HashSet<String>,
    /// dependent reaction -> reactions it depends on
    upstreams: HashMap<String, Vec<String>>,
}

impl SchemaIndex {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|error| SchemaError::Io {
            path: path.display().to_string(),
            error,
        })?;
        let index = Self::from_yaml_str(&content)?;
        tracing::info!(
            path = %path.display(),
            entities = index.len(),
            ports = index.ports.len(),
            main_reactor = %index.main_reactor,
            "Loaded reactor schema"
        );
        Ok(index)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, SchemaError> {
        let document: Value = serde_yaml::from_str(content)?;
        let document = match document {
            Value::Mapping(mapping) => mapping,
            _ => return Err(SchemaError::MissingKey(KEY_REACTOR_INSTANCES)),
        };

        let instances = required_key(&document, KEY_REACTOR_INSTANCES)?;
        let dependencies = required_key(&document, KEY_REACTION_DEPENDENCIES)?;
        let top_level = required_key(&document, KEY_TOP_LEVEL_INSTANCES)?;

        let mut index = Self {
            main_reactor: parse_main_reactor(top_level)?,
            ..Self::default()
        };

        match instances {
            Value::Mapping(reactors) => {
                for (key, value) in reactors {
                    let reactor = key_to_string(key);
                    index.add_reactor(&reactor, value)?;
                }
            }
            Value::Null => {}
            _ => {
                return Err(SchemaError::InvalidReactor {
                    reactor: KEY_REACTOR_INSTANCES.to_string(),
                    message: "expected a map of reactor instances".to_string(),
                })
            }
        }

        index.upstreams = parse_dependencies(dependencies)?;
        Ok(index)
    }

    fn add_reactor(&mut self, reactor: &str, value: &Value) -> Result<(), SchemaError> {
        let raw: RawReactor = match value {
            Value::Null => RawReactor::default(),
            other => serde_yaml::from_value(other.clone()).map_err(|err| {
                SchemaError::InvalidReactor {
                    reactor: reactor.to_string(),
                    message: err.to_string(),
                }
            })?,
        };

        for reaction in raw.reactions.unwrap_or_default() {
            self.insert(ReactionSchema {
                id: EntityId::new(reactor, reaction.name),
                kind: EntityKind::Reaction,
                priority: reaction.priority,
                level: reaction.level,
                triggers: reaction.triggers.unwrap_or_default(),
                effects: reaction.effects.unwrap_or_default(),
            })?;
        }

        for trigger in raw.triggers.unwrap_or_default() {
            let entry = parse_trigger(reactor, &trigger)?;
            if entry.kind.is_action() {
                self.actions.insert(entry.qualified_name());
            }
            self.insert(entry)?;
        }

        for ports in [raw.inputs, raw.outputs].into_iter().flatten() {
            for (key, value) in ports {
                let port_name = format!("{reactor}.{}", key_to_string(&key));
                let port: RawPort = match value {
                    Value::Null => RawPort {
                        upstream_port: None,
                        downstream_ports: None,
                        trigger_of: None,
                    },
                    other => serde_yaml::from_value(other).map_err(|err| {
                        SchemaError::InvalidReactor {
                            reactor: reactor.to_string(),
                            message: format!("port `{port_name}`: {err}"),
                        }
                    })?,
                };
                if !self.ports.contains_key(&port_name) {
                    self.port_order.push(port_name.clone());
                }
                self.ports.insert(
                    port_name.clone(),
                    PortEdge {
                        port_name,
                        upstream_port: port.upstream_port,
                        downstream_ports: port.downstream_ports.unwrap_or_default(),
                        trigger_of: port.trigger_of.unwrap_or_default(),
                    },
                );
            }
        }

        Ok(())
    }

    fn insert(&mut self, entry: ReactionSchema) -> Result<(), SchemaError> {
        if self.entries.contains_key(&entry.id) {
            return Err(SchemaError::DuplicateEntity(entry.qualified_name()));
        }
        if entry.is_redundant() {
            self.redundant.insert(entry.qualified_name());
        }
        self.order.push(entry.id.clone());
        self.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn main_reactor(&self) -> &str {
        &self.main_reactor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, reactor: &str, name: &str) -> Result<&ReactionSchema, LookupError> {
        self.entries
            .get(&EntityId::new(reactor, name))
            .ok_or_else(|| LookupError::UnknownEntity(format!("{reactor}.{name}")))
    }

    pub fn lookup_qualified(&self, qualified: &str) -> Option<&ReactionSchema> {
        EntityId::parse(qualified).and_then(|id| self.entries.get(&id))
    }

    /// Entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ReactionSchema> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Qualified names in declaration order.
    pub fn all_identifiers(&self) -> impl Iterator<Item = String> + '_ {
        self.order.iter().map(EntityId::qualified)
    }

    pub fn action_identifiers(&self) -> &HashSet<String> {
        &self.actions
    }

    pub fn is_action(&self, identifier: &str) -> bool {
        self.actions.contains(identifier)
    }

    pub fn redundant_entities(&self) -> &HashSet<String> {
        &self.redundant
    }

    pub fn is_redundant(&self, identifier: &str) -> bool {
        self.redundant.contains(identifier)
    }

    /// True when the schema declares `dependent` to depend on `upstream`.
    pub fn depends_on(&self, dependent: &str, upstream: &str) -> bool {
        self.upstreams
            .get(dependent)
            .is_some_and(|ups| ups.iter().any(|u| u == upstream))
    }

    pub fn upstreams_of(&self, dependent: &str) -> &[String] {
        self.upstreams
            .get(dependent)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn port(&self, name: &str) -> Option<&PortEdge> {
        self.ports.get(name)
    }

    pub fn is_port(&self, name: &str) -> bool {
        self.ports.contains_key(name)
    }

    pub fn ports(&self) -> impl Iterator<Item = &PortEdge> {
        self.port_order.iter().filter_map(|name| self.ports.get(name))
    }

    // ── Port routing ─────────────────────────────────────────────────────────

    /// Reactions reached by following `downstream_ports` from `port_name`.
    ///
    /// A downstream port with direct triggers contributes those reactions and
    /// is not expanded further; one without is expanded through its own
    /// downstream ports. Result is deduplicated, in discovery order.
    pub fn resolve_port_chain(&self, port_name: &str) -> Result<Vec<String>, RoutingError> {
        let origin = self
            .ports
            .get(port_name)
            .ok_or_else(|| RoutingError::UnknownPort(port_name.to_string()))?;

        let mut reactions = Vec::new();
        let mut path = vec![origin.port_name.as_str()];
        let mut finished = HashSet::new();
        self.follow_downstream(origin, &mut path, &mut finished, &mut reactions)?;
        Ok(reactions)
    }

    fn follow_downstream<'a>(
        &'a self,
        port: &'a PortEdge,
        path: &mut Vec<&'a str>,
        finished: &mut HashSet<&'a str>,
        reactions: &mut Vec<String>,
    ) -> Result<(), RoutingError> {
        for next_name in &port.downstream_ports {
            if path.contains(&next_name.as_str()) {
                return Err(RoutingError::RoutingCycle {
                    origin: path[0].to_string(),
                    port: next_name.clone(),
                });
            }
            if finished.contains(next_name.as_str()) {
                continue;
            }
            let next = self
                .ports
                .get(next_name)
                .ok_or_else(|| RoutingError::UnknownPort(next_name.clone()))?;

            if next.trigger_of.is_empty() {
                path.push(next.port_name.as_str());
                self.follow_downstream(next, path, finished, reactions)?;
                path.pop();
            } else {
                for reaction in &next.trigger_of {
                    if !reactions.contains(reaction) {
                        reactions.push(reaction.clone());
                    }
                }
            }
            finished.insert(next.port_name.as_str());
        }
        Ok(())
    }

    pub fn port_routes(&self) -> PortRoutes {
        let mut routes = PortRoutes::default();
        for port in self.ports().filter(|port| port.is_origin()) {
            match self.resolve_port_chain(&port.port_name) {
                Ok(reactions) => {
                    routes.routes.insert(port.port_name.clone(), reactions);
                }
                Err(err) => {
                    tracing::warn!(port = %port.port_name, error = %err, "Port chain unresolved");
                    routes.failures.push(err);
                }
            }
        }
        routes
    }
}

// ── Parsing helpers ──────────────────────────────────────────────────────────

fn required_key<'a>(document: &'a Mapping, key: &'static str) -> Result<&'a Value, SchemaError> {
    document.get(key).ok_or(SchemaError::MissingKey(key))
}

fn key_to_string(key: &Value) -> String {
    match key {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        other => serde_yaml::to_string(other)
            .map(|text| text.trim().to_string())
            .unwrap_or_default(),
    }
}

fn parse_main_reactor(value: &Value) -> Result<String, SchemaError> {
    value
        .as_sequence()
        .and_then(|items| items.first())
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| SchemaError::InvalidReactor {
            reactor: KEY_TOP_LEVEL_INSTANCES.to_string(),
            message: "expected a non-empty list of reactor names".to_string(),
        })
}

fn parse_kind(raw: &str) -> Option<EntityKind> {
    match raw.trim().replace(' ', "_").as_str() {
        "logical_action" => Some(EntityKind::LogicalAction),
        "physical_action" => Some(EntityKind::PhysicalAction),
        "startup" => Some(EntityKind::Startup),
        "shutdown" => Some(EntityKind::Shutdown),
        "timer" => Some(EntityKind::Timer),
        _ => None,
    }
}

/// First present field among `names`; `None` when none is present.
fn routing_field(
    entry: &Mapping,
    names: &[&str],
) -> Option<Result<Vec<String>, String>> {
    let (name, value) = names
        .iter()
        .find_map(|name| entry.get(*name).map(|value| (*name, value)))?;
    Some(identifier_list(value).map_err(|message| format!("`{name}`: {message}")))
}

fn identifier_list(value: &Value) -> Result<Vec<String>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(ToString::to_string)
                    .ok_or_else(|| "expected a list of identifiers".to_string())
            })
            .collect(),
        _ => Err("expected a list of identifiers".to_string()),
    }
}

fn parse_trigger(reactor: &str, entry: &Mapping) -> Result<ReactionSchema, SchemaError> {
    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| SchemaError::InvalidReactor {
            reactor: reactor.to_string(),
            message: "trigger entry without a `name`".to_string(),
        })?
        .to_string();
    let invalid = |message: String| SchemaError::InvalidTrigger {
        reactor: reactor.to_string(),
        name: name.clone(),
        message,
    };

    let raw_type = entry
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing `type`".to_string()))?;
    let kind = parse_kind(raw_type).ok_or_else(|| invalid(format!("unknown type `{raw_type}`")))?;

    let triggers = routing_field(entry, &["effect_of", "triggers"])
        .ok_or_else(|| invalid(format!("type `{raw_type}` without `effect_of`")))?
        .map_err(&invalid)?;
    let effects = routing_field(entry, &["trigger_of", "effects"])
        .ok_or_else(|| invalid(format!("type `{raw_type}` without `trigger_of`")))?
        .map_err(&invalid)?;

    Ok(ReactionSchema {
        id: EntityId::new(reactor, name.clone()),
        kind,
        priority: None,
        level: None,
        triggers,
        effects,
    })
}

/// Entries are either combined `{from, to}` maps or a `{from}` map followed by a
/// `{to}` map. The `from` reaction depends on the `to` reaction.
fn parse_dependencies(value: &Value) -> Result<HashMap<String, Vec<String>>, SchemaError> {
    let entries = match value {
        Value::Null => return Ok(HashMap::new()),
        Value::Sequence(entries) => entries,
        _ => {
            return Err(SchemaError::InvalidDependencies {
                index: 0,
                message: "expected a list".to_string(),
            })
        }
    };

    let mut upstreams: HashMap<String, Vec<String>> = HashMap::new();
    let mut pending_from: Option<String> = None;

    for (index, entry) in entries.iter().enumerate() {
        let from = entry.get("from").and_then(Value::as_str).map(ToString::to_string);
        let to = entry.get("to").and_then(Value::as_str).map(ToString::to_string);

        let (dependent, upstream) = match (pending_from.take(), from, to) {
            (None, Some(from), Some(to)) => (from, to),
            (None, Some(from), None) => {
                pending_from = Some(from);
                continue;
            }
            (Some(from), None, Some(to)) => (from, to),
            (Some(from), _, _) => {
                return Err(SchemaError::InvalidDependencies {
                    index,
                    message: format!("expected a `to` entry after `from: {from}`"),
                })
            }
            (None, _, _) => {
                return Err(SchemaError::InvalidDependencies {
                    index,
                    message: "expected a `from` entry".to_string(),
                })
            }
        };

        let entry = upstreams.entry(dependent).or_default();
        if !entry.contains(&upstream) {
            entry.push(upstream);
        }
    }

    if let Some(from) = pending_from {
        return Err(SchemaError::InvalidDependencies {
            index: entries.len(),
            message: format!("`from: {from}` has no matching `to`"),
        });
    }

    Ok(upstreams)
}
