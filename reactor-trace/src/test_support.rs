//! Shared fixtures for unit tests.

use crate::event_stream::TraceRecord;

/// Two communicating reactors plus a relay:
/// - `A.r1` (startup-triggered) effects `B.r2` directly and schedules `A.act`
/// - `A.act` triggers `A.r3`, which writes `A.out` and reschedules `A.act`
/// - `A.out` reaches `B.in` through the relay port `C.relay`; `B.in` triggers `B.r4`
/// - `B.idle` has neither triggers nor effects
pub const TWO_REACTOR_SCHEMA: &str = r#"
top_level_instances:
  - Main
all_reactor_instances:
  Main:
    reactions: null
    triggers: null
    inputs: null
    outputs: null
  A:
    reactions:
      - name: r1
        priority: 1
        level: 0
        triggers: [A.startup]
        effects: [B.r2, A.act]
      - name: r3
        priority: 2
        level: 1
        triggers: [A.act]
        effects: [A.out, A.act]
    triggers:
      - name: startup
        type: startup
        effect_of: null
        trigger_of: [A.r1]
      - name: act
        type: logical action
        effect_of: [A.r1]
        trigger_of: [A.r3]
    inputs: null
    outputs:
      out:
        upstream_port: null
        downstream_ports: [C.relay]
        trigger_of: null
  B:
    reactions:
      - name: r2
        priority: 1
        level: 1
        triggers: [A.r1]
        effects: null
      - name: r4
        priority: 2
        level: 2
        triggers: [B.in]
        effects: []
      - name: idle
        priority: 3
        level: 0
        triggers: null
        effects: null
    triggers: null
    inputs:
      in:
        upstream_port: C.relay
        downstream_ports: []
        trigger_of: [B.r4]
    outputs: null
  C:
    reactions: null
    triggers: null
    inputs:
      relay:
        upstream_port: A.out
        downstream_ports: [B.in]
        trigger_of: null
    outputs: null
reaction_dependencies:
  - from: B.r2
    to: A.r1
  - from: A.r3
  - to: A.r1
  - from: B.r4
    to: A.r3
"#;

pub fn start(reactor: &str, reaction: &str, ts: i64) -> TraceRecord {
    TraceRecord::execution("reaction_execution_starts", reactor, reaction, ts)
}

pub fn finish(reactor: &str, reaction: &str, ts: i64) -> TraceRecord {
    TraceRecord::execution("reaction_execution_finishes", reactor, reaction, ts)
}

pub fn triggered(reactor: &str, reaction: &str, ts: i64, logical_time: i64) -> TraceRecord {
    TraceRecord::tagged("trigger_reaction", reactor, reaction, ts, logical_time, 0)
}

pub fn scheduled(reactor: &str, action: &str, ts: i64, logical_time: i64) -> TraceRecord {
    TraceRecord::tagged("schedule_action", reactor, action, ts, logical_time, 0)
}
