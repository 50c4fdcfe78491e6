//! Petri-net construction and workflow analysis
//!
//! Places are the events steps actually consume or emit; transitions are
//! steps. External events (those with a trigger kind) provide the initial
//! marking; events emitted but never consumed form the final marking. When
//! no such sink event exists, a `workflow_complete` place is synthesized and
//! fed by every step that emits nothing.
//!
//! The analysis checks workflow-net shape (one source, one sink, every node
//! on a source→sink path), soundness via bounded token-game reachability
//! (completion reachable from every marking, no dead transitions, bounded
//! state space), and acyclicity of the transition graph for acyclic plans.

use crate::plan::Plan;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Synthesized sink place; plans must never declare it
pub const COMPLETION_PLACE: &str = "workflow_complete";

const MAX_STATES: usize = 20_000;
const TOKEN_BOUND: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Place(String),
    Transition(String),
}

#[derive(Debug)]
struct TransitionDef {
    name: String,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

/// A Petri net built from a plan, with initial and final markings
#[derive(Debug)]
pub struct PetriNet {
    graph: DiGraph<Node, ()>,
    place_names: Vec<String>,
    place_nodes: Vec<NodeIndex>,
    transition_nodes: Vec<NodeIndex>,
    transitions: Vec<TransitionDef>,
    initial_marking: Vec<u8>,
    final_marking: Vec<u8>,
}

/// Build the net from a plan
///
/// Fails when a step consumes an event that is neither declared nor emitted
/// by any step.
pub fn build(plan: &Plan) -> Result<PetriNet, String> {
    let mut used: BTreeSet<&str> = BTreeSet::new();
    for step in &plan.steps {
        used.extend(step.on.iter().map(String::as_str));
        used.extend(step.emits.iter().map(String::as_str));
    }

    // Places: declared events that are used, plus any emitted event
    let mut place_ids: BTreeMap<String, usize> = BTreeMap::new();
    for event in &plan.events {
        if used.contains(event.name.as_str()) {
            let next = place_ids.len();
            place_ids.entry(event.name.clone()).or_insert(next);
        }
    }
    for step in &plan.steps {
        for emitted in &step.emits {
            let next = place_ids.len();
            place_ids.entry(emitted.clone()).or_insert(next);
        }
    }

    let mut transitions = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        let mut inputs = Vec::with_capacity(step.on.len());
        for event_name in &step.on {
            let id = place_ids.get(event_name).ok_or_else(|| {
                format!(
                    "Step '{}' references unknown event: {}",
                    step.name, event_name
                )
            })?;
            inputs.push(*id);
        }
        let outputs = step
            .emits
            .iter()
            .map(|e| place_ids[e])
            .collect();
        transitions.push(TransitionDef {
            name: step.name.clone(),
            inputs,
            outputs,
        });
    }

    // Initial marking: one token per external event place
    let external: BTreeSet<&str> = plan
        .events
        .iter()
        .filter(|e| e.kind.is_some())
        .map(|e| e.name.as_str())
        .collect();

    let consumed: BTreeSet<&str> = plan
        .steps
        .iter()
        .flat_map(|s| s.on.iter().map(String::as_str))
        .collect();
    let emitted: BTreeSet<&str> = plan
        .steps
        .iter()
        .flat_map(|s| s.emits.iter().map(String::as_str))
        .collect();

    // Final marking: emitted-but-never-consumed events, or a synthesized sink
    let sink_events: Vec<&str> = emitted.difference(&consumed).copied().collect();
    let needs_completion_place = sink_events.is_empty();
    if needs_completion_place {
        let next = place_ids.len();
        place_ids.insert(COMPLETION_PLACE.to_string(), next);
        let completion = place_ids[COMPLETION_PLACE];
        for (step, transition) in plan.steps.iter().zip(transitions.iter_mut()) {
            if step.emits.is_empty() {
                transition.outputs.push(completion);
            }
        }
    }

    let mut place_names = vec![String::new(); place_ids.len()];
    for (name, id) in &place_ids {
        place_names[*id] = name.clone();
    }

    let mut initial_marking = vec![0u8; place_ids.len()];
    for name in &external {
        if let Some(id) = place_ids.get(*name) {
            initial_marking[*id] = 1;
        }
    }

    let mut final_marking = vec![0u8; place_ids.len()];
    if needs_completion_place {
        final_marking[place_ids[COMPLETION_PLACE]] = 1;
    } else {
        for name in &sink_events {
            final_marking[place_ids[*name]] = 1;
        }
    }

    // Graph mirror for the structural checks
    let mut graph = DiGraph::new();
    let place_nodes: Vec<NodeIndex> = place_names
        .iter()
        .map(|name| graph.add_node(Node::Place(name.clone())))
        .collect();
    let mut transition_nodes = Vec::with_capacity(transitions.len());
    for transition in &transitions {
        let node = graph.add_node(Node::Transition(transition.name.clone()));
        for input in &transition.inputs {
            graph.add_edge(place_nodes[*input], node, ());
        }
        for output in &transition.outputs {
            graph.add_edge(node, place_nodes[*output], ());
        }
        transition_nodes.push(node);
    }

    Ok(PetriNet {
        graph,
        place_names,
        place_nodes,
        transition_nodes,
        transitions,
        initial_marking,
        final_marking,
    })
}

impl PetriNet {
    pub fn place_names(&self) -> &[String] {
        &self.place_names
    }

    /// Check workflow-net shape: exactly one source place, exactly one sink
    /// place, and every node on a path from source to sink
    pub fn check_workflow_net(&self) -> Result<(), String> {
        let mut sources = Vec::new();
        let mut sinks = Vec::new();
        let mut isolated = Vec::new();
        for (id, node) in self.place_nodes.iter().enumerate() {
            let in_degree = self.graph.edges_directed(*node, Direction::Incoming).count();
            let out_degree = self.graph.edges_directed(*node, Direction::Outgoing).count();
            match (in_degree, out_degree) {
                (0, 0) => isolated.push(self.place_names[id].clone()),
                (0, _) => sources.push(*node),
                (_, 0) => sinks.push(*node),
                _ => {}
            }
        }

        if !isolated.is_empty() {
            return Err(format!(
                "isolated places (no arcs): {}",
                isolated.join(", ")
            ));
        }
        if sources.len() != 1 {
            return Err(format!(
                "a workflow net requires exactly one source place, found {}",
                sources.len()
            ));
        }
        if sinks.len() != 1 {
            return Err(format!(
                "a workflow net requires exactly one sink place, found {}",
                sinks.len()
            ));
        }

        let forward = reachable(&self.graph, sources[0], Direction::Outgoing);
        let backward = reachable(&self.graph, sinks[0], Direction::Incoming);
        for node in self.place_nodes.iter().chain(self.transition_nodes.iter()) {
            if !forward.contains(node) || !backward.contains(node) {
                let name = match &self.graph[*node] {
                    Node::Place(n) | Node::Transition(n) => n.clone(),
                };
                return Err(format!(
                    "node '{}' is not on a path from source to sink",
                    name
                ));
            }
        }
        Ok(())
    }

    /// Check soundness by exploring the token game from the initial marking
    ///
    /// Requires a bounded state space, the final marking reachable from
    /// every reachable marking, and no dead transitions.
    pub fn check_soundness(&self) -> Result<(), String> {
        if self.initial_marking.iter().all(|t| *t == 0) {
            return Err("no external event provides an initial token".to_string());
        }

        let mut state_ids: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut states: Vec<Vec<u8>> = Vec::new();
        let mut edges: Vec<Vec<usize>> = Vec::new();
        let mut fired = vec![false; self.transitions.len()];

        state_ids.insert(self.initial_marking.clone(), 0);
        states.push(self.initial_marking.clone());
        edges.push(Vec::new());

        let mut frontier = VecDeque::from([0usize]);
        while let Some(state_id) = frontier.pop_front() {
            let marking = states[state_id].clone();
            for (t_id, transition) in self.transitions.iter().enumerate() {
                if !transition.inputs.iter().all(|p| marking[*p] > 0) {
                    continue;
                }
                fired[t_id] = true;
                let mut next = marking.clone();
                for p in &transition.inputs {
                    next[*p] -= 1;
                }
                for p in &transition.outputs {
                    if next[*p] >= TOKEN_BOUND {
                        return Err(format!(
                            "net is not bounded: place '{}' accumulates tokens",
                            self.place_names[*p]
                        ));
                    }
                    next[*p] += 1;
                }
                let next_id = match state_ids.get(&next) {
                    Some(id) => *id,
                    None => {
                        if states.len() >= MAX_STATES {
                            return Err("state space too large to verify soundness".to_string());
                        }
                        let id = states.len();
                        state_ids.insert(next.clone(), id);
                        states.push(next);
                        edges.push(Vec::new());
                        frontier.push_back(id);
                        id
                    }
                };
                edges[state_id].push(next_id);
            }
        }

        let final_id = match state_ids.get(&self.final_marking) {
            Some(id) => *id,
            None => return Err("the final marking is not reachable".to_string()),
        };

        // Every reachable marking must still be able to complete
        let mut can_complete = vec![false; states.len()];
        can_complete[final_id] = true;
        let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); states.len()];
        for (from, tos) in edges.iter().enumerate() {
            for to in tos {
                reverse[*to].push(from);
            }
        }
        let mut frontier = VecDeque::from([final_id]);
        while let Some(state_id) = frontier.pop_front() {
            for prev in &reverse[state_id] {
                if !can_complete[*prev] {
                    can_complete[*prev] = true;
                    frontier.push_back(*prev);
                }
            }
        }
        if let Some(stuck) = can_complete.iter().position(|ok| !ok) {
            return Err(format!(
                "deadlock: marking {:?} cannot reach completion",
                describe_marking(&states[stuck], &self.place_names)
            ));
        }

        if let Some(dead) = fired.iter().position(|f| !f) {
            return Err(format!(
                "transition '{}' can never fire",
                self.transitions[dead].name
            ));
        }

        Ok(())
    }

    /// For acyclic plans: reject any cycle in the transition→transition
    /// graph (transitions connected through shared places)
    pub fn check_acyclic(&self) -> Result<(), String> {
        // Adjacency: t1 → t2 when t1 emits into a place t2 consumes
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.transitions.len()];
        for (t1, from) in self.transitions.iter().enumerate() {
            for (t2, to) in self.transitions.iter().enumerate() {
                if from.outputs.iter().any(|p| to.inputs.contains(p)) {
                    adjacency[t1].push(t2);
                }
            }
        }

        // DFS with an explicit recursion stack
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InStack,
            Done,
        }
        let mut marks = vec![Mark::Unvisited; self.transitions.len()];

        fn visit(
            node: usize,
            adjacency: &[Vec<usize>],
            marks: &mut [Mark],
            names: &[String],
        ) -> Result<(), String> {
            marks[node] = Mark::InStack;
            for next in &adjacency[node] {
                match marks[*next] {
                    Mark::InStack => {
                        return Err(format!(
                            "cycle detected in acyclic plan through step '{}'",
                            names[*next]
                        ))
                    }
                    Mark::Unvisited => visit(*next, adjacency, marks, names)?,
                    Mark::Done => {}
                }
            }
            marks[node] = Mark::Done;
            Ok(())
        }

        let names: Vec<String> = self.transitions.iter().map(|t| t.name.clone()).collect();
        for node in 0..self.transitions.len() {
            if marks[node] == Mark::Unvisited {
                visit(node, &adjacency, &mut marks, &names)?;
            }
        }
        Ok(())
    }
}

fn reachable(
    graph: &DiGraph<Node, ()>,
    start: NodeIndex,
    direction: Direction,
) -> BTreeSet<NodeIndex> {
    let mut seen = BTreeSet::new();
    let mut frontier = VecDeque::from([start]);
    seen.insert(start);
    while let Some(node) = frontier.pop_front() {
        for edge in graph.edges_directed(node, direction) {
            let next = match direction {
                Direction::Outgoing => edge.target(),
                Direction::Incoming => edge.source(),
            };
            if seen.insert(next) {
                frontier.push_back(next);
            }
        }
    }
    seen
}

fn describe_marking(marking: &[u8], names: &[String]) -> Vec<String> {
    marking
        .iter()
        .enumerate()
        .filter(|(_, tokens)| **tokens > 0)
        .map(|(id, tokens)| format!("{}={}", names[id], tokens))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::GraphType;

    fn plan_from_json(json: serde_json::Value) -> Plan {
        serde_json::from_value(json).unwrap()
    }

    fn linear_plan() -> Plan {
        plan_from_json(serde_json::json!({
            "plan_name": "linear",
            "graph_type": "acyclic",
            "events": [{"name": "event.manual.trigger", "kind": "manual"}],
            "steps": [
                {
                    "name": "s",
                    "on": ["event.manual.trigger"],
                    "action": "llm.summarize",
                    "args": {"text": "x", "style": "brief"},
                    "emits": ["event.summary_complete"]
                }
            ]
        }))
    }

    #[test]
    fn test_linear_plan_is_sound() {
        let net = build(&linear_plan()).unwrap();
        net.check_workflow_net().unwrap();
        net.check_soundness().unwrap();
        net.check_acyclic().unwrap();
    }

    #[test]
    fn test_places_limited_to_used_events() {
        let mut plan = linear_plan();
        plan.events.push(crate::plan::PlanEvent {
            name: "event.never.used".to_string(),
            kind: None,
            schedule: None,
            description: None,
        });
        let net = build(&plan).unwrap();
        assert!(!net.place_names().contains(&"event.never.used".to_string()));
    }

    #[test]
    fn test_unknown_on_event_fails_build() {
        let plan = plan_from_json(serde_json::json!({
            "plan_name": "broken",
            "graph_type": "acyclic",
            "events": [],
            "steps": [
                {"name": "s", "on": ["event.ghost"], "action": "a", "emits": []}
            ]
        }));
        let err = build(&plan).unwrap_err();
        assert!(err.contains("event.ghost"));
        assert!(err.contains("'s'"));
    }

    #[test]
    fn test_completion_place_synthesized() {
        let plan = plan_from_json(serde_json::json!({
            "plan_name": "terminal",
            "graph_type": "acyclic",
            "events": [{"name": "event.manual.trigger", "kind": "manual"}],
            "steps": [
                {"name": "s", "on": ["event.manual.trigger"], "action": "a", "emits": []}
            ]
        }));
        let net = build(&plan).unwrap();
        assert!(net.place_names().contains(&COMPLETION_PLACE.to_string()));
        net.check_workflow_net().unwrap();
        net.check_soundness().unwrap();
    }

    #[test]
    fn test_chain_is_sound() {
        let plan = plan_from_json(serde_json::json!({
            "plan_name": "chain",
            "graph_type": "acyclic",
            "events": [{"name": "event.manual.trigger", "kind": "manual"}],
            "steps": [
                {"name": "first", "on": ["event.manual.trigger"], "action": "a",
                 "emits": ["event.mid"]},
                {"name": "second", "on": ["event.mid"], "action": "b",
                 "emits": ["event.done"]}
            ]
        }));
        let net = build(&plan).unwrap();
        net.check_workflow_net().unwrap();
        net.check_soundness().unwrap();
        net.check_acyclic().unwrap();
    }

    #[test]
    fn test_two_sources_is_not_workflow_net() {
        let plan = plan_from_json(serde_json::json!({
            "plan_name": "forked",
            "graph_type": "acyclic",
            "events": [
                {"name": "event.manual.trigger", "kind": "manual"},
                {"name": "event.webhook.github", "kind": "webhook"}
            ],
            "steps": [
                {"name": "a", "on": ["event.manual.trigger"], "action": "x", "emits": ["event.out"]},
                {"name": "b", "on": ["event.webhook.github"], "action": "y", "emits": ["event.out"]}
            ]
        }));
        let net = build(&plan).unwrap();
        let err = net.check_workflow_net().unwrap_err();
        assert!(err.contains("source"));
    }

    #[test]
    fn test_dead_step_fails_soundness() {
        // Step "stuck" consumes an event nobody emits until after it fires
        let plan = plan_from_json(serde_json::json!({
            "plan_name": "dead",
            "graph_type": "reactive",
            "events": [
                {"name": "event.manual.trigger", "kind": "manual"},
                {"name": "event.never.arrives"}
            ],
            "steps": [
                {"name": "ok", "on": ["event.manual.trigger"], "action": "x",
                 "emits": ["event.done"]},
                {"name": "stuck", "on": ["event.never.arrives"], "action": "y",
                 "emits": ["event.done"]}
            ]
        }));
        let net = build(&plan).unwrap();
        // The net shape itself is broken: event.never.arrives is a second source
        assert!(net.check_workflow_net().is_err());
        // And the token game never fires "stuck"
        assert!(net.check_soundness().is_err());
    }

    #[test]
    fn test_cycle_detected_for_acyclic_plan() {
        let plan = plan_from_json(serde_json::json!({
            "plan_name": "loopy",
            "graph_type": "acyclic",
            "events": [{"name": "event.manual.trigger", "kind": "manual"}],
            "steps": [
                {"name": "ping", "on": ["event.manual.trigger", "event.pong"], "action": "x",
                 "emits": ["event.ping"]},
                {"name": "pong", "on": ["event.ping"], "action": "y",
                 "emits": ["event.pong"]}
            ]
        }));
        assert_eq!(plan.graph_type, GraphType::Acyclic);
        let net = build(&plan).unwrap();
        let err = net.check_acyclic().unwrap_err();
        assert!(err.contains("cycle"));
    }

    #[test]
    fn test_self_loop_detected() {
        let plan = plan_from_json(serde_json::json!({
            "plan_name": "self-loop",
            "graph_type": "acyclic",
            "events": [{"name": "event.manual.trigger", "kind": "manual"}],
            "steps": [
                {"name": "echo", "on": ["event.manual.trigger", "event.echo"], "action": "x",
                 "emits": ["event.echo"]}
            ]
        }));
        let net = build(&plan).unwrap();
        assert!(net.check_acyclic().is_err());
    }

    #[test]
    fn test_fork_join_is_sound() {
        let plan = plan_from_json(serde_json::json!({
            "plan_name": "fork-join",
            "graph_type": "acyclic",
            "events": [{"name": "event.manual.trigger", "kind": "manual"}],
            "steps": [
                {"name": "split", "on": ["event.manual.trigger"], "action": "a",
                 "emits": ["event.left", "event.right"]},
                {"name": "work_left", "on": ["event.left"], "action": "b",
                 "emits": ["event.left.done"]},
                {"name": "work_right", "on": ["event.right"], "action": "c",
                 "emits": ["event.right.done"]},
                {"name": "join", "on": ["event.left.done", "event.right.done"], "action": "d",
                 "emits": ["event.final"]}
            ]
        }));
        let net = build(&plan).unwrap();
        net.check_workflow_net().unwrap();
        net.check_soundness().unwrap();
        net.check_acyclic().unwrap();
    }

    #[test]
    fn test_unbalanced_join_deadlocks() {
        // The join waits for an event only one branch can produce twice
        let plan = plan_from_json(serde_json::json!({
            "plan_name": "unbalanced",
            "graph_type": "acyclic",
            "events": [{"name": "event.manual.trigger", "kind": "manual"}],
            "steps": [
                {"name": "split", "on": ["event.manual.trigger"], "action": "a",
                 "emits": ["event.left"]},
                {"name": "join", "on": ["event.left", "event.right"], "action": "b",
                 "emits": ["event.final", "event.right"]}
            ]
        }));
        let net = build(&plan).unwrap();
        assert!(net.check_soundness().is_err());
    }

    #[test]
    fn test_no_external_trigger_fails_soundness() {
        let plan = plan_from_json(serde_json::json!({
            "plan_name": "untriggered",
            "graph_type": "acyclic",
            "events": [{"name": "event.internal.thing"}],
            "steps": [
                {"name": "s", "on": ["event.internal.thing"], "action": "a",
                 "emits": ["event.done"]}
            ]
        }));
        let net = build(&plan).unwrap();
        let err = net.check_soundness().unwrap_err();
        assert!(err.contains("initial token"));
    }
}
