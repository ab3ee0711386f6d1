//! Action-graph data model: the user-supplied directed multigraph of
//! `Start`/`End`/`Pause`/`Stream`/`Flow` vertices that the driver walks.
//!
//! Loaded through the same thin `graphml::parse` used by the Markov
//! model loader, then validated and converted into typed vertex/edge
//! records the driver can index by `NodeIndex` without re-parsing
//! strings on every traversal step.

use std::collections::HashMap;
use std::time::Duration;

use log::info;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use thiserror::Error;

use crate::graphml::{self, TypedGraph};
use crate::peer::Peer;
use crate::pool::Pool;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexKind {
    Start,
    End,
    Pause,
    Stream,
    Flow,
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub model_path: Option<String>,
    pub model_seed: u64,
    pub peers: Pool<Arc<Peer>>,
    pub socks_proxy: Option<String>,
    pub socks_username: Option<String>,
    pub socks_password: Option<String>,
    pub send_size: Option<u64>,
    pub recv_size: Option<u64>,
    pub timeout: Option<Duration>,
    pub stallout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct StopConditions {
    pub send_size: Option<u64>,
    pub recv_size: Option<u64>,
    pub count: Option<u64>,
    pub time: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct PauseOptions {
    pub times: Option<Pool<Duration>>,
}

/// Arrival-timing configuration for a `Flow` vertex: a second, independent
/// Markov model (the "stream" model) whose delays space out the streams a
/// `Flow` spawns, distinct from the per-stream "packet" model in
/// `StreamOptions`.
#[derive(Debug, Clone, Default)]
pub struct FlowOptions {
    pub stream_model_path: Option<String>,
    pub stream_model_seed: u64,
}

#[derive(Debug, Clone)]
pub struct Vertex {
    pub id: String,
    pub kind: VertexKind,
    pub stream_opts: Option<StreamOptions>,
    pub stop_conditions: Option<StopConditions>,
    pub pause_opts: Option<PauseOptions>,
    pub flow_opts: Option<FlowOptions>,
    pub server_port: Option<u16>,
}

#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub weight: Option<f64>,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graphml: {0}")]
    Graphml(#[from] graphml::GraphmlError),
    #[error("no vertex with id \"start\"")]
    MissingStart,
    #[error("more than one start vertex")]
    DuplicateStart,
    #[error("vertex {0:?}: unrecognized 'type' attribute {1:?}")]
    UnknownVertexType(String, String),
    #[error("start vertex has a self-loop")]
    StartSelfLoop,
}

pub struct ActionGraph {
    graph: DiGraph<Vertex, Edge>,
    index: HashMap<String, NodeIndex>,
    start: NodeIndex,
}

impl ActionGraph {
    pub fn from_graphml(xml: &str) -> Result<ActionGraph, GraphError> {
        let typed = graphml::parse(xml)?;
        Self::from_typed(typed)
    }

    pub fn from_typed(typed: TypedGraph) -> Result<ActionGraph, GraphError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut start = None;
        let mut start_count = 0;

        for node in &typed.nodes {
            let kind = match node.attrs.get("type").map(|s| s.as_str()) {
                Some("start") => VertexKind::Start,
                Some("end") => VertexKind::End,
                Some("pause") => VertexKind::Pause,
                Some("stream") => VertexKind::Stream,
                Some("flow") => VertexKind::Flow,
                other => {
                    return Err(GraphError::UnknownVertexType(
                        node.id.clone(),
                        other.unwrap_or("").to_string(),
                    ))
                }
            };

            if kind == VertexKind::Start {
                start_count += 1;
            }

            let stream_opts = if matches!(kind, VertexKind::Stream | VertexKind::Flow | VertexKind::Start) {
                Some(parse_stream_options(&node.attrs))
            } else {
                None
            };
            let stop_conditions = if kind == VertexKind::End { Some(parse_stop_conditions(&node.attrs)) } else { None };
            let pause_opts = if kind == VertexKind::Pause { Some(parse_pause_options(&node.attrs)) } else { None };
            let flow_opts = if kind == VertexKind::Flow { Some(parse_flow_options(&node.attrs)) } else { None };
            let server_port = node.attrs.get("serverport").and_then(|s| s.parse().ok());

            let idx = graph.add_node(Vertex {
                id: node.id.clone(),
                kind,
                stream_opts,
                stop_conditions,
                pause_opts,
                flow_opts,
                server_port,
            });
            index.insert(node.id.clone(), idx);
            if kind == VertexKind::Start {
                start = Some(idx);
            }
        }

        match start_count {
            0 => return Err(GraphError::MissingStart),
            1 => {}
            _ => return Err(GraphError::DuplicateStart),
        }
        let start = start.unwrap();

        for edge in &typed.edges {
            let src = match index.get(&edge.source) {
                Some(i) => *i,
                None => continue,
            };
            let dst = match index.get(&edge.target) {
                Some(i) => *i,
                None => continue,
            };
            if src == start && dst == start {
                return Err(GraphError::StartSelfLoop);
            }
            let weight = edge.attrs.get("weight").and_then(|s| s.parse::<f64>().ok());
            graph.add_edge(src, dst, Edge { weight });
        }

        Ok(ActionGraph { graph, index, start })
    }

    pub fn start(&self) -> NodeIndex {
        self.start
    }

    pub fn vertex(&self, idx: NodeIndex) -> &Vertex {
        &self.graph[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn in_degree(&self, idx: NodeIndex) -> usize {
        self.graph.edges_directed(idx, petgraph::Direction::Incoming).count()
    }

    /// Partitions `idx`'s outgoing edges into (unweighted targets,
    /// weighted `(target, weight)` pairs).
    pub fn outgoing(&self, idx: NodeIndex) -> (Vec<NodeIndex>, Vec<(NodeIndex, f64)>) {
        let mut unweighted = Vec::new();
        let mut weighted = Vec::new();
        for e in self.graph.edges_directed(idx, petgraph::Direction::Outgoing) {
            match e.weight().weight {
                Some(w) => weighted.push((e.target(), w)),
                None => unweighted.push(e.target()),
            }
        }
        (unweighted, weighted)
    }

    /// All vertices carrying a `serverport` attribute, for binding
    /// passive listeners before traversal begins.
    pub fn server_ports(&self) -> Vec<u16> {
        self.graph.node_weights().filter_map(|v| v.server_port).collect()
    }

    pub fn log_summary(&self) {
        let mut kinds: HashMap<&str, usize> = HashMap::new();
        for idx in self.graph.node_indices() {
            let label = match self.graph[idx].kind {
                VertexKind::Start => "start",
                VertexKind::End => "end",
                VertexKind::Pause => "pause",
                VertexKind::Stream => "stream",
                VertexKind::Flow => "flow",
            };
            *kinds.entry(label).or_insert(0) += 1;
        }
        info!(
            "action graph: {} vertices ({:?}), {} edges",
            self.graph.node_count(),
            kinds,
            self.graph.edge_count()
        );
    }
}

fn parse_stream_options(attrs: &HashMap<String, String>) -> StreamOptions {
    let mut peers = Pool::new();
    if let Some(peer_str) = attrs.get("peers") {
        for entry in peer_str.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some((host, port)) = entry.rsplit_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    if let Ok(peer) = Peer::resolve(host, port) {
                        peers.insert(peer);
                    }
                }
            }
        }
    }
    StreamOptions {
        model_path: attrs.get("packetmodelpath").cloned(),
        model_seed: attrs.get("packetmodelseed").and_then(|s| s.parse().ok()).unwrap_or(0),
        peers,
        socks_proxy: attrs.get("socksproxy").cloned(),
        socks_username: attrs.get("socksusername").cloned(),
        socks_password: attrs.get("sockspassword").cloned(),
        send_size: attrs.get("sendsize").and_then(|s| s.parse().ok()),
        recv_size: attrs.get("recvsize").and_then(|s| s.parse().ok()),
        timeout: attrs.get("timeoutnanos").and_then(|s| s.parse().ok()).map(Duration::from_nanos),
        stallout: attrs.get("stalloutnanos").and_then(|s| s.parse().ok()).map(Duration::from_nanos),
    }
}

fn parse_stop_conditions(attrs: &HashMap<String, String>) -> StopConditions {
    StopConditions {
        send_size: attrs.get("sendsize").and_then(|s| s.parse().ok()),
        recv_size: attrs.get("recvsize").and_then(|s| s.parse().ok()),
        count: attrs.get("count").and_then(|s| s.parse().ok()),
        time: attrs.get("timenanos").and_then(|s| s.parse().ok()).map(Duration::from_nanos),
    }
}

fn parse_pause_options(attrs: &HashMap<String, String>) -> PauseOptions {
    let times = attrs.get("time").map(|raw| {
        raw.split(',')
            .filter_map(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_nanos)
            .collect::<Pool<Duration>>()
    });
    PauseOptions { times }
}

fn parse_flow_options(attrs: &HashMap<String, String>) -> FlowOptions {
    FlowOptions {
        stream_model_path: attrs.get("streammodelpath").cloned(),
        stream_model_seed: attrs.get("streammodelseed").and_then(|s| s.parse().ok()).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIAMOND: &str = r#"<?xml version="1.0"?>
<graphml>
  <key id="d0" for="node" attr.name="type"/>
  <key id="d1" for="edge" attr.name="weight"/>
  <graph edgedefault="directed">
    <node id="start"><data key="d0">start</data></node>
    <node id="a"><data key="d0">stream</data></node>
    <node id="b"><data key="d0">stream</data></node>
    <node id="pause"><data key="d0">pause</data></node>
    <node id="end"><data key="d0">end</data></node>
    <edge source="start" target="a"/>
    <edge source="start" target="b"/>
    <edge source="a" target="pause"/>
    <edge source="b" target="pause"/>
    <edge source="pause" target="end"/>
  </graph>
</graphml>"#;

    #[test]
    fn loads_diamond_graph_and_computes_indegree() {
        let g = ActionGraph::from_graphml(DIAMOND).unwrap();
        let pause = g.index_of("pause").unwrap();
        assert_eq!(g.in_degree(pause), 2);
        let end = g.index_of("end").unwrap();
        assert_eq!(g.in_degree(end), 1);
    }

    #[test]
    fn outgoing_partitions_weighted_and_unweighted() {
        let xml = r#"<?xml version="1.0"?>
<graphml>
  <key id="d0" for="node" attr.name="type"/>
  <key id="d1" for="edge" attr.name="weight"/>
  <graph edgedefault="directed">
    <node id="start"><data key="d0">start</data></node>
    <node id="a"><data key="d0">stream</data></node>
    <node id="b"><data key="d0">stream</data></node>
    <node id="c"><data key="d0">stream</data></node>
    <edge source="start" target="a"><data key="d1">1.0</data></edge>
    <edge source="start" target="b"><data key="d1">3.0</data></edge>
    <edge source="start" target="c"/>
  </graph>
</graphml>"#;
        let g = ActionGraph::from_graphml(xml).unwrap();
        let (unweighted, weighted) = g.outgoing(g.start());
        assert_eq!(unweighted.len(), 1);
        assert_eq!(weighted.len(), 2);
    }

    #[test]
    fn missing_start_is_rejected() {
        let xml = r#"<?xml version="1.0"?>
<graphml>
  <key id="d0" for="node" attr.name="type"/>
  <graph edgedefault="directed">
    <node id="a"><data key="d0">stream</data></node>
  </graph>
</graphml>"#;
        assert!(matches!(ActionGraph::from_graphml(xml), Err(GraphError::MissingStart)));
    }
}
