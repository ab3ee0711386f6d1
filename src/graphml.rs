//! A thin GraphML reader shared by the action-graph loader (`graph::`) and
//! the Markov-model loader (`markov::`).
//!
//! This module's boundary stops at a typed graph with labeled vertices
//! and edges: resolve `<key>` declarations to attribute names, walk
//! `<node>`/`<edge>` elements, and hand back a generic `TypedGraph` of
//! `id -> attrs` maps. Making sense of
//! those attributes (vertex kinds, edge weights, distributions) is
//! `markov`'s and `graph`'s job, not this module's.

use std::collections::HashMap;
use std::io::BufRead;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphmlError {
    #[error("xml parse error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("xml attribute error: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
    #[error("malformed graphml: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Default)]
pub struct TypedNode {
    pub id: String,
    pub attrs: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct TypedEdge {
    pub source: String,
    pub target: String,
    pub attrs: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct TypedGraph {
    pub nodes: Vec<TypedNode>,
    pub edges: Vec<TypedEdge>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum KeyScope {
    Node,
    Edge,
    Other,
}

/// Parses a GraphML document into a `TypedGraph`. Handles the
/// `<key id=".." for="node|edge" attr.name="..">` indirection real
/// graphml writers (networkx, yEd) use instead of literal attribute
/// names on `<data>`.
pub fn parse(xml: &str) -> Result<TypedGraph, GraphmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut keys: HashMap<String, (KeyScope, String)> = HashMap::new();
    let mut graph = TypedGraph::default();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Empty(ref e) if e.name().as_ref() == b"key" => {
                parse_key_decl(e, &mut keys)?;
            }
            Event::Empty(ref e) if e.name().as_ref() == b"node" => {
                let mut node = TypedNode::default();
                for a in e.attributes() {
                    let a = a?;
                    if a.key.as_ref() == b"id" {
                        node.id = String::from_utf8_lossy(&a.value).into_owned();
                    }
                }
                graph.nodes.push(node);
            }
            Event::Empty(ref e) if e.name().as_ref() == b"edge" => {
                let mut edge = TypedEdge::default();
                for a in e.attributes() {
                    let a = a?;
                    match a.key.as_ref() {
                        b"source" => edge.source = String::from_utf8_lossy(&a.value).into_owned(),
                        b"target" => edge.target = String::from_utf8_lossy(&a.value).into_owned(),
                        _ => {}
                    }
                }
                graph.edges.push(edge);
            }
            Event::Start(ref e) if e.name().as_ref() == b"key" => {
                parse_key_decl(e, &mut keys)?;
            }
            Event::Start(ref e) if e.name().as_ref() == b"node" => {
                let mut node = TypedNode::default();
                for a in e.attributes() {
                    let a = a?;
                    if a.key.as_ref() == b"id" {
                        node.id = String::from_utf8_lossy(&a.value).into_owned();
                    }
                }
                read_data_block(&mut reader, &keys, KeyScope::Node, b"node", &mut node.attrs)?;
                graph.nodes.push(node);
            }
            Event::Start(ref e) if e.name().as_ref() == b"edge" => {
                let mut edge = TypedEdge::default();
                for a in e.attributes() {
                    let a = a?;
                    match a.key.as_ref() {
                        b"source" => edge.source = String::from_utf8_lossy(&a.value).into_owned(),
                        b"target" => edge.target = String::from_utf8_lossy(&a.value).into_owned(),
                        _ => {}
                    }
                }
                read_data_block(&mut reader, &keys, KeyScope::Edge, b"edge", &mut edge.attrs)?;
                graph.edges.push(edge);
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(graph)
}

fn parse_key_decl(
    e: &quick_xml::events::BytesStart<'_>,
    keys: &mut HashMap<String, (KeyScope, String)>,
) -> Result<(), GraphmlError> {
    let mut id = None;
    let mut scope = KeyScope::Other;
    let mut attr_name = None;
    for a in e.attributes() {
        let a = a?;
        match a.key.as_ref() {
            b"id" => id = Some(String::from_utf8_lossy(&a.value).into_owned()),
            b"for" => {
                scope = match a.value.as_ref() {
                    b"node" => KeyScope::Node,
                    b"edge" => KeyScope::Edge,
                    _ => KeyScope::Other,
                }
            }
            b"attr.name" => attr_name = Some(String::from_utf8_lossy(&a.value).into_owned()),
            _ => {}
        }
    }
    if let (Some(id), Some(name)) = (id, attr_name) {
        keys.insert(id, (scope, name));
    }
    Ok(())
}

/// Reads `<data key="...">value</data>` children until the matching
/// closing tag for `end_tag`, resolving each `key` against the
/// previously-seen `<key>` declarations for `scope`.
fn read_data_block<R: BufRead>(
    reader: &mut Reader<R>,
    keys: &HashMap<String, (KeyScope, String)>,
    scope: KeyScope,
    end_tag: &[u8],
    out: &mut HashMap<String, String>,
) -> Result<(), GraphmlError> {
    let mut buf = Vec::new();
    let mut current_key: Option<String> = None;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if e.name().as_ref() == b"data" => {
                let mut key_id = None;
                for a in e.attributes() {
                    let a = a?;
                    if a.key.as_ref() == b"key" {
                        key_id = Some(String::from_utf8_lossy(&a.value).into_owned());
                    }
                }
                current_key = key_id.map(|id| resolve_key(keys, &id, scope));
            }
            Event::Text(t) => {
                if let Some(key) = current_key.take() {
                    let text = t.unescape()?.into_owned();
                    out.insert(key, text);
                }
            }
            Event::End(ref e) if e.name().as_ref() == b"data" => {
                current_key = None;
            }
            Event::End(ref e) if e.name().as_ref() == end_tag => break,
            Event::Eof => {
                return Err(GraphmlError::Malformed(format!(
                    "unexpected eof inside <{}>",
                    String::from_utf8_lossy(end_tag)
                )))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn resolve_key(keys: &HashMap<String, (KeyScope, String)>, id: &str, scope: KeyScope) -> String {
    match keys.get(id) {
        Some((s, name)) if *s == scope || *s == KeyScope::Other => name.clone(),
        _ => id.to_string(),
    }
}

/// Renders a `TypedGraph` back to a GraphML string, one `<key>` per
/// distinct attribute name observed across all nodes/edges. Used for the
/// Markov model's graphml round-trip.
pub fn render(graph: &TypedGraph) -> String {
    let mut node_keys: Vec<&str> = Vec::new();
    let mut edge_keys: Vec<&str> = Vec::new();
    for n in &graph.nodes {
        for k in n.attrs.keys() {
            if !node_keys.contains(&k.as_str()) {
                node_keys.push(k);
            }
        }
    }
    for e in &graph.edges {
        for k in e.attrs.keys() {
            if !edge_keys.contains(&k.as_str()) {
                edge_keys.push(k);
            }
        }
    }

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<graphml xmlns=\"http://graphml.graphdrawing.org/xmlns\">\n");

    let mut key_id_of = |scope: &str, name: &str, keys: &mut Vec<(String, String)>| -> String {
        let id = format!("{}_{}", scope, name);
        keys.push((id.clone(), name.to_string()));
        id
    };
    let mut node_key_ids = Vec::new();
    let mut edge_key_ids = Vec::new();
    for k in &node_keys {
        let id = key_id_of("n", k, &mut node_key_ids);
        out.push_str(&format!(
            "  <key id=\"{}\" for=\"node\" attr.name=\"{}\" attr.type=\"string\"/>\n",
            id, xml_escape(k)
        ));
    }
    for k in &edge_keys {
        let id = key_id_of("e", k, &mut edge_key_ids);
        out.push_str(&format!(
            "  <key id=\"{}\" for=\"edge\" attr.name=\"{}\" attr.type=\"string\"/>\n",
            id, xml_escape(k)
        ));
    }

    out.push_str("  <graph edgedefault=\"directed\">\n");
    for n in &graph.nodes {
        out.push_str(&format!("    <node id=\"{}\">\n", xml_escape(&n.id)));
        for (id, name) in &node_key_ids {
            if let Some(v) = n.attrs.get(name.as_str()) {
                out.push_str(&format!("      <data key=\"{}\">{}</data>\n", id, xml_escape(v)));
            }
        }
        out.push_str("    </node>\n");
    }
    for e in &graph.edges {
        out.push_str(&format!(
            "    <edge source=\"{}\" target=\"{}\">\n",
            xml_escape(&e.source),
            xml_escape(&e.target)
        ));
        for (id, name) in &edge_key_ids {
            if let Some(v) = e.attrs.get(name.as_str()) {
                out.push_str(&format!("      <data key=\"{}\">{}</data>\n", id, xml_escape(v)));
            }
        }
        out.push_str("    </edge>\n");
    }
    out.push_str("  </graph>\n</graphml>\n");
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<graphml>
  <key id="d0" for="node" attr.name="type"/>
  <key id="d1" for="edge" attr.name="weight"/>
  <graph edgedefault="directed">
    <node id="start"><data key="d0">state</data></node>
    <node id="s1"><data key="d0">state</data></node>
    <edge source="start" target="s1"><data key="d1">1.0</data></edge>
  </graph>
</graphml>"#;

    #[test]
    fn parses_nodes_and_edges_with_key_indirection() {
        let g = parse(SAMPLE).unwrap();
        assert_eq!(g.nodes.len(), 2);
        assert_eq!(g.nodes[0].id, "start");
        assert_eq!(g.nodes[0].attrs.get("type"), Some(&"state".to_string()));
        assert_eq!(g.edges.len(), 1);
        assert_eq!(g.edges[0].attrs.get("weight"), Some(&"1.0".to_string()));
    }

    #[test]
    fn round_trips_through_render() {
        let g = parse(SAMPLE).unwrap();
        let xml = render(&g);
        let g2 = parse(&xml).unwrap();
        assert_eq!(g.nodes.len(), g2.nodes.len());
        assert_eq!(g.edges.len(), g2.edges.len());
        assert_eq!(g2.nodes[0].attrs.get("type"), Some(&"state".to_string()));
    }
}
