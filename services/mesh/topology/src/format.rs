//! Human-readable renderings of a topology map.

use crate::TopologyMap;
use std::fmt::Write;

/// Multi-line summary of nodes and links
pub fn format_info(map: &TopologyMap) -> String {
    let stats = map.stats();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Topology of {} ({} nodes, {} links, local seq {}, converged: {})",
        map.local_node_id(),
        stats.total_nodes,
        stats.total_links,
        stats.local_sequence,
        stats.converged
    );

    for node in map.nodes() {
        let marker = if node.node_id == *map.local_node_id() {
            " (local)"
        } else {
            ""
        };
        let _ = writeln!(
            out,
            "  node \"{}\" [{}]{} relay={} seq={}",
            node.name(),
            node.node_id,
            marker,
            node.is_relay,
            node.sequence_number
        );
        for link in map.outgoing_links(&node.node_id) {
            let _ = writeln!(
                out,
                "    -> {} via {} (weight {})",
                link.destination, link.connection_id, link.weight
            );
        }
    }
    out
}

/// Graphviz `digraph` of the map
pub fn format_graphviz(map: &TopologyMap) -> String {
    let mut out = String::from("digraph topology {\n");
    for node in map.nodes() {
        let shape = if node.node_id == *map.local_node_id() {
            "doublecircle"
        } else if node.is_relay {
            "box"
        } else {
            "ellipse"
        };
        let _ = writeln!(
            out,
            "  \"{}\" [label=\"{}\", shape={}];",
            node.node_id,
            escape(node.name()),
            shape
        );
    }
    for link in map.links() {
        let _ = writeln!(
            out,
            "  \"{}\" -> \"{}\" [label=\"{}\"];",
            link.source,
            link.destination,
            escape(&link.connection_id)
        );
    }
    out.push_str("}\n");
    out
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
