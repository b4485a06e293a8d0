//! Cycle condensation: rewrite a cyclic board into a DAG of nested subgraphs.
//!
//! The traversal scheduler is DAG-oriented. [`condense`] finds every strongly
//! connected component (Tarjan, single DFS pass) and replaces each cycle with
//! one node typed as a reference to a synthesized subgraph. Edges crossing
//! the component boundary are rewired through `input`/`output` pseudo-nodes
//! so the cycle keeps its original port wiring once the subgraph runs.

use rustc_hash::{FxHashMap, FxHashSet};

use super::{Edge, GraphDescriptor, INPUT_TYPE, NodeDescriptor, OUTPUT_TYPE};

/// Replace every non-trivial strongly connected component of `graph` with a
/// condensed node `scc_<n>` typed `#scc_<n>`, backed by a synthesized
/// subgraph under `graphs["scc_<n>"]`.
///
/// Trivial components (a single node without a self-loop) are left untouched;
/// an acyclic graph comes back structurally identical. Nodes and edges are
/// visited in stored order, so output is deterministic.
pub fn condense(graph: &GraphDescriptor) -> GraphDescriptor {
    let components = strongly_connected_components(graph);

    // Only components with more than one node, or a single node with a
    // self-loop, get condensed.
    let condensable: Vec<&Vec<String>> = components
        .iter()
        .filter(|component| {
            component.len() > 1 || {
                let only = &component[0];
                graph
                    .edges
                    .iter()
                    .any(|edge| edge.from == *only && edge.to == *only)
            }
        })
        .collect();

    if condensable.is_empty() {
        return graph.clone();
    }

    // Node id -> condensed node id.
    let mut condensed_id: FxHashMap<&str, String> = FxHashMap::default();
    for (index, component) in condensable.iter().enumerate() {
        let id = format!("scc_{index}");
        for node in component.iter() {
            condensed_id.insert(node.as_str(), id.clone());
        }
    }

    let mut result = graph.clone();
    result.nodes.retain(|node| !condensed_id.contains_key(node.id.as_str()));
    result.edges.clear();

    for (index, component) in condensable.iter().enumerate() {
        let id = format!("scc_{index}");
        let members: FxHashSet<&str> = component.iter().map(String::as_str).collect();
        let subgraph = synthesize_subgraph(graph, &members);
        if result.graphs.contains_key(&id) {
            tracing::warn!(
                subgraph = %id,
                "condensed subgraph id shadows a pre-existing subgraph"
            );
        }
        result.graphs.insert(id.clone(), subgraph);
        result.nodes.push(NodeDescriptor::new(id.clone(), format!("#{id}")));
    }

    // Rewrite top-level edges: internal edges disappear (they now live inside
    // their subgraph); crossing edges point at the condensed node instead.
    for edge in &graph.edges {
        let from = condensed_id.get(edge.from.as_str());
        let to = condensed_id.get(edge.to.as_str());
        match (from, to) {
            (Some(a), Some(b)) if a == b => continue,
            _ => {}
        }
        let mut rewritten = edge.clone();
        if let Some(id) = from {
            rewritten.from = id.clone();
        }
        if let Some(id) = to {
            rewritten.to = id.clone();
        }
        result.edges.push(rewritten);
    }

    result
}

/// Build the subgraph standing in for one component: its members plus
/// `input`/`output` pseudo-nodes, with boundary-crossing edges re-anchored.
fn synthesize_subgraph(graph: &GraphDescriptor, members: &FxHashSet<&str>) -> GraphDescriptor {
    let mut nodes = vec![NodeDescriptor::new(INPUT_TYPE, INPUT_TYPE)];
    nodes.extend(
        graph
            .nodes
            .iter()
            .filter(|node| members.contains(node.id.as_str()))
            .cloned(),
    );
    nodes.push(NodeDescriptor::new(OUTPUT_TYPE, OUTPUT_TYPE));

    let mut edges = Vec::new();
    for edge in &graph.edges {
        let from_inside = members.contains(edge.from.as_str());
        let to_inside = members.contains(edge.to.as_str());
        match (from_inside, to_inside) {
            (true, true) => edges.push(edge.clone()),
            // Inbound: the original `in` label becomes the new `out` label,
            // so the pseudo input node forwards the value untouched.
            (false, true) => edges.push(Edge {
                from: INPUT_TYPE.to_string(),
                to: edge.to.clone(),
                out: edge.in_.clone(),
                in_: edge.in_.clone(),
                optional: edge.optional,
                constant: edge.constant,
            }),
            // Outbound: the original `out` label becomes the new `in` label.
            (true, false) => edges.push(Edge {
                from: edge.from.clone(),
                to: OUTPUT_TYPE.to_string(),
                out: edge.out.clone(),
                in_: edge.out.clone(),
                optional: edge.optional,
                constant: edge.constant,
            }),
            (false, false) => {}
        }
    }

    GraphDescriptor {
        nodes,
        edges,
        ..Default::default()
    }
}

/// Tarjan's algorithm, iterative to keep deep graphs off the call stack.
/// Components come back in completion order; node order within a component
/// follows the DFS stack.
fn strongly_connected_components(graph: &GraphDescriptor) -> Vec<Vec<String>> {
    let ids: Vec<&str> = graph.nodes.iter().map(|node| node.id.as_str()).collect();
    let index_of: FxHashMap<&str, usize> =
        ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    // Adjacency in stored edge order, ignoring edges to unknown nodes.
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    for edge in &graph.edges {
        if let (Some(&from), Some(&to)) = (
            index_of.get(edge.from.as_str()),
            index_of.get(edge.to.as_str()),
        ) {
            adjacency[from].push(to);
        }
    }

    let mut index = 0usize;
    let mut indices: Vec<Option<usize>> = vec![None; ids.len()];
    let mut lowlink: Vec<usize> = vec![0; ids.len()];
    let mut on_stack: Vec<bool> = vec![false; ids.len()];
    let mut stack: Vec<usize> = Vec::new();
    let mut components: Vec<Vec<String>> = Vec::new();

    // Explicit DFS frames: (node, next-neighbor cursor).
    let mut frames: Vec<(usize, usize)> = Vec::new();

    for start in 0..ids.len() {
        if indices[start].is_some() {
            continue;
        }
        frames.push((start, 0));
        indices[start] = Some(index);
        lowlink[start] = index;
        index += 1;
        stack.push(start);
        on_stack[start] = true;

        while let Some(&mut (node, ref mut cursor)) = frames.last_mut() {
            if *cursor < adjacency[node].len() {
                let next = adjacency[node][*cursor];
                *cursor += 1;
                match indices[next] {
                    None => {
                        indices[next] = Some(index);
                        lowlink[next] = index;
                        index += 1;
                        stack.push(next);
                        on_stack[next] = true;
                        frames.push((next, 0));
                    }
                    Some(next_index) => {
                        if on_stack[next] {
                            lowlink[node] = lowlink[node].min(next_index);
                        }
                    }
                }
            } else {
                frames.pop();
                if let Some(&(parent, _)) = frames.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[node]);
                }
                if Some(lowlink[node]) == indices[node] {
                    let mut component = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack[member] = false;
                        component.push(ids[member].to_string());
                        if member == node {
                            break;
                        }
                    }
                    component.reverse();
                    components.push(component);
                }
            }
        }
    }

    components
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeDescriptor {
        NodeDescriptor::new(id, "process")
    }

    fn edge(from: &str, to: &str, out: &str, in_: &str) -> Edge {
        Edge::new(from, to).ports(out, in_)
    }

    #[test]
    fn acyclic_graph_is_unchanged() {
        let graph = GraphDescriptor {
            nodes: vec![node("a"), node("b"), node("c")],
            edges: vec![edge("a", "b", "x", "x"), edge("b", "c", "y", "y")],
            ..Default::default()
        };
        let result = condense(&graph);
        assert_eq!(result.nodes, graph.nodes);
        assert_eq!(result.edges, graph.edges);
        assert!(result.graphs.is_empty());
    }

    #[test]
    fn empty_graph_is_unchanged() {
        let graph = GraphDescriptor::default();
        assert_eq!(condense(&graph), graph);
    }

    #[test]
    fn three_node_cycle_condenses_to_one_subgraph() {
        let graph = GraphDescriptor {
            nodes: vec![node("a"), node("b"), node("c")],
            edges: vec![
                edge("a", "b", "s1", "s1"),
                edge("b", "c", "s2", "s2"),
                edge("c", "a", "s3", "s3"),
            ],
            ..Default::default()
        };
        let result = condense(&graph);
        assert_eq!(result.nodes.len(), 1);
        assert_eq!(result.nodes[0].id, "scc_0");
        assert_eq!(result.nodes[0].node_type, "#scc_0");

        let subgraph = &result.graphs["scc_0"];
        // input, a, b, c, output
        assert_eq!(subgraph.nodes.len(), 5);
        let internal: Vec<(&str, &str)> = subgraph
            .edges
            .iter()
            .map(|e| (e.from.as_str(), e.to.as_str()))
            .collect();
        assert_eq!(internal, vec![("a", "b"), ("b", "c"), ("c", "a")]);
    }

    #[test]
    fn boundary_edges_are_relabeled_through_pseudo_nodes() {
        let graph = GraphDescriptor {
            nodes: vec![node("start"), node("a"), node("b"), node("end")],
            edges: vec![
                edge("start", "a", "seed", "value"),
                edge("a", "b", "data", "input"),
                edge("b", "a", "feedback", "previous"),
                edge("b", "end", "result", "final"),
            ],
            ..Default::default()
        };
        let result = condense(&graph);

        let subgraph = &result.graphs["scc_0"];
        let inbound = subgraph
            .edges
            .iter()
            .find(|e| e.from == INPUT_TYPE)
            .unwrap();
        assert_eq!(inbound.to, "a");
        assert_eq!(inbound.out.as_deref(), Some("value"));
        assert_eq!(inbound.in_.as_deref(), Some("value"));

        let outbound = subgraph
            .edges
            .iter()
            .find(|e| e.to == OUTPUT_TYPE)
            .unwrap();
        assert_eq!(outbound.from, "b");
        assert_eq!(outbound.out.as_deref(), Some("result"));
        assert_eq!(outbound.in_.as_deref(), Some("result"));

        // Top-level edges now reference the condensed node.
        assert!(
            result
                .edges
                .iter()
                .any(|e| e.from == "start" && e.to == "scc_0")
        );
        assert!(
            result
                .edges
                .iter()
                .any(|e| e.from == "scc_0" && e.to == "end")
        );
    }

    #[test]
    fn self_loop_is_condensed() {
        let graph = GraphDescriptor {
            nodes: vec![node("loop"), node("sink")],
            edges: vec![
                edge("loop", "loop", "again", "again"),
                edge("loop", "sink", "done", "done"),
            ],
            ..Default::default()
        };
        let result = condense(&graph);
        assert!(result.nodes.iter().any(|n| n.id == "scc_0"));
        assert!(result.graphs.contains_key("scc_0"));
    }

    #[test]
    fn condensed_ids_may_shadow_existing_subgraphs() {
        let mut graph = GraphDescriptor {
            nodes: vec![node("a"), node("b")],
            edges: vec![edge("a", "b", "x", "x"), edge("b", "a", "y", "y")],
            ..Default::default()
        };
        graph
            .graphs
            .insert("scc_0".to_string(), GraphDescriptor::default());
        // Known hazard: the pre-existing subgraph is silently replaced.
        let result = condense(&graph);
        assert!(!result.graphs["scc_0"].nodes.is_empty());
    }
}
