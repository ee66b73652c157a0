//! Topological ordering and cycle detection over node keys

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;

fn build<'a, I>(nodes: I, edges: &'a [(String, String)]) -> DiGraphMap<&'a str, ()>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut graph = DiGraphMap::new();
    for node in nodes {
        graph.add_node(node);
    }
    for (from, to) in edges {
        graph.add_edge(from.as_str(), to.as_str(), ());
    }
    graph
}

/// Order `nodes` so every edge points forward.
///
/// Returns `Err` with the nodes that sit on a cycle (sorted) when no such
/// order exists. Endpoints of `edges` missing from `nodes` are added implicitly.
pub fn topological_sort<'a, I>(nodes: I, edges: &'a [(String, String)]) -> Result<Vec<String>, Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let graph = build(nodes, edges);
    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(_) => {
            let mut members: Vec<String> = tarjan_scc(&graph)
                .into_iter()
                .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
                .flatten()
                .map(str::to_string)
                .collect();
            members.sort();
            Err(members)
        }
    }
}
