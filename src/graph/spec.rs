// src/graph/spec.rs

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use tracing::{debug, warn};

use crate::errors::{Result, StepflowError};
use crate::graph::handler::NodeHandler;
use crate::graph::route::{Router, Target, END};
use crate::state::Patch;

/// A declared node: handler plus the patch used when a fan-out branch fails.
#[derive(Clone)]
pub struct NodeEntry {
    pub name: String,
    /// Position in declaration order; breaks fan-out merge ties.
    pub order: usize,
    pub handler: Arc<dyn NodeHandler>,
    pub fallback: Option<Patch>,
}

/// Outgoing edges of one node.
#[derive(Debug, Clone)]
pub enum Edges {
    None,
    /// One target continues, several targets fan out. May contain [`END`].
    Static(Vec<String>),
    Conditional {
        router: Router,
        targets: BTreeMap<String, Target>,
    },
}

/// Immutable, validated workflow graph. Built once, shared across runs.
pub struct GraphSpec {
    nodes: Vec<NodeEntry>,
    index: HashMap<String, usize>,
    edges: HashMap<String, Edges>,
    entry: String,
}

impl GraphSpec {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, name: &str) -> Option<&NodeEntry> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Node names in declaration order.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    pub fn edges(&self, name: &str) -> &Edges {
        self.edges.get(name).unwrap_or(&Edges::None)
    }

    /// The node every branch of a fan-out group converges on.
    ///
    /// Build-time validation guarantees that a group has exactly one.
    pub fn join_of(&self, branches: &[String]) -> Option<&str> {
        let first = branches.first()?;
        match self.edges(first) {
            Edges::Static(targets) if targets.len() == 1 => Some(targets[0].as_str()),
            _ => None,
        }
    }
}

/// Incremental builder for [`GraphSpec`].
///
/// Mistakes are collected while building and reported from [`build`]
/// as a single `Configuration` error.
///
/// [`build`]: GraphBuilder::build
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeEntry>,
    static_edges: Vec<(String, String)>,
    conditional: Vec<(String, Router, BTreeMap<String, Target>)>,
    entry: Option<String>,
    problems: Vec<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(self, name: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Self {
        self.push_node(name.into(), handler, None)
    }

    /// Declare a node together with the patch substituted for its output
    /// when it runs as a fan-out branch and fails or times out.
    pub fn add_node_with_fallback(
        self,
        name: impl Into<String>,
        handler: Arc<dyn NodeHandler>,
        fallback: Patch,
    ) -> Self {
        self.push_node(name.into(), handler, Some(fallback))
    }

    fn push_node(
        mut self,
        name: String,
        handler: Arc<dyn NodeHandler>,
        fallback: Option<Patch>,
    ) -> Self {
        if name == END {
            self.problems
                .push(format!("'{END}' is reserved and cannot name a node"));
        } else if self.nodes.iter().any(|n| n.name == name) {
            self.problems.push(format!("node '{name}' is declared twice"));
        } else {
            let order = self.nodes.len();
            self.nodes.push(NodeEntry {
                name,
                order,
                handler,
                fallback,
            });
        }
        self
    }

    /// Declare a static edge. Calling this several times for one source
    /// declares a fan-out group.
    pub fn add_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        let edge = (source.into(), target.into());
        if self.static_edges.contains(&edge) {
            warn!(source = %edge.0, target = %edge.1, "duplicate static edge ignored");
        } else {
            self.static_edges.push(edge);
        }
        self
    }

    pub fn add_conditional_edge<I, K>(
        mut self,
        source: impl Into<String>,
        router: Router,
        targets: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, Target)>,
        K: Into<String>,
    {
        let targets = targets.into_iter().map(|(k, t)| (k.into(), t)).collect();
        self.conditional.push((source.into(), router, targets));
        self
    }

    pub fn set_entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    pub fn build(self) -> Result<GraphSpec> {
        let GraphBuilder {
            nodes,
            static_edges,
            conditional,
            entry,
            mut problems,
        } = self;

        let index: HashMap<String, usize> = nodes
            .iter()
            .map(|n| (n.name.clone(), n.order))
            .collect();
        let declared = |name: &str| index.contains_key(name);

        let entry = match entry {
            Some(entry) if declared(&entry) => entry,
            Some(entry) => {
                problems.push(format!("entry node '{entry}' is not declared"));
                entry
            }
            None => {
                problems.push("no entry node set".to_string());
                String::new()
            }
        };

        let mut static_targets: HashMap<String, Vec<String>> = HashMap::new();
        for (source, target) in static_edges {
            if !declared(&source) {
                problems.push(format!("edge source '{source}' is not declared"));
            }
            if target != END && !declared(&target) {
                problems.push(format!(
                    "edge '{source}' -> '{target}' references an undeclared node"
                ));
            }
            static_targets.entry(source).or_default().push(target);
        }

        let mut edges: HashMap<String, Edges> = HashMap::new();
        for (source, targets) in static_targets {
            edges.insert(source, Edges::Static(targets));
        }

        for (source, router, targets) in conditional {
            if !declared(&source) {
                problems.push(format!("conditional edge source '{source}' is not declared"));
            }
            if edges.contains_key(&source) {
                problems.push(format!(
                    "node '{source}' declares both static and conditional edges, or more than one conditional edge"
                ));
                continue;
            }
            for key in router.keys() {
                if !targets.contains_key(key) {
                    problems.push(format!(
                        "conditional edge from '{source}' has no target for router key '{key}'"
                    ));
                }
            }
            for (key, target) in &targets {
                let names: Vec<&String> = match target {
                    Target::Node(n) => vec![n],
                    Target::Parallel(ns) => ns.iter().collect(),
                    Target::End => Vec::new(),
                };
                for name in names {
                    if !declared(name) {
                        problems.push(format!(
                            "conditional edge from '{source}' maps key '{key}' to undeclared node '{name}'"
                        ));
                    }
                }
            }
            edges.insert(source, Edges::Conditional { router, targets });
        }

        for group in fanout_groups(&edges) {
            if let Err(msg) = check_convergence(&group, &edges) {
                problems.push(msg);
            }
        }

        if !problems.is_empty() {
            return Err(StepflowError::Configuration(problems.join("; ")));
        }

        warn_unreachable(&nodes, &edges, &entry);
        debug!(nodes = nodes.len(), entry = %entry, "graph built");

        Ok(GraphSpec {
            nodes,
            index,
            edges,
            entry,
        })
    }
}

/// Every set of nodes that can be scheduled together.
fn fanout_groups(edges: &HashMap<String, Edges>) -> Vec<Vec<String>> {
    let mut groups = Vec::new();
    for e in edges.values() {
        match e {
            Edges::Static(targets) if targets.len() > 1 => groups.push(targets.clone()),
            Edges::Conditional { targets, .. } => {
                for t in targets.values() {
                    if let Target::Parallel(ns) = t {
                        groups.push(ns.clone());
                    }
                }
            }
            _ => {}
        }
    }
    groups
}

/// Each branch needs exactly one static out-edge, all to the same join node.
fn check_convergence(
    group: &[String],
    edges: &HashMap<String, Edges>,
) -> std::result::Result<(), String> {
    let unique: HashSet<&str> = group.iter().map(String::as_str).collect();
    if unique.len() != group.len() {
        return Err(format!("fan-out group {group:?} lists a branch twice"));
    }
    if group.iter().any(|n| n == END) {
        return Err(format!("fan-out group {group:?} cannot include '{END}'"));
    }

    let mut join: Option<&str> = None;
    for branch in group {
        let target = match edges.get(branch) {
            Some(Edges::Static(targets)) if targets.len() == 1 => targets[0].as_str(),
            _ => {
                return Err(format!(
                    "fan-out branch '{branch}' must have exactly one static edge to a join node"
                ));
            }
        };
        if target == END || unique.contains(target) {
            return Err(format!(
                "fan-out branch '{branch}' must lead to a join node outside its group"
            ));
        }
        match join {
            None => join = Some(target),
            Some(j) if j == target => {}
            Some(j) => {
                return Err(format!(
                    "fan-out group {group:?} does not converge: '{j}' vs '{target}'"
                ));
            }
        }
    }
    Ok(())
}

fn warn_unreachable(nodes: &[NodeEntry], edges: &HashMap<String, Edges>, entry: &str) {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for n in nodes {
        graph.add_node(n.name.as_str());
    }
    for (source, e) in edges {
        let targets: Vec<&str> = match e {
            Edges::None => Vec::new(),
            Edges::Static(ts) => ts.iter().map(String::as_str).collect(),
            Edges::Conditional { targets, .. } => targets
                .values()
                .flat_map(|t| match t {
                    Target::Node(n) => vec![n.as_str()],
                    Target::Parallel(ns) => ns.iter().map(String::as_str).collect(),
                    Target::End => Vec::new(),
                })
                .collect(),
        };
        for t in targets.into_iter().filter(|t| *t != END) {
            graph.add_edge(source.as_str(), t, ());
        }
    }

    let mut reached = HashSet::new();
    let mut dfs = Dfs::new(&graph, entry);
    while let Some(n) = dfs.next(&graph) {
        reached.insert(n);
    }
    for n in nodes {
        if !reached.contains(n.name.as_str()) {
            warn!(node = %n.name, "node is unreachable from the entry node");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::handler::handler_fn;
    use crate::state::Patch;

    fn noop() -> Arc<dyn NodeHandler> {
        handler_fn(|_| Ok(Patch::new()))
    }

    fn config_error(builder: GraphBuilder) -> String {
        match builder.build() {
            Err(StepflowError::Configuration(msg)) => msg,
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected a configuration error"),
        }
    }

    #[test]
    fn builds_a_linear_chain() {
        let spec = GraphBuilder::new()
            .add_node("a", noop())
            .add_node("b", noop())
            .add_edge("a", "b")
            .add_edge("b", END)
            .set_entry("a")
            .build()
            .unwrap();

        assert_eq!(spec.entry(), "a");
        assert_eq!(spec.node_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(matches!(spec.edges("a"), Edges::Static(t) if t == &vec!["b".to_string()]));
        assert_eq!(spec.node("b").map(|n| n.order), Some(1));
    }

    #[test]
    fn rejects_undeclared_entry() {
        let msg = config_error(GraphBuilder::new().add_node("a", noop()).set_entry("missing"));
        assert!(msg.contains("entry node 'missing'"));
    }

    #[test]
    fn rejects_edge_to_undeclared_node() {
        let msg = config_error(
            GraphBuilder::new()
                .add_node("a", noop())
                .add_edge("a", "ghost")
                .set_entry("a"),
        );
        assert!(msg.contains("ghost"));
    }

    #[test]
    fn rejects_incomplete_target_map() {
        let router = Router::new(["again", "done"], |_| Ok("done".to_string()));
        let msg = config_error(
            GraphBuilder::new()
                .add_node("a", noop())
                .add_conditional_edge("a", router, [("again", Target::node("a"))])
                .set_entry("a"),
        );
        assert!(msg.contains("router key 'done'"));
    }

    #[test]
    fn rejects_mixed_edge_kinds() {
        let router = Router::new(["end"], |_| Ok("end".to_string()));
        let msg = config_error(
            GraphBuilder::new()
                .add_node("a", noop())
                .add_node("b", noop())
                .add_edge("a", "b")
                .add_conditional_edge("a", router, [("end", Target::End)])
                .set_entry("a"),
        );
        assert!(msg.contains("both static and conditional"));
    }

    #[test]
    fn fanout_must_converge_on_one_join() {
        let msg = config_error(
            GraphBuilder::new()
                .add_node("src", noop())
                .add_node("x", noop())
                .add_node("y", noop())
                .add_node("j1", noop())
                .add_node("j2", noop())
                .add_edge("src", "x")
                .add_edge("src", "y")
                .add_edge("x", "j1")
                .add_edge("y", "j2")
                .set_entry("src"),
        );
        assert!(msg.contains("does not converge"));
    }

    #[test]
    fn converging_fanout_exposes_its_join() {
        let spec = GraphBuilder::new()
            .add_node("src", noop())
            .add_node("x", noop())
            .add_node("y", noop())
            .add_node("join", noop())
            .add_edge("src", "x")
            .add_edge("src", "y")
            .add_edge("x", "join")
            .add_edge("y", "join")
            .set_entry("src")
            .build()
            .unwrap();

        assert_eq!(spec.join_of(&["x".into(), "y".into()]), Some("join"));
    }

    #[test]
    fn rejects_duplicate_and_reserved_names() {
        let msg = config_error(
            GraphBuilder::new()
                .add_node("a", noop())
                .add_node("a", noop())
                .add_node(END, noop())
                .set_entry("a"),
        );
        assert!(msg.contains("declared twice"));
        assert!(msg.contains("reserved"));
    }
}
