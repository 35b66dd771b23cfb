//! The build graph, a graph between nodes connected by task and file
//! dependencies.

use crate::densemap::{self, DenseMap};
use crate::error::ConfigError;
use crate::task::Action;
use rustc_hash::FxHashMap;

/// Id for BuildNode within Graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// A task declared without a generator.
    Task,
    /// One item produced by a task's generator.
    SubTask { parent: String },
    /// Stands for a generating task as a whole; waits on all its sub-tasks.
    Group,
}

/// One concrete, schedulable unit of work.
#[derive(Debug, Clone)]
pub struct BuildNode {
    pub name: String,
    pub doc: Option<String>,
    pub kind: NodeKind,
    pub actions: Vec<Action>,
    /// Canonical paths of the files this node produces.
    pub targets: Vec<String>,
    /// Canonical paths of files this node reads.  Either targets of other
    /// nodes, or leaf inputs that no node produces.
    pub file_deps: Vec<String>,
    /// Names of nodes that must finish first.
    pub task_deps: Vec<String>,
    pub values: Vec<String>,
    /// Set when the node could not be fully expanded; it fails when scheduled.
    pub error: Option<String>,
    /// Resolved predecessors, filled in by Graph::build.
    preds: Vec<NodeId>,
}

impl BuildNode {
    pub fn new(name: String, kind: NodeKind) -> Self {
        BuildNode {
            name,
            doc: None,
            kind,
            actions: Vec::new(),
            targets: Vec::new(),
            file_deps: Vec::new(),
            task_deps: Vec::new(),
            values: Vec::new(),
            error: None,
            preds: Vec::new(),
        }
    }
    pub fn with_doc(mut self, doc: Option<String>) -> Self {
        self.doc = doc;
        self
    }
    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }
    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }
    pub fn with_file_deps(mut self, deps: Vec<String>) -> Self {
        self.file_deps = deps;
        self
    }
    pub fn with_task_deps(mut self, deps: Vec<String>) -> Self {
        self.task_deps = deps;
        self
    }
    pub fn with_values(mut self, values: Vec<String>) -> Self {
        self.values = values;
        self
    }
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    /// Nodes that must reach done before this one may run.
    pub fn preds(&self) -> &[NodeId] {
        &self.preds
    }

    /// A node without actions only aggregates its dependencies.
    pub fn is_meta(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Default)]
pub struct Graph {
    nodes: DenseMap<NodeId, BuildNode>,
    by_name: FxHashMap<String, NodeId>,
    /// Target path => node producing it.
    producers: FxHashMap<String, NodeId>,
    dependents: FxHashMap<NodeId, Vec<NodeId>>,
}

impl Graph {
    /// Builds the graph from expanded nodes, resolving every dependency
    /// reference into an edge and rejecting cycles and shared targets.
    pub fn build(nodes: impl IntoIterator<Item = BuildNode>) -> Result<Graph, ConfigError> {
        let mut graph = Graph::default();
        for node in nodes {
            graph.add_node(node)?;
        }
        graph.resolve()?;
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn add_node(&mut self, node: BuildNode) -> Result<(), ConfigError> {
        if self.by_name.contains_key(&node.name) {
            return Err(ConfigError::DuplicateTask(node.name));
        }
        let id = self.nodes.next_id();
        for target in &node.targets {
            if let Some(&other) = self.producers.get(target) {
                return Err(ConfigError::TargetConflict {
                    target: target.clone(),
                    first: self.nodes[other].name.clone(),
                    second: node.name,
                });
            }
            self.producers.insert(target.clone(), id);
        }
        self.by_name.insert(node.name.clone(), id);
        self.nodes.push(node);
        Ok(())
    }

    fn resolve(&mut self) -> Result<(), ConfigError> {
        for id in self.nodes.all_ids() {
            let node = &self.nodes[id];
            let mut preds = Vec::new();
            for name in &node.task_deps {
                match self.by_name.get(name) {
                    Some(&dep) => preds.push(dep),
                    None => {
                        return Err(ConfigError::UnknownTask {
                            name: name.clone(),
                            referenced_by: Some(node.name.clone()),
                        })
                    }
                }
            }
            // File deps nobody produces are leaf inputs: no edge, but they
            // still feed the fingerprint.
            preds.extend(
                node.file_deps
                    .iter()
                    .filter_map(|path| self.producers.get(path).copied()),
            );
            preds.sort();
            preds.dedup();
            for &pred in &preds {
                self.dependents.entry(pred).or_default().push(id);
            }
            self.nodes[id].preds = preds;
        }
        Ok(())
    }

    /// Depth-first search over predecessor edges; a back edge is a cycle.
    fn check_acyclic(&self) -> Result<(), ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Visiting,
            Done,
        }
        let mut marks = DenseMap::filled_like(&self.nodes, Mark::New);

        for root in self.nodes.all_ids() {
            if marks[root] != Mark::New {
                continue;
            }
            // Stack of (node, index of next pred to visit).
            let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
            marks[root] = Mark::Visiting;
            while let Some(top) = stack.last_mut() {
                let id = top.0;
                let preds = &self.nodes[id].preds;
                if top.1 == preds.len() {
                    marks[id] = Mark::Done;
                    stack.pop();
                    continue;
                }
                let pred = preds[top.1];
                top.1 += 1;
                match marks[pred] {
                    Mark::Done => {}
                    Mark::New => {
                        marks[pred] = Mark::Visiting;
                        stack.push((pred, 0));
                    }
                    Mark::Visiting => {
                        let start = stack.iter().position(|&(n, _)| n == pred).unwrap_or(0);
                        // The stack runs from dependents to dependencies;
                        // report in execution order.
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .rev()
                            .map(|&(n, _)| self.nodes[n].name.clone())
                            .collect();
                        cycle.push(self.nodes[id].name.clone());
                        return Err(ConfigError::CyclicDependency { cycle });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> &BuildNode {
        &self.nodes[id]
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// The node that declares `path` as a target.
    pub fn producer(&self, path: &str) -> Option<NodeId> {
        self.producers.get(path).copied()
    }

    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        self.dependents.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn all_ids(&self) -> impl Iterator<Item = NodeId> {
        self.nodes.all_ids()
    }

    pub(crate) fn nodes(&self) -> &DenseMap<NodeId, BuildNode> {
        &self.nodes
    }
}
