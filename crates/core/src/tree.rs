//! Multi-root dependency tree.
//!
//! Nodes live in an arena owned by [`MultiRootTree`] and refer to each other
//! through [`NodeId`] indices. Edges point downstream: a node's `dependents`
//! are the jobs that depend on it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::{ModelError, Result};
use crate::Time;

/// Index of a node inside its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// A job in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// Job name, unique within the tree
    pub name: String,
    /// Jobs that depend on this one
    pub dependents: Vec<NodeId>,
    /// Scheduled instants attached to this job
    pub runs: BTreeSet<Time>,
}

impl TreeNode {
    /// Create a node without edges or runs.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependents: Vec::new(),
            runs: BTreeSet::new(),
        }
    }
}

/// A DAG with any number of roots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TreeRecord", into = "TreeRecord")]
pub struct MultiRootTree {
    nodes: Vec<TreeNode>,
    index: HashMap<String, NodeId>,
    root_names: Vec<String>,
}

impl MultiRootTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, replacing any node of the same name.
    ///
    /// Edges pointing at the replaced node keep pointing at the new one.
    pub fn add_node(&mut self, node: TreeNode) -> NodeId {
        if let Some(&id) = self.index.get(&node.name) {
            self.nodes[id.0] = node;
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.index.insert(node.name.clone(), id);
        self.nodes.push(node);
        id
    }

    /// Insert a node unless one with the same name exists.
    pub fn add_node_if_not_exist(&mut self, node: TreeNode) -> NodeId {
        match self.index.get(&node.name) {
            Some(&id) => id,
            None => self.add_node(node),
        }
    }

    /// Get or create the node for a name.
    pub fn node_for(&mut self, name: &str) -> NodeId {
        self.add_node_if_not_exist(TreeNode::new(name))
    }

    /// Record that `child` depends on `parent`.
    pub fn add_dependent(&mut self, parent: NodeId, child: NodeId) {
        let dependents = &mut self.nodes[parent.0].dependents;
        if !dependents.contains(&child) {
            dependents.push(child);
        }
    }

    /// Mark a node as a root.
    pub fn mark_root(&mut self, name: &str) {
        self.root_names.push(name.to_string());
    }

    /// Look up a node by name.
    pub fn get_node_by_name(&self, name: &str) -> Option<&TreeNode> {
        self.index.get(name).map(|id| &self.nodes[id.0])
    }

    /// Look up a node id by name.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    /// Access a node.
    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    /// Mutable access to a node.
    pub fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id.0]
    }

    /// Names passed to [`mark_root`](Self::mark_root), in order.
    pub fn root_names(&self) -> &[String] {
        &self.root_names
    }

    /// Root nodes, deduplicated, in marking order.
    pub fn get_root_nodes(&self) -> Vec<&TreeNode> {
        self.root_ids().into_iter().map(|id| self.node(id)).collect()
    }

    /// Root node ids, deduplicated, in marking order.
    pub fn root_ids(&self) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.root_names
            .iter()
            .filter_map(|name| self.node_id(name))
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// All node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.iter()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes reachable from `start` (inclusive), breadth first.
    pub fn reachable_from(&self, start: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::from([start]);
        let mut order = vec![start];
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for &child in &self.nodes[id.0].dependents {
                if seen.insert(child) {
                    order.push(child);
                    queue.push_back(child);
                }
            }
        }
        order
    }

    /// Reachable nodes from `start` ordered so every parent precedes its dependents.
    ///
    /// Only meaningful on acyclic trees.
    pub fn topological_from(&self, start: NodeId) -> Vec<NodeId> {
        let reachable = self.reachable_from(start);
        let members: HashSet<NodeId> = reachable.iter().copied().collect();

        let mut in_degree: HashMap<NodeId, usize> = reachable.iter().map(|id| (*id, 0)).collect();
        for id in &reachable {
            for child in &self.nodes[id.0].dependents {
                if members.contains(child) {
                    *in_degree.entry(*child).or_default() += 1;
                }
            }
        }

        let mut queue: VecDeque<NodeId> = reachable
            .iter()
            .copied()
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(reachable.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for child in &self.nodes[id.0].dependents {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }
        order
    }

    /// Copy of the subtree reachable from `start`, with `start` as its only root.
    pub fn subtree(&self, start: NodeId) -> MultiRootTree {
        let mut tree = MultiRootTree::new();
        for id in self.reachable_from(start) {
            let node = &self.nodes[id.0];
            let copy = tree.node_for(&node.name);
            tree.node_mut(copy).runs = node.runs.clone();
            for &child in &node.dependents {
                let child_copy = tree.node_for(&self.nodes[child.0].name);
                tree.add_dependent(copy, child_copy);
            }
        }
        tree.mark_root(&self.nodes[start.0].name);
        tree
    }

    /// Check the tree for cycles.
    ///
    /// Runs an iterative depth-first search from every unvisited node,
    /// tracking the nodes on the current path. Reaching a dependent that is
    /// already on the path is a cycle; the error names that dependent and
    /// renders the path leading back to it.
    pub fn is_cyclic(&self) -> Result<()> {
        let mut visited = vec![false; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if visited[start] {
                continue;
            }

            let mut on_path = vec![false; self.nodes.len()];
            let mut path: Vec<usize> = Vec::new();
            // (node, index of the next dependent to chase)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            visited[start] = true;
            on_path[start] = true;
            path.push(start);

            while let Some(frame) = stack.last_mut() {
                let (current, next) = *frame;
                let Some(child) = self.nodes[current].dependents.get(next).map(|c| c.0) else {
                    on_path[current] = false;
                    path.pop();
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                if on_path[child] {
                    return Err(ModelError::CyclicDependency {
                        node: self.nodes[child].name.clone(),
                        chain: self.render_chain(&path, child),
                    });
                }
                if !visited[child] {
                    visited[child] = true;
                    on_path[child] = true;
                    path.push(child);
                    stack.push((child, 0));
                }
            }
        }
        Ok(())
    }

    fn render_chain(&self, path: &[usize], back_to: usize) -> String {
        let from = path.iter().position(|&n| n == back_to).unwrap_or(0);
        path[from..]
            .iter()
            .chain(std::iter::once(&back_to))
            .enumerate()
            .map(|(depth, &n)| format!("{}->{}", "\t".repeat(depth), self.nodes[n].name))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Persisted form of a tree: a node list keyed by job name.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreeRecord {
    #[serde(default)]
    roots: Vec<String>,
    nodes: Vec<NodeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    job_name: String,
    #[serde(default)]
    dependents: Vec<String>,
    #[serde(default)]
    runs: Vec<Time>,
}

impl From<MultiRootTree> for TreeRecord {
    fn from(tree: MultiRootTree) -> Self {
        let nodes = tree
            .nodes
            .iter()
            .map(|node| NodeRecord {
                job_name: node.name.clone(),
                dependents: node
                    .dependents
                    .iter()
                    .map(|id| tree.nodes[id.0].name.clone())
                    .collect(),
                runs: node.runs.iter().copied().collect(),
            })
            .collect();
        Self {
            roots: tree.root_names,
            nodes,
        }
    }
}

impl TryFrom<TreeRecord> for MultiRootTree {
    type Error = ModelError;

    fn try_from(record: TreeRecord) -> Result<Self> {
        let mut tree = MultiRootTree::new();
        for node in &record.nodes {
            let id = tree.node_for(&node.job_name);
            tree.node_mut(id).runs = node.runs.iter().copied().collect();
        }
        for node in &record.nodes {
            let parent = tree
                .node_id(&node.job_name)
                .ok_or_else(|| ModelError::NodeNotFound(node.job_name.clone()))?;
            for dependent in &node.dependents {
                let child = tree
                    .node_id(dependent)
                    .ok_or_else(|| ModelError::NodeNotFound(dependent.clone()))?;
                tree.add_dependent(parent, child);
            }
        }
        for root in &record.roots {
            if tree.node_id(root).is_none() {
                return Err(ModelError::NodeNotFound(root.clone()));
            }
            tree.mark_root(root);
        }
        Ok(tree)
    }
}
