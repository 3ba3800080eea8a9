// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Decision trees and additive ensembles of them.

use serde::{Deserialize, Serialize};
use std::{fmt, fs, io, ops::Index, path::Path};
use thiserror::Error;

use crate::domain::RealDomain;

/// Index of a node within a single [`Tree`]. The root is always node 0.
pub type NodeId = usize;
/// Index of an input feature.
pub type FeatId = usize;

/// Errors from loading or building a model.
#[derive(Error, Debug)]
pub enum ModelError {
    /// I/O went wrong
    #[error("could not access model file: {0}")]
    Io(#[from] io::Error),
    /// The JSON was malformed, including unknown split kinds
    #[error("could not parse model: {0}")]
    Json(#[from] serde_json::Error),
    /// The tree structure is inconsistent
    #[error("invalid tree: {0}")]
    Invalid(String),
}

/// The test performed at an internal node. Going left means the test holds.
///
/// Boolean features are encoded as reals, `0.0` for false and `1.0` for true;
/// a boolean test goes left on false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Split {
    /// `x[feat_id] < split_value`
    Lt {
        /// Tested feature
        feat_id: FeatId,
        /// Threshold
        split_value: f64,
    },
    /// `!x[feat_id]`
    Bool {
        /// Tested feature
        feat_id: FeatId,
    },
}

/// The real threshold separating false from true for boolean features.
pub const BOOL_SPLIT_VALUE: f64 = 0.5;

impl Split {
    /// The tested feature.
    pub fn feat_id(&self) -> FeatId {
        match self {
            Split::Lt { feat_id, .. } | Split::Bool { feat_id } => *feat_id,
        }
    }

    /// The threshold of this test on the real axis.
    pub fn split_value(&self) -> f64 {
        match self {
            Split::Lt { split_value, .. } => *split_value,
            Split::Bool { .. } => BOOL_SPLIT_VALUE,
        }
    }

    /// Whether an example with `value` for the tested feature goes left.
    pub fn test(&self, value: f64) -> bool {
        value < self.split_value()
    }

    /// The domains of the tested feature for which the test goes left and
    /// right, respectively.
    pub fn domains(&self) -> (RealDomain, RealDomain) {
        RealDomain::everything().split(self.split_value())
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Lt {
                feat_id,
                split_value,
            } => write!(f, "x{feat_id} < {split_value}"),
            Split::Bool { feat_id } => write!(f, "!x{feat_id}"),
        }
    }
}

/// A node in the arena of a [`Tree`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    /// A leaf contributing `value` to the ensemble output
    Leaf {
        /// Leaf value
        value: f64,
    },
    /// An internal node with a test and two children
    Internal {
        /// Test of this node
        split: Split,
        /// Child taken when the test holds
        left: NodeId,
        /// Child taken when the test fails
        right: NodeId,
    },
}

/// A binary decision tree stored as an arena of nodes, rooted at node 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Node>", into = "Vec<Node>")]
pub struct Tree {
    nodes: Vec<Node>,
    parents: Vec<Option<NodeId>>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// A tree consisting of a single leaf with value 0.
    pub fn new() -> Self {
        Tree {
            nodes: vec![Node::Leaf { value: 0.0 }],
            parents: vec![None],
        }
    }

    /// The root, always node 0.
    pub fn root(&self) -> NodeId {
        0
    }

    /// Number of nodes, leaves included.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// The node with id `node`. Panics if it is out of range.
    pub fn node(&self, node: NodeId) -> &Node {
        &self.nodes[node]
    }

    /// Whether `node` is a leaf.
    pub fn is_leaf(&self, node: NodeId) -> bool {
        matches!(self.nodes[node], Node::Leaf { .. })
    }

    /// Whether `node` has a test and two children.
    pub fn is_internal(&self, node: NodeId) -> bool {
        !self.is_leaf(node)
    }

    /// Whether `node` is the root.
    pub fn is_root(&self, node: NodeId) -> bool {
        node == self.root()
    }

    /// Child taken when the test of `node` holds.
    pub fn left(&self, node: NodeId) -> Option<NodeId> {
        match self.nodes[node] {
            Node::Internal { left, .. } => Some(left),
            Node::Leaf { .. } => None,
        }
    }

    /// Child taken when the test of `node` fails.
    pub fn right(&self, node: NodeId) -> Option<NodeId> {
        match self.nodes[node] {
            Node::Internal { right, .. } => Some(right),
            Node::Leaf { .. } => None,
        }
    }

    /// Parent of `node`, `None` for the root.
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.parents[node]
    }

    /// The test of an internal node.
    pub fn get_split(&self, node: NodeId) -> Option<&Split> {
        match &self.nodes[node] {
            Node::Internal { split, .. } => Some(split),
            Node::Leaf { .. } => None,
        }
    }

    /// The value of a leaf node.
    pub fn leaf_value(&self, node: NodeId) -> Option<f64> {
        match self.nodes[node] {
            Node::Leaf { value } => Some(value),
            Node::Internal { .. } => None,
        }
    }

    /// Number of edges between the root and `node`.
    pub fn depth(&self, mut node: NodeId) -> usize {
        let mut depth = 0;
        while let Some(p) = self.parents[node] {
            node = p;
            depth += 1;
        }
        depth
    }

    /// Turn the leaf `node` into an internal node with two fresh zero-valued
    /// leaves, returning their ids.
    pub fn split(&mut self, node: NodeId, split: Split) -> Result<(NodeId, NodeId), ModelError> {
        if !self.is_leaf(node) {
            return Err(ModelError::Invalid(format!("node {node} is already split")));
        }
        let left = self.nodes.len();
        let right = left + 1;
        self.nodes.push(Node::Leaf { value: 0.0 });
        self.nodes.push(Node::Leaf { value: 0.0 });
        self.parents.push(Some(node));
        self.parents.push(Some(node));
        self.nodes[node] = Node::Internal { split, left, right };
        Ok((left, right))
    }

    /// Set the value of a leaf. Fails for internal nodes.
    pub fn set_leaf_value(&mut self, node: NodeId, value: f64) -> Result<(), ModelError> {
        match &mut self.nodes[node] {
            Node::Leaf { value: v } => {
                *v = value;
                Ok(())
            }
            Node::Internal { .. } => Err(ModelError::Invalid(format!(
                "cannot set leaf value of internal node {node}"
            ))),
        }
    }

    /// Leaf value reached by `example`.
    pub fn predict_single(&self, example: &[f64]) -> f64 {
        self.leaf_value(self.eval_leaf(example)).unwrap_or(0.0)
    }

    /// The leaf reached by `example`; missing feature values are treated as 0.
    pub fn eval_leaf(&self, example: &[f64]) -> NodeId {
        let mut node = self.root();
        while let Node::Internal { split, left, right } = &self.nodes[node] {
            let value = example.get(split.feat_id()).copied().unwrap_or(0.0);
            node = if split.test(value) { *left } else { *right };
        }
        node
    }

    /// Ids of all internal nodes, in arena order.
    pub fn internal_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).filter(|&n| self.is_internal(n))
    }

    /// One more than the largest feature id tested in this tree.
    pub fn num_features(&self) -> usize {
        self.internal_nodes()
            .filter_map(|n| self.get_split(n).map(|s| s.feat_id() + 1))
            .max()
            .unwrap_or(0)
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, node: NodeId, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match &self.nodes[node] {
            Node::Leaf { value } => writeln!(f, "{pad}Leaf({node}): {value}"),
            Node::Internal { split, left, right } => {
                writeln!(f, "{pad}Node({node}): {split}")?;
                self.fmt_node(f, *left, indent + 1)?;
                self.fmt_node(f, *right, indent + 1)
            }
        }
    }
}

impl TryFrom<Vec<Node>> for Tree {
    type Error = String;

    fn try_from(nodes: Vec<Node>) -> Result<Self, Self::Error> {
        if nodes.is_empty() {
            return Err("tree has no nodes".to_string());
        }
        let mut parents = vec![None; nodes.len()];
        for (id, node) in nodes.iter().enumerate() {
            if let Node::Internal { left, right, .. } = node {
                for child in [*left, *right] {
                    if child == 0 || child >= nodes.len() {
                        return Err(format!("node {id} has invalid child {child}"));
                    }
                    if parents[child].replace(id).is_some() {
                        return Err(format!("node {child} has more than one parent"));
                    }
                }
            }
        }
        if let Some(orphan) = (1..nodes.len()).find(|&n| parents[n].is_none()) {
            return Err(format!("node {orphan} is not reachable from the root"));
        }
        Ok(Tree { nodes, parents })
    }
}

impl From<Tree> for Vec<Node> {
    fn from(tree: Tree) -> Self {
        tree.nodes
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f, self.root(), 0)
    }
}

/// An additive ensemble: the prediction is `base_score` plus the sum of the
/// leaf values reached in every tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddTree {
    /// Constant offset added to every prediction
    #[serde(default)]
    pub base_score: f64,
    trees: Vec<Tree>,
}

impl AddTree {
    /// An ensemble without trees and with base score 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of trees.
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    /// Whether the ensemble has no trees.
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Add a tree, returning its index.
    pub fn add_tree(&mut self, tree: Tree) -> usize {
        self.trees.push(tree);
        self.trees.len() - 1
    }

    /// The trees in order.
    pub fn iter(&self) -> impl Iterator<Item = &Tree> {
        self.trees.iter()
    }

    /// The ensemble output for one example.
    pub fn predict_single(&self, example: &[f64]) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.predict_single(example)).sum::<f64>()
    }

    /// The ensemble output for each example.
    pub fn predict(&self, examples: &[Vec<f64>]) -> Vec<f64> {
        examples.iter().map(|e| self.predict_single(e)).collect()
    }

    /// One more than the largest feature id tested anywhere in the ensemble.
    pub fn num_features(&self) -> usize {
        self.trees.iter().map(|t| t.num_features()).max().unwrap_or(0)
    }

    /// Total number of nodes over all trees.
    pub fn num_nodes(&self) -> usize {
        self.trees.iter().map(|t| t.num_nodes()).sum()
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse the JSON format of [`AddTree::to_json`].
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load an ensemble from a JSON file.
    pub fn read(path: &Path) -> Result<Self, ModelError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Save as JSON.
    pub fn write(&self, path: &Path) -> Result<(), ModelError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl Index<usize> for AddTree {
    type Output = Tree;

    fn index(&self, index: usize) -> &Self::Output {
        &self.trees[index]
    }
}

impl fmt::Display for AddTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "AddTree with {} trees, base score {}", self.len(), self.base_score)?;
        for (i, tree) in self.trees.iter().enumerate() {
            writeln!(f, "tree {i}:")?;
            write!(f, "{tree}")?;
        }
        Ok(())
    }
}
