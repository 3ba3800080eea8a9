// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! The domain partition tree ("domtree").
//!
//! A [`DomTree`] recursively cuts the input space of one [`AddTree`] into
//! boxes. Its leaves are [`Subspace`]s, which track for every node of every
//! ensemble tree whether some input in the box can still reach it, together
//! with a cached best cut.
//!
//! The tree is an arena addressed by [`DomNodeId`]. Splitting a leaf turns it
//! into an internal node and drops its [`Subspace`]; any later access to the
//! old leaf through [`DomTree::get_subspace`] fails with
//! [`DomainError::NotALeaf`]. Copies of a [`Subspace`] handed out before the
//! split stay valid as values but are rejected by [`DomTree::update_leaf`].

use bitvec::prelude::*;
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Domains, RealDomain};
use crate::tree::{AddTree, FeatId, NodeId, Tree};

/// Index of a node in a [`DomTree`]. The root is always node 0.
pub type DomNodeId = usize;

/// Errors from manipulating the domain partition tree.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// The node exists but was split, so its leaf is gone
    #[error("domain tree node {0} is not a leaf")]
    NotALeaf(DomNodeId),
    /// No such node
    #[error("domain tree node {0} does not exist")]
    NoSuchNode(DomNodeId),
    /// No cut of the leaf makes any tree node unreachable
    #[error("domain tree leaf {0} has no split with a positive score")]
    NoSplit(DomNodeId),
    /// Subspaces that do not describe the same leaf
    #[error("cannot merge subspaces: {0}")]
    Merge(String),
}

/// A candidate cut `x[feat_id] < split_value` of a leaf and its quality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestSplit {
    /// Feature that is cut
    pub feat_id: FeatId,
    /// The left child gets `[lo, split_value)`, the right `[split_value, hi)`
    pub split_value: f64,
    /// Number of reachable ensemble nodes that become unreachable in either child
    pub score: f64,
    /// `min / max` of the per-child unreachable counts, in `[0, 1]`
    pub balance: f64,
}

/// A leaf of the domain tree: a box plus per-tree reachability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subspace {
    node_id: DomNodeId,
    domains: Domains,
    reachable: Vec<BitVec>,
    best_split: Option<BestSplit>,
}

impl Subspace {
    /// A leaf covering `domains` where every node compatible with the box is
    /// reachable.
    pub fn new(at: &AddTree, node_id: DomNodeId, domains: Domains) -> Self {
        let mut leaf = Subspace {
            node_id,
            domains,
            reachable: at.iter().map(|t| bitvec![1; t.num_nodes()]).collect(),
            best_split: None,
        };
        leaf.refine_reachability(at);
        leaf
    }

    /// Id of the domain tree node this leaf was taken from.
    pub fn domtree_node_id(&self) -> DomNodeId {
        self.node_id
    }

    /// The box of this leaf.
    pub fn domains(&self) -> &Domains {
        &self.domains
    }

    /// Whether node `node` of tree `tree_index` can still be reached.
    pub fn is_reachable(&self, tree_index: usize, node: NodeId) -> bool {
        self.reachable
            .get(tree_index)
            .and_then(|bits| bits.get(node).map(|b| *b))
            .unwrap_or(false)
    }

    /// Mark a node unreachable. Reachability is never restored afterwards.
    pub fn mark_unreachable(&mut self, tree_index: usize, node: NodeId) {
        if let Some(bits) = self.reachable.get_mut(tree_index) {
            if node < bits.len() {
                bits.set(node, false);
            }
        }
    }

    /// The cached result of [`Subspace::find_best_domtree_split`].
    pub fn get_best_split(&self) -> Option<BestSplit> {
        self.best_split
    }

    /// Score of the cached best split, 0 if none was found or computed.
    pub fn split_score(&self) -> f64 {
        self.best_split.map_or(0.0, |s| s.score)
    }

    /// Balance of the cached best split, 0 if there is none.
    pub fn split_balance(&self) -> f64 {
        self.best_split.map_or(0.0, |s| s.balance)
    }

    /// Clear the reachability of every child whose branch cannot be taken by
    /// any input in the box.
    fn refine_reachability(&mut self, at: &AddTree) {
        for (tree_index, tree) in at.iter().enumerate() {
            let mut stack = vec![tree.root()];
            while let Some(node) = stack.pop() {
                if !self.is_reachable(tree_index, node) {
                    continue;
                }
                let (Some(split), Some(l), Some(r)) =
                    (tree.get_split(node), tree.left(node), tree.right(node))
                else {
                    continue;
                };
                let (dl, dr) = split.domains();
                let d = self.domains.get(split.feat_id());
                for (child, branch) in [(l, dl), (r, dr)] {
                    if d.overlaps(&branch) {
                        stack.push(child);
                    } else {
                        self.mark_unreachable(tree_index, child);
                    }
                }
            }
        }
    }

    /// Visit every node of `tree` that is reachable in this leaf when the box
    /// is narrowed to `domains`.
    fn walk_reachable<F>(&self, tree_index: usize, tree: &Tree, domains: &Domains, mut f: F)
    where
        F: FnMut(NodeId),
    {
        let mut stack = vec![tree.root()];
        while let Some(node) = stack.pop() {
            if !self.is_reachable(tree_index, node) {
                continue;
            }
            f(node);
            if let (Some(split), Some(l), Some(r)) =
                (tree.get_split(node), tree.left(node), tree.right(node))
            {
                let (dl, dr) = split.domains();
                let d = domains.get(split.feat_id());
                if d.overlaps(&dl) {
                    stack.push(l);
                }
                if d.overlaps(&dr) {
                    stack.push(r);
                }
            }
        }
    }

    fn count_reachable(&self, at: &AddTree, domains: &Domains) -> usize {
        let mut count = 0;
        for (tree_index, tree) in at.iter().enumerate() {
            self.walk_reachable(tree_index, tree, domains, |_| count += 1);
        }
        count
    }

    /// Number of ensemble nodes no input in this leaf can reach.
    pub fn num_unreachable(&self, at: &AddTree) -> usize {
        at.num_nodes() - self.count_reachable(at, &self.domains)
    }

    /// Bounds `(lo, hi)` on the leaf values of tree `tree_index` reachable in
    /// this leaf. The interval is empty (`lo > hi`) if no leaf is reachable.
    pub fn get_tree_bounds(&self, at: &AddTree, tree_index: usize) -> (f64, f64) {
        let tree = &at[tree_index];
        let mut bounds = (f64::INFINITY, f64::NEG_INFINITY);
        self.walk_reachable(tree_index, tree, &self.domains, |node| {
            if let Some(v) = tree.leaf_value(node) {
                bounds = (bounds.0.min(v), bounds.1.max(v));
            }
        });
        bounds
    }

    /// Bounds on the ensemble output in this leaf, base score included.
    pub fn output_bounds(&self, at: &AddTree) -> (f64, f64) {
        (0..at.len())
            .map(|i| self.get_tree_bounds(at, i))
            .fold((at.base_score, at.base_score), |(lo, hi), (l, h)| {
                (lo + l, hi + h)
            })
    }

    /// Search the cut with the highest unreachable-nodes score and cache it.
    ///
    /// Candidates are the thresholds of reachable internal nodes that lie
    /// strictly inside the current box. Ties go to the first candidate in
    /// tree order. Nothing is cached if no cut has a positive score.
    pub fn find_best_domtree_split(&mut self, at: &AddTree) {
        let mut candidates = vec![];
        for (tree_index, tree) in at.iter().enumerate() {
            self.walk_reachable(tree_index, tree, &self.domains, |node| {
                if let Some(split) = tree.get_split(node) {
                    let (feat_id, value) = (split.feat_id(), split.split_value());
                    if self.domains.get(feat_id).contains_strict(value) {
                        candidates.push((feat_id, value));
                    }
                }
            });
        }
        let candidates = candidates
            .into_iter()
            .unique_by(|(f, v)| (*f, v.to_bits()))
            .collect_vec();

        let base = self.count_reachable(at, &self.domains);
        let scored: Vec<BestSplit> = candidates
            .par_iter()
            .map(|&(feat_id, split_value)| {
                let (dl, dr) = self.domains.get(feat_id).split(split_value);
                let mut domains_l = self.domains.clone();
                domains_l.set(feat_id, dl);
                let mut domains_r = self.domains.clone();
                domains_r.set(feat_id, dr);
                let unreach_l = base - self.count_reachable(at, &domains_l);
                let unreach_r = base - self.count_reachable(at, &domains_r);
                let (lo, hi) = (unreach_l.min(unreach_r), unreach_l.max(unreach_r));
                BestSplit {
                    feat_id,
                    split_value,
                    score: (unreach_l + unreach_r) as f64,
                    balance: if hi == 0 { 0.0 } else { lo as f64 / hi as f64 },
                }
            })
            .collect();

        let mut best: Option<BestSplit> = None;
        for s in scored {
            if s.score > best.map_or(0.0, |b| b.score) {
                best = Some(s);
            }
        }
        log::debug!(
            "best split for domtree leaf {}: {:?} ({} candidates)",
            self.node_id,
            best,
            candidates.len()
        );
        self.best_split = best;
    }

    /// The leaf for one side of a cut of this leaf.
    fn child(&self, at: &AddTree, node_id: DomNodeId, feat_id: FeatId, d: RealDomain) -> Self {
        let mut leaf = self.clone();
        leaf.node_id = node_id;
        leaf.domains.set(feat_id, d);
        leaf.best_split = None;
        leaf.refine_reachability(at);
        leaf
    }

    /// Fold copies of the same leaf back together: a node is reachable only
    /// if it is reachable in every copy. The first cached best split wins.
    pub fn merge(leaves: Vec<Subspace>) -> Result<Subspace, DomainError> {
        let mut iter = leaves.into_iter();
        let Some(mut merged) = iter.next() else {
            return Err(DomainError::Merge("nothing to merge".to_string()));
        };
        for leaf in iter {
            if leaf.node_id != merged.node_id || leaf.domains != merged.domains {
                return Err(DomainError::Merge(format!(
                    "leaf {} does not match leaf {}",
                    leaf.node_id, merged.node_id
                )));
            }
            if leaf.reachable.len() != merged.reachable.len() {
                return Err(DomainError::Merge(format!(
                    "leaf {} was built for a different ensemble",
                    leaf.node_id
                )));
            }
            for (bits, other) in merged.reachable.iter_mut().zip(&leaf.reachable) {
                for node in other.iter_zeros() {
                    if node < bits.len() {
                        bits.set(node, false);
                    }
                }
            }
            merged.best_split = merged.best_split.or(leaf.best_split);
        }
        Ok(merged)
    }
}

#[derive(Debug, Clone)]
enum DomNode {
    Leaf(Subspace),
    Internal {
        split: BestSplit,
        left: DomNodeId,
        right: DomNodeId,
    },
}

/// The domain partition tree of one [`AddTree`].
#[derive(Debug, Clone)]
pub struct DomTree {
    nodes: Vec<DomNode>,
    parents: Vec<Option<DomNodeId>>,
}

impl DomTree {
    /// A tree with a single leaf covering `root_domains`.
    pub fn new(at: &AddTree, root_domains: Domains) -> Self {
        DomTree {
            nodes: vec![DomNode::Leaf(Subspace::new(at, 0, root_domains))],
            parents: vec![None],
        }
    }

    /// Id of the root, the whole input box.
    pub fn root(&self) -> DomNodeId {
        0
    }

    /// Number of nodes ever created, split ones included.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, id: DomNodeId) -> Result<&DomNode, DomainError> {
        self.nodes.get(id).ok_or(DomainError::NoSuchNode(id))
    }

    /// Whether `id` has not been split.
    pub fn is_leaf(&self, id: DomNodeId) -> bool {
        matches!(self.nodes.get(id), Some(DomNode::Leaf(_)))
    }

    /// Parent of `id`, `None` for the root.
    pub fn parent(&self, id: DomNodeId) -> Option<DomNodeId> {
        self.parents.get(id).copied().flatten()
    }

    /// The children of a split node, `None` for leaves.
    pub fn children(&self, id: DomNodeId) -> Option<(DomNodeId, DomNodeId)> {
        match self.nodes.get(id) {
            Some(DomNode::Internal { left, right, .. }) => Some((*left, *right)),
            _ => None,
        }
    }

    /// The cut applied at a split node.
    pub fn get_split(&self, id: DomNodeId) -> Option<BestSplit> {
        match self.nodes.get(id) {
            Some(DomNode::Internal { split, .. }) => Some(*split),
            _ => None,
        }
    }

    /// Number of splits between the root and `id`.
    pub fn depth(&self, mut id: DomNodeId) -> usize {
        let mut depth = 0;
        while let Some(p) = self.parent(id) {
            id = p;
            depth += 1;
        }
        depth
    }

    /// Ids of all current leaves.
    pub fn leaves(&self) -> impl Iterator<Item = DomNodeId> + '_ {
        (0..self.nodes.len()).filter(|&id| self.is_leaf(id))
    }

    /// The leaf at `id`. Fails for split nodes.
    pub fn get_subspace(&self, id: DomNodeId) -> Result<&Subspace, DomainError> {
        match self.node(id)? {
            DomNode::Leaf(leaf) => Ok(leaf),
            DomNode::Internal { .. } => Err(DomainError::NotALeaf(id)),
        }
    }

    /// Mutable access to the leaf at `id`.
    pub fn get_subspace_mut(&mut self, id: DomNodeId) -> Result<&mut Subspace, DomainError> {
        match self.nodes.get_mut(id) {
            Some(DomNode::Leaf(leaf)) => Ok(leaf),
            Some(DomNode::Internal { .. }) => Err(DomainError::NotALeaf(id)),
            None => Err(DomainError::NoSuchNode(id)),
        }
    }

    /// Write back a copy of a leaf that was annotated elsewhere (pruned
    /// reachability, cached best split). The stored and returned
    /// reachabilities are merged, so nothing becomes reachable again.
    pub fn update_leaf(&mut self, leaf: Subspace) -> Result<(), DomainError> {
        let id = leaf.domtree_node_id();
        let stored = self.get_subspace_mut(id)?;
        *stored = Subspace::merge(vec![leaf, stored.clone()])?;
        Ok(())
    }

    /// Split leaf `id` at its best cut, computing the cut first if needed.
    /// Returns the ids of the two new leaves; `id` is no longer a leaf.
    pub fn split(&mut self, id: DomNodeId, at: &AddTree) -> Result<(DomNodeId, DomNodeId), DomainError> {
        let (left, right) = (self.nodes.len(), self.nodes.len() + 1);
        let leaf = self.get_subspace_mut(id)?;
        if leaf.best_split.is_none() {
            leaf.find_best_domtree_split(at);
        }
        let Some(split) = leaf.best_split else {
            return Err(DomainError::NoSplit(id));
        };
        let (dl, dr) = leaf.domains.get(split.feat_id).split(split.split_value);
        let l = leaf.child(at, left, split.feat_id, dl);
        let r = leaf.child(at, right, split.feat_id, dr);
        self.nodes.push(DomNode::Leaf(l));
        self.nodes.push(DomNode::Leaf(r));
        self.parents.push(Some(id));
        self.parents.push(Some(id));
        self.nodes[id] = DomNode::Internal { split, left, right };
        log::debug!(
            "split domtree leaf {id} at x{} < {} into {left}, {right}",
            split.feat_id,
            split.split_value
        );
        Ok((left, right))
    }

    /// Split the leaf a copy `leaf` was taken from and return the two
    /// children as values.
    ///
    /// If the node is still a leaf, the annotations of `leaf` are written back
    /// first, so its cached best split decides the cut. If the node was
    /// already split through another copy, the existing cut is applied to
    /// `leaf` and the children keep the existing ids.
    pub fn split_leaf(&mut self, leaf: &Subspace, at: &AddTree) -> Result<(Subspace, Subspace), DomainError> {
        let id = leaf.domtree_node_id();
        if self.is_leaf(id) {
            self.update_leaf(leaf.clone())?;
            let (l, r) = self.split(id, at)?;
            return Ok((self.get_subspace(l)?.clone(), self.get_subspace(r)?.clone()));
        }
        match (self.children(id), self.get_split(id)) {
            (Some((left, right)), Some(split)) => {
                let (dl, dr) = leaf.domains.get(split.feat_id).split(split.split_value);
                Ok((
                    leaf.child(at, left, split.feat_id, dl),
                    leaf.child(at, right, split.feat_id, dr),
                ))
            }
            _ => Err(DomainError::NoSuchNode(id)),
        }
    }
}
