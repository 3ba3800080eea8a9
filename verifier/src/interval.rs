// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! A verifier for output properties of tree ensembles that works directly on
//! boxes of the input space.
//!
//! After [`Verifier::add_all_trees`], a check enumerates combinations of
//! leaves, one per tree of every model, whose regions intersect within the
//! leaf-set's box. Partial combinations are cut off as soon as the output
//! bounds of the remaining trees can no longer satisfy the property. Without
//! the trees, a check only decides the extra constraint over the box, which
//! is what the reachability pass needs.

use ensemble::{Domains, FeatId, NodeId, Subspace};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};

use crate::basics::{Assignment, SharedModels, Status, Verifier, VerifierError, VerifierFactory};
use crate::constraint::Constraint;

/// Comparison of a model output against a threshold.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cmp {
    /// `output > threshold`
    Gt,
    /// `output < threshold`
    Lt,
}

/// `output(instance) cmp threshold`
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputProperty {
    /// Index of the model the property talks about
    pub instance: usize,
    /// Comparison
    pub cmp: Cmp,
    /// Threshold
    pub threshold: f64,
}

impl OutputProperty {
    /// `output(instance) > threshold`
    pub fn gt(instance: usize, threshold: f64) -> Self {
        OutputProperty {
            instance,
            cmp: Cmp::Gt,
            threshold,
        }
    }

    /// `output(instance) < threshold`
    pub fn lt(instance: usize, threshold: f64) -> Self {
        OutputProperty {
            instance,
            cmp: Cmp::Lt,
            threshold,
        }
    }

    /// Whether `output` satisfies the property.
    pub fn holds(&self, output: f64) -> bool {
        match self.cmp {
            Cmp::Gt => output > self.threshold,
            Cmp::Lt => output < self.threshold,
        }
    }

    /// Whether some output in `[lo, hi]` can satisfy the property.
    pub fn feasible(&self, lo: f64, hi: f64) -> bool {
        match self.cmp {
            Cmp::Gt => hi > self.threshold,
            Cmp::Lt => lo < self.threshold,
        }
    }
}

impl fmt::Display for OutputProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.cmp {
            Cmp::Gt => ">",
            Cmp::Lt => "<",
        };
        write!(f, "output{} {op} {}", self.instance, self.threshold)
    }
}

/// Builds [`IntervalVerifier`]s that decide a conjunction of output properties.
#[derive(Debug, Clone)]
pub struct IntervalVerifierFactory {
    properties: Vec<OutputProperty>,
}

impl IntervalVerifierFactory {
    /// Verifiers for the conjunction of `properties`.
    pub fn new(properties: Vec<OutputProperty>) -> Self {
        IntervalVerifierFactory { properties }
    }
}

impl VerifierFactory for IntervalVerifierFactory {
    type Verifier = IntervalVerifier;

    fn create(&self, models: &SharedModels, leaves: &[Subspace]) -> Result<IntervalVerifier, VerifierError> {
        IntervalVerifier::new(models.clone(), leaves.to_vec(), self.properties.clone())
    }
}

/// One step of the leaf-combination search: a tree of one model.
#[derive(Debug, Clone, Copy)]
struct Slot {
    instance: usize,
    tree_index: usize,
}

/// See the module documentation.
pub struct IntervalVerifier {
    models: SharedModels,
    leaves: Vec<Subspace>,
    properties: Vec<OutputProperty>,
    timeout: Option<Duration>,
    trees_added: bool,
    check_time: Duration,
    model: Option<Assignment>,
}

struct Search<'a> {
    verifier: &'a IntervalVerifier,
    slots: Vec<Slot>,
    /// `remaining[k][i]`: output bounds of model `i` over slots `k..`
    remaining: Vec<Vec<(f64, f64)>>,
    start: Instant,
    deadline: Option<Instant>,
}

impl IntervalVerifier {
    /// A verifier over one leaf per model. Fails on an arity mismatch or a
    /// property about a model that does not exist.
    pub fn new(
        models: SharedModels,
        leaves: Vec<Subspace>,
        properties: Vec<OutputProperty>,
    ) -> Result<Self, VerifierError> {
        if models.len() != leaves.len() {
            return Err(VerifierError::Arity {
                models: models.len(),
                leaves: leaves.len(),
            });
        }
        if let Some(p) = properties.iter().find(|p| p.instance >= models.len()) {
            return Err(VerifierError::Property(format!(
                "{p} refers to model {} but there are only {}",
                p.instance,
                models.len()
            )));
        }
        Ok(IntervalVerifier {
            models,
            leaves,
            properties,
            timeout: None,
            trees_added: false,
            check_time: Duration::ZERO,
            model: None,
        })
    }

    /// The box shared by all leaves of the leaf-set.
    fn joint_domains(&self) -> Option<Domains> {
        self.leaves
            .iter()
            .try_fold(Domains::new(), |acc, leaf| acc.intersect(leaf.domains()))
    }

    fn num_features(&self) -> usize {
        self.models.iter().map(|at| at.num_features()).max().unwrap_or(0)
    }

    /// A point inside `domains`, covering every feature the models use.
    fn pick_point(&self, domains: &Domains) -> BTreeMap<FeatId, f64> {
        let n = self.num_features().max(domains.len());
        (0..n)
            .map(|f| {
                let d = domains.get(f);
                let v = if d.lo.is_finite() {
                    d.lo
                } else if d.hi.is_finite() {
                    d.hi - 1.0
                } else {
                    0.0
                };
                (f, v)
            })
            .collect()
    }

    fn search(&self, start: Instant, domains: &Domains) -> Result<Option<Domains>, VerifierError> {
        let mut slots = vec![];
        for (instance, at) in self.models.iter().enumerate() {
            for tree_index in 0..at.len() {
                slots.push(Slot {
                    instance,
                    tree_index,
                });
            }
        }
        let zero = vec![(0.0, 0.0); self.models.len()];
        let mut remaining = vec![zero; slots.len() + 1];
        for k in (0..slots.len()).rev() {
            let Slot {
                instance,
                tree_index,
            } = slots[k];
            let (lo, hi) =
                self.leaves[instance].get_tree_bounds(&self.models[instance], tree_index);
            remaining[k] = remaining[k + 1].clone();
            remaining[k][instance].0 += lo;
            remaining[k][instance].1 += hi;
        }
        let search = Search {
            verifier: self,
            slots,
            remaining,
            start,
            deadline: self.timeout.map(|t| start + t),
        };
        let outputs = self.models.iter().map(|at| at.base_score).collect::<Vec<_>>();
        search.descend(0, domains, &outputs)
    }
}

impl<'a> Search<'a> {
    fn check_deadline(&self) -> Result<(), VerifierError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(VerifierError::Timeout {
                unknown_after: self.start.elapsed(),
            }),
            _ => Ok(()),
        }
    }

    /// Whether the property can still hold after fixing slots `..k`.
    fn feasible(&self, k: usize, outputs: &[f64]) -> bool {
        self.verifier.properties.iter().all(|p| {
            let (lo, hi) = self.remaining[k][p.instance];
            p.feasible(outputs[p.instance] + lo, outputs[p.instance] + hi)
        })
    }

    fn descend(&self, k: usize, domains: &Domains, outputs: &[f64]) -> Result<Option<Domains>, VerifierError> {
        self.check_deadline()?;
        if !self.feasible(k, outputs) {
            return Ok(None);
        }
        let Some(&Slot {
            instance,
            tree_index,
        }) = self.slots.get(k)
        else {
            return Ok(Some(domains.clone()));
        };
        for (value, leaf_domains) in self.compatible_leaves(instance, tree_index, domains) {
            let mut outputs = outputs.to_vec();
            outputs[instance] += value;
            if let Some(found) = self.descend(k + 1, &leaf_domains, &outputs)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Leaves of a tree reachable within `domains`, with their values and the
    /// box narrowed to their region.
    fn compatible_leaves(&self, instance: usize, tree_index: usize, domains: &Domains) -> Vec<(f64, Domains)> {
        let tree = &self.verifier.models[instance][tree_index];
        let leaf = &self.verifier.leaves[instance];
        let mut out = vec![];
        let mut stack: Vec<(NodeId, Domains)> = vec![(tree.root(), domains.clone())];
        while let Some((node, domains)) = stack.pop() {
            if !leaf.is_reachable(tree_index, node) {
                continue;
            }
            match (tree.get_split(node), tree.left(node), tree.right(node)) {
                (Some(split), Some(l), Some(r)) => {
                    let (dl, dr) = split.domains();
                    if let Some(d) = domains.refine(split.feat_id(), &dr) {
                        stack.push((r, d));
                    }
                    if let Some(d) = domains.refine(split.feat_id(), &dl) {
                        stack.push((l, d));
                    }
                }
                _ => {
                    if let Some(value) = tree.leaf_value(node) {
                        out.push((value, domains));
                    }
                }
            }
        }
        out
    }
}

impl Verifier for IntervalVerifier {
    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    fn add_all_trees(&mut self) -> Result<(), VerifierError> {
        self.trees_added = true;
        Ok(())
    }

    fn check(&mut self, extra: Option<&Constraint>) -> Result<Status, VerifierError> {
        let start = Instant::now();
        self.model = None;
        let result = self.check_from(start, extra);
        self.check_time = start.elapsed();
        match &result {
            Ok(status) => log::debug!("interval check: {status} in {:?}", self.check_time),
            Err(err) => log::debug!("interval check: {err}"),
        }
        result
    }

    fn model(&self) -> Option<Assignment> {
        self.model.clone()
    }

    fn check_time(&self) -> Duration {
        self.check_time
    }
}

impl IntervalVerifier {
    fn check_from(&mut self, start: Instant, extra: Option<&Constraint>) -> Result<Status, VerifierError> {
        let Some(domains) = self.joint_domains() else {
            return Ok(Status::Unsat);
        };
        let boxes = match extra {
            Some(c) => c.boxes(&domains),
            None => vec![domains],
        };
        for b in boxes {
            let found = if self.trees_added {
                self.search(start, &b)?
            } else {
                Some(b)
            };
            if let Some(found) = found {
                let point = self.pick_point(&found);
                self.model = Some(Assignment::evaluate(&self.models, point));
                return Ok(Status::Sat);
            }
        }
        Ok(Status::Unsat)
    }
}
