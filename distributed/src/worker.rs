// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Functions executed by the workers. They only read the models and return
//! results; the driver applies every change to the domain trees.

use ensemble::Subspace;
use std::time::{Duration, Instant};
use verifier::{
    branch_constraints,
    timing::{self, TimeType},
    Assignment, Constraint, SharedModels, Status, Verifier, VerifierError, VerifierFactory,
};

use crate::config::TimeoutPolicy;

/// What a verification task produced.
#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    /// The leaf-set was decided. `model` is set for SAT.
    Resolved {
        status: Status,
        model: Option<Assignment>,
        check_time: Duration,
    },
    /// The budget ran out. Every leaf carries a best split suggestion if it
    /// has a split with positive score.
    Timeout {
        leaves: Vec<Subspace>,
        check_time: Duration,
    },
}

/// Check the leaf-set `leaves` against all trees of `models` within
/// `timeout` seconds.
pub fn verify_fun<F: VerifierFactory>(
    models: &SharedModels,
    mut leaves: Vec<Subspace>,
    timeout: f64,
    factory: &F,
) -> Result<VerifyOutcome, VerifierError> {
    let start = Instant::now();
    let mut verifier = factory.create(models, &leaves)?;
    match TimeoutPolicy::duration(timeout) {
        Some(deadline) => verifier.set_timeout(deadline),
        None => log::debug!("budget of {timeout}s is unbounded, checking without deadline"),
    }
    verifier.add_all_trees()?;

    let unknown_after = match verifier.check(None) {
        Ok(status @ (Status::Sat | Status::Unsat)) => {
            timing::elapsed(TimeType::Check(status), start);
            let model = if status.is_sat() { verifier.model() } else { None };
            return Ok(VerifyOutcome::Resolved {
                status,
                model,
                check_time: start.elapsed(),
            });
        }
        Ok(Status::Unknown) => {
            timing::elapsed(TimeType::Check(Status::Unknown), start);
            start.elapsed()
        }
        Err(VerifierError::Timeout { unknown_after }) => {
            timing::elapsed(TimeType::Timeout, start);
            unknown_after
        }
        Err(e) => return Err(e),
    };
    log::debug!("unknown after {unknown_after:.2?} (timeout = {timeout}s), suggesting splits");

    for (leaf, at) in leaves.iter_mut().zip(models.iter()) {
        if leaf.get_best_split().is_none() {
            leaf.find_best_domtree_split(at);
        }
    }
    Ok(VerifyOutcome::Timeout {
        leaves,
        check_time: start.elapsed(),
    })
}

/// Find the nodes of tree `tree_index` of model `instance` that no input in
/// the leaf-set reaches, and return that model's leaf with those nodes marked
/// unreachable.
///
/// Walks the tree depth first, checking each child the leaf still considers
/// reachable under the conjunction of the branch constraints leading to it.
pub fn check_tree_paths<F: VerifierFactory>(
    models: &SharedModels,
    instance: usize,
    tree_index: usize,
    leaves: &[Subspace],
    factory: &F,
) -> Result<Subspace, VerifierError> {
    let (Some(at), Some(leaf)) = (models.get(instance), leaves.get(instance)) else {
        return Err(VerifierError::Arity {
            models: models.len(),
            leaves: leaves.len(),
        });
    };
    let Some(tree) = at.iter().nth(tree_index) else {
        return Err(VerifierError::Failed(format!(
            "model {instance} has no tree {tree_index}"
        )));
    };
    let mut leaf = leaf.clone();
    let mut verifier = factory.create(models, leaves)?;

    let mut num_unreachable = 0;
    let mut stack = vec![(tree.root(), Constraint::True)];
    while let Some((node, path)) = stack.pop() {
        let (Some(split), Some(left), Some(right)) =
            (tree.get_split(node), tree.left(node), tree.right(node))
        else {
            continue;
        };
        let (cl, cr) = branch_constraints(split, verifier.xvar(split.feat_id()));
        for (child, branch) in [(right, cr), (left, cl)] {
            if !leaf.is_reachable(tree_index, child) {
                continue;
            }
            let constraint = path.clone() & branch;
            let start = Instant::now();
            match verifier.check(Some(&constraint))? {
                Status::Unsat => {
                    timing::elapsed(TimeType::PathCheck { reachable: false }, start);
                    leaf.mark_unreachable(tree_index, child);
                    num_unreachable += 1;
                }
                // undecided paths stay reachable
                status => {
                    timing::elapsed(TimeType::PathCheck { reachable: true }, start);
                    if status == Status::Unknown {
                        log::debug!("path to node {child} of tree {tree_index} undecided");
                    }
                    stack.push((child, constraint));
                }
            }
        }
    }
    log::debug!("model {instance}, tree {tree_index}: {num_unreachable} unreachable subtrees");
    Ok(leaf)
}
