// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Traits defining the interface to a per-branch verifier.

use ensemble::{AddTree, DomainError, FeatId, NodeId, Subspace};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};
use thiserror::Error;

use crate::constraint::{Constraint, Var};

/// The models under joint verification, shared read-only between workers.
pub type SharedModels = Arc<[AddTree]>;

/// Outcome of a check.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// A satisfying assignment exists
    Sat,
    /// No assignment exists in the checked leaf-set
    Unsat,
    /// The verifier could not decide
    Unknown,
}

impl Status {
    /// Whether this is [`Status::Sat`].
    pub fn is_sat(&self) -> bool {
        *self == Status::Sat
    }

    /// Whether this is [`Status::Unsat`].
    pub fn is_unsat(&self) -> bool {
        *self == Status::Unsat
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Sat => "SAT",
            Status::Unsat => "UNSAT",
            Status::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Errors raised by a verifier.
///
/// [`VerifierError::Timeout`] is the expected way for a check to run out of
/// budget; every other variant is a genuine failure.
#[derive(Error, Debug)]
pub enum VerifierError {
    /// The time budget ran out in the middle of the search
    #[error("unknown after {unknown_after:.2?}")]
    Timeout {
        /// Time spent before giving up
        unknown_after: Duration,
    },
    /// The leaf-set does not match the models
    #[error("expected one leaf per model ({models} models, {leaves} leaves)")]
    Arity {
        /// Number of models
        models: usize,
        /// Number of leaves
        leaves: usize,
    },
    /// The property refers to something that does not exist
    #[error("invalid property: {0}")]
    Property(String),
    /// Domain tree access failed
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// Anything else
    #[error("verifier failed: {0}")]
    Failed(String),
}

impl VerifierError {
    /// Whether this is the non-fatal [`VerifierError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, VerifierError::Timeout { .. })
    }
}

/// A satisfying assignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Value of every feature that occurs in the models
    pub features: BTreeMap<FeatId, f64>,
    /// Ensemble output of each model at this point
    pub outputs: Vec<f64>,
    /// For each model, the leaf reached in each of its trees
    pub family: Vec<Vec<NodeId>>,
}

impl Assignment {
    /// Build the assignment for `point`, evaluating every model on it.
    pub fn evaluate(models: &[AddTree], point: BTreeMap<FeatId, f64>) -> Self {
        let n = point.keys().next_back().map_or(0, |f| f + 1);
        let mut example = vec![0.0; n];
        for (&f, &v) in &point {
            example[f] = v;
        }
        Assignment {
            outputs: models.iter().map(|at| at.predict_single(&example)).collect(),
            family: models
                .iter()
                .map(|at| at.iter().map(|t| t.eval_leaf(&example)).collect())
                .collect(),
            features: point,
        }
    }
}

/// A verifier for one leaf-set, built fresh for every check.
pub trait Verifier: Send {
    /// Budget for subsequent checks.
    fn set_timeout(&mut self, timeout: Duration);

    /// Encode every tree of every model, so that [`Verifier::check`] decides
    /// the property rather than just the domain.
    fn add_all_trees(&mut self) -> Result<(), VerifierError>;

    /// Check satisfiability, optionally conjoined with `extra`.
    ///
    /// Returns [`VerifierError::Timeout`] when the budget runs out.
    fn check(&mut self, extra: Option<&Constraint>) -> Result<Status, VerifierError>;

    /// The assignment found by the last SAT check.
    fn model(&self) -> Option<Assignment>;

    /// Symbolic variable of a feature.
    fn xvar(&self, feat_id: FeatId) -> Var {
        Var(feat_id)
    }

    /// Time spent in the last check.
    fn check_time(&self) -> Duration;
}

/// Builds a [`Verifier`] for the given models and leaf-set (one leaf per model).
pub trait VerifierFactory: Send + Sync + 'static {
    /// The verifier type built by this factory
    type Verifier: Verifier;

    /// Construct a verifier.
    fn create(&self, models: &SharedModels, leaves: &[Subspace]) -> Result<Self::Verifier, VerifierError>;
}

impl<F, V> VerifierFactory for F
where
    F: Fn(&SharedModels, &[Subspace]) -> Result<V, VerifierError> + Send + Sync + 'static,
    V: Verifier,
{
    type Verifier = V;

    fn create(&self, models: &SharedModels, leaves: &[Subspace]) -> Result<V, VerifierError> {
        self(models, leaves)
    }
}
