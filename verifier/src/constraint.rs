// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Constraints over input features.

use ensemble::{tree::BOOL_SPLIT_VALUE, Domains, FeatId, RealDomain, Split};
use itertools::Itertools;
use serde::Serialize;
use std::{fmt, ops};

/// Handle to the symbolic variable of one input feature.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Var(pub FeatId);

impl Var {
    /// The feature this variable stands for.
    pub fn id(&self) -> FeatId {
        self.0
    }

    /// `x < value`
    pub fn lt(&self, value: f64) -> Constraint {
        Constraint::Lt(self.0, value)
    }

    /// `x >= value`
    pub fn ge(&self, value: f64) -> Constraint {
        Constraint::Ge(self.0, value)
    }

    /// `x` as a boolean feature
    pub fn is_true(&self) -> Constraint {
        Constraint::Bool(self.0)
    }
}

/// A formula over feature variables.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Constraint {
    True,
    False,
    Lt(FeatId, f64),
    Ge(FeatId, f64),
    Bool(FeatId),
    Not(Box<Constraint>),
    And(Vec<Constraint>),
    Or(Vec<Constraint>),
}

/// The constraints under which the test of `split` goes left and right,
/// respectively.
pub fn branch_constraints(split: &Split, var: Var) -> (Constraint, Constraint) {
    match split {
        Split::Lt { split_value, .. } => (var.lt(*split_value), var.ge(*split_value)),
        Split::Bool { .. } => (!var.is_true(), var.is_true()),
    }
}

impl Constraint {
    /// Push negations down to the atoms and drop them.
    pub fn nnf(&self) -> Constraint {
        self.nnf_polarity(true)
    }

    fn nnf_polarity(&self, positive: bool) -> Constraint {
        use Constraint::*;
        match (self, positive) {
            (True, true) | (False, false) => True,
            (True, false) | (False, true) => False,
            (Lt(f, v), true) | (Ge(f, v), false) => Lt(*f, *v),
            (Ge(f, v), true) | (Lt(f, v), false) => Ge(*f, *v),
            (Bool(f), true) => Ge(*f, BOOL_SPLIT_VALUE),
            (Bool(f), false) => Lt(*f, BOOL_SPLIT_VALUE),
            (Not(c), p) => c.nnf_polarity(!p),
            (And(cs), true) | (Or(cs), false) => And(cs.iter().map(|c| c.nnf_polarity(positive)).collect()),
            (Or(cs), true) | (And(cs), false) => Or(cs.iter().map(|c| c.nnf_polarity(positive)).collect()),
        }
    }

    /// Sub-boxes of `domains` whose union is exactly the set of points that
    /// satisfy the constraint. The boxes of a disjunction may overlap.
    pub fn boxes(&self, domains: &Domains) -> Vec<Domains> {
        self.nnf().boxes_nnf(domains)
    }

    fn boxes_nnf(&self, domains: &Domains) -> Vec<Domains> {
        use Constraint::*;
        match self {
            True => vec![domains.clone()],
            False => vec![],
            Lt(f, v) => domains
                .refine(*f, &RealDomain::new(f64::NEG_INFINITY, *v))
                .into_iter()
                .collect(),
            Ge(f, v) => domains
                .refine(*f, &RealDomain::new(*v, f64::INFINITY))
                .into_iter()
                .collect(),
            Bool(f) => Ge(*f, BOOL_SPLIT_VALUE).boxes_nnf(domains),
            Not(c) => c.nnf_polarity(false).boxes_nnf(domains),
            And(cs) => cs.iter().fold(vec![domains.clone()], |boxes, c| {
                boxes.iter().flat_map(|b| c.boxes_nnf(b)).collect()
            }),
            Or(cs) => cs.iter().flat_map(|c| c.boxes_nnf(domains)).collect(),
        }
    }

    /// Whether some point in `domains` satisfies the constraint.
    pub fn is_satisfiable(&self, domains: &Domains) -> bool {
        !self.boxes(domains).is_empty()
    }
}

impl ops::BitAnd for Constraint {
    type Output = Constraint;

    fn bitand(self, rhs: Constraint) -> Constraint {
        match (self, rhs) {
            (Constraint::True, c) | (c, Constraint::True) => c,
            (Constraint::And(mut cs), Constraint::And(ds)) => {
                cs.extend(ds);
                Constraint::And(cs)
            }
            (Constraint::And(mut cs), c) => {
                cs.push(c);
                Constraint::And(cs)
            }
            (c, d) => Constraint::And(vec![c, d]),
        }
    }
}

impl ops::BitOr for Constraint {
    type Output = Constraint;

    fn bitor(self, rhs: Constraint) -> Constraint {
        match (self, rhs) {
            (Constraint::False, c) | (c, Constraint::False) => c,
            (c, d) => Constraint::Or(vec![c, d]),
        }
    }
}

impl ops::Not for Constraint {
    type Output = Constraint;

    fn not(self) -> Constraint {
        match self {
            Constraint::Not(c) => *c,
            c => Constraint::Not(Box::new(c)),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::True => write!(f, "true"),
            Constraint::False => write!(f, "false"),
            Constraint::Lt(i, v) => write!(f, "x{i} < {v}"),
            Constraint::Ge(i, v) => write!(f, "x{i} >= {v}"),
            Constraint::Bool(i) => write!(f, "x{i}"),
            Constraint::Not(c) => write!(f, "!({c})"),
            Constraint::And(cs) => write!(f, "({})", cs.iter().join(" & ")),
            Constraint::Or(cs) => write!(f, "({})", cs.iter().join(" | ")),
        }
    }
}
