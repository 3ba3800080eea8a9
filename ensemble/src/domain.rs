// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Half-open real intervals and boxes of them over the feature space.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::tree::FeatId;

/// Where a value lies with respect to a [`RealDomain`].
///
/// ```text
///            lo                  hi
///            [--- real domain ---)
///  ---x1--------------x2-----------------x3-----> (real axis)
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WhereFlag {
    /// `x1`: smaller than any value in the domain
    Left,
    /// `x2`: in the domain
    InDomain,
    /// `x3`: larger than any value in the domain (this includes `hi` itself)
    Right,
}

/// The half-open interval `[lo, hi)`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealDomain {
    /// Inclusive lower bound
    pub lo: f64,
    /// Exclusive upper bound
    pub hi: f64,
}

impl Default for RealDomain {
    fn default() -> Self {
        Self::everything()
    }
}

impl RealDomain {
    /// Create the interval `[lo, hi)`.
    pub fn new(lo: f64, hi: f64) -> Self {
        RealDomain { lo, hi }
    }

    /// The whole real axis.
    pub fn everything() -> Self {
        RealDomain {
            lo: f64::NEG_INFINITY,
            hi: f64::INFINITY,
        }
    }

    /// Whether this domain is the whole real axis.
    pub fn is_everything(&self) -> bool {
        self.lo == f64::NEG_INFINITY && self.hi == f64::INFINITY
    }

    /// Whether no value lies in this domain.
    pub fn is_empty(&self) -> bool {
        !(self.lo < self.hi)
    }

    /// Where `value` lies relative to the domain.
    pub fn where_is(&self, value: f64) -> WhereFlag {
        if value < self.lo {
            WhereFlag::Left
        } else if value >= self.hi {
            WhereFlag::Right
        } else {
            WhereFlag::InDomain
        }
    }

    /// Like [`RealDomain::where_is`], but `lo` itself counts as lying to the left.
    pub fn where_is_strict(&self, value: f64) -> WhereFlag {
        if value <= self.lo {
            WhereFlag::Left
        } else if value >= self.hi {
            WhereFlag::Right
        } else {
            WhereFlag::InDomain
        }
    }

    /// Whether `value` lies in the domain.
    pub fn contains(&self, value: f64) -> bool {
        self.where_is(value) == WhereFlag::InDomain
    }

    /// Whether `value` lies strictly between `lo` and `hi`, i.e. whether
    /// splitting at `value` leaves both sides non-empty.
    pub fn contains_strict(&self, value: f64) -> bool {
        self.where_is_strict(value) == WhereFlag::InDomain
    }

    /// Whether the two domains share a value.
    pub fn overlaps(&self, other: &RealDomain) -> bool {
        self.lo < other.hi && other.lo < self.hi
    }

    /// Whether every value of `other` lies in `self`.
    pub fn covers(&self, other: &RealDomain) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }

    /// Like [`RealDomain::covers`], but `other` must also differ from `self`.
    pub fn covers_strict(&self, other: &RealDomain) -> bool {
        self.covers(other) && self != other
    }

    /// The intersection of two domains, or `None` if they do not overlap.
    pub fn intersect(&self, other: &RealDomain) -> Option<RealDomain> {
        let d = RealDomain::new(self.lo.max(other.lo), self.hi.min(other.hi));
        if d.is_empty() {
            None
        } else {
            Some(d)
        }
    }

    /// Split into `[lo, value)` and `[value, hi)`.
    ///
    /// Both halves are only non-empty if [`RealDomain::contains_strict`] holds
    /// for `value`.
    pub fn split(&self, value: f64) -> (RealDomain, RealDomain) {
        (
            RealDomain::new(self.lo, value.min(self.hi)),
            RealDomain::new(value.max(self.lo), self.hi),
        )
    }

    /// The part of this domain where a `x < value` test goes left.
    pub fn restrict_lt(&self, value: f64) -> Option<RealDomain> {
        self.intersect(&RealDomain::new(f64::NEG_INFINITY, value))
    }

    /// The part of this domain where a `x < value` test goes right.
    pub fn restrict_ge(&self, value: f64) -> Option<RealDomain> {
        self.intersect(&RealDomain::new(value, f64::INFINITY))
    }

    /// Width of the domain; infinite for unbounded domains.
    pub fn width(&self) -> f64 {
        self.hi - self.lo
    }
}

impl fmt::Display for RealDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lo = if self.lo == f64::NEG_INFINITY {
            "-inf".to_string()
        } else {
            format!("{}", self.lo)
        };
        let hi = if self.hi == f64::INFINITY {
            "inf".to_string()
        } else {
            format!("{}", self.hi)
        };
        write!(f, "[{lo}, {hi})")
    }
}

/// A box in feature space: one [`RealDomain`] per feature.
///
/// Features beyond the stored length are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Domains(Vec<RealDomain>);

impl Domains {
    /// The unconstrained box.
    pub fn new() -> Self {
        Domains(vec![])
    }

    /// A box with the domain of feature `i` at index `i`.
    pub fn from_vec(domains: Vec<RealDomain>) -> Self {
        Domains(domains)
    }

    /// Number of explicitly stored feature domains.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no feature is constrained explicitly.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Domain of a feature; unconstrained if none is stored.
    pub fn get(&self, feat_id: FeatId) -> RealDomain {
        self.0.get(feat_id).copied().unwrap_or_default()
    }

    /// Replace the domain of a feature.
    pub fn set(&mut self, feat_id: FeatId, domain: RealDomain) {
        if feat_id >= self.0.len() {
            self.0.resize(feat_id + 1, RealDomain::everything());
        }
        self.0[feat_id] = domain;
    }

    /// Intersect the domain of one feature with `domain`, returning `None`
    /// when the box becomes empty.
    pub fn refine(&self, feat_id: FeatId, domain: &RealDomain) -> Option<Domains> {
        let d = self.get(feat_id).intersect(domain)?;
        let mut out = self.clone();
        out.set(feat_id, d);
        Some(out)
    }

    /// Intersect two boxes.
    pub fn intersect(&self, other: &Domains) -> Option<Domains> {
        let n = self.len().max(other.len());
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(self.get(i).intersect(&other.get(i))?);
        }
        Some(Domains(out))
    }

    /// Whether every feature domain of `self` covers that of `other`.
    pub fn covers(&self, other: &Domains) -> bool {
        let n = self.len().max(other.len());
        (0..n).all(|i| self.get(i).covers(&other.get(i)))
    }

    /// Whether the point lies in the box.
    pub fn contains(&self, point: &[f64]) -> bool {
        self.0
            .iter()
            .enumerate()
            .all(|(i, d)| point.get(i).map_or(d.is_everything(), |&v| d.contains(v)))
    }

    /// The stored domains with their feature ids.
    pub fn iter(&self) -> impl Iterator<Item = (FeatId, &RealDomain)> {
        self.0.iter().enumerate()
    }
}

impl fmt::Display for Domains {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .iter()
            .filter(|(_, d)| !d.is_everything())
            .map(|(i, d)| format!("x{i} in {d}"))
            .join(", ");
        if parts.is_empty() {
            write!(f, "everything")
        } else {
            write!(f, "{parts}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn where_is_half_open() {
        let d = RealDomain::new(1.0, 3.0);
        assert_eq!(d.where_is(0.5), WhereFlag::Left);
        assert_eq!(d.where_is(1.0), WhereFlag::InDomain);
        assert_eq!(d.where_is(3.0), WhereFlag::Right);
        assert_eq!(d.where_is_strict(1.0), WhereFlag::Left);
        assert!(d.contains_strict(2.0));
        assert!(!d.contains_strict(1.0));
    }

    #[test]
    fn split_and_intersect() {
        let d = RealDomain::new(0.0, 10.0);
        let (l, r) = d.split(4.0);
        assert_eq!(l, RealDomain::new(0.0, 4.0));
        assert_eq!(r, RealDomain::new(4.0, 10.0));
        assert!(!l.overlaps(&r));
        assert!(d.covers(&l) && d.covers_strict(&r));
        assert_eq!(l.intersect(&r), None);
        assert_eq!(
            d.intersect(&RealDomain::new(5.0, 20.0)),
            Some(RealDomain::new(5.0, 10.0))
        );
        assert_eq!(d.restrict_lt(0.0), None);
        assert_eq!(d.restrict_ge(0.0), Some(d));
    }

    #[test]
    fn domains_refine() {
        let b = Domains::new();
        assert_eq!(b.get(3), RealDomain::everything());
        let b = b.refine(2, &RealDomain::new(0.0, 1.0)).unwrap();
        assert_eq!(b.len(), 3);
        assert_eq!(b.get(2), RealDomain::new(0.0, 1.0));
        assert!(b.refine(2, &RealDomain::new(1.0, 2.0)).is_none());
        assert!(Domains::new().covers(&b));
        assert!(!b.covers(&Domains::new()));
        assert!(b.contains(&[7.0, -3.0, 0.5]));
        assert!(!b.contains(&[7.0, -3.0, 1.5]));
        insta::assert_snapshot!(b.to_string(), @"x2 in [0, 1)");
    }
}
