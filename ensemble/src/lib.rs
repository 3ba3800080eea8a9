// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Additive tree ensembles and the domain partition tree over their input
//! space.

// configure clippy
#![allow(clippy::needless_return)]
#![allow(clippy::type_complexity)]
#![deny(clippy::uninlined_format_args)]
// documentation-related lints (only checked when running rustdoc)
#![warn(missing_docs)]
#![allow(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod domain;
pub mod domtree;
pub mod tree;

pub use domain::{Domains, RealDomain, WhereFlag};
pub use domtree::{BestSplit, DomNodeId, DomTree, DomainError, Subspace};
pub use tree::{AddTree, FeatId, ModelError, NodeId, Split, Tree};
