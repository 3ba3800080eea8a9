// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Interface to the per-branch verifier, a constraint language over the
//! input features, and a box-based verifier for output properties.

// configure clippy
#![allow(clippy::needless_return)]
#![allow(clippy::type_complexity)]
#![deny(clippy::uninlined_format_args)]
// documentation-related lints (only checked when running rustdoc)
#![warn(missing_docs)]
#![allow(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod basics;
pub mod constraint;
pub mod interval;
pub mod timing;

pub use basics::{Assignment, SharedModels, Status, Verifier, VerifierError, VerifierFactory};
pub use constraint::{branch_constraints, Constraint, Var};
