// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Distributed branch-and-bound verification of tree ensembles.
//!
//! A [`DistributedVerifier`] splits the input space into leaf-sets, runs a
//! verifier on each of them in parallel, and splits further whenever a check
//! runs out of time, retrying with a larger budget.

// configure clippy
#![allow(clippy::needless_return)]
#![allow(clippy::type_complexity)]
#![deny(clippy::uninlined_format_args)]
// documentation-related lints (only checked when running rustdoc)
#![allow(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod record;
pub mod worker;

pub use config::{DistributedConfig, TimeoutPolicy};
pub use driver::{CheckReport, DistributedVerifier, Instance};
pub use error::DistributedError;
pub use executor::{
    BasicCanceler, CancelToken, Client, Executor, SequentialExecutor, TaskError, TaskFuture,
    ThreadPool,
};
pub use record::{RecordStatus, ResultRecord, Results, SplitInfo, TaskId};
pub use worker::{check_tree_paths, verify_fun, VerifyOutcome};
