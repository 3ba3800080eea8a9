// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

use ensemble::DomainError;
use thiserror::Error;
use verifier::VerifierError;

use crate::{executor::TaskError, record::TaskId};

/// Errors that abort a distributed run.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// The configuration is inconsistent
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Nothing to verify
    #[error("no models to verify")]
    NoInstances,
    /// The requested number of initial tasks cannot be reached
    #[error("no further splits possible: requested {requested} initial tasks, reached {reached}")]
    NoMoreSplits {
        /// Number of leaf-sets asked for
        requested: usize,
        /// Number of leaf-sets produced before running out of splits
        reached: usize,
    },
    /// A verification task failed with something other than a timeout
    #[error("task {task_id} failed: {source}")]
    Worker {
        /// The failed task
        task_id: TaskId,
        /// The verifier's error
        source: VerifierError,
    },
    /// A reachability check failed
    #[error("path check of model {instance}, tree {tree_index} failed: {source}")]
    Pruning {
        /// Model index
        instance: usize,
        /// Tree index within the model
        tree_index: usize,
        /// The verifier's error
        source: VerifierError,
    },
    /// A task ended without producing a value
    #[error("task {task_id}: {source}")]
    Task {
        /// The verification task
        task_id: TaskId,
        /// Why there is no value
        source: TaskError,
    },
    /// Domain tree access failed
    #[error(transparent)]
    Domain(#[from] DomainError),
}
