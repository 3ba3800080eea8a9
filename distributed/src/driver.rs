// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! The scheduler: splits the input space of one or more models into
//! leaf-sets, dispatches a verification task per leaf-set, and on every
//! timeout splits the leaf-set further and retries both halves with a larger
//! budget.
//!
//! The driver runs on a single thread and is the only writer of the domain
//! trees and the result records. Workers get read-only copies and return
//! their results through [`TaskFuture`]s.

use ensemble::{AddTree, DomTree, DomainError, Domains, Subspace};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Instant};
use verifier::{SharedModels, Status, VerifierError, VerifierFactory};

use crate::{
    config::{DistributedConfig, TimeoutPolicy},
    error::DistributedError,
    executor::{BasicCanceler, CancelToken, Client, TaskError, TaskFuture},
    record::{RecordStatus, ResultRecord, Results, SplitInfo, TaskId},
    worker::{self, VerifyOutcome},
};

type TaskResult = Result<VerifyOutcome, VerifierError>;

/// A model to verify and the part of its input space to verify it on.
#[derive(Debug, Clone)]
pub struct Instance {
    pub model: AddTree,
    pub domains: Domains,
}

impl Instance {
    pub fn new(model: AddTree, domains: Domains) -> Self {
        Instance { model, domains }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    /// SAT if any task was SAT, UNSAT if every branch was UNSAT, UNKNOWN
    /// otherwise
    pub status: Status,
    pub num_initial_tasks: usize,
    pub num_tasks: usize,
    pub num_splits: usize,
    /// Tasks resolved to SAT or UNSAT
    pub done_count: usize,
    /// Timed-out tasks that could not be split any further
    pub unresolved_count: usize,
    /// Tasks abandoned after the stop flag was raised
    pub cancelled_count: usize,
    /// Iterations of the dispatch loop
    pub iterations: usize,
    pub stopped_early: bool,
    /// Seconds spent in the whole run
    pub elapsed: f64,
    /// Seconds spent in the reachability pass, if it ran
    pub check_paths_time: Option<f64>,
    pub results: Results,
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "status: {}", self.status)?;
        writeln!(
            f,
            "tasks: {} ({} initial, {} splits, {} done, {} unresolved, {} cancelled)",
            self.num_tasks,
            self.num_initial_tasks,
            self.num_splits,
            self.done_count,
            self.unresolved_count,
            self.cancelled_count
        )?;
        if let Some(t) = self.check_paths_time {
            writeln!(f, "path checks: {t:.2}s")?;
        }
        write!(f, "elapsed: {:.2}s", self.elapsed)
    }
}

/// State of one [`DistributedVerifier::check`] run.
struct RunContext {
    start: Instant,
    policy: TimeoutPolicy,
    stop: CancelToken,
    outstanding: Vec<(TaskId, TaskFuture<TaskResult>)>,
    next_task_id: TaskId,
    num_initial_tasks: usize,
    done_count: usize,
    unresolved_count: usize,
    num_splits: usize,
    iterations: usize,
    check_paths_time: Option<f64>,
    results: Results,
}

impl RunContext {
    fn new(policy: TimeoutPolicy) -> Self {
        RunContext {
            start: Instant::now(),
            policy,
            stop: CancelToken::new(),
            outstanding: vec![],
            next_task_id: 0,
            num_initial_tasks: 0,
            done_count: 0,
            unresolved_count: 0,
            num_splits: 0,
            iterations: 0,
            check_paths_time: None,
            results: Results::new(),
        }
    }

    fn progress(&self, msg: impl fmt::Display) {
        let secs = self.start.elapsed().as_secs();
        log::info!(
            "[{:>3}m{:02}s {:>4} {:<4}] {msg}",
            secs / 60,
            secs % 60,
            self.done_count,
            self.outstanding.len()
        );
    }

    fn set_status(&mut self, task_id: TaskId, status: RecordStatus) {
        if let Some(record) = self.results.get_mut(task_id) {
            record.status = status;
        }
    }
}

/// Pick the candidate with the strictly greatest positive score; the first
/// one wins ties.
pub(crate) fn select_split<K>(candidates: impl IntoIterator<Item = (K, f64)>) -> Option<K> {
    let mut best = None;
    let mut best_score = 0.0;
    for (key, score) in candidates {
        if score > best_score {
            best_score = score;
            best = Some(key);
        }
    }
    best
}

/// Verifies models jointly by dispatching leaf-sets to a [`Client`].
pub struct DistributedVerifier<F: VerifierFactory> {
    client: Client,
    config: DistributedConfig,
    models: SharedModels,
    root_domains: Vec<Domains>,
    domtrees: Vec<DomTree>,
    factory: Arc<F>,
}

impl<F: VerifierFactory> DistributedVerifier<F> {
    /// Set up a verifier for `instances`. The models are handed to the
    /// workers once, here.
    pub fn new(
        client: Client,
        instances: Vec<Instance>,
        factory: F,
        config: DistributedConfig,
    ) -> Result<Self, DistributedError> {
        config.validate()?;
        if instances.is_empty() {
            return Err(DistributedError::NoInstances);
        }
        let (models, root_domains): (Vec<AddTree>, Vec<Domains>) =
            instances.into_iter().map(|i| (i.model, i.domains)).unzip();
        let domtrees = models
            .iter()
            .zip(&root_domains)
            .map(|(at, d)| DomTree::new(at, d.clone()))
            .collect();
        let models: SharedModels = client.scatter(models);
        Ok(DistributedVerifier {
            client,
            config,
            models,
            root_domains,
            domtrees,
            factory: Arc::new(factory),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &DistributedConfig {
        &self.config
    }

    pub fn models(&self) -> &SharedModels {
        &self.models
    }

    /// The domain tree of an instance, as grown by the last run.
    pub fn domtree(&self, instance: usize) -> Option<&DomTree> {
        self.domtrees.get(instance)
    }

    /// Run the verification to completion, or until the first SAT result if
    /// `stop_when_sat` is set. Each call starts over from fresh domain trees.
    pub fn check(&mut self) -> Result<CheckReport, DistributedError> {
        self.domtrees = self
            .models
            .iter()
            .zip(&self.root_domains)
            .map(|(at, d)| DomTree::new(at, d.clone()))
            .collect();
        let mut ctx = RunContext::new(self.config.timeout_policy());
        if let Err(e) = self.run(&mut ctx) {
            self.cancel_outstanding(&mut ctx);
            return Err(e);
        }
        Ok(self.report(ctx))
    }

    fn run(&mut self, ctx: &mut RunContext) -> Result<(), DistributedError> {
        if self.config.check_paths {
            self.check_paths(ctx)?;
        }

        let roots = self.root_leafset()?;
        let ntasks = self.config.initial_tasks(self.client.num_workers());
        let leafsets = self.generate_splits(ctx, roots, ntasks)?;
        ctx.num_initial_tasks = leafsets.len();
        let timeout = ctx.policy.start();
        for leaves in leafsets {
            self.submit(ctx, leaves, timeout, None);
        }
        ctx.progress(format_args!("dispatched {} initial tasks", ctx.num_initial_tasks));

        while !ctx.outstanding.is_empty() {
            self.client
                .wait_first(ctx.outstanding.iter().map(|(_, future)| future));
            ctx.iterations += 1;

            let mut pending = std::mem::take(&mut ctx.outstanding).into_iter();
            while let Some((task_id, future)) = pending.next() {
                if !future.done() || ctx.stop.is_canceled() {
                    ctx.outstanding.push((task_id, future));
                    continue;
                }
                if let Err(e) = self.handle_done(ctx, task_id, future) {
                    ctx.outstanding.extend(pending);
                    return Err(e);
                }
            }

            if ctx.stop.is_canceled() {
                ctx.progress("stop flag raised, cancelling outstanding tasks");
                self.cancel_outstanding(ctx);
                break;
            }
            debug_assert_eq!(
                ctx.results.count(RecordStatus::Pending),
                ctx.outstanding.len()
            );
        }
        Ok(())
    }

    fn root_leafset(&self) -> Result<Vec<Subspace>, DomainError> {
        self.domtrees
            .iter()
            .map(|dt| dt.get_subspace(dt.root()).cloned())
            .collect()
    }

    /// Mark tree nodes that cannot be reached in the root leaf-set. One task
    /// per tree of every model; the results are merged into the roots.
    fn check_paths(&mut self, ctx: &mut RunContext) -> Result<(), DistributedError> {
        let start = Instant::now();
        let roots = self.root_leafset()?;
        let mut futures = vec![];
        for (instance, at) in self.models.iter().enumerate() {
            for tree_index in 0..at.len() {
                let models = self.models.clone();
                let factory = self.factory.clone();
                let leaves = roots.clone();
                let future = self.client.submit(&ctx.stop, move || {
                    worker::check_tree_paths(&models, instance, tree_index, &leaves, &*factory)
                });
                futures.push((instance, tree_index, future));
            }
        }
        self.client.wait_all(futures.iter().map(|(_, _, future)| future));

        let mut pruned: Vec<Vec<Subspace>> = vec![vec![]; self.models.len()];
        for (instance, tree_index, future) in futures {
            let leaf = future
                .take_result()
                .unwrap_or_else(|e| Err(VerifierError::Failed(e.to_string())))
                .map_err(|source| DistributedError::Pruning {
                    instance,
                    tree_index,
                    source,
                })?;
            pruned[instance].push(leaf);
        }
        for (dt, leaves) in self.domtrees.iter_mut().zip(pruned) {
            if !leaves.is_empty() {
                dt.update_leaf(Subspace::merge(leaves)?)?;
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        ctx.check_paths_time = Some(elapsed);
        let num_unreachable: usize = self
            .root_leafset()?
            .iter()
            .zip(self.models.iter())
            .map(|(leaf, at)| leaf.num_unreachable(at))
            .sum();
        ctx.progress(format_args!(
            "path checks done in {elapsed:.2}s, {num_unreachable} unreachable nodes"
        ));
        Ok(())
    }

    /// Split the root leaf-set until there are `ntasks` leaf-sets.
    fn generate_splits(
        &mut self,
        ctx: &mut RunContext,
        roots: Vec<Subspace>,
        ntasks: usize,
    ) -> Result<Vec<Vec<Subspace>>, DistributedError> {
        let mut leafsets = vec![roots];
        while leafsets.len() < ntasks {
            for leaves in leafsets.iter_mut() {
                self.suggest_splits(leaves);
            }
            let candidates = leafsets.iter().enumerate().flat_map(|(s, leaves)| {
                leaves
                    .iter()
                    .enumerate()
                    .map(move |(i, leaf)| ((s, i), leaf.split_score()))
            });
            let Some((s, i)) = select_split(candidates) else {
                return Err(DistributedError::NoMoreSplits {
                    requested: ntasks,
                    reached: leafsets.len(),
                });
            };
            let leaves = leafsets.remove(s);
            let (left, right, info) = self.split_leafset(ctx, &leaves, i)?;
            log::debug!(
                "initial split of model {} at node {}: x{} < {}",
                info.instance,
                info.domtree_node_id,
                info.feat_id,
                info.split_value
            );
            leafsets.push(left);
            leafsets.push(right);
        }
        Ok(leafsets)
    }

    fn suggest_splits(&self, leaves: &mut [Subspace]) {
        for (leaf, at) in leaves.iter_mut().zip(self.models.iter()) {
            if leaf.get_best_split().is_none() {
                leaf.find_best_domtree_split(at);
            }
        }
    }

    /// Split leaf `i` of `leaves`, returning the two leaf-sets that replace
    /// it.
    fn split_leafset(
        &mut self,
        ctx: &mut RunContext,
        leaves: &[Subspace],
        i: usize,
    ) -> Result<(Vec<Subspace>, Vec<Subspace>, SplitInfo), DistributedError> {
        let node = leaves[i].domtree_node_id();
        let (l, r) = self.domtrees[i].split_leaf(&leaves[i], &self.models[i])?;
        let split = self.domtrees[i]
            .get_split(node)
            .ok_or(DomainError::NoSplit(node))?;
        ctx.num_splits += 1;

        let mut left = leaves.to_vec();
        left[i] = l;
        let mut right = leaves.to_vec();
        right[i] = r;
        let info = SplitInfo {
            instance: i,
            domtree_node_id: node,
            feat_id: split.feat_id,
            split_value: split.split_value,
            score: split.score,
            balance: split.balance,
        };
        Ok((left, right, info))
    }

    fn submit(
        &self,
        ctx: &mut RunContext,
        leaves: Vec<Subspace>,
        timeout: f64,
        prev_split_id: Option<TaskId>,
    ) -> TaskId {
        let task_id = ctx.next_task_id;
        ctx.next_task_id += 1;
        ctx.results.insert(ResultRecord::new(
            task_id,
            &leaves,
            &self.models,
            timeout,
            prev_split_id,
        ));

        let models = self.models.clone();
        let factory = self.factory.clone();
        let future = self.client.submit(&ctx.stop, move || {
            worker::verify_fun(&models, leaves, timeout, &*factory)
        });
        ctx.outstanding.push((task_id, future));
        log::debug!("submitted task {task_id} with timeout {timeout}s");
        task_id
    }

    fn handle_done(
        &mut self,
        ctx: &mut RunContext,
        task_id: TaskId,
        future: TaskFuture<TaskResult>,
    ) -> Result<(), DistributedError> {
        let outcome = match future.take_result() {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(source)) => return Err(DistributedError::Worker { task_id, source }),
            Err(TaskError::Cancelled) => {
                log::warn!("task {task_id} was cancelled, discarding it");
                ctx.set_status(task_id, RecordStatus::Cancelled);
                return Ok(());
            }
            Err(source) => return Err(DistributedError::Task { task_id, source }),
        };

        match outcome {
            VerifyOutcome::Resolved {
                status,
                model,
                check_time,
            } => {
                ctx.done_count += 1;
                if let Some(record) = ctx.results.get_mut(task_id) {
                    record.status = status.into();
                    record.check_time = Some(check_time.as_secs_f64());
                    record.model = model;
                }
                ctx.progress(format_args!(
                    "{status} for task {task_id} in {:.2}s",
                    check_time.as_secs_f64()
                ));
                if status.is_sat() && self.config.stop_when_sat {
                    ctx.stop.cancel();
                }
            }
            VerifyOutcome::Timeout { leaves, check_time } => {
                self.handle_timeout(ctx, task_id, leaves, check_time.as_secs_f64())?
            }
        }
        Ok(())
    }

    fn handle_timeout(
        &mut self,
        ctx: &mut RunContext,
        task_id: TaskId,
        mut leaves: Vec<Subspace>,
        check_time: f64,
    ) -> Result<(), DistributedError> {
        let timeout = ctx
            .results
            .get(task_id)
            .map_or(ctx.policy.start(), |r| r.timeout);
        if let Some(record) = ctx.results.get_mut(task_id) {
            record.status = RecordStatus::Unknown;
            record.check_time = Some(check_time);
        }

        // the worker's suggestions stand; score whatever it left out
        self.suggest_splits(&mut leaves);
        let candidates = leaves.iter().enumerate().map(|(i, l)| (i, l.split_score()));
        let Some(i) = select_split(candidates) else {
            ctx.unresolved_count += 1;
            ctx.progress(format_args!(
                "UNKNOWN for task {task_id} after {timeout}s, no split left, giving up on it"
            ));
            return Ok(());
        };

        let (left, right, info) = self.split_leafset(ctx, &leaves, i)?;
        let next_timeout = ctx.policy.next(timeout);
        let l = self.submit(ctx, left, next_timeout, Some(task_id));
        let r = self.submit(ctx, right, next_timeout, Some(task_id));
        ctx.progress(format_args!(
            "TIMEOUT for task {task_id} after {timeout}s, split model {} at x{} < {} \
             (score {}, balance {:.2}) into {l}, {r} with timeout {next_timeout:.1}s",
            info.instance, info.feat_id, info.split_value, info.score, info.balance
        ));
        if let Some(record) = ctx.results.get_mut(task_id) {
            record.split = Some(info);
            record.next_split_ids = Some((l, r));
        }
        Ok(())
    }

    /// Cancel every outstanding future, once, and abandon its task.
    fn cancel_outstanding(&self, ctx: &mut RunContext) {
        for (task_id, future) in std::mem::take(&mut ctx.outstanding) {
            self.client.cancel(&future);
            if ctx.results.get(task_id).map(|r| r.status) == Some(RecordStatus::Pending) {
                ctx.set_status(task_id, RecordStatus::Cancelled);
            }
        }
    }

    fn report(&self, ctx: RunContext) -> CheckReport {
        let results = ctx.results;
        let status = if results.count(RecordStatus::Sat) > 0 {
            Status::Sat
        } else if results
            .iter()
            .filter(|r| r.is_terminal())
            .all(|r| r.status == RecordStatus::Unsat)
        {
            Status::Unsat
        } else {
            Status::Unknown
        };
        CheckReport {
            status,
            num_initial_tasks: ctx.num_initial_tasks,
            num_tasks: results.len(),
            num_splits: ctx.num_splits,
            done_count: ctx.done_count,
            unresolved_count: ctx.unresolved_count,
            cancelled_count: results.count(RecordStatus::Cancelled),
            iterations: ctx.iterations,
            stopped_early: ctx.stop.is_canceled(),
            elapsed: ctx.start.elapsed().as_secs_f64(),
            check_paths_time: ctx.check_paths_time,
            results,
        }
    }
}
