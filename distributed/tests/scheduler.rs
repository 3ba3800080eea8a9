// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Scheduler runs against scripted verifiers.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use distributed::{
    Client, DistributedConfig, DistributedError, DistributedVerifier, Instance, RecordStatus,
    SequentialExecutor, ThreadPool,
};
use ensemble::{AddTree, DomNodeId, Domains, RealDomain, Split, Subspace, Tree};
use verifier::{
    interval::{IntervalVerifierFactory, OutputProperty},
    Assignment, Constraint, SharedModels, Status, Verifier, VerifierError, VerifierFactory,
};

type Script = dyn Fn(&[Subspace], f64) -> Result<Status, VerifierError> + Send + Sync;

/// One call of a scripted verifier: the leaf-set and its budget.
#[derive(Debug, Clone, PartialEq)]
struct Attempt {
    leaves: Vec<DomNodeId>,
    timeout: f64,
}

#[derive(Clone)]
struct ScriptedFactory {
    script: Arc<Script>,
    attempts: Arc<Mutex<Vec<Attempt>>>,
}

impl ScriptedFactory {
    fn new(script: impl Fn(&[Subspace], f64) -> Result<Status, VerifierError> + Send + Sync + 'static) -> Self {
        ScriptedFactory {
            script: Arc::new(script),
            attempts: Arc::new(Mutex::new(vec![])),
        }
    }

    fn always(status: Status) -> Self {
        Self::new(move |_, _| Ok(status))
    }

    fn always_timeout() -> Self {
        Self::new(|_, timeout| {
            Err(VerifierError::Timeout {
                unknown_after: Duration::from_secs_f64(timeout),
            })
        })
    }

    fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }
}

struct Scripted {
    leaves: Vec<Subspace>,
    timeout: f64,
    script: Arc<Script>,
    attempts: Arc<Mutex<Vec<Attempt>>>,
    last: Option<Status>,
}

impl Verifier for Scripted {
    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout.as_secs_f64();
    }

    fn add_all_trees(&mut self) -> Result<(), VerifierError> {
        Ok(())
    }

    fn check(&mut self, extra: Option<&Constraint>) -> Result<Status, VerifierError> {
        if extra.is_some() {
            // path checks: every path is feasible
            return Ok(Status::Sat);
        }
        self.attempts.lock().unwrap().push(Attempt {
            leaves: self.leaves.iter().map(|l| l.domtree_node_id()).collect(),
            timeout: self.timeout,
        });
        let status = (self.script)(&self.leaves, self.timeout);
        self.last = status.as_ref().ok().copied();
        status
    }

    fn model(&self) -> Option<Assignment> {
        (self.last == Some(Status::Sat)).then(Assignment::default)
    }

    fn check_time(&self) -> Duration {
        Duration::ZERO
    }
}

impl VerifierFactory for ScriptedFactory {
    type Verifier = Scripted;

    fn create(&self, _models: &SharedModels, leaves: &[Subspace]) -> Result<Scripted, VerifierError> {
        Ok(Scripted {
            leaves: leaves.to_vec(),
            timeout: f64::INFINITY,
            script: self.script.clone(),
            attempts: self.attempts.clone(),
            last: None,
        })
    }
}

/// A single tree testing x0 < 1, x0 < 2, ... x0 < n along its right spine.
fn chain(n: usize) -> AddTree {
    let mut t = Tree::new();
    let mut node = t.root();
    for k in 1..=n {
        let (l, r) = t
            .split(node, Split::Lt { feat_id: 0, split_value: k as f64 })
            .unwrap();
        t.set_leaf_value(l, k as f64).unwrap();
        node = r;
    }
    t.set_leaf_value(node, (n + 1) as f64).unwrap();
    let mut at = AddTree::new();
    at.add_tree(t);
    at
}

fn config() -> DistributedConfig {
    DistributedConfig {
        check_paths: false,
        ..Default::default()
    }
}

fn sequential<F: VerifierFactory>(
    models: Vec<AddTree>,
    factory: F,
    config: DistributedConfig,
) -> DistributedVerifier<F> {
    let instances = models
        .into_iter()
        .map(|at| Instance::new(at, Domains::new()))
        .collect();
    DistributedVerifier::new(Client::new(SequentialExecutor::new()), instances, factory, config).unwrap()
}

#[test]
fn root_unsat_immediately() {
    let factory = ScriptedFactory::always(Status::Unsat);
    let config = DistributedConfig {
        timeout_start: 10.0,
        timeout_max: 10.0,
        ..config()
    };
    let mut dv = sequential(vec![chain(1)], factory.clone(), config);
    let report = dv.check().unwrap();
    assert_eq!(report.status, Status::Unsat);
    assert_eq!(report.done_count, 1);
    assert_eq!(report.num_splits, 0);
    assert_eq!(report.iterations, 1);
    assert_eq!(report.num_tasks, 1);
    assert_eq!(
        factory.attempts(),
        vec![Attempt {
            leaves: vec![0],
            timeout: 10.0
        }]
    );
    let record = report.results.get(0).unwrap();
    assert_eq!(record.status, RecordStatus::Unsat);
    assert_eq!(record.bounds, vec![(1.0, 2.0)]);
}

#[test]
fn timeouts_escalate_until_splits_run_out() {
    let factory = ScriptedFactory::always_timeout();
    let config = DistributedConfig {
        timeout_start: 5.0,
        timeout_max: 20.0,
        timeout_grow_rate: 2.0,
        ..config()
    };
    let policy = config.timeout_policy();
    let mut dv = sequential(vec![chain(8)], factory.clone(), config);
    let report = dv.check().unwrap();

    // 9 intervals between the thresholds, none of which can be split
    assert_eq!(report.status, Status::Unknown);
    assert_eq!(report.done_count, 0);
    assert_eq!(report.num_splits, 8);
    assert_eq!(report.unresolved_count, 9);
    assert_eq!(report.num_tasks, 17);
    report.results.check_shape().unwrap();

    let results = &report.results;
    let mut max_depth = 0;
    for record in results.iter() {
        let depth = results.depth(record.task_id);
        max_depth = max_depth.max(depth);
        let expected = policy.escalation().nth(depth).unwrap();
        assert_eq!(record.timeout, expected, "task {}", record.task_id);
        assert_eq!(record.status, RecordStatus::Unknown);
        if let Some((l, r)) = results.children(record.task_id) {
            assert_eq!(results.depth(l.task_id), depth + 1);
            assert_eq!(results.depth(r.task_id), depth + 1);
            assert_eq!(l.timeout, policy.next(record.timeout));
        }
    }
    // a binary tree with 9 leaves has a path of length at least 4
    assert!(max_depth >= 4);
    assert!(results
        .iter()
        .any(|r| r.timeout == 20.0 && results.get(r.prev_split_id.unwrap_or(0)).unwrap().timeout == 20.0));

    let mut seen: Vec<f64> = factory.attempts().iter().map(|a| a.timeout).collect();
    seen.dedup();
    assert_eq!(&seen[..3], &[5.0, 10.0, 20.0]);
}

#[test]
fn initial_splits() {
    let factory = ScriptedFactory::always(Status::Unsat);
    let config = DistributedConfig {
        num_initial_tasks: 4,
        ..config()
    };
    let mut dv = sequential(vec![chain(8)], factory.clone(), config);
    let report = dv.check().unwrap();

    assert_eq!(report.num_splits, 3);
    assert_eq!(report.num_initial_tasks, 4);
    assert_eq!(report.num_tasks, 4);
    assert_eq!(report.done_count, 4);
    assert_eq!(report.status, Status::Unsat);
    let roots: Vec<_> = report.results.roots().collect();
    assert_eq!(roots.len(), 4);
    let ids: BTreeSet<_> = roots.iter().map(|r| r.task_id).collect();
    assert_eq!(ids.len(), 4);
    assert!(roots.iter().all(|r| r.timeout == 5.0));

    let attempts = factory.attempts();
    assert_eq!(attempts.len(), 4);
    let leaves: BTreeSet<_> = attempts.iter().map(|a| a.leaves[0]).collect();
    assert_eq!(leaves.len(), 4);

    // the leaves of the domain tree partition the input space
    let domtree = dv.domtree(0).unwrap();
    assert_eq!(domtree.leaves().count(), 4);
    for i in -4..40 {
        let x = i as f64 * 0.25;
        let covering = domtree
            .leaves()
            .filter(|&id| domtree.get_subspace(id).unwrap().domains().contains(&[x]))
            .count();
        assert_eq!(covering, 1, "x0 = {x}");
    }
}

#[test]
fn saturate_workers_from_start() {
    let factory = ScriptedFactory::always(Status::Unsat);
    let config = DistributedConfig {
        saturate_workers_from_start: true,
        saturate_workers_factor: 3.0,
        ..config()
    };
    // one sequential worker, three tasks
    let mut dv = sequential(vec![chain(8)], factory, config);
    let report = dv.check().unwrap();
    assert_eq!(report.num_initial_tasks, 3);
    assert_eq!(report.num_splits, 2);
}

#[test]
fn not_enough_splits() {
    let factory = ScriptedFactory::always(Status::Unsat);
    let config = DistributedConfig {
        num_initial_tasks: 5,
        ..config()
    };
    let mut dv = sequential(vec![chain(2)], factory.clone(), config);
    let err = dv.check().unwrap_err();
    assert!(
        matches!(
            err,
            DistributedError::NoMoreSplits {
                requested: 5,
                reached: 3
            }
        ),
        "{err}"
    );
    assert!(factory.attempts().is_empty());
}

#[test]
fn stop_when_sat_cancels_the_rest() {
    let factory = ScriptedFactory::always(Status::Sat);
    let config = DistributedConfig {
        num_initial_tasks: 4,
        stop_when_sat: true,
        ..config()
    };
    let mut dv = sequential(vec![chain(8)], factory.clone(), config);
    let report = dv.check().unwrap();

    assert_eq!(report.status, Status::Sat);
    assert!(report.stopped_early);
    assert_eq!(report.done_count, 1);
    assert_eq!(report.cancelled_count, 3);
    assert_eq!(report.num_tasks, 4);
    assert_eq!(report.iterations, 1);
    // one request per outstanding future, none repeated
    assert_eq!(dv.client().num_cancelled(), 3);
    assert_eq!(dv.client().num_cancel_requests(), 3);
    assert_eq!(factory.attempts().len(), 1);
    assert_eq!(report.results.models().count(), 1);
    assert!(report
        .results
        .iter()
        .all(|r| r.status == RecordStatus::Sat || r.status == RecordStatus::Cancelled));
}

#[test]
fn stop_when_sat_discards_running_tasks() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let factory = ScriptedFactory::new(move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) > 0 {
            thread::sleep(Duration::from_millis(300));
        }
        Ok(Status::Sat)
    });
    let config = DistributedConfig {
        num_initial_tasks: 4,
        stop_when_sat: true,
        ..config()
    };
    let instances = vec![Instance::new(chain(8), Domains::new())];
    let mut dv =
        DistributedVerifier::new(Client::new(ThreadPool::new(4)), instances, factory, config)
            .unwrap();
    let report = dv.check().unwrap();

    assert_eq!(report.status, Status::Sat);
    assert!(report.stopped_early);
    assert_eq!(report.done_count, 1);
    assert_eq!(report.cancelled_count, 3);
    assert_eq!(report.results.models().count(), 1);
    assert_eq!(dv.client().num_cancelled(), 3);
    assert_eq!(dv.client().num_cancel_requests(), 3);
    assert_eq!(report.results.count(RecordStatus::Sat), 1);
}

#[test]
fn sat_without_stopping() {
    let factory = ScriptedFactory::always(Status::Sat);
    let config = DistributedConfig {
        num_initial_tasks: 4,
        ..config()
    };
    let mut dv = sequential(vec![chain(8)], factory, config);
    let report = dv.check().unwrap();
    assert!(!report.stopped_early);
    assert_eq!(report.done_count, 4);
    assert_eq!(report.results.models().count(), 4);
    assert_eq!(dv.client().num_cancelled(), 0);
}

#[test]
fn worker_failure_aborts() {
    let factory = ScriptedFactory::new(|leaves, _| {
        if leaves[0].domtree_node_id() == 0 {
            Err(VerifierError::Timeout {
                unknown_after: Duration::from_secs(5),
            })
        } else {
            Err(VerifierError::Failed("malformed split".to_string()))
        }
    });
    let mut dv = sequential(vec![chain(3)], factory.clone(), config());
    let err = dv.check().unwrap_err();
    assert!(
        matches!(err, DistributedError::Worker { task_id: 1, .. }),
        "{err}"
    );
    // the sibling was never run
    assert_eq!(factory.attempts().len(), 2);
    assert_eq!(dv.client().num_cancelled(), 1);
}

#[test]
fn joint_instances_share_splits() {
    let factory = ScriptedFactory::always_timeout();
    let mut dv = sequential(vec![chain(3), chain(3)], factory, config());
    let report = dv.check().unwrap();

    // every combination of the 4 intervals of each model ends unresolved
    assert_eq!(report.unresolved_count, 16);
    assert_eq!(report.num_splits, 15);
    assert_eq!(report.num_tasks, 31);
    report.results.check_shape().unwrap();
    for instance in 0..2 {
        let domtree = dv.domtree(instance).unwrap();
        assert_eq!(domtree.num_nodes(), 7);
        assert_eq!(domtree.leaves().count(), 4);
    }
    let final_sets: BTreeSet<_> = report
        .results
        .iter()
        .filter(|r| r.is_terminal())
        .map(|r| r.leaves.clone())
        .collect();
    assert_eq!(final_sets.len(), 16);
}

/// x0 < 1 on the left leads to a test x0 < 2 whose right side cannot be
/// reached.
fn dead_branch() -> AddTree {
    let mut t = Tree::new();
    let (l, r) = t.split(0, Split::Lt { feat_id: 0, split_value: 1.0 }).unwrap();
    let (ll, lr) = t.split(l, Split::Lt { feat_id: 0, split_value: 2.0 }).unwrap();
    t.set_leaf_value(ll, 1.0).unwrap();
    t.set_leaf_value(lr, 100.0).unwrap();
    t.set_leaf_value(r, 2.0).unwrap();
    let mut at = AddTree::new();
    at.add_tree(t);
    at
}

#[test]
fn pruning_marks_dead_branches() {
    let factory = IntervalVerifierFactory::new(vec![OutputProperty::gt(0, 50.0)]);
    let config = DistributedConfig {
        check_paths: true,
        num_initial_tasks: 2,
        ..Default::default()
    };
    let instances = vec![Instance::new(dead_branch(), Domains::new())];
    let mut dv =
        DistributedVerifier::new(Client::new(ThreadPool::new(2)), instances, factory, config).unwrap();
    let report = dv.check().unwrap();

    assert_eq!(report.status, Status::Unsat);
    assert!(report.check_paths_time.is_some());
    let domtree = dv.domtree(0).unwrap();
    assert!(!domtree.is_leaf(domtree.root()));
    for id in domtree.leaves() {
        assert!(!domtree.get_subspace(id).unwrap().is_reachable(0, 4));
    }
    for record in report.results.iter() {
        assert!(record.bounds[0].1 <= 2.0);
    }
}

/// t0: x0 < 2 ? 1 : -1, t1: x1 < 3 ? 5 : 0, t2: x0 < 1 ? 0.5 : 0
fn three_trees() -> AddTree {
    let mut at = AddTree::new();
    for (feat_id, split_value, lv, rv) in [(0, 2.0, 1.0, -1.0), (1, 3.0, 5.0, 0.0), (0, 1.0, 0.5, 0.0)] {
        let mut t = Tree::new();
        let (l, r) = t.split(0, Split::Lt { feat_id, split_value }).unwrap();
        t.set_leaf_value(l, lv).unwrap();
        t.set_leaf_value(r, rv).unwrap();
        at.add_tree(t);
    }
    at
}

#[test]
fn thread_pool_end_to_end() {
    let config = DistributedConfig {
        num_initial_tasks: 3,
        ..Default::default()
    };

    let sat = IntervalVerifierFactory::new(vec![OutputProperty::gt(0, 6.0)]);
    let instances = vec![Instance::new(three_trees(), Domains::new())];
    let mut dv = DistributedVerifier::new(Client::new(ThreadPool::new(4)), instances, sat, config.clone())
        .unwrap();
    let report = dv.check().unwrap();
    assert_eq!(report.status, Status::Sat);
    let models: Vec<_> = report.results.models().collect();
    assert_eq!(models.len(), 1);
    let (_, model) = models[0];
    assert_eq!(model.outputs, vec![6.5]);
    assert_eq!(model.family, vec![vec![1, 1, 1]]);

    let unsat = IntervalVerifierFactory::new(vec![OutputProperty::gt(0, 6.0)]);
    let domains = Domains::from_vec(vec![RealDomain::new(1.0, 10.0)]);
    let instances = vec![Instance::new(three_trees(), domains)];
    let mut dv = DistributedVerifier::new(Client::new(ThreadPool::new(4)), instances, unsat, config).unwrap();
    let report = dv.check().unwrap();
    assert_eq!(report.status, Status::Unsat);
    assert_eq!(report.done_count, report.num_tasks);
    assert_eq!(report.results.models().count(), 0);
}

#[test]
fn budgets_beyond_any_deadline() {
    let config = DistributedConfig {
        timeout_start: 1e19,
        timeout_max: f64::INFINITY,
        timeout_grow_rate: 2.0,
        ..config()
    };
    let factory = ScriptedFactory::new(|leaves, timeout| {
        if leaves[0].domtree_node_id() == 0 {
            Err(VerifierError::Timeout {
                unknown_after: Duration::from_secs_f64(timeout),
            })
        } else {
            Ok(Status::Unsat)
        }
    });
    let mut dv = sequential(vec![chain(3)], factory.clone(), config);
    let report = dv.check().unwrap();
    assert_eq!(report.status, Status::Unsat);
    assert_eq!(report.num_tasks, 3);

    let attempts = factory.attempts();
    assert_eq!(attempts.len(), 3);
    assert!(attempts[0].timeout.is_finite());
    // 2e19s does not fit a deadline, the children run without one
    assert!(attempts[1..].iter().all(|a| a.timeout == f64::INFINITY));
    assert_eq!(report.results.get(1).map(|r| r.timeout), Some(2e19));

    let config = DistributedConfig {
        timeout_start: 1e20,
        timeout_max: f64::INFINITY,
        ..Default::default()
    };
    let sat = IntervalVerifierFactory::new(vec![OutputProperty::gt(0, 6.0)]);
    let instances = vec![Instance::new(three_trees(), Domains::new())];
    let mut dv =
        DistributedVerifier::new(Client::new(ThreadPool::new(2)), instances, sat, config).unwrap();
    let report = dv.check().unwrap();
    assert_eq!(report.status, Status::Sat);
}

#[test]
fn invalid_setups() {
    let factory = ScriptedFactory::always(Status::Unsat);
    let bad = DistributedConfig {
        timeout_grow_rate: 0.5,
        ..config()
    };
    let instances = vec![Instance::new(chain(1), Domains::new())];
    assert!(matches!(
        DistributedVerifier::new(Client::new(SequentialExecutor::new()), instances, factory.clone(), bad),
        Err(DistributedError::Config(_))
    ));
    assert!(matches!(
        DistributedVerifier::new(Client::new(SequentialExecutor::new()), vec![], factory, config()),
        Err(DistributedError::NoInstances)
    ));
}
