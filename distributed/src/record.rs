// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Bookkeeping of verification tasks.
//!
//! Every dispatched task gets a [`ResultRecord`]. A task that times out is
//! split into two children, so the records form a forest of binary trees
//! mirroring the splits of the domain trees, rooted at the initial tasks.

use ensemble::{AddTree, DomNodeId, FeatId, Subspace};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use verifier::{Assignment, Status};

/// Identifier of a verification task, unique within one run.
pub type TaskId = usize;

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    /// Submitted, result outstanding
    Pending,
    /// Resolved: an assignment exists
    Sat,
    /// Resolved: no assignment exists
    Unsat,
    /// Timed out; either split, or unresolved when no split was possible
    Unknown,
    /// Abandoned after the stop flag was raised
    Cancelled,
}

impl From<Status> for RecordStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Sat => RecordStatus::Sat,
            Status::Unsat => RecordStatus::Unsat,
            Status::Unknown => RecordStatus::Unknown,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::Sat => "SAT",
            RecordStatus::Unsat => "UNSAT",
            RecordStatus::Unknown => "UNKNOWN",
            RecordStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// The cut applied to a timed-out task's leaf-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitInfo {
    /// Position in the leaf-set of the leaf that was split
    pub instance: usize,
    /// Domain tree node that was split
    pub domtree_node_id: DomNodeId,
    pub feat_id: FeatId,
    pub split_value: f64,
    pub score: f64,
    pub balance: f64,
}

/// Outcome and summaries of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: TaskId,
    /// Domain tree node of each instance's leaf
    pub leaves: Vec<DomNodeId>,
    /// Budget in seconds
    pub timeout: f64,
    pub status: RecordStatus,
    /// Seconds the worker spent, once known
    pub check_time: Option<f64>,
    /// Per instance, the number of tree nodes unreachable in the leaf
    pub unreachable: Vec<usize>,
    /// Per instance, bounds on the ensemble output within the leaf
    pub bounds: Vec<(f64, f64)>,
    pub split: Option<SplitInfo>,
    pub next_split_ids: Option<(TaskId, TaskId)>,
    pub prev_split_id: Option<TaskId>,
    /// Satisfying assignment of a SAT task
    pub model: Option<Assignment>,
}

impl ResultRecord {
    /// A pending record for `leaves`, with fresh summaries.
    pub fn new(
        task_id: TaskId,
        leaves: &[Subspace],
        models: &[AddTree],
        timeout: f64,
        prev_split_id: Option<TaskId>,
    ) -> Self {
        ResultRecord {
            task_id,
            leaves: leaves.iter().map(|l| l.domtree_node_id()).collect(),
            timeout,
            status: RecordStatus::Pending,
            check_time: None,
            unreachable: leaves
                .iter()
                .zip(models)
                .map(|(l, at)| l.num_unreachable(at))
                .collect(),
            bounds: leaves
                .iter()
                .zip(models)
                .map(|(l, at)| l.output_bounds(at))
                .collect(),
            split: None,
            next_split_ids: None,
            prev_split_id,
            model: None,
        }
    }

    pub fn is_split(&self) -> bool {
        self.next_split_ids.is_some()
    }

    /// Whether the record will never change again.
    pub fn is_terminal(&self) -> bool {
        self.status != RecordStatus::Pending && !self.is_split()
    }
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} {} timeout={}s leaves={:?}",
            self.task_id, self.status, self.timeout, self.leaves
        )?;
        if let Some(t) = self.check_time {
            write!(f, " time={t:.2}s")?;
        }
        for (lo, hi) in &self.bounds {
            write!(f, " [{lo}, {hi}]")?;
        }
        if let (Some(split), Some((l, r))) = (&self.split, self.next_split_ids) {
            write!(
                f,
                " split {}:{} x{} < {} -> ({l}, {r})",
                split.instance, split.domtree_node_id, split.feat_id, split.split_value
            )?;
        }
        Ok(())
    }
}

/// All records of a run, keyed by task id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Results(BTreeMap<TaskId, ResultRecord>);

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: ResultRecord) {
        self.0.insert(record.task_id, record);
    }

    pub fn get(&self, task_id: TaskId) -> Option<&ResultRecord> {
        self.0.get(&task_id)
    }

    pub fn get_mut(&mut self, task_id: TaskId) -> Option<&mut ResultRecord> {
        self.0.get_mut(&task_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResultRecord> {
        self.0.values()
    }

    /// Records of the initial tasks.
    pub fn roots(&self) -> impl Iterator<Item = &ResultRecord> {
        self.iter().filter(|r| r.prev_split_id.is_none())
    }

    pub fn children(&self, task_id: TaskId) -> Option<(&ResultRecord, &ResultRecord)> {
        let (l, r) = self.get(task_id)?.next_split_ids?;
        Some((self.get(l)?, self.get(r)?))
    }

    /// Number of splits between the record and its root.
    pub fn depth(&self, task_id: TaskId) -> usize {
        let mut depth = 0;
        let mut current = self.get(task_id).and_then(|r| r.prev_split_id);
        while let Some(id) = current {
            depth += 1;
            current = self.get(id).and_then(|r| r.prev_split_id);
        }
        depth
    }

    pub fn count(&self, status: RecordStatus) -> usize {
        self.iter().filter(|r| r.status == status).count()
    }

    /// Satisfying assignments found, by task.
    pub fn models(&self) -> impl Iterator<Item = (TaskId, &Assignment)> {
        self.iter()
            .filter_map(|r| r.model.as_ref().map(|m| (r.task_id, m)))
    }

    /// Check that the records form binary trees: a split record has exactly
    /// two children that point back to it, and only split records have
    /// children.
    pub fn check_shape(&self) -> Result<(), String> {
        for record in self.iter() {
            let id = record.task_id;
            if let Some((l, r)) = record.next_split_ids {
                if l == r {
                    return Err(format!("task {id} has the same child twice"));
                }
                if record.status != RecordStatus::Unknown {
                    return Err(format!("task {id} was split but is {}", record.status));
                }
                for child in [l, r] {
                    match self.get(child) {
                        Some(c) if c.prev_split_id == Some(id) => {}
                        Some(_) => return Err(format!("child {child} of {id} has another parent")),
                        None => return Err(format!("child {child} of {id} is missing")),
                    }
                }
            }
            if let Some(parent) = record.prev_split_id {
                if parent >= id {
                    return Err(format!("task {id} was created before its parent {parent}"));
                }
                let linked = self
                    .get(parent)
                    .and_then(|p| p.next_split_ids)
                    .map_or(false, |(l, r)| l == id || r == id);
                if !linked {
                    return Err(format!("parent {parent} of {id} does not list it"));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Results {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn go(results: &Results, id: TaskId, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let Some(record) = results.get(id) else {
                return Ok(());
            };
            writeln!(f, "{:indent$}{record}", "")?;
            if let Some((l, r)) = record.next_split_ids {
                go(results, l, indent + 2, f)?;
                go(results, r, indent + 2, f)?;
            }
            Ok(())
        }
        for root in self.roots() {
            go(self, root.task_id, 0, f)?;
        }
        Ok(())
    }
}
