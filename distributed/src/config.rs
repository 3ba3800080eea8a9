// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Scheduler options and the timeout escalation policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::DistributedError;

/// Default values of [`DistributedConfig`].
pub mod defaults {
    pub const CHECK_PATHS: bool = true;
    pub const NUM_INITIAL_TASKS: usize = 1;
    pub const SATURATE_WORKERS_FROM_START: bool = false;
    pub const SATURATE_WORKERS_FACTOR: f64 = 1.0;
    pub const STOP_WHEN_SAT: bool = false;
    pub const TIMEOUT_START: f64 = 5.0;
    pub const TIMEOUT_MAX: f64 = 120.0;
    pub const TIMEOUT_GROW_RATE: f64 = 1.2;
}

/// Options of a [`crate::DistributedVerifier`] run. Timeouts are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Prune unreachable tree nodes with the verifier before dispatching
    pub check_paths: bool,
    /// Split the root into this many leaf-sets before the first dispatch
    pub num_initial_tasks: usize,
    /// Derive the number of initial tasks from the number of workers instead
    pub saturate_workers_from_start: bool,
    /// Initial tasks per worker when saturating
    pub saturate_workers_factor: f64,
    /// Cancel all outstanding work on the first SAT result
    pub stop_when_sat: bool,
    /// Budget of the first attempt on every initial leaf-set
    pub timeout_start: f64,
    /// Largest budget any attempt gets
    pub timeout_max: f64,
    /// Factor between the budgets of a task and its children
    pub timeout_grow_rate: f64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        DistributedConfig {
            check_paths: defaults::CHECK_PATHS,
            num_initial_tasks: defaults::NUM_INITIAL_TASKS,
            saturate_workers_from_start: defaults::SATURATE_WORKERS_FROM_START,
            saturate_workers_factor: defaults::SATURATE_WORKERS_FACTOR,
            stop_when_sat: defaults::STOP_WHEN_SAT,
            timeout_start: defaults::TIMEOUT_START,
            timeout_max: defaults::TIMEOUT_MAX,
            timeout_grow_rate: defaults::TIMEOUT_GROW_RATE,
        }
    }
}

impl DistributedConfig {
    pub fn validate(&self) -> Result<(), DistributedError> {
        let fail = |msg: String| Err(DistributedError::Config(msg));
        if self.num_initial_tasks < 1 {
            return fail("num_initial_tasks must be at least 1".to_string());
        }
        if !(self.timeout_start.is_finite() && self.timeout_start > 0.0) {
            return fail(format!(
                "timeout_start must be positive, got {}",
                self.timeout_start
            ));
        }
        if !(self.timeout_max >= self.timeout_start) {
            return fail(format!(
                "timeout_max ({}) must be at least timeout_start ({})",
                self.timeout_max, self.timeout_start
            ));
        }
        if !(self.timeout_grow_rate > 1.0) {
            return fail(format!(
                "timeout_grow_rate must be greater than 1, got {}",
                self.timeout_grow_rate
            ));
        }
        if self.saturate_workers_from_start
            && !(self.saturate_workers_factor.is_finite() && self.saturate_workers_factor > 0.0)
        {
            return fail(format!(
                "saturate_workers_factor must be positive, got {}",
                self.saturate_workers_factor
            ));
        }
        Ok(())
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            start: self.timeout_start,
            max: self.timeout_max,
            grow_rate: self.timeout_grow_rate,
        }
    }

    /// Number of leaf-sets to dispatch initially, given the number of workers.
    pub fn initial_tasks(&self, num_workers: usize) -> usize {
        if self.saturate_workers_from_start {
            ((self.saturate_workers_factor * num_workers as f64).round() as usize).max(1)
        } else {
            self.num_initial_tasks
        }
    }
}

/// Geometric escalation of task budgets, capped at a maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    start: f64,
    max: f64,
    grow_rate: f64,
}

impl TimeoutPolicy {
    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn next(&self, prev: f64) -> f64 {
        self.max.min(self.grow_rate * prev)
    }

    /// The budgets of successive attempts along one branch.
    pub fn escalation(&self) -> impl Iterator<Item = f64> + '_ {
        std::iter::successors(Some(self.start), |&t| Some(self.next(t)))
    }

    /// The deadline a verifier gets for a budget of `timeout` seconds. Budgets
    /// too large for a [`Duration`] mean no deadline at all.
    pub fn duration(timeout: f64) -> Option<Duration> {
        Duration::try_from_secs_f64(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DistributedConfig::default();
        config.validate().unwrap();
        assert_eq!(config.initial_tasks(8), 1);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: DistributedConfig =
            serde_json::from_str(r#"{"stop_when_sat": true, "timeout_max": 60}"#).unwrap();
        assert!(config.stop_when_sat);
        assert_eq!(config.timeout_max, 60.0);
        assert_eq!(config.timeout_start, defaults::TIMEOUT_START);
    }

    #[test]
    fn invalid_configs() {
        let bad = [
            DistributedConfig {
                num_initial_tasks: 0,
                ..Default::default()
            },
            DistributedConfig {
                timeout_start: 0.0,
                ..Default::default()
            },
            DistributedConfig {
                timeout_max: 1.0,
                ..Default::default()
            },
            DistributedConfig {
                timeout_grow_rate: 1.0,
                ..Default::default()
            },
            DistributedConfig {
                timeout_grow_rate: f64::NAN,
                ..Default::default()
            },
            DistributedConfig {
                saturate_workers_from_start: true,
                saturate_workers_factor: 0.0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(DistributedError::Config(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn saturate_workers() {
        let config = DistributedConfig {
            saturate_workers_from_start: true,
            saturate_workers_factor: 1.5,
            num_initial_tasks: 100,
            ..Default::default()
        };
        assert_eq!(config.initial_tasks(4), 6);
        assert_eq!(config.initial_tasks(0), 1);
    }

    #[test]
    fn escalation_is_capped() {
        let policy = DistributedConfig {
            timeout_start: 5.0,
            timeout_max: 20.0,
            timeout_grow_rate: 2.0,
            ..Default::default()
        }
        .timeout_policy();
        let seq: Vec<f64> = policy.escalation().take(6).collect();
        assert_eq!(seq, vec![5.0, 10.0, 20.0, 20.0, 20.0, 20.0]);
    }

    #[test]
    fn escalation_stays_in_bounds() {
        for (start, max, rate) in [(1.0, 1.0, 1.1), (0.5, 7.0, 1.2), (3.0, 100.0, 3.7)] {
            let policy = TimeoutPolicy {
                start,
                max,
                grow_rate: rate,
            };
            let seq: Vec<f64> = policy.escalation().take(50).collect();
            for w in seq.windows(2) {
                assert!(start <= w[0] && w[0] <= max);
                assert!(w[0] <= w[1]);
                assert_eq!(w[1], max.min(rate * w[0]));
            }
        }
    }

    #[test]
    fn huge_budgets_have_no_deadline() {
        assert_eq!(TimeoutPolicy::duration(5.0), Some(Duration::from_secs(5)));
        assert_eq!(TimeoutPolicy::duration(1e20), None);
        assert_eq!(TimeoutPolicy::duration(f64::INFINITY), None);
        assert_eq!(TimeoutPolicy::duration(f64::NAN), None);

        let config = DistributedConfig {
            timeout_start: 1e20,
            timeout_max: f64::INFINITY,
            ..Default::default()
        };
        config.validate().unwrap();
        let policy = config.timeout_policy();
        assert!(policy.next(1e20) > 1e20);
        assert_eq!(TimeoutPolicy::duration(policy.next(f64::MAX)), None);
    }
}
