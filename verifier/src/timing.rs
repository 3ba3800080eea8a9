// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Process-wide statistics about time spent in verifier checks.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use itertools::Itertools;
use lazy_static::lazy_static;

use crate::basics::Status;

/// Kinds of timed events.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimeType {
    /// A full check that returned a status
    Check(Status),
    /// A full check that ran out of time
    Timeout,
    /// A reachability check of one tree path
    PathCheck { reachable: bool },
}

impl TimeType {
    fn name(&self) -> &'static str {
        match self {
            TimeType::Check(Status::Sat) => "check (sat)",
            TimeType::Check(Status::Unsat) => "check (unsat)",
            TimeType::Check(Status::Unknown) => "check (unknown)",
            TimeType::Timeout => "check (timeout)",
            TimeType::PathCheck { reachable: true } => "path (reachable)",
            TimeType::PathCheck { reachable: false } => "path (unreachable)",
        }
    }

    const ALL: [TimeType; 6] = [
        TimeType::Check(Status::Sat),
        TimeType::Check(Status::Unsat),
        TimeType::Check(Status::Unknown),
        TimeType::Timeout,
        TimeType::PathCheck { reachable: true },
        TimeType::PathCheck { reachable: false },
    ];
}

/// A single timing event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct TimeInfo {
    typ: TimeType,
    dur: Duration,
}

/// A record of timing measurements.
///
/// `Sync` so that worker threads can record concurrently.
pub struct Timings(Mutex<Vec<TimeInfo>>, Instant);

impl Timings {
    /// Empty timings, with the clock started now.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Timings(Mutex::new(vec![]), Instant::now())
    }

    /// Hack to make sure start time is initialized
    pub fn init(&self) {}

    /// Add one event.
    pub fn record_duration(&self, typ: TimeType, dur: Duration) {
        if let Ok(mut times) = self.0.lock() {
            times.push(TimeInfo { typ, dur });
        }
    }

    /// Total time and number of calls per kind of event.
    pub fn totals(&self) -> Vec<(TimeType, Duration, usize)> {
        let times = match self.0.lock() {
            Ok(times) => times.clone(),
            Err(_) => return vec![],
        };
        let totals = times
            .iter()
            .into_grouping_map_by(|info| info.typ)
            .fold((Duration::ZERO, 0), |(dur, count), _key, t| {
                (dur + t.dur, count + 1)
            });
        TimeType::ALL
            .into_iter()
            .filter_map(|typ| totals.get(&typ).map(|&(dur, count)| (typ, dur, count)))
            .collect()
    }

    /// Print a full timing report to stdout.
    pub fn report(&self) {
        if cfg!(debug_assertions) {
            eprintln!("warning: this is a debug build, verifier time will be worse");
        }
        let total_time = self.1.elapsed().as_secs_f64();
        println!("{:<22}: {total_time:.1}s", "total");

        let totals = self.totals();
        let count: usize = totals.iter().map(|(_, _, c)| c).sum();
        let verifier_total = totals
            .iter()
            .map(|(_, dur, _)| *dur)
            .sum::<Duration>()
            .as_secs_f64();
        println!(
            "  {:<20}: {verifier_total:.1}s {count:>4} calls",
            "verifier total",
        );
        for (typ, time, count) in totals {
            println!(
                "    {:<18}: {:.1}s {count:>4} calls ",
                typ.name(),
                time.as_secs_f64()
            );
        }
    }
}

lazy_static! {
    /// The process-wide timings.
    pub static ref TIMES: Timings = Timings::new();
}

/// Start the clock of [`TIMES`].
pub fn init() {
    TIMES.init()
}

/// Record the time since `start` under `typ`.
pub fn elapsed(typ: TimeType, start: Instant) {
    TIMES.record_duration(typ, start.elapsed())
}

/// Print the timings to stdout.
pub fn report() {
    TIMES.report()
}
