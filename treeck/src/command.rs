// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! The treeck binary's command-line interface.

use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
    process,
};

use clap::Args;
use distributed::{
    Client, DistributedConfig, DistributedVerifier, Instance, ResultRecord, Results, ThreadPool,
};
use ensemble::{AddTree, Domains, FeatId, RealDomain, Subspace};
use itertools::Itertools;
use tabled::settings::{object::Columns, Alignment, Modify, Style};
use verifier::{
    interval::{IntervalVerifierFactory, OutputProperty},
    timing, Assignment,
};

/// Print `msg` to stderr and exit with status 1.
fn fail(msg: impl Display) -> ! {
    eprintln!("{msg}");
    process::exit(1);
}

fn parse_f64(s: &str) -> Result<f64, String> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| format!("invalid number {s:?}"))
}

/// Parse `VALUE` (first model) or `MODEL:VALUE`.
fn parse_output_bound(s: &str) -> Result<(usize, f64), String> {
    match s.split_once(':') {
        Some((instance, value)) => {
            let instance = instance
                .trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid model index in {s:?}"))?;
            Ok((instance, parse_f64(value)?))
        }
        None => Ok((0, parse_f64(s)?)),
    }
}

/// Parse `FEATURE=LO:HI`, where the feature may be written `3` or `x3` and
/// an empty bound is unbounded.
fn parse_domain(s: &str) -> Result<(FeatId, RealDomain), String> {
    let Some((feat, range)) = s.split_once('=') else {
        return Err(format!("expected exactly one '=' in domain {s:?}"));
    };
    let feat = feat.trim();
    let feat_id = feat
        .strip_prefix('x')
        .unwrap_or(feat)
        .parse::<FeatId>()
        .map_err(|_| format!("invalid feature {feat:?}"))?;
    let Some((lo, hi)) = range.split_once(':') else {
        return Err(format!("expected LO:HI in domain {s:?}"));
    };
    let lo = if lo.trim().is_empty() { f64::NEG_INFINITY } else { parse_f64(lo)? };
    let hi = if hi.trim().is_empty() { f64::INFINITY } else { parse_f64(hi)? };
    let domain = RealDomain::new(lo, hi);
    if domain.is_empty() {
        return Err(format!("empty domain {s:?}"));
    }
    Ok((feat_id, domain))
}

#[derive(Args, Clone, Debug, PartialEq)]
struct DomainArgs {
    #[arg(long = "domain", value_parser = parse_domain, allow_negative_numbers = true)]
    /// Restrict a feature to `[LO, HI)`, given as `FEATURE=LO:HI`; either
    /// bound may be left empty. May be repeated
    domains: Vec<(FeatId, RealDomain)>,
}

impl DomainArgs {
    fn to_domains(&self) -> Result<Domains, String> {
        let mut domains = Domains::new();
        for (feat_id, d) in &self.domains {
            domains = domains
                .refine(*feat_id, d)
                .ok_or_else(|| format!("domain of x{feat_id} is empty"))?;
        }
        Ok(domains)
    }
}

#[derive(Args, Clone, Debug, PartialEq)]
struct PropertyArgs {
    #[arg(long, value_parser = parse_output_bound, allow_negative_numbers = true)]
    /// Look for an input with output above a value, given as `VALUE` for the
    /// first model or `MODEL:VALUE`. May be repeated
    gt: Vec<(usize, f64)>,

    #[arg(long, value_parser = parse_output_bound, allow_negative_numbers = true)]
    /// Look for an input with output below a value, same format as `--gt`
    lt: Vec<(usize, f64)>,
}

impl PropertyArgs {
    fn properties(&self) -> Vec<OutputProperty> {
        let gt = self.gt.iter().map(|&(i, v)| OutputProperty::gt(i, v));
        let lt = self.lt.iter().map(|&(i, v)| OutputProperty::lt(i, v));
        gt.chain(lt).collect()
    }
}

#[derive(Args, Clone, Debug, PartialEq)]
struct SchedulerArgs {
    #[arg(long)]
    /// JSON file with scheduler options; the flags below override it
    config: Option<PathBuf>,

    #[arg(long)]
    /// Skip the reachability pass before dispatching
    no_check_paths: bool,

    #[arg(long)]
    /// Split the input space into this many leaf-sets before dispatching
    initial_tasks: Option<usize>,

    #[arg(long)]
    /// Start with this many leaf-sets per worker instead of --initial-tasks
    saturate_workers: Option<f64>,

    #[arg(long)]
    /// Stop at the first satisfying input
    stop_when_sat: bool,

    #[arg(long)]
    /// Budget of the first attempt on each leaf-set, e.g. `5s`
    timeout_start: Option<humantime::Duration>,

    #[arg(long)]
    /// Largest budget of any attempt, e.g. `2min`
    timeout_max: Option<humantime::Duration>,

    #[arg(long)]
    /// Factor between the budgets of successive attempts
    timeout_grow_rate: Option<f64>,
}

impl SchedulerArgs {
    fn to_config(&self) -> Result<DistributedConfig, String> {
        let mut config = match &self.config {
            Some(path) => {
                let json = fs::read_to_string(path)
                    .map_err(|err| format!("could not read {}: {err}", path.display()))?;
                serde_json::from_str(&json)
                    .map_err(|err| format!("could not parse {}: {err}", path.display()))?
            }
            None => DistributedConfig::default(),
        };
        if self.no_check_paths {
            config.check_paths = false;
        }
        if let Some(n) = self.initial_tasks {
            config.num_initial_tasks = n;
        }
        if let Some(factor) = self.saturate_workers {
            config.saturate_workers_from_start = true;
            config.saturate_workers_factor = factor;
        }
        if self.stop_when_sat {
            config.stop_when_sat = true;
        }
        if let Some(t) = self.timeout_start {
            config.timeout_start = t.as_secs_f64();
        }
        if let Some(t) = self.timeout_max {
            config.timeout_max = t.as_secs_f64();
        }
        if let Some(rate) = self.timeout_grow_rate {
            config.timeout_grow_rate = rate;
        }
        Ok(config)
    }
}

#[derive(Args, Clone, Debug, PartialEq)]
struct VerifyArgs {
    #[command(flatten)]
    property: PropertyArgs,

    #[command(flatten)]
    domain: DomainArgs,

    #[command(flatten)]
    scheduler: SchedulerArgs,

    #[arg(long)]
    /// Number of worker threads (default: one per core)
    workers: Option<usize>,

    #[arg(long)]
    /// Print the report as JSON
    json: bool,

    #[arg(long)]
    /// Print a table of all tasks
    records: bool,

    #[arg(long)]
    /// Print timing statistics
    time: bool,

    #[arg(required = true)]
    /// Ensemble JSON files, verified jointly over the same input
    models: Vec<PathBuf>,
}

#[derive(clap::Subcommand, Clone, Debug, PartialEq)]
enum Command {
    /// Search for an input on which the ensembles' outputs satisfy the
    /// given bounds, or prove that there is none.
    Verify(VerifyArgs),
    /// Print the trees of an ensemble.
    Print {
        /// Ensemble JSON file
        file: PathBuf,
    },
    /// Summarize an ensemble, optionally restricted to a domain.
    Info {
        #[command(flatten)]
        domain: DomainArgs,
        /// Ensemble JSON file
        file: PathBuf,
    },
}

#[derive(clap::Parser, Debug)]
#[command(about, long_about=None)]
/// Entrypoint for the treeck binary, including all commands.
pub struct App {
    #[command(subcommand)]
    /// Command to run
    command: Command,
}

fn load_model(path: &Path) -> AddTree {
    AddTree::read(path).unwrap_or_else(|err| fail(format_args!("{}: {err}", path.display())))
}

fn format_model(task_id: usize, model: &Assignment) -> String {
    let features = model
        .features
        .iter()
        .map(|(f, v)| format!("x{f} = {v}"))
        .join(", ");
    let outputs = model.outputs.iter().join(", ");
    format!("model from task {task_id}: {features}; outputs {outputs}")
}

fn record_header() -> Vec<String> {
    [
        "task", "parent", "status", "timeout s", "time s", "leaves", "bounds", "unreachable",
        "split",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn record_row(record: &ResultRecord) -> Vec<String> {
    let parent = record.prev_split_id.map_or(String::new(), |p| p.to_string());
    let time = record.check_time.map_or(String::new(), |t| format!("{t:0.2}"));
    let split = match (&record.split, record.next_split_ids) {
        (Some(s), Some((l, r))) => format!(
            "{}: x{} < {} -> {l}, {r}",
            s.instance, s.feat_id, s.split_value
        ),
        _ => String::new(),
    };
    vec![
        record.task_id.to_string(),
        parent,
        record.status.to_string(),
        format!("{:0.1}", record.timeout),
        time,
        record.leaves.iter().join(" "),
        record
            .bounds
            .iter()
            .map(|(lo, hi)| format!("[{lo}, {hi}]"))
            .join(" "),
        record.unreachable.iter().join(" "),
        split,
    ]
}

fn print_records(results: &Results) {
    let mut rows = vec![record_header()];
    rows.extend(results.iter().map(record_row));
    let mut table = tabled::builder::Builder::from(rows).build();
    table
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..=4)).with(Alignment::right()));
    println!("{table}");
}

impl VerifyArgs {
    fn exec(&self) {
        let properties = self.property.properties();
        if properties.is_empty() {
            fail("no property to verify, use --gt or --lt");
        }
        let domains = self.domain.to_domains().unwrap_or_else(|err| fail(err));
        let config = self.scheduler.to_config().unwrap_or_else(|err| fail(err));
        let instances = self
            .models
            .iter()
            .map(|path| Instance::new(load_model(path), domains.clone()))
            .collect();
        let pool = match self.workers {
            Some(n) => ThreadPool::new(n),
            None => ThreadPool::with_available_parallelism(),
        };

        let client = Client::new(pool);
        log::info!(
            "verifying {} model(s) on {} worker(s)",
            self.models.len(),
            client.num_workers()
        );

        let factory = IntervalVerifierFactory::new(properties);
        let mut dv = DistributedVerifier::new(client, instances, factory, config)
            .unwrap_or_else(|err| fail(err));
        let report = dv.check().unwrap_or_else(|err| fail(err));

        if self.json {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(err) => fail(err),
            }
        } else {
            println!("{report}");
            if self.records {
                print_records(&report.results);
            }
            for (task_id, model) in report.results.models() {
                println!("{}", format_model(task_id, model));
            }
        }
        if self.time {
            timing::report();
        }
    }
}

impl App {
    /// Run the application.
    pub fn exec(self) {
        match self.command {
            Command::Verify(ref args) => args.exec(),
            Command::Print { ref file } => {
                print!("{}", load_model(file));
            }
            Command::Info {
                ref domain,
                ref file,
            } => {
                let at = load_model(file);
                let domains = domain.to_domains().unwrap_or_else(|err| fail(err));
                let leaf = Subspace::new(&at, 0, domains.clone());
                let (lo, hi) = leaf.output_bounds(&at);
                println!("trees: {}", at.len());
                println!("nodes: {}", at.num_nodes());
                println!("features: {}", at.num_features());
                println!("base score: {}", at.base_score);
                println!("domain: {domains}");
                println!("output bounds: [{lo}, {hi}]");
                println!("unreachable nodes: {}", leaf.num_unreachable(&at));
            }
        }
    }
}
