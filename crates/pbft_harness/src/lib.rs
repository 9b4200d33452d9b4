//! Orchestration harness for multi-cluster PBFT benchmark runs.
//!
//! The crate covers three jobs:
//! - [`topology`]: deterministic node tables mapping `<cluster><index>` to
//!   `host:port`,
//! - [`launcher`]: building the node binary and starting one process per
//!   node inside a multiplexer session,
//! - [`driver`]: sweeping node counts, running per-cluster trial scripts and
//!   appending one sample per trial to an append-only result log.
//!
//! External programs are reached through [`runner::CommandRunner`] so the
//! orchestration logic can run against a recording fake in tests.

pub mod cluster;
pub mod command;
pub mod config;
pub mod driver;
pub mod error;
pub mod launcher;
pub mod results;
pub mod runner;
pub mod topology;

pub use cluster::{ClusterSet, ClusterTag, Endpoint, NodeIdentity};
pub use config::{ConfigArgs, HarnessConfig};
pub use driver::{BatchDriver, DriverState, SweepSummary, TrialConfig};
pub use error::{HarnessError, Result};
pub use launcher::{LaunchReport, LaunchSpec, Launcher, Selection};
pub use results::{CommandSampler, ElapsedSampler, ResultLog, Sampler};
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
pub use topology::{NodeTable, TopologyGenerator, DEFAULT_BASE_PORT, LOCAL_OVERRIDE_HOST};
