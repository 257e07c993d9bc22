//! Test-run driver for the MPD transport.
//!
//! Generates node configs, brings a scenario network up through an
//! [`mpd_netsim::Emulator`], supervises the client and server processes,
//! applies the scenario's mid-run perturbation and collects scored traces.

pub mod config;
pub mod driver;
pub mod nodes;
pub mod process;
pub mod results;
pub mod schedule;

pub use config::{ConfigError, HarnessConfig};
pub use driver::{run_scenario, Perturbation, RunReport, WaitPolicy};
pub use schedule::{ScheduledTask, TaskOutcome};
