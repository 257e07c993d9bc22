//! Network emulation for MPD transport testing.
//!
//! Describes host/switch topologies with per-interface shaping, realizes
//! them on Linux network namespaces with bridges, veth pairs and `tc netem`,
//! and builds the fixed test scenarios the harness runs.

pub mod emulator;
pub mod namespace;
pub mod options;
pub mod scenarios;
pub mod shaping;
pub mod topology;

pub mod test_util;

pub use emulator::{Emulator, NetnsEmulator, PingSummary};
pub use options::{IntfParams, LinkOptions};
pub use scenarios::{ScenarioKind, ScenarioOptions, ScenarioTopology};
pub use topology::{End, LinkId, ShapedLink, Topology, TopologyBuilder, TopologyError};
