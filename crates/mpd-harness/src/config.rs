use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mpd_netsim::{LinkOptions, ScenarioKind, ScenarioOptions};
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unknown scenario '{0}' in overrides")]
    UnknownScenario(String),
    #[error("scorer command is empty")]
    EmptyScorer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfigInput {
    pub version: u32,
    pub seed: Option<u64>,
    pub binaries: BinariesInput,
    pub paths: PathsInput,
    pub scorer: Option<Vec<String>>,
    pub timing: TimingInput,
    pub ports: PortsInput,
    /// Keyed by scenario name, e.g. `[scenarios.dual_bottleneck]`.
    pub scenarios: BTreeMap<String, ScenarioOverrideInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BinariesInput {
    pub client: Option<PathBuf>,
    pub server: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsInput {
    pub config_dir: Option<PathBuf>,
    /// Where `<host>stdout` capture files are written.
    pub output_dir: Option<PathBuf>,
    pub result_dir: Option<PathBuf>,
    pub trace_glob: Option<String>,
    /// Trace pattern of the `mpd` scenario.
    pub mpd_trace_glob: Option<String>,
    pub capture_file: Option<PathBuf>,
    pub namespace_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingInput {
    pub settle_ms: Option<u64>,
    pub poll_ms: Option<u64>,
    pub cleanup_ms: Option<u64>,
    pub perturb_after_ms: Option<u64>,
    pub competing_flow_secs: Option<u64>,
    pub kill_grace_ms: Option<u64>,
    pub marker_poll_ms: Option<u64>,
    pub bandwidth_drop_polls: Option<u32>,
    pub bandwidth_drop_mbit: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortsInput {
    pub client: Option<u16>,
    pub server: Option<u16>,
}

/// Per-scenario link option overrides. Set fields replace the defaults;
/// list entries apply by index.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioOverrideInput {
    pub server_count: Option<usize>,
    pub client_link: Option<LinkOptions>,
    pub bottlenecks: Vec<LinkOptions>,
    pub servers: Vec<LinkOptions>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    pub settle: Duration,
    pub poll: Duration,
    pub cleanup: Duration,
    pub perturb_after: Duration,
    pub competing_flow: Duration,
    pub kill_grace: Duration,
    pub marker_poll: Duration,
    pub bandwidth_drop_polls: u32,
    pub bandwidth_drop_mbit: f64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(3),
            poll: Duration::from_secs(2),
            cleanup: Duration::from_secs(1),
            perturb_after: Duration::from_secs(10),
            competing_flow: Duration::from_secs(20),
            kill_grace: Duration::from_secs(2),
            marker_poll: Duration::from_secs(10),
            bandwidth_drop_polls: 5,
            bandwidth_drop_mbit: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub version: u32,
    pub seed: Option<u64>,
    pub client_bin: PathBuf,
    pub server_bin: PathBuf,
    pub config_dir: PathBuf,
    pub output_dir: PathBuf,
    pub result_dir: PathBuf,
    pub trace_glob: String,
    pub mpd_trace_glob: String,
    pub capture_file: PathBuf,
    pub namespace_prefix: String,
    /// Program and leading arguments; the trace path is appended.
    pub scorer: Vec<String>,
    pub timing: Timing,
    pub client_port: u16,
    pub server_port: u16,
    pub scenarios: BTreeMap<ScenarioKind, ScenarioOverrideInput>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            seed: None,
            client_bin: PathBuf::from("./MPDtest"),
            server_bin: PathBuf::from("./bin/servertest"),
            config_dir: PathBuf::from("./config"),
            output_dir: PathBuf::from("."),
            result_dir: PathBuf::from("trace"),
            trace_glob: "./MPDTrace_*.txt".to_string(),
            mpd_trace_glob: "./MPDTrace.txt".to_string(),
            capture_file: PathBuf::from("tcpflow.pcap"),
            namespace_prefix: "mpd".to_string(),
            scorer: vec!["python".to_string(), "../tools/get_score.py".to_string()],
            timing: Timing::default(),
            client_port: 48888,
            server_port: 41111,
            scenarios: BTreeMap::new(),
        }
    }
}

impl HarnessConfigInput {
    pub fn resolve(self) -> Result<HarnessConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let d = HarnessConfig::default();
        let t = self.timing;
        let ms = |v: Option<u64>, default: Duration| v.map(Duration::from_millis).unwrap_or(default);
        let timing = Timing {
            settle: ms(t.settle_ms, d.timing.settle),
            poll: ms(t.poll_ms, d.timing.poll),
            cleanup: ms(t.cleanup_ms, d.timing.cleanup),
            perturb_after: ms(t.perturb_after_ms, d.timing.perturb_after),
            competing_flow: t
                .competing_flow_secs
                .map(Duration::from_secs)
                .unwrap_or(d.timing.competing_flow),
            kill_grace: ms(t.kill_grace_ms, d.timing.kill_grace),
            marker_poll: ms(t.marker_poll_ms, d.timing.marker_poll),
            bandwidth_drop_polls: t.bandwidth_drop_polls.unwrap_or(d.timing.bandwidth_drop_polls),
            bandwidth_drop_mbit: t.bandwidth_drop_mbit.unwrap_or(d.timing.bandwidth_drop_mbit),
        };

        let scorer = match self.scorer {
            Some(cmd) if cmd.is_empty() => return Err(ConfigError::EmptyScorer),
            Some(cmd) => cmd,
            None => d.scorer,
        };

        let mut scenarios = BTreeMap::new();
        for (name, over) in self.scenarios {
            let kind = ScenarioKind::from_name(name.trim())
                .ok_or_else(|| ConfigError::UnknownScenario(name.clone()))?;
            scenarios.insert(kind, over);
        }

        Ok(HarnessConfig {
            version,
            seed: self.seed,
            client_bin: self.binaries.client.unwrap_or(d.client_bin),
            server_bin: self.binaries.server.unwrap_or(d.server_bin),
            config_dir: self.paths.config_dir.unwrap_or(d.config_dir),
            output_dir: self.paths.output_dir.unwrap_or(d.output_dir),
            result_dir: self.paths.result_dir.unwrap_or(d.result_dir),
            trace_glob: self.paths.trace_glob.unwrap_or(d.trace_glob),
            mpd_trace_glob: self.paths.mpd_trace_glob.unwrap_or(d.mpd_trace_glob),
            capture_file: self.paths.capture_file.unwrap_or(d.capture_file),
            namespace_prefix: self.paths.namespace_prefix.unwrap_or(d.namespace_prefix),
            scorer,
            timing,
            client_port: self.ports.client.unwrap_or(d.client_port),
            server_port: self.ports.server.unwrap_or(d.server_port),
            scenarios,
        })
    }
}

impl HarnessConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(HarnessConfig::default());
        }
        let parsed: HarnessConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Default link options for `kind` with this config's overrides applied.
    pub fn scenario_options(&self, kind: ScenarioKind) -> ScenarioOptions {
        let Some(over) = self.scenarios.get(&kind) else {
            return ScenarioOptions::defaults(kind);
        };

        let mut opts = match (kind, over.server_count) {
            (ScenarioKind::Mpd, Some(n)) => ScenarioOptions::mpd(n),
            (_, Some(n)) => {
                let mut opts = ScenarioOptions::defaults(kind);
                opts.servers.resize_with(n, LinkOptions::new);
                opts
            }
            (_, None) => ScenarioOptions::defaults(kind),
        };

        if let Some(client) = &over.client_link {
            opts.client_link = opts.client_link.merged(client);
        }
        merge_by_index(&mut opts.bottlenecks, &over.bottlenecks);
        merge_by_index(&mut opts.servers, &over.servers);
        opts
    }
}

fn merge_by_index(base: &mut Vec<LinkOptions>, overrides: &[LinkOptions]) {
    for (idx, over) in overrides.iter().enumerate() {
        match base.get_mut(idx) {
            Some(slot) => *slot = slot.merged(over),
            None => base.push(over.clone()),
        }
    }
}
