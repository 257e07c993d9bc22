//! Running one scenario end to end.
//!
//! Order of a run: node configs, network up, servers, settle, capture,
//! clients, perturbation task, wait. Teardown always runs afterwards, in
//! order: cancel and join the task, stop the capture, kill every process,
//! pause, stop the network.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use mpd_netsim::scenarios::{self, ScenarioKind, ScenarioTopology};
use mpd_netsim::{Emulator, End, LinkId};
use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::nodes::{client_suffix, downnode_path, upnode_path, write_node_configs, ClientSpec, Ports};
use crate::process::{output_file, ManagedProcess, ProcessGroup};
use crate::schedule::{ScheduledTask, TaskOutcome};

/// Text the client prints as its last line once a legacy run is complete.
pub const FINISH_MARKER: &str = "test finished";

const CAPTURE_LABEL: &str = "tshark";

/// How the driver decides the clients are done.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitPolicy {
    /// Poll until every client process has exited.
    ClientsExit { poll: Duration },
    /// Poll until the last line of `file` contains `marker`.
    Marker {
        file: PathBuf,
        marker: String,
        poll: Duration,
    },
}

/// The one-shot mid-run change a scenario applies.
#[derive(Debug, Clone, PartialEq)]
pub enum Perturbation {
    /// A TCP transfer between the competing host pair.
    CompetingFlow {
        sender: String,
        receiver: String,
        duration: Duration,
    },
    /// Remove one of `candidates`, chosen with `seed`.
    RemoveLink { candidates: Vec<LinkId>, seed: u64 },
    /// Re-shape one link end to a lower rate.
    BandwidthDrop { link: LinkId, end: End, bw_mbit: f64 },
}

impl Perturbation {
    /// The perturbation `scenario` calls for and its delay from client start.
    pub fn for_scenario(
        scenario: &ScenarioTopology,
        cfg: &HarnessConfig,
    ) -> Option<(Perturbation, Duration)> {
        let timing = &cfg.timing;
        match scenario.kind {
            ScenarioKind::CompetingFlow | ScenarioKind::DualBottleneck => {
                let (sender, receiver) = scenario.competing.clone()?;
                let flow = Perturbation::CompetingFlow {
                    sender,
                    receiver,
                    duration: timing.competing_flow,
                };
                Some((flow, timing.perturb_after))
            }
            ScenarioKind::LinkFailure => {
                let candidates = scenario.topology.links_touching(&scenario.servers);
                let seed = cfg.seed.unwrap_or_else(rand::random);
                Some((
                    Perturbation::RemoveLink { candidates, seed },
                    timing.perturb_after,
                ))
            }
            ScenarioKind::Mpd => {
                let bottleneck = scenario.bottlenecks.first()?;
                let drop = Perturbation::BandwidthDrop {
                    link: bottleneck.right,
                    end: End::B,
                    bw_mbit: timing.bandwidth_drop_mbit,
                };
                Some((drop, timing.marker_poll * timing.bandwidth_drop_polls))
            }
            ScenarioKind::SingleBottleneck | ScenarioKind::TwoClients => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Perturbation::CompetingFlow { .. } => "competing-flow",
            Perturbation::RemoveLink { .. } => "remove-link",
            Perturbation::BandwidthDrop { .. } => "bandwidth-drop",
        }
    }

    pub fn apply<E: Emulator>(self, emulator: &Mutex<E>) -> Result<()> {
        match self {
            Perturbation::CompetingFlow {
                sender,
                receiver,
                duration,
            } => run_competing_flow(emulator, &sender, &receiver, duration),
            Perturbation::RemoveLink { candidates, seed } => {
                if candidates.is_empty() {
                    bail!("no link to remove");
                }
                lock(emulator)?.ping_all()?;
                let mut rng = StdRng::seed_from_u64(seed);
                let victim = candidates[rng.random_range(0..candidates.len())];
                {
                    let mut emu = lock(emulator)?;
                    if let Some(link) = emu.topology().and_then(|t| t.link(victim).ok()) {
                        info!(a = %link.a.node, b = %link.b.node, seed, "removing link");
                    }
                    emu.delete_link(victim)?;
                }
                lock(emulator)?.ping_all()?;
                Ok(())
            }
            Perturbation::BandwidthDrop { link, end, bw_mbit } => {
                lock(emulator)?.set_bandwidth(link, end, bw_mbit)
            }
        }
    }
}

fn run_competing_flow<E: Emulator>(
    emulator: &Mutex<E>,
    sender: &str,
    receiver: &str,
    duration: Duration,
) -> Result<()> {
    // receiver must be owned before the sender starts
    let (_server, client) = {
        let emu = lock(emulator)?;
        let target = emu
            .host_ip(receiver)
            .ok_or_else(|| anyhow!("'{receiver}' has no address"))?
            .to_string();
        let server = emu
            .spawn(receiver, "iperf", &["-s".to_string()], Stdio::null())
            .with_context(|| format!("start iperf server on '{receiver}'"))?;
        let server = ManagedProcess::new("iperf-server", server, None);
        let args = [
            "-c".to_string(),
            target,
            "-t".to_string(),
            duration.as_secs().to_string(),
        ];
        let client = emu
            .spawn(sender, "iperf", &args, Stdio::piped())
            .with_context(|| format!("start iperf client on '{sender}'"))?;
        (server, client)
    };

    info!(%sender, %receiver, secs = duration.as_secs(), "competing TCP flow started");
    let output = client.wait_with_output().context("wait for iperf client")?;
    let report = String::from_utf8_lossy(&output.stdout);
    let summary = report.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    info!(status = %output.status, report = summary.trim(), "competing TCP flow finished");
    Ok(())
}

fn lock<E>(emulator: &Mutex<E>) -> Result<MutexGuard<'_, E>> {
    emulator
        .lock()
        .map_err(|_| anyhow!("emulator lock poisoned"))
}

/// What happened in one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub kind: ScenarioKind,
    pub clients: Vec<ClientResult>,
    /// `None` when the scenario has no perturbation or it never started.
    pub perturbation: Option<TaskOutcome>,
}

#[derive(Debug, Clone)]
pub struct ClientResult {
    pub name: String,
    pub output: PathBuf,
    pub status: Option<ExitStatus>,
}

/// Runs scenario `kind` on `emulator`, tearing everything down before
/// returning, on success and on error alike.
pub fn run_scenario<E>(cfg: &HarnessConfig, kind: ScenarioKind, emulator: E) -> Result<RunReport>
where
    E: Emulator + Send + 'static,
{
    let opts = cfg.scenario_options(kind);
    let scenario =
        scenarios::build(kind, &opts).with_context(|| format!("build scenario {kind}"))?;

    let clients = scenario
        .clients
        .iter()
        .map(|name| {
            let ip = scenario
                .topology
                .host_ip(name)
                .ok_or_else(|| anyhow!("client '{name}' has no address"))?;
            Ok(ClientSpec {
                name: name.clone(),
                ip,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let ports = Ports {
        client: cfg.client_port,
        server: cfg.server_port,
    };
    write_node_configs(&cfg.config_dir, &clients, scenario.servers.len(), ports)?;

    info!(
        scenario = %kind,
        servers = scenario.servers.len(),
        clients = clients.len(),
        "starting scenario"
    );
    let emulator = Arc::new(Mutex::new(emulator));
    lock(&emulator)?
        .start(&scenario.topology)
        .with_context(|| format!("start network for {kind}"))?;

    let mut run = ScenarioRun {
        cfg,
        scenario,
        emulator,
        procs: ProcessGroup::new(cfg.timing.kill_grace),
        task: None,
        client_outputs: Vec::new(),
    };
    let result = run.execute();
    let perturbation = run.teardown();

    let clients = run
        .client_outputs
        .iter()
        .map(|(name, output)| ClientResult {
            name: name.clone(),
            output: output.clone(),
            status: run.procs.iter().find(|p| p.label() == name).and_then(|p| p.status()),
        })
        .collect();

    result?;
    Ok(RunReport {
        kind,
        clients,
        perturbation: perturbation?,
    })
}

struct ScenarioRun<'a, E: Emulator + Send + 'static> {
    cfg: &'a HarnessConfig,
    scenario: ScenarioTopology,
    emulator: Arc<Mutex<E>>,
    procs: ProcessGroup,
    task: Option<ScheduledTask>,
    client_outputs: Vec<(String, PathBuf)>,
}

impl<E: Emulator + Send + 'static> ScenarioRun<'_, E> {
    fn execute(&mut self) -> Result<()> {
        self.start_servers()?;
        thread::sleep(self.cfg.timing.settle);

        if self.scenario.kind.has_competing_flow() {
            if let Err(err) = self.start_capture() {
                warn!(error = %err, "packet capture not started");
            }
        }

        self.start_clients()?;
        if let Some((perturbation, delay)) = Perturbation::for_scenario(&self.scenario, self.cfg) {
            let emulator = self.emulator.clone();
            let name = perturbation.name();
            self.task = Some(ScheduledTask::spawn(name, delay, move || {
                perturbation.apply(&emulator)
            })?);
        }

        self.wait(self.wait_policy())
    }

    fn wait_policy(&self) -> WaitPolicy {
        match (self.scenario.kind, self.client_outputs.first()) {
            (ScenarioKind::Mpd, Some((_, output))) => WaitPolicy::Marker {
                file: output.clone(),
                marker: FINISH_MARKER.to_string(),
                poll: self.cfg.timing.marker_poll,
            },
            _ => WaitPolicy::ClientsExit {
                poll: self.cfg.timing.poll,
            },
        }
    }

    fn start_servers(&mut self) -> Result<()> {
        let program = self.cfg.server_bin.to_string_lossy().into_owned();
        for (idx, server) in self.scenario.servers.iter().enumerate() {
            let config = upnode_path(&self.cfg.config_dir, idx);
            let output = self.cfg.output_dir.join(format!("{server}stdout"));
            let args = [config.to_string_lossy().into_owned()];
            let child = lock(&self.emulator)?
                .spawn(server, &program, &args, output_file(&output)?)
                .with_context(|| format!("start server on '{server}'"))?;
            self.procs.push(ManagedProcess::new(server.clone(), child, Some(output)));
        }
        info!(count = self.scenario.servers.len(), "servers started");
        Ok(())
    }

    fn start_capture(&mut self) -> Result<()> {
        let Some((left, _)) = &self.scenario.competing else {
            return Ok(());
        };
        let intf = self
            .scenario
            .topology
            .host_interface(left)
            .ok_or_else(|| anyhow!("'{left}' has no interface"))?
            .to_string();
        let args = [
            "-i".to_string(),
            intf.clone(),
            "-f".to_string(),
            "tcp".to_string(),
            "-w".to_string(),
            self.cfg.capture_file.to_string_lossy().into_owned(),
        ];
        let child = lock(&self.emulator)?.spawn(left, "tshark", &args, Stdio::null())?;
        self.procs.push(ManagedProcess::new(CAPTURE_LABEL, child, None));
        info!(%intf, file = %self.cfg.capture_file.display(), "packet capture started");
        Ok(())
    }

    fn start_clients(&mut self) -> Result<()> {
        let program = self.cfg.client_bin.to_string_lossy().into_owned();
        for client in self.scenario.clients.clone() {
            let config = downnode_path(&self.cfg.config_dir, client_suffix(&client));
            let output = self.cfg.output_dir.join(format!("{client}_stdout"));
            let args = [config.to_string_lossy().into_owned()];
            let child = lock(&self.emulator)?
                .spawn(&client, &program, &args, output_file(&output)?)
                .with_context(|| format!("start client on '{client}'"))?;
            info!(%client, pid = child.id(), "client started");
            self.procs.push(ManagedProcess::new(client.clone(), child, Some(output.clone())));
            self.client_outputs.push((client, output));
        }
        Ok(())
    }

    fn wait(&mut self, policy: WaitPolicy) -> Result<()> {
        let clients: Vec<String> = self.client_outputs.iter().map(|(n, _)| n.clone()).collect();
        match policy {
            WaitPolicy::ClientsExit { poll } => {
                while self.procs.any_running(&clients)? {
                    thread::sleep(poll);
                }
                info!("all clients exited");
                Ok(())
            }
            WaitPolicy::Marker { file, marker, poll } => loop {
                // checked before reading so a client that just exited has
                // its final line on disk
                let running = self.procs.any_running(&clients)?;
                let last = last_line(&file)?;
                info!(line = %last, "client status");
                if last.contains(&marker) {
                    return Ok(());
                }
                if !running {
                    bail!("client exited without printing '{marker}'");
                }
                thread::sleep(poll);
            },
        }
    }

    /// Returns the perturbation outcome; errors only after every resource
    /// has been released.
    fn teardown(&mut self) -> Result<Option<TaskOutcome>> {
        let outcome = self.task.take().map(ScheduledTask::cancel_and_join).transpose();
        if let Err(err) = &outcome {
            warn!(error = %format!("{err:#}"), "perturbation task failed");
        }

        self.procs.stop(CAPTURE_LABEL);
        self.procs.shutdown();
        thread::sleep(self.cfg.timing.cleanup);

        match lock(&self.emulator) {
            Ok(mut emu) => {
                if let Err(err) = emu.stop() {
                    warn!(error = %format!("{err:#}"), "failed to stop network");
                }
            }
            Err(err) => warn!(error = %err, "network not stopped"),
        }
        info!(scenario = %self.scenario.kind, "scenario torn down");
        outcome
    }
}

fn last_line(path: &std::path::Path) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .to_string())
}
