//! Driver runs against a local emulator that starts every process directly
//! on this machine, so no privileges are needed.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use mpd_harness::config::Timing;
use mpd_harness::{run_scenario, HarnessConfig, TaskOutcome};
use mpd_netsim::{Emulator, End, LinkId, LinkOptions, ScenarioKind, Topology};

/// Scripts are written and executed by the same thread only.
static SERIAL: Mutex<()> = Mutex::new(());

#[derive(Clone, Default)]
struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.all().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

struct LocalEmulator {
    topology: Option<Topology>,
    events: Events,
    /// `tshark.sh` and `iperf.sh` stand in for the real tools.
    tools: PathBuf,
    iperf_client_missing: bool,
}

impl LocalEmulator {
    fn resolve(&self, host: &str, program: &str, args: &[String]) -> Result<PathBuf> {
        match program {
            "iperf" if self.iperf_client_missing && args.first().is_some_and(|a| a == "-c") => {
                bail!("iperf client unavailable on {host}")
            }
            "iperf" => Ok(self.tools.join("iperf.sh")),
            "tshark" => Ok(self.tools.join("tshark.sh")),
            other => Ok(PathBuf::from(other)),
        }
    }
}

impl Emulator for LocalEmulator {
    fn start(&mut self, topology: &Topology) -> Result<()> {
        self.topology = Some(topology.clone());
        self.events.push("start".into());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.topology.take().is_some() {
            self.events.push("stop".into());
        }
        Ok(())
    }

    fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }

    fn spawn(&self, host: &str, program: &str, args: &[String], stdout: Stdio) -> Result<Child> {
        self.events.push(format!("spawn {host}"));
        let path = self.resolve(host, program, args)?;
        let child = Command::new(&path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .process_group(0)
            .spawn()
            .with_context(|| format!("spawn {program}"))?;
        self.events.push(format!("pid {program} {}", child.id()));
        Ok(child)
    }

    fn exec(&self, host: &str, program: &str, _args: &[&str]) -> Result<Output> {
        self.events.push(format!("exec {host} {program}"));
        Ok(Command::new("true").output()?)
    }

    fn delete_link(&mut self, link: LinkId) -> Result<()> {
        let topo = self.topology.as_ref().context("not running")?;
        let l = topo.link(link)?;
        self.events.push(format!("delete {} {}", l.a.node, l.b.node));
        Ok(())
    }

    fn set_bandwidth(&mut self, link: LinkId, _end: End, bw_mbit: f64) -> Result<()> {
        self.events.push(format!("bandwidth {} {bw_mbit}", link.0));
        Ok(())
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    events: Events,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            &dir.path().join("server.sh"),
            "echo \"server $$ $1\"\nexec sleep 30\n",
        );
        write_script(
            &dir.path().join("client.sh"),
            "echo \"client $1\"\nsleep 0.3\necho \"test finished\"\n",
        );
        Self {
            dir,
            events: Events::default(),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn config(&self) -> HarnessConfig {
        HarnessConfig {
            seed: Some(3),
            client_bin: self.path().join("client.sh"),
            server_bin: self.path().join("server.sh"),
            config_dir: self.path().join("config"),
            output_dir: self.path().to_path_buf(),
            result_dir: self.path().join("trace"),
            timing: Timing {
                settle: Duration::from_millis(200),
                poll: Duration::from_millis(20),
                cleanup: Duration::from_millis(10),
                perturb_after: Duration::from_millis(0),
                competing_flow: Duration::from_secs(1),
                kill_grace: Duration::from_millis(500),
                marker_poll: Duration::from_millis(50),
                bandwidth_drop_polls: 1000,
                bandwidth_drop_mbit: 1.0,
            },
            ..Default::default()
        }
    }

    fn emulator(&self) -> LocalEmulator {
        LocalEmulator {
            topology: None,
            events: self.events.clone(),
            tools: self.path().to_path_buf(),
            iperf_client_missing: false,
        }
    }

    /// Installs stand-ins for tshark and iperf. `iperf -s` runs until
    /// killed; `iperf -c` finishes after a short transfer.
    fn with_tools(self) -> Self {
        write_script(&self.path().join("tshark.sh"), "exec sleep 30\n");
        write_script(
            &self.path().join("iperf.sh"),
            "if [ \"$1\" = \"-s\" ]; then exec sleep 30; fi\nsleep 0.2\necho \"0.0-1.0 sec 1 MBytes\"\n",
        );
        self
    }

    /// Pids of every `program` the emulator started.
    fn pids(&self, program: &str) -> Vec<u32> {
        let prefix = format!("pid {program} ");
        self.events
            .all()
            .iter()
            .filter_map(|e| e.strip_prefix(&prefix))
            .map(|pid| pid.parse().unwrap())
            .collect()
    }

    /// Pids the server scripts reported on their first line.
    fn server_pids(&self, count: usize) -> Vec<u32> {
        (0..count)
            .map(|idx| {
                let out = std::fs::read_to_string(self.path().join(format!("server{idx}stdout")))
                    .unwrap();
                out.split_whitespace().nth(1).unwrap().parse().unwrap()
            })
            .collect()
    }
}

fn write_script(path: &PathBuf, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn assert_dead(pid: u32) {
    assert!(
        !Path::new(&format!("/proc/{pid}")).exists(),
        "process {pid} still alive"
    );
}

#[test]
fn single_bottleneck_runs_and_tears_down() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let cfg = fx.config();

    let report = run_scenario(&cfg, ScenarioKind::SingleBottleneck, fx.emulator()).unwrap();

    assert_eq!(report.clients.len(), 1);
    let client = &report.clients[0];
    assert_eq!(client.name, "client");
    assert!(client.status.unwrap().success());
    let client_out = std::fs::read_to_string(&client.output).unwrap();
    assert!(client_out.contains("downnode_mn.json"), "{client_out}");
    assert_eq!(report.perturbation, None);

    let events = fx.events.all();
    assert_eq!(events.first().map(String::as_str), Some("start"));
    assert_eq!(events.last().map(String::as_str), Some("stop"));
    assert_eq!(fx.events.count("spawn server"), 4);
    assert_eq!(fx.events.count("spawn client"), 1);

    for idx in 0..4 {
        assert!(fx.path().join(format!("config/upnode_mn{idx}.json")).exists());
    }
    for pid in fx.server_pids(4) {
        assert_dead(pid);
    }
}

#[test]
fn failed_client_start_still_cleans_up() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let mut cfg = fx.config();
    cfg.client_bin = fx.path().join("missing-client");

    let err = run_scenario(&cfg, ScenarioKind::SingleBottleneck, fx.emulator()).unwrap_err();
    assert!(format!("{err:#}").contains("start client"), "{err:#}");

    assert_eq!(fx.events.all().last().map(String::as_str), Some("stop"));
    for pid in fx.server_pids(4) {
        assert_dead(pid);
    }
}

#[test]
fn link_failure_removes_one_server_link() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let cfg = fx.config();

    let report = run_scenario(&cfg, ScenarioKind::LinkFailure, fx.emulator()).unwrap();

    assert_eq!(report.perturbation, Some(TaskOutcome::Fired));
    let deletes: Vec<String> = fx
        .events
        .all()
        .into_iter()
        .filter(|e| e.starts_with("delete"))
        .collect();
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].starts_with("delete server"), "{deletes:?}");
    // two full ping rounds between five hosts
    assert_eq!(fx.events.count("exec"), 40);
}

#[test]
fn perturbation_is_cancelled_when_clients_finish_first() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let mut cfg = fx.config();
    cfg.timing.perturb_after = Duration::from_secs(60);

    let started = Instant::now();
    let report = run_scenario(&cfg, ScenarioKind::LinkFailure, fx.emulator()).unwrap();

    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(report.perturbation, Some(TaskOutcome::Cancelled));
    assert_eq!(fx.events.count("delete"), 0);
    assert_eq!(fx.events.count("exec"), 0);
}

#[test]
fn two_clients_use_their_own_configs() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let cfg = fx.config();

    let report = run_scenario(&cfg, ScenarioKind::TwoClients, fx.emulator()).unwrap();

    assert_eq!(report.clients.len(), 2);
    for (client, suffix) in report.clients.iter().zip(["1", "2"]) {
        assert_eq!(client.output, fx.path().join(format!("client{suffix}_stdout")));
        let out = std::fs::read_to_string(&client.output).unwrap();
        assert!(out.contains(&format!("downnode_mn{suffix}.json")), "{out}");
    }
    let second: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(fx.path().join("config/downnode_mn2.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(second["IP"], "10.100.0.2");
    assert!(second["selfpeerID"].as_str().unwrap().ends_with("FE"));
}

#[test]
fn mpd_scenario_waits_for_finish_marker() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    let toml = r#"
        [scenarios.mpd]
        server_count = 2
        client_link = { bw_mbit = 50.0 }
    "#;
    let overrides = HarnessConfig::from_toml_str(toml).unwrap();
    let mut cfg = fx.config();
    cfg.scenarios = overrides.scenarios;

    let report = run_scenario(&cfg, ScenarioKind::Mpd, fx.emulator()).unwrap();

    assert_eq!(fx.events.count("spawn server"), 2);
    assert_eq!(report.perturbation, Some(TaskOutcome::Cancelled));
    let out = std::fs::read_to_string(&report.clients[0].output).unwrap();
    assert!(out.trim_end().ends_with("test finished"));
}

#[test]
fn mpd_scenario_drops_bottleneck_bandwidth_on_schedule() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new();
    write_script(
        &fx.path().join("client.sh"),
        "echo \"client $1\"\nsleep 0.6\necho \"test finished\"\n",
    );
    let mut cfg = fx.config();
    cfg.timing.bandwidth_drop_polls = 1;
    cfg.scenarios.insert(
        ScenarioKind::Mpd,
        mpd_harness::config::ScenarioOverrideInput {
            server_count: Some(1),
            bottlenecks: vec![LinkOptions::new().bw(4.0)],
            ..Default::default()
        },
    );

    let report = run_scenario(&cfg, ScenarioKind::Mpd, fx.emulator()).unwrap();

    assert_eq!(report.perturbation, Some(TaskOutcome::Fired));
    assert_eq!(fx.events.count("bandwidth"), 1);
    assert!(fx.events.all().iter().any(|e| e.ends_with(" 1")));
}

#[test]
fn competing_flow_stops_capture_and_iperf() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new().with_tools();
    let cfg = fx.config();

    let report = run_scenario(&cfg, ScenarioKind::CompetingFlow, fx.emulator()).unwrap();

    assert_eq!(report.perturbation, Some(TaskOutcome::Fired));
    let tshark = fx.pids("tshark");
    let iperf = fx.pids("iperf");
    assert_eq!(tshark.len(), 1);
    assert_eq!(iperf.len(), 2);
    for pid in tshark.into_iter().chain(iperf) {
        assert_dead(pid);
    }
    assert_eq!(fx.events.all().last().map(String::as_str), Some("stop"));
}

#[test]
fn failed_iperf_client_leaves_no_process_behind() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let fx = Fixture::new().with_tools();
    let cfg = fx.config();
    let mut emulator = fx.emulator();
    emulator.iperf_client_missing = true;

    let err = run_scenario(&cfg, ScenarioKind::CompetingFlow, emulator).unwrap_err();
    assert!(format!("{err:#}").contains("iperf client unavailable"), "{err:#}");

    let iperf = fx.pids("iperf");
    assert_eq!(iperf.len(), 1, "only the receiver should have started");
    let spawned: Vec<u32> = iperf
        .into_iter()
        .chain(fx.pids("tshark"))
        .chain(fx.server_pids(4))
        .collect();
    for pid in spawned {
        assert_dead(pid);
    }
    assert_eq!(fx.events.all().last().map(String::as_str), Some("stop"));
}
