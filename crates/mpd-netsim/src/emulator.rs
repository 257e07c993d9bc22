//! Realizing a [`Topology`] as a live network.
//!
//! [`Emulator`] is the seam between the harness and whatever carries the
//! packets. [`NetnsEmulator`] builds the network out of Linux primitives:
//! one namespace per host, one bridge per switch (root namespace), one veth
//! pair per link and a `tc netem` qdisc per shaped interface.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::process::{Child, Output, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use crate::namespace::{sudo, sudo_checked, Namespace, Scope};
use crate::shaping::apply_shaping;
use crate::topology::{End, LinkEnd, LinkId, Topology};

/// Prefix length given to every host address; all hosts share one subnet.
pub const HOST_PREFIX_LEN: u8 = 8;

/// Outcome of pinging every host from every other host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingSummary {
    pub sent: usize,
    pub received: usize,
}

impl PingSummary {
    pub fn dropped_percent(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        100.0 * (self.sent - self.received) as f64 / self.sent as f64
    }
}

pub trait Emulator {
    /// Brings the whole topology up.
    fn start(&mut self, topology: &Topology) -> Result<()>;

    /// Tears everything down. Safe to call more than once.
    fn stop(&mut self) -> Result<()>;

    /// The topology as currently running, including runtime changes.
    fn topology(&self) -> Option<&Topology>;

    /// Starts `program` on `host` without waiting for it.
    fn spawn(&self, host: &str, program: &str, args: &[String], stdout: Stdio) -> Result<Child>;

    /// Runs `program` on `host` to completion.
    fn exec(&self, host: &str, program: &str, args: &[&str]) -> Result<Output>;

    fn delete_link(&mut self, link: LinkId) -> Result<()>;

    /// Re-shapes one end of `link` with a new rate, keeping its other params.
    fn set_bandwidth(&mut self, link: LinkId, end: End, bw_mbit: f64) -> Result<()>;

    fn host_ip(&self, host: &str) -> Option<Ipv4Addr> {
        self.topology().and_then(|t| t.host_ip(host))
    }

    /// One ping from every host to every other host.
    fn ping_all(&self) -> Result<PingSummary> {
        let topo = self
            .topology()
            .ok_or_else(|| anyhow!("network is not running"))?;
        let hosts: Vec<(String, Ipv4Addr)> = topo
            .hosts()
            .filter_map(|h| h.ip().map(|ip| (h.name.clone(), ip)))
            .collect();

        let mut summary = PingSummary::default();
        for (src, _) in &hosts {
            for (dst, ip) in &hosts {
                if src == dst {
                    continue;
                }
                let target = ip.to_string();
                let out = self.exec(src, "ping", &["-c", "1", "-W", "1", &target])?;
                summary.sent += 1;
                if out.status.success() {
                    summary.received += 1;
                } else {
                    debug!(%src, %dst, "ping failed");
                }
            }
        }
        info!(
            sent = summary.sent,
            received = summary.received,
            dropped_percent = summary.dropped_percent(),
            "ping all hosts"
        );
        Ok(summary)
    }
}

struct Running {
    topology: Topology,
    namespaces: BTreeMap<String, Namespace>,
    bridges: Vec<String>,
    removed: BTreeSet<LinkId>,
}

/// Emulator backed by network namespaces, Linux bridges and `tc netem`.
///
/// Namespaces are named `<prefix>-<host>`. Interfaces keep their topology
/// names, so they must fit the 15 character netdev limit.
pub struct NetnsEmulator {
    prefix: String,
    running: Option<Running>,
}

impl NetnsEmulator {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            running: None,
        }
    }

    fn running(&self) -> Result<&Running> {
        self.running
            .as_ref()
            .ok_or_else(|| anyhow!("network is not running"))
    }

    fn namespace(&self, host: &str) -> Result<&Namespace> {
        self.running()?
            .namespaces
            .get(host)
            .ok_or_else(|| anyhow!("'{host}' is not a host"))
    }

    fn bring_up(&self, running: &mut Running, topology: &Topology) -> Result<()> {
        for node in topology.nodes() {
            if node.is_host() {
                let ns = Namespace::new(&format!("{}-{}", self.prefix, node.name))?;
                running.namespaces.insert(node.name.clone(), ns);
            } else {
                let _ = sudo(&["ip", "link", "del", &node.name]);
                sudo_checked(&["ip", "link", "add", "name", &node.name, "type", "bridge"])
                    .with_context(|| format!("create bridge '{}'", node.name))?;
                sudo_checked(&["ip", "link", "set", &node.name, "up"])?;
                running.bridges.push(node.name.clone());
            }
        }

        for link in topology.links() {
            let _ = sudo(&["ip", "link", "del", &link.a.intf]);
            sudo_checked(&[
                "ip", "link", "add", &link.a.intf, "type", "veth", "peer", "name", &link.b.intf,
            ])
            .with_context(|| format!("create veth {} <-> {}", link.a.intf, link.b.intf))?;

            for end in [&link.a, &link.b] {
                self.attach(running, topology, end)?;
            }
            debug!(a = %link.a.intf, b = %link.b.intf, "link up");
        }
        Ok(())
    }

    fn attach(&self, running: &Running, topology: &Topology, end: &LinkEnd) -> Result<()> {
        match running.namespaces.get(&end.node) {
            Some(ns) => {
                ns.adopt_interface(&end.intf)?;
                if topology.host_interface(&end.node) == Some(end.intf.as_str()) {
                    let ip = topology
                        .host_ip(&end.node)
                        .ok_or_else(|| anyhow!("host '{}' has no address", end.node))?;
                    let cidr = format!("{ip}/{HOST_PREFIX_LEN}");
                    ns.exec_checked("ip", &["addr", "add", &cidr, "dev", &end.intf])?;
                }
                ns.exec_checked("ip", &["link", "set", &end.intf, "up"])?;
                apply_shaping(Scope::Netns(ns), &end.intf, &end.params)
            }
            None => {
                sudo_checked(&["ip", "link", "set", &end.intf, "master", &end.node])
                    .with_context(|| format!("attach '{}' to bridge '{}'", end.intf, end.node))?;
                sudo_checked(&["ip", "link", "set", &end.intf, "up"])?;
                apply_shaping(Scope::Root, &end.intf, &end.params)
            }
        }
    }
}

impl Emulator for NetnsEmulator {
    fn start(&mut self, topology: &Topology) -> Result<()> {
        if self.running.is_some() {
            bail!("network is already running");
        }
        let mut running = Running {
            topology: topology.clone(),
            namespaces: BTreeMap::new(),
            bridges: Vec::new(),
            removed: BTreeSet::new(),
        };
        let result = self.bring_up(&mut running, topology);
        self.running = Some(running);
        if let Err(err) = result {
            let _ = self.stop();
            return Err(err.context("start emulated network"));
        }
        info!(
            hosts = topology.hosts().count(),
            switches = topology.switches().count(),
            links = topology.links().len(),
            "emulated network started"
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        for link in running.topology.links() {
            if running.removed.contains(&link.id) {
                continue;
            }
            // deleting a root-side end removes the pair; host-side ends go
            // with their namespace
            for end in [&link.a, &link.b] {
                if !running.namespaces.contains_key(&end.node) {
                    let _ = sudo(&["ip", "link", "del", &end.intf]);
                    break;
                }
            }
        }
        for bridge in &running.bridges {
            let _ = sudo(&["ip", "link", "del", bridge]);
        }
        drop(running.namespaces);
        info!("emulated network stopped");
        Ok(())
    }

    fn topology(&self) -> Option<&Topology> {
        self.running.as_ref().map(|r| &r.topology)
    }

    fn spawn(&self, host: &str, program: &str, args: &[String], stdout: Stdio) -> Result<Child> {
        self.namespace(host)?.spawn(program, args, stdout)
    }

    fn exec(&self, host: &str, program: &str, args: &[&str]) -> Result<Output> {
        self.namespace(host)?.exec(program, args)
    }

    fn delete_link(&mut self, link: LinkId) -> Result<()> {
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| anyhow!("network is not running"))?;
        if running.removed.contains(&link) {
            bail!("link {link:?} was already removed");
        }
        let l = running.topology.link(link)?;
        let (a, b) = (l.a.clone(), l.b.clone());
        let scope = match running.namespaces.get(&a.node) {
            Some(ns) => Scope::Netns(ns),
            None => Scope::Root,
        };
        scope
            .exec_checked("ip", &["link", "del", &a.intf])
            .with_context(|| format!("delete link {} <-> {}", a.node, b.node))?;
        running.removed.insert(link);
        info!(a = %a.node, b = %b.node, "link removed");
        Ok(())
    }

    fn set_bandwidth(&mut self, link: LinkId, end: End, bw_mbit: f64) -> Result<()> {
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| anyhow!("network is not running"))?;
        if running.removed.contains(&link) {
            warn!(?link, "bandwidth change on a removed link ignored");
            return Ok(());
        }
        let link_end = running.topology.link_mut(link)?.end_mut(end);
        link_end.params.bw_mbit = Some(bw_mbit);
        let link_end = link_end.clone();
        let scope = match running.namespaces.get(&link_end.node) {
            Some(ns) => Scope::Netns(ns),
            None => Scope::Root,
        };
        apply_shaping(scope, &link_end.intf, &link_end.params)?;
        info!(intf = %link_end.intf, bw_mbit, "bandwidth changed");
        Ok(())
    }
}

impl Drop for NetnsEmulator {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
