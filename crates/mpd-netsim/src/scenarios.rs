//! # Test Scenarios
//!
//! Fixed topologies the harness runs the transport through:
//! - **Single bottleneck**: client and servers on either side of one shaped link
//! - **Competing flow**: as above, plus a host pair for a competing TCP flow
//! - **Dual bottleneck**: two parallel bottleneck paths, servers split across them
//! - **Two clients**: two clients sharing one bottleneck
//! - **Link failure**: single bottleneck, one server link removed mid-run
//! - **Mpd**: many servers behind one bottleneck, bandwidth dropped mid-run
//!
//! Every builder is deterministic: the same [`ScenarioOptions`] always yield
//! the same node names, interface names and link order.

use std::fmt;
use std::net::Ipv4Addr;

use crate::options::{IntfParams, LinkOptions};
use crate::topology::{BridgeAllocator, ShapedLink, Topology, TopologyBuilder, TopologyError};

pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 100, 0, 1);
pub const COMPETING_LEFT_IP: Ipv4Addr = Ipv4Addr::new(10, 240, 1, 1);
pub const COMPETING_RIGHT_IP: Ipv4Addr = Ipv4Addr::new(10, 240, 1, 2);
pub const COMPETING_LEFT: &str = "tcp_left";
pub const COMPETING_RIGHT: &str = "tcp_right";

/// Server count of the [`ScenarioKind::Mpd`] topology unless overridden.
pub const MPD_DEFAULT_SERVERS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScenarioKind {
    SingleBottleneck,
    CompetingFlow,
    DualBottleneck,
    TwoClients,
    LinkFailure,
    Mpd,
}

impl ScenarioKind {
    /// The numbered test cases, in run order.
    pub const NUMBERED: [ScenarioKind; 5] = [
        ScenarioKind::SingleBottleneck,
        ScenarioKind::CompetingFlow,
        ScenarioKind::DualBottleneck,
        ScenarioKind::TwoClients,
        ScenarioKind::LinkFailure,
    ];

    /// 1-based test case number; `None` for the legacy topology.
    pub fn number(self) -> Option<usize> {
        Self::NUMBERED.iter().position(|k| *k == self).map(|i| i + 1)
    }

    pub fn from_number(n: usize) -> Option<Self> {
        n.checked_sub(1).and_then(|i| Self::NUMBERED.get(i).copied())
    }

    pub fn name(self) -> &'static str {
        match self {
            ScenarioKind::SingleBottleneck => "single_bottleneck",
            ScenarioKind::CompetingFlow => "competing_flow",
            ScenarioKind::DualBottleneck => "dual_bottleneck",
            ScenarioKind::TwoClients => "two_clients",
            ScenarioKind::LinkFailure => "link_failure",
            ScenarioKind::Mpd => "mpd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::NUMBERED
            .into_iter()
            .chain([ScenarioKind::Mpd])
            .find(|k| k.name() == name)
    }

    pub fn has_competing_flow(self) -> bool {
        matches!(
            self,
            ScenarioKind::CompetingFlow | ScenarioKind::DualBottleneck
        )
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Link option records for one scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioOptions {
    pub client_link: LinkOptions,
    /// One record per bottleneck; the dual-bottleneck topology uses two.
    pub bottlenecks: Vec<LinkOptions>,
    /// One record per server.
    pub servers: Vec<LinkOptions>,
}

impl ScenarioOptions {
    pub fn defaults(kind: ScenarioKind) -> Self {
        let servers = vec![
            LinkOptions::new().delay(5),
            LinkOptions::new().delay(10),
            LinkOptions::new().delay(15),
            LinkOptions::new().delay(20),
        ];
        let bottleneck = LinkOptions::new().bw(10.0).delay(30).loss(1.0, 1.0).queue(100);
        match kind {
            ScenarioKind::DualBottleneck => ScenarioOptions {
                client_link: LinkOptions::new().bw(1000.0).delay(10).queue(1000),
                bottlenecks: vec![
                    LinkOptions::new().bw(3.5).delay(30).loss(1.0, 1.0).queue(20),
                    LinkOptions::new().bw(1.5).delay(30).loss(1.0, 1.0).queue(20),
                ],
                servers,
            },
            ScenarioKind::Mpd => Self::mpd(MPD_DEFAULT_SERVERS),
            _ => ScenarioOptions {
                client_link: LinkOptions::new().bw(1000.0).delay(10).queue(200),
                bottlenecks: vec![bottleneck],
                servers,
            },
        }
    }

    /// The legacy topology: per-server 5 Mbit links with growing delay and a
    /// bottleneck sized at 10 Mbit per server.
    pub fn mpd(server_count: usize) -> Self {
        ScenarioOptions {
            client_link: LinkOptions::new().bw(100.0),
            bottlenecks: vec![LinkOptions::new()
                .bw(10.0 * server_count as f64)
                .delay(25)
                .loss(1.0, 1.0)
                .queue(100)],
            servers: (0..server_count)
                .map(|idx| {
                    LinkOptions::new()
                        .bw(5.0)
                        .delay(20 + 5 * idx as u32)
                        .loss(1.0, 1.0)
                        .queue(100)
                })
                .collect(),
        }
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Server link record with the default delay filled in: server `idx`
    /// gets `5 * (idx + 1)` ms, so delays grow strictly with the index.
    pub fn server_link(&self, idx: usize) -> LinkOptions {
        let mut opts = self.servers[idx].clone();
        if opts.delay_ms.is_none() {
            opts.delay_ms = Some(5 * (idx as u32 + 1));
        }
        opts
    }

    fn bottleneck(&self, idx: usize) -> LinkOptions {
        self.bottlenecks.get(idx).cloned().unwrap_or_default()
    }
}

/// A built scenario: the topology plus the roles the driver needs.
#[derive(Debug, Clone)]
pub struct ScenarioTopology {
    pub kind: ScenarioKind,
    pub topology: Topology,
    pub clients: Vec<String>,
    pub servers: Vec<String>,
    pub bottlenecks: Vec<ShapedLink>,
    /// `(sender, receiver)` of the competing TCP flow, if the scenario has one.
    pub competing: Option<(String, String)>,
}

/// `10.100.2.<idx>`; there are 256 such addresses.
pub fn server_ip(idx: usize) -> Result<Ipv4Addr, TopologyError> {
    let host = u8::try_from(idx).map_err(|_| TopologyError::AddressExhausted(idx))?;
    Ok(Ipv4Addr::new(10, 100, 2, host))
}

pub fn server_name(idx: usize) -> String {
    format!("server{idx}")
}

pub fn build(kind: ScenarioKind, opts: &ScenarioOptions) -> Result<ScenarioTopology, TopologyError> {
    match kind {
        ScenarioKind::SingleBottleneck | ScenarioKind::LinkFailure => single_bottleneck(kind, opts),
        ScenarioKind::CompetingFlow => competing_flow(opts),
        ScenarioKind::DualBottleneck => dual_bottleneck(opts),
        ScenarioKind::TwoClients => two_clients(opts),
        ScenarioKind::Mpd => mpd(opts),
    }
}

fn add_servers(
    b: &mut TopologyBuilder,
    opts: &ScenarioOptions,
) -> Result<Vec<String>, TopologyError> {
    (0..opts.server_count())
        .map(|idx| b.add_host(&server_name(idx), server_ip(idx)?))
        .collect()
}

fn single_bottleneck(
    kind: ScenarioKind,
    opts: &ScenarioOptions,
) -> Result<ScenarioTopology, TopologyError> {
    let mut b = TopologyBuilder::new();
    let mut bridges = BridgeAllocator::new("s2");

    let client = b.add_host("client", CLIENT_IP)?;
    let s0 = b.add_switch("s0")?;
    b.add_shaped_link(&mut bridges, &client, &s0, &opts.client_link)?;

    let s1 = b.add_switch("s1")?;
    let servers = add_servers(&mut b, opts)?;
    for (idx, server) in servers.iter().enumerate() {
        b.add_shaped_link(&mut bridges, server, &s1, &opts.server_link(idx))?;
    }

    let bottleneck = b.add_shaped_link(&mut bridges, &s0, &s1, &opts.bottleneck(0))?;

    Ok(ScenarioTopology {
        kind,
        topology: b.build(),
        clients: vec![client],
        servers,
        bottlenecks: vec![bottleneck],
        competing: None,
    })
}

fn competing_flow(opts: &ScenarioOptions) -> Result<ScenarioTopology, TopologyError> {
    let mut b = TopologyBuilder::new();

    let client = b.add_host("client", CLIENT_IP)?;
    let s0 = b.add_switch("s0")?;
    b.add_shaped_link(&mut BridgeAllocator::new("s0"), &client, &s0, &opts.client_link)?;

    let s1 = b.add_switch("s1")?;
    let servers = add_servers(&mut b, opts)?;
    let mut server_bridges = BridgeAllocator::new("s1");
    for (idx, server) in servers.iter().enumerate() {
        b.add_shaped_link(&mut server_bridges, server, &s1, &opts.server_link(idx))?;
    }

    let bottleneck =
        b.add_shaped_link(&mut BridgeAllocator::new("s2"), &s0, &s1, &opts.bottleneck(0))?;

    let competing = add_competing_pair(&mut b, &s0, &s1)?;

    Ok(ScenarioTopology {
        kind: ScenarioKind::CompetingFlow,
        topology: b.build(),
        clients: vec![client],
        servers,
        bottlenecks: vec![bottleneck],
        competing: Some(competing),
    })
}

fn dual_bottleneck(opts: &ScenarioOptions) -> Result<ScenarioTopology, TopologyError> {
    let mut b = TopologyBuilder::new();
    let mut bridges = BridgeAllocator::new("s2");

    let client = b.add_host("client", CLIENT_IP)?;
    let s0 = b.add_switch("s0")?;
    b.add_shaped_link(&mut bridges, &client, &s0, &opts.client_link)?;
    let branch0 = b.add_switch("s0-0")?;
    b.add_shaped_link(&mut bridges, &s0, &branch0, &opts.client_link)?;
    let branch1 = b.add_switch("s0-1")?;
    b.add_shaped_link(&mut bridges, &s0, &branch1, &opts.client_link)?;

    let far0 = b.add_switch("s1-0")?;
    let bottleneck0 = b.add_shaped_link(&mut bridges, &branch0, &far0, &opts.bottleneck(0))?;
    let far1 = b.add_switch("s1-1")?;
    let bottleneck1 = b.add_shaped_link(&mut bridges, &branch1, &far1, &opts.bottleneck(1))?;

    // the last two servers sit behind the second bottleneck
    let servers = add_servers(&mut b, opts)?;
    let split = opts.server_count().saturating_sub(2);
    for (idx, server) in servers.iter().enumerate() {
        let switch = if idx < split { &far0 } else { &far1 };
        b.add_shaped_link(&mut bridges, server, switch, &opts.server_link(idx))?;
    }

    let competing = add_competing_pair(&mut b, &branch1, &far0)?;

    Ok(ScenarioTopology {
        kind: ScenarioKind::DualBottleneck,
        topology: b.build(),
        clients: vec![client],
        servers,
        bottlenecks: vec![bottleneck0, bottleneck1],
        competing: Some(competing),
    })
}

fn two_clients(opts: &ScenarioOptions) -> Result<ScenarioTopology, TopologyError> {
    let mut b = TopologyBuilder::new();
    let mut bridges = BridgeAllocator::new("s2");

    let s0 = b.add_switch("s0")?;
    let client1 = b.add_host("client1", CLIENT_IP)?;
    b.add_shaped_link(&mut bridges, &client1, &s0, &opts.client_link)?;
    let client2 = b.add_host("client2", Ipv4Addr::new(10, 100, 0, 2))?;
    b.add_shaped_link(&mut bridges, &client2, &s0, &opts.client_link)?;

    let s1 = b.add_switch("s1")?;
    let bottleneck = b.add_shaped_link(&mut bridges, &s0, &s1, &opts.bottleneck(0))?;
    let servers = add_servers(&mut b, opts)?;
    for (idx, server) in servers.iter().enumerate() {
        b.add_shaped_link(&mut bridges, server, &s1, &opts.server_link(idx))?;
    }

    Ok(ScenarioTopology {
        kind: ScenarioKind::TwoClients,
        topology: b.build(),
        clients: vec![client1, client2],
        servers,
        bottlenecks: vec![bottleneck],
        competing: None,
    })
}

fn mpd(opts: &ScenarioOptions) -> Result<ScenarioTopology, TopologyError> {
    let mut b = TopologyBuilder::new();

    let client = b.add_host("client", CLIENT_IP)?;
    let s0 = b.add_switch("s0")?;
    let client_params = IntfParams {
        bw_mbit: opts.client_link.bw_mbit,
        ..Default::default()
    };
    b.add_link(&client, &s0, client_params)?;

    let s1 = b.add_switch("s1")?;
    let mut bridges = BridgeAllocator::new("s1");
    let servers = add_servers(&mut b, opts)?;
    for (idx, server) in servers.iter().enumerate() {
        b.add_shaped_link(&mut bridges, server, &s1, &opts.server_link(idx))?;
    }
    let bottleneck = b.add_shaped_link(&mut bridges, &s0, &s1, &opts.bottleneck(0))?;

    Ok(ScenarioTopology {
        kind: ScenarioKind::Mpd,
        topology: b.build(),
        clients: vec![client],
        servers,
        bottlenecks: vec![bottleneck],
        competing: None,
    })
}

fn add_competing_pair(
    b: &mut TopologyBuilder,
    left_switch: &str,
    right_switch: &str,
) -> Result<(String, String), TopologyError> {
    let left = b.add_host(COMPETING_LEFT, COMPETING_LEFT_IP)?;
    let right = b.add_host(COMPETING_RIGHT, COMPETING_RIGHT_IP)?;
    let params = IntfParams::bandwidth(1000.0).with_delay(2);
    b.add_link(&left, left_switch, params.clone())?;
    b.add_link(right_switch, &right, params)?;
    Ok((left, right))
}
