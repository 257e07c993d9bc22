//! Static description of an emulated network.
//!
//! A [`Topology`] is plain data: hosts, switches and the physical links
//! between them. Every link end is a named interface (`<node>-eth<N>`) with
//! its own egress shaping, so the two directions of one link can differ.
//! Nothing here touches the kernel; see [`crate::emulator`] for that.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::options::{IntfParams, LinkOptions};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("node '{0}' already exists")]
    DuplicateNode(String),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("unknown link {0:?}")]
    UnknownLink(LinkId),
    #[error("no address left for server {0}")]
    AddressExhausted(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Host { ip: Ipv4Addr },
    Switch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_host(&self) -> bool {
        matches!(self.kind, NodeKind::Host { .. })
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        match self.kind {
            NodeKind::Host { ip } => Some(ip),
            NodeKind::Switch => None,
        }
    }
}

/// Which end of a [`Link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    A,
    B,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkEnd {
    pub node: String,
    pub intf: String,
    pub params: IntfParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub id: LinkId,
    pub a: LinkEnd,
    pub b: LinkEnd,
}

impl Link {
    pub fn end(&self, end: End) -> &LinkEnd {
        match end {
            End::A => &self.a,
            End::B => &self.b,
        }
    }

    pub fn end_mut(&mut self, end: End) -> &mut LinkEnd {
        match end {
            End::A => &mut self.a,
            End::B => &mut self.b,
        }
    }

    pub fn touches(&self, node: &str) -> bool {
        self.a.node == node || self.b.node == node
    }
}

/// The two physical links that make up one shaped logical link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapedLink {
    pub bridge: String,
    /// `a -- bridge`
    pub left: LinkId,
    /// `bridge -- b`
    pub right: LinkId,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    nodes: Vec<Node>,
    links: Vec<Link>,
}

impl Topology {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_host())
    }

    pub fn switches(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.is_host())
    }

    pub fn host_ip(&self, name: &str) -> Option<Ipv4Addr> {
        self.node(name).and_then(Node::ip)
    }

    pub fn link(&self, id: LinkId) -> Result<&Link, TopologyError> {
        self.links.get(id.0).ok_or(TopologyError::UnknownLink(id))
    }

    pub fn link_mut(&mut self, id: LinkId) -> Result<&mut Link, TopologyError> {
        self.links.get_mut(id.0).ok_or(TopologyError::UnknownLink(id))
    }

    /// Links with at least one end on any of `nodes`, in declaration order.
    pub fn links_touching<S: AsRef<str>>(&self, nodes: &[S]) -> Vec<LinkId> {
        self.links
            .iter()
            .filter(|l| nodes.iter().any(|n| l.touches(n.as_ref())))
            .map(|l| l.id)
            .collect()
    }

    /// First interface of `host`, the one that carries its address.
    pub fn host_interface(&self, host: &str) -> Option<&str> {
        self.links.iter().find_map(|l| {
            [&l.a, &l.b]
                .into_iter()
                .find(|end| end.node == host)
                .map(|end| end.intf.as_str())
        })
    }
}

/// Hands out bridge switch names `<prefix>-0`, `<prefix>-1`, ...
#[derive(Debug, Clone)]
pub struct BridgeAllocator {
    prefix: String,
    next: usize,
}

impl BridgeAllocator {
    pub fn new(prefix: &str) -> Self {
        Self::starting_at(prefix, 0)
    }

    pub fn starting_at(prefix: &str, base: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: base,
        }
    }

    pub fn next_name(&mut self) -> String {
        let name = format!("{}-{}", self.prefix, self.next);
        self.next += 1;
        name
    }

    pub fn allocated(&self) -> usize {
        self.next
    }
}

#[derive(Debug, Default)]
pub struct TopologyBuilder {
    topo: Topology,
    next_intf: HashMap<String, u32>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&mut self, name: &str, ip: Ipv4Addr) -> Result<String, TopologyError> {
        self.add_node(name, NodeKind::Host { ip }, 0)
    }

    pub fn add_switch(&mut self, name: &str) -> Result<String, TopologyError> {
        self.add_node(name, NodeKind::Switch, 1)
    }

    fn add_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        first_intf: u32,
    ) -> Result<String, TopologyError> {
        if self.topo.node(name).is_some() {
            return Err(TopologyError::DuplicateNode(name.to_string()));
        }
        self.topo.nodes.push(Node {
            name: name.to_string(),
            kind,
        });
        self.next_intf.insert(name.to_string(), first_intf);
        Ok(name.to_string())
    }

    /// Plain link, both ends shaped alike.
    pub fn add_link(
        &mut self,
        a: &str,
        b: &str,
        params: IntfParams,
    ) -> Result<LinkId, TopologyError> {
        self.add_link_with(a, b, params.clone(), params)
    }

    pub fn add_link_with(
        &mut self,
        a: &str,
        b: &str,
        params_a: IntfParams,
        params_b: IntfParams,
    ) -> Result<LinkId, TopologyError> {
        let a = self.link_end(a, params_a)?;
        let b = self.link_end(b, params_b)?;
        let id = LinkId(self.topo.links.len());
        self.topo.links.push(Link { id, a, b });
        Ok(id)
    }

    /// Splits `a <-> b` into `a <-> bridge <-> b` with a fresh bridge switch
    /// from `bridges`, so each direction gets its own delay and loss.
    pub fn add_shaped_link(
        &mut self,
        bridges: &mut BridgeAllocator,
        a: &str,
        b: &str,
        opts: &LinkOptions,
    ) -> Result<ShapedLink, TopologyError> {
        for node in [a, b] {
            if self.topo.node(node).is_none() {
                return Err(TopologyError::UnknownNode(node.to_string()));
            }
        }
        let bridge = self.add_switch(&bridges.next_name())?;
        let [a_side, towards_a, towards_b, b_side] = opts.split();
        let left = self.add_link_with(a, &bridge, a_side, towards_a)?;
        let right = self.add_link_with(&bridge, b, towards_b, b_side)?;
        Ok(ShapedLink {
            bridge,
            left,
            right,
        })
    }

    fn link_end(&mut self, node: &str, params: IntfParams) -> Result<LinkEnd, TopologyError> {
        let counter = self
            .next_intf
            .get_mut(node)
            .ok_or_else(|| TopologyError::UnknownNode(node.to_string()))?;
        let intf = format!("{node}-eth{counter}");
        *counter += 1;
        Ok(LinkEnd {
            node: node.to_string(),
            intf,
            params,
        })
    }

    pub fn build(self) -> Topology {
        self.topo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn shaped_link_inserts_one_bridge_with_asymmetric_halves() {
        let mut b = TopologyBuilder::new();
        b.add_switch("s0").unwrap();
        b.add_switch("s1").unwrap();
        let mut bridges = BridgeAllocator::new("s2");
        let opts = LinkOptions::new().bw(10.0).delay(30).loss(1.0, 4.0).queue(100);

        let shaped = b.add_shaped_link(&mut bridges, "s0", "s1", &opts).unwrap();
        let topo = b.build();

        assert_eq!(shaped.bridge, "s2-0");
        assert_eq!(topo.switches().count(), 3);
        assert_eq!(topo.links().len(), 2);

        let left = topo.link(shaped.left).unwrap();
        assert_eq!(left.a.node, "s0");
        assert_eq!(left.b.node, "s2-0");
        assert_eq!(left.a.params.bw_mbit, Some(10.0));
        assert_eq!(left.b.params.loss_percent, Some(4.0));
        assert_eq!(left.b.params.delay_ms, Some(30));

        let right = topo.link(shaped.right).unwrap();
        assert_eq!(right.a.node, "s2-0");
        assert_eq!(right.b.node, "s1");
        assert_eq!(right.a.params.loss_percent, Some(1.0));
        assert_eq!(right.a.params.delay_ms, Some(30));
        assert_eq!(right.b.params.bw_mbit, Some(10.0));
    }

    #[test]
    fn interfaces_are_numbered_per_node() {
        let mut b = TopologyBuilder::new();
        b.add_host("h1", ip("10.0.0.1")).unwrap();
        b.add_host("h2", ip("10.0.0.2")).unwrap();
        b.add_switch("s0").unwrap();
        b.add_link("h1", "s0", IntfParams::default()).unwrap();
        b.add_link("h2", "s0", IntfParams::default()).unwrap();
        let topo = b.build();

        assert_eq!(topo.links()[0].a.intf, "h1-eth0");
        assert_eq!(topo.links()[0].b.intf, "s0-eth1");
        assert_eq!(topo.links()[1].b.intf, "s0-eth2");
        assert_eq!(topo.host_interface("h2"), Some("h2-eth0"));
    }

    #[test]
    fn unknown_and_duplicate_nodes_are_rejected() {
        let mut b = TopologyBuilder::new();
        b.add_switch("s0").unwrap();
        assert_eq!(
            b.add_switch("s0"),
            Err(TopologyError::DuplicateNode("s0".into()))
        );
        assert_eq!(
            b.add_link("s0", "nope", IntfParams::default()),
            Err(TopologyError::UnknownNode("nope".into()))
        );
    }

    #[test]
    fn bridge_names_depend_only_on_allocator_state() {
        let mut first = BridgeAllocator::new("s2");
        let mut second = BridgeAllocator::new("s2");
        let a: Vec<_> = (0..3).map(|_| first.next_name()).collect();
        let b: Vec<_> = (0..3).map(|_| second.next_name()).collect();
        assert_eq!(a, b);
        assert_eq!(a, ["s2-0", "s2-1", "s2-2"]);
        assert_eq!(BridgeAllocator::starting_at("s1", 4).next_name(), "s1-4");
    }

    #[test]
    fn links_touching_finds_both_ends() {
        let mut b = TopologyBuilder::new();
        b.add_host("server0", ip("10.100.2.0")).unwrap();
        b.add_switch("s1").unwrap();
        b.add_switch("s9").unwrap();
        let mut bridges = BridgeAllocator::new("s2");
        let shaped = b
            .add_shaped_link(&mut bridges, "server0", "s1", &LinkOptions::new())
            .unwrap();
        b.add_link("s1", "s9", IntfParams::default()).unwrap();
        let topo = b.build();

        assert_eq!(topo.links_touching(&["server0"]), vec![shaped.left]);
        assert_eq!(topo.links_touching(&["s9", "server0"]).len(), 2);
    }
}
