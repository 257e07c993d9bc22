//! Node configuration files read by the client and server binaries.
//!
//! Every client gets a `downnode_mn<suffix>.json` listing all servers as
//! upnodes; every server gets an `upnode_mn<idx>.json` with its own address.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use mpd_netsim::scenarios::{server_ip, CLIENT_IP};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Shared head of every peer id; servers append their two-digit index.
pub const PEER_ID_PREFIX: &str = "00010203040506070809101112131415161718";

/// Server indices must fit the two decimal digits of the peer id.
pub const MAX_SERVERS: usize = 100;

/// Client peer ids count down from `FF` and must stay clear of the decimal
/// server ids.
pub const MAX_CLIENTS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(rename = "IP")]
    pub ip: Ipv4Addr,
    pub port: u16,
    #[serde(rename = "selfpeerID")]
    pub self_peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownnodeConfig {
    #[serde(flatten)]
    pub peer: PeerConfig,
    pub upnodes: Vec<PeerConfig>,
}

/// A client to generate a downnode file for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSpec {
    pub name: String,
    pub ip: Ipv4Addr,
}

impl ClientSpec {
    /// Config file suffix: the client name without its `client` prefix.
    pub fn suffix(&self) -> &str {
        client_suffix(&self.name)
    }
}

pub fn client_suffix(name: &str) -> &str {
    name.strip_prefix("client").unwrap_or(name)
}

/// Client names and addresses as the scenarios lay them out: a lone client is
/// `client`, several are `client1`, `client2`, ...
pub fn default_clients(count: usize) -> Result<Vec<ClientSpec>> {
    if count > MAX_CLIENTS {
        bail!("{count} clients requested, at most {MAX_CLIENTS} supported");
    }
    if count == 1 {
        return Ok(vec![ClientSpec {
            name: "client".to_string(),
            ip: CLIENT_IP,
        }]);
    }
    (0..count)
        .map(|n| {
            let host = u8::try_from(n + 1).context("client address out of range")?;
            Ok(ClientSpec {
                name: format!("client{}", n + 1),
                ip: Ipv4Addr::new(10, 100, 0, host),
            })
        })
        .collect()
}

pub fn server_peer_id(idx: usize) -> String {
    format!("{PEER_ID_PREFIX}{idx:02}")
}

/// `FF` for the first client, `FE` for the second, and so on.
pub fn client_peer_id(nth: usize) -> String {
    format!("{PEER_ID_PREFIX}{:02X}", 0xFFusize.saturating_sub(nth))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ports {
    pub client: u16,
    pub server: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            client: 48888,
            server: 41111,
        }
    }
}

pub fn upnode(idx: usize, ports: Ports) -> Result<PeerConfig> {
    if idx >= MAX_SERVERS {
        bail!("server index {idx} out of range, at most {MAX_SERVERS} servers supported");
    }
    Ok(PeerConfig {
        ip: server_ip(idx)?,
        port: ports.server,
        self_peer_id: server_peer_id(idx),
    })
}

pub fn downnode(
    nth: usize,
    client: &ClientSpec,
    server_count: usize,
    ports: Ports,
) -> Result<DownnodeConfig> {
    if nth >= MAX_CLIENTS {
        bail!("client {nth} out of range, at most {MAX_CLIENTS} clients supported");
    }
    Ok(DownnodeConfig {
        peer: PeerConfig {
            ip: client.ip,
            port: ports.client,
            self_peer_id: client_peer_id(nth),
        },
        upnodes: (0..server_count)
            .map(|idx| upnode(idx, ports))
            .collect::<Result<_>>()?,
    })
}

pub fn downnode_path(dir: &Path, suffix: &str) -> PathBuf {
    dir.join(format!("downnode_mn{suffix}.json"))
}

pub fn upnode_path(dir: &Path, idx: usize) -> PathBuf {
    dir.join(format!("upnode_mn{idx}.json"))
}

/// Writes one downnode file per client and one upnode file per server into
/// `dir`, creating it if needed. Returns the written paths.
pub fn write_node_configs(
    dir: &Path,
    clients: &[ClientSpec],
    server_count: usize,
    ports: Ports,
) -> Result<Vec<PathBuf>> {
    if server_count > MAX_SERVERS {
        bail!("{server_count} servers requested, at most {MAX_SERVERS} supported");
    }
    if clients.len() > MAX_CLIENTS {
        bail!("{} clients requested, at most {MAX_CLIENTS} supported", clients.len());
    }
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let mut written = Vec::with_capacity(clients.len() + server_count);
    for (nth, client) in clients.iter().enumerate() {
        let path = downnode_path(dir, client.suffix());
        write_json(&path, &downnode(nth, client, server_count, ports)?)?;
        written.push(path);
    }
    for idx in 0..server_count {
        let path = upnode_path(dir, idx);
        write_json(&path, &upnode(idx, ports)?)?;
        written.push(path);
    }

    info!(
        dir = %dir.display(),
        clients = clients.len(),
        servers = server_count,
        "wrote node configs"
    );
    Ok(written)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    std::fs::write(path, text).with_context(|| format!("write {}", path.display()))
}
