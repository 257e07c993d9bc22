use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Output, Stdio};

use anyhow::{bail, Context, Result};
use tracing::debug;

/// A Linux network namespace managed via `ip netns`.
///
/// Creates the namespace on construction, initializes loopback, and
/// deletes the namespace on drop. Everything runs through `sudo`.
pub struct Namespace {
    pub name: String,
}

impl Namespace {
    pub fn new(name: &str) -> Result<Self> {
        // cleanup any existing namespace with the same name
        let _ = sudo(&["ip", "netns", "del", name]);

        sudo_checked(&["ip", "netns", "add", name])
            .with_context(|| format!("create netns '{name}'"))?;
        debug!(ns = name, "created network namespace");

        let _ = sudo(&["ip", "netns", "exec", name, "ip", "link", "set", "lo", "up"]);

        Ok(Self {
            name: name.to_string(),
        })
    }

    pub fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let mut full = vec!["ip", "netns", "exec", &self.name, cmd];
        full.extend_from_slice(args);
        sudo(&full).with_context(|| format!("exec '{cmd}' in ns '{}'", self.name))
    }

    pub fn exec_checked(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let mut full = vec!["ip", "netns", "exec", &self.name, cmd];
        full.extend_from_slice(args);
        sudo_checked(&full).with_context(|| format!("exec '{cmd}' in ns '{}'", self.name))
    }

    /// Starts `program` inside the namespace without waiting for it.
    ///
    /// The child leads its own process group so a signal to the group
    /// reaches the program behind `sudo ip netns exec`.
    pub fn spawn(&self, program: &str, args: &[String], stdout: Stdio) -> Result<Child> {
        let child = Command::new("sudo")
            .args(["ip", "netns", "exec", &self.name, program])
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .with_context(|| format!("spawn '{program}' in ns '{}'", self.name))?;
        debug!(ns = %self.name, program, pid = child.id(), "spawned namespace process");
        Ok(child)
    }

    /// Moves `intf` from the root namespace into this one.
    pub fn adopt_interface(&self, intf: &str) -> Result<()> {
        sudo_checked(&["ip", "link", "set", intf, "netns", &self.name])
            .with_context(|| format!("move '{intf}' into ns '{}'", self.name))?;
        Ok(())
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        debug!(ns = %self.name, "deleting network namespace");
        let _ = sudo(&["ip", "netns", "del", &self.name]);
    }
}

/// Where a command runs: the root namespace or a host namespace.
#[derive(Clone, Copy)]
pub enum Scope<'a> {
    Root,
    Netns(&'a Namespace),
}

impl Scope<'_> {
    pub fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        match self {
            Scope::Root => {
                let mut full = vec![cmd];
                full.extend_from_slice(args);
                sudo(&full)
            }
            Scope::Netns(ns) => ns.exec(cmd, args),
        }
    }

    pub fn exec_checked(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        match self {
            Scope::Root => {
                let mut full = vec![cmd];
                full.extend_from_slice(args);
                sudo_checked(&full)
            }
            Scope::Netns(ns) => ns.exec_checked(cmd, args),
        }
    }
}

/// Run `sudo <args>`, returning raw output.
pub(crate) fn sudo(args: &[&str]) -> Result<Output> {
    Command::new("sudo")
        .args(args)
        .output()
        .with_context(|| format!("sudo {}", args.join(" ")))
}

/// Run `sudo <args>`, bailing with stderr on a non-zero exit.
pub(crate) fn sudo_checked(args: &[&str]) -> Result<Output> {
    let output = sudo(args)?;
    if !output.status.success() {
        bail!(
            "command failed: sudo {}\n{}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}
