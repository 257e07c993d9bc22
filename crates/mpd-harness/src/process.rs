//! Supervision of the client, server and tool processes of one run.
//!
//! Every process is owned by a [`ProcessGroup`] from spawn to reap. The group
//! kills whatever is still running on [`ProcessGroup::shutdown`] and again on
//! drop, so an early return never leaks a process into the next scenario.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

const KILL_POLL: Duration = Duration::from_millis(50);

/// Opens `path` for a child's stdout. The returned handle moves into the
/// child at spawn; the parent keeps no open descriptor.
pub fn output_file(path: &Path) -> Result<Stdio> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    Ok(Stdio::from(file))
}

/// A spawned child and the file its stdout goes to.
#[derive(Debug)]
pub struct ManagedProcess {
    label: String,
    child: Child,
    output: Option<PathBuf>,
    status: Option<ExitStatus>,
}

impl ManagedProcess {
    pub fn new(label: impl Into<String>, child: Child, output: Option<PathBuf>) -> Self {
        let label = label.into();
        debug!(%label, pid = child.id(), "process registered");
        Self {
            label,
            child,
            output,
            status: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// Exit status once the process has been reaped.
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if self.status.is_none() {
            self.status = self
                .child
                .try_wait()
                .with_context(|| format!("poll '{}'", self.label))?;
            if let Some(status) = self.status {
                debug!(label = %self.label, %status, "process exited");
            }
        }
        Ok(self.status)
    }

    pub fn is_running(&mut self) -> Result<bool> {
        Ok(self.try_wait()?.is_none())
    }

    /// SIGTERM to the process group, then SIGKILL once `grace` runs out.
    /// A zero `grace` escalates straight away without complaint.
    ///
    /// The group signal reaches programs started behind `sudo ip netns exec`;
    /// without sudo rights the direct child is killed instead.
    pub fn kill(&mut self, grace: Duration) {
        if !matches!(self.try_wait(), Ok(None)) {
            return;
        }

        if !signal_group(self.child.id(), "-TERM") {
            let _ = self.child.kill();
        }
        if self.wait_for_exit(grace) {
            return;
        }

        if grace.is_zero() {
            debug!(label = %self.label, "killing process");
        } else {
            warn!(label = %self.label, "process ignored SIGTERM, killing");
        }
        signal_group(self.child.id(), "-KILL");
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => self.status = Some(status),
            Err(err) => warn!(label = %self.label, error = %err, "failed to reap process"),
        }
    }

    fn wait_for_exit(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            match self.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) if Instant::now() < deadline => std::thread::sleep(KILL_POLL),
                _ => return false,
            }
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.kill(Duration::ZERO);
    }
}

fn signal_group(pgid: u32, signal: &str) -> bool {
    Command::new("sudo")
        .args(["-n", "kill", signal, "--", &format!("-{pgid}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Owns every process of one run.
#[derive(Debug)]
pub struct ProcessGroup {
    procs: Vec<ManagedProcess>,
    grace: Duration,
}

impl ProcessGroup {
    pub fn new(grace: Duration) -> Self {
        Self {
            procs: Vec::new(),
            grace,
        }
    }

    pub fn push(&mut self, process: ManagedProcess) {
        self.procs.push(process);
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn get_mut(&mut self, label: &str) -> Option<&mut ManagedProcess> {
        self.procs.iter_mut().find(|p| p.label == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedProcess> {
        self.procs.iter()
    }

    /// Whether any of the processes named in `labels` is still running.
    pub fn any_running(&mut self, labels: &[String]) -> Result<bool> {
        for proc in self.procs.iter_mut().filter(|p| labels.contains(&p.label)) {
            if proc.is_running()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Kills the named process if it is still running.
    pub fn stop(&mut self, label: &str) {
        let grace = self.grace;
        if let Some(proc) = self.get_mut(label) {
            proc.kill(grace);
        }
    }

    /// Kills and reaps every process. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let mut killed = 0usize;
        for proc in &mut self.procs {
            if matches!(proc.try_wait(), Ok(None)) {
                killed += 1;
            }
            proc.kill(self.grace);
        }
        if !self.procs.is_empty() {
            info!(total = self.procs.len(), killed, "processes shut down");
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::os::unix::process::CommandExt;
    use std::sync::{Arc, Mutex};

    fn spawn(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .process_group(0)
            .spawn()
            .expect("spawn")
    }

    #[test]
    fn shutdown_kills_running_processes() {
        let mut group = ProcessGroup::new(Duration::from_millis(500));
        group.push(ManagedProcess::new("sleeper", spawn("sleep", &["30"]), None));
        assert!(group.any_running(&["sleeper".into()]).unwrap());

        let started = Instant::now();
        group.shutdown();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!group.any_running(&["sleeper".into()]).unwrap());
        assert!(group.get_mut("sleeper").unwrap().status().is_some());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn immediate_kill_does_not_warn() {
        let logs = Captured::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut proc = ManagedProcess::new("sleeper", spawn("sleep", &["30"]), None);
            proc.kill(Duration::ZERO);
            assert!(proc.status().is_some());
            drop(ManagedProcess::new("dropped", spawn("sleep", &["30"]), None));
        });

        let text = logs.text();
        assert!(text.contains("process registered"), "{text}");
        assert!(!text.contains("ignored SIGTERM"), "{text}");
    }

    #[test]
    fn exited_processes_keep_their_status() {
        let mut proc = ManagedProcess::new("true", spawn("true", &[]), None);
        let deadline = Instant::now() + Duration::from_secs(5);
        while proc.is_running().unwrap() {
            assert!(Instant::now() < deadline, "true did not exit");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(proc.status().unwrap().success());
        proc.kill(Duration::from_millis(100));
        assert!(proc.status().unwrap().success());
    }

    #[test]
    fn output_file_captures_child_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo_stdout");
        let child = Command::new("echo")
            .arg("hello")
            .stdout(output_file(&path).unwrap())
            .spawn()
            .unwrap();
        let mut proc = ManagedProcess::new("echo", child, Some(path.clone()));
        let deadline = Instant::now() + Duration::from_secs(5);
        while proc.is_running().unwrap() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(proc.output(), Some(path.as_path()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }
}
