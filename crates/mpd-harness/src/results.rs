use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use crate::config::HarnessConfig;

/// Score lines echoed to the console per trace.
const SCORE_TAIL_LINES: usize = 3;

/// One trace file after collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedTrace {
    pub original: PathBuf,
    pub stored: PathBuf,
    pub score_file: Option<PathBuf>,
    /// Last lines of the scorer output.
    pub score_tail: Vec<String>,
}

/// Result directory name of the `mpd` scenario.
pub const MPD_CASE: &str = "mpd";

pub fn case_name(case: usize) -> String {
    format!("topo_{case}")
}

/// `MPDTrace_3.txt` becomes `<client>_Trace_3.txt`.
pub fn stored_trace_name(file_name: &str, client: &str) -> String {
    match file_name.strip_prefix("MPD") {
        Some(rest) => format!("{client}_{rest}"),
        None => format!("{client}_{file_name}"),
    }
}

/// Scores every trace matching the configured glob and moves it into
/// `<result_dir>/topo_<case>/`.
pub fn collect_results(cfg: &HarnessConfig, case: usize, client: &str) -> Result<Vec<CollectedTrace>> {
    collect_traces(cfg, &case_name(case), &cfg.trace_glob, client)
}

/// Like [`collect_results`], for the `mpd` scenario's trace into
/// `<result_dir>/mpd/`.
pub fn collect_mpd_results(cfg: &HarnessConfig, client: &str) -> Result<Vec<CollectedTrace>> {
    collect_traces(cfg, MPD_CASE, &cfg.mpd_trace_glob, client)
}

fn collect_traces(
    cfg: &HarnessConfig,
    case: &str,
    pattern: &str,
    client: &str,
) -> Result<Vec<CollectedTrace>> {
    let dir = cfg.result_dir.join(case);
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

    let mut traces: Vec<PathBuf> = glob::glob(pattern)
        .with_context(|| format!("bad trace pattern '{pattern}'"))?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(error = %err, "unreadable trace path");
                None
            }
        })
        .collect();
    traces.sort();
    if traces.is_empty() {
        warn!(%pattern, %case, "no trace files found");
    }

    let mut collected = Vec::with_capacity(traces.len());
    for trace in traces {
        collected.push(collect_one(cfg, &dir, &trace, client)?);
    }
    info!(%case, traces = collected.len(), dir = %dir.display(), "results saved");
    Ok(collected)
}

fn collect_one(cfg: &HarnessConfig, dir: &Path, trace: &Path, client: &str) -> Result<CollectedTrace> {
    let stem = trace
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("trace path '{}' has no file name", trace.display()))?;

    let (score_file, score_tail) = match run_scorer(&cfg.scorer, trace) {
        Ok(output) => {
            let path = dir.join(format!("{client}_{stem}_score.txt"));
            std::fs::write(&path, &output).with_context(|| format!("write {}", path.display()))?;
            let lines: Vec<String> = output.lines().map(str::to_string).collect();
            let tail = lines[lines.len().saturating_sub(SCORE_TAIL_LINES)..].to_vec();
            (Some(path), tail)
        }
        Err(err) => {
            warn!(trace = %trace.display(), error = %format!("{err:#}"), "scoring failed");
            (None, Vec::new())
        }
    };

    let file_name = trace
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or(stem);
    let stored = dir.join(stored_trace_name(&file_name, client));
    move_file(trace, &stored)?;

    Ok(CollectedTrace {
        original: trace.to_path_buf(),
        stored,
        score_file,
        score_tail,
    })
}

/// Runs `scorer <trace>` and returns its stdout.
fn run_scorer(scorer: &[String], trace: &Path) -> Result<String> {
    let (program, args) = scorer
        .split_first()
        .ok_or_else(|| anyhow!("scorer command is empty"))?;
    let output = Command::new(program)
        .args(args)
        .arg(trace)
        .output()
        .with_context(|| format!("run scorer '{program}'"))?;
    if !output.status.success() {
        warn!(
            status = %output.status,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "scorer exited with failure"
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // rename fails across filesystems
    std::fs::copy(from, to)
        .with_context(|| format!("copy {} to {}", from.display(), to.display()))?;
    std::fs::remove_file(from).with_context(|| format!("remove {}", from.display()))
}
