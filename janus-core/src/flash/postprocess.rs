//! Post-write stages: grow the last partition, then the filesystem on it.
//!
//! Both stages are best-effort: a missing tool or an unsupported layout is a
//! warning for the operator, never a pipeline failure.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::progress::{KillSignal, LogRing, StageSink};

const LSBLK_TIMEOUT: Duration = Duration::from_secs(10);
const GROWPART_TIMEOUT: Duration = Duration::from_secs(60);
const RESIZE_TIMEOUT: Duration = Duration::from_secs(120);

static RE_PART_INDEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)$").expect("static regex"));

#[derive(Debug)]
enum ToolError {
    NotFound,
    TimedOut,
    Killed,
    Failed(String),
}

struct ToolOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

/// Run a short-lived external tool, polling for exit so the kill signal and
/// the timeout are both honoured.
fn run_tool(
    program: &str,
    args: &[&str],
    timeout: Duration,
    kill: &KillSignal,
) -> Result<ToolOutput, ToolError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ToolError::NotFound
            } else {
                ToolError::Failed(err.to_string())
            }
        })?;

    let started = Instant::now();
    let status = loop {
        if kill.is_raised() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ToolError::Killed);
        }
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if started.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ToolError::TimedOut);
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => return Err(ToolError::Failed(err.to_string())),
        }
    };

    let mut stdout = String::new();
    let mut stderr = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        let _ = pipe.read_to_string(&mut stdout);
    }
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr);
    }
    Ok(ToolOutput {
        code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

#[derive(Debug, Deserialize)]
struct LsblkChildren {
    #[serde(default)]
    blockdevices: Vec<LsblkNode>,
}

#[derive(Debug, Deserialize)]
struct LsblkNode {
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

/// `(name, fstype)` of every partition under `device`, in lsblk order.
fn partitions_of(
    device: &str,
    columns: &str,
    kill: &KillSignal,
) -> Result<Vec<(String, String)>, ToolError> {
    let out = run_tool(
        "lsblk",
        &["-J", "-n", "-o", columns, device],
        LSBLK_TIMEOUT,
        kill,
    )?;
    if out.code != 0 {
        return Err(ToolError::Failed(format!(
            "lsblk exited with code {}",
            out.code
        )));
    }
    let report: LsblkChildren =
        serde_json::from_str(&out.stdout).map_err(|err| ToolError::Failed(err.to_string()))?;
    let mut parts = Vec::new();
    for device in &report.blockdevices {
        for child in &device.children {
            if child.kind == "part" {
                parts.push((
                    child.name.clone(),
                    child.fstype.clone().unwrap_or_default(),
                ));
            }
        }
    }
    Ok(parts)
}

fn push_output(log: &LogRing, out: &ToolOutput) {
    let stdout = out.stdout.trim();
    if !stdout.is_empty() {
        log.push(stdout.to_string());
    }
    let stderr = out.stderr.trim();
    if !stderr.is_empty() {
        log.push(stderr.to_string());
    }
}

/// Grow the last partition of `device` with growpart.
///
/// growpart exits 1 for NOCHANGE (already at maximum), which counts as
/// success. Returns false only for a genuine failure.
pub fn expand_partition(
    device: &str,
    sink: &StageSink,
    log: &LogRing,
    kill: &KillSignal,
) -> bool {
    if kill.is_raised() {
        return false;
    }
    sink.progress(0.0);

    let parts = match partitions_of(device, "NAME,TYPE", kill) {
        Ok(parts) => parts,
        Err(ToolError::Killed) => return false,
        Err(ToolError::NotFound) => {
            log.push("WARN: lsblk not found, skipping expand".to_string());
            sink.progress(1.0);
            return true;
        }
        Err(err) => {
            log.push(format!("ERROR expand: {err:?}"));
            sink.progress(1.0);
            return false;
        }
    };
    let Some((last, _)) = parts.last() else {
        log.push("WARN: no partitions found, skipping expand".to_string());
        sink.progress(1.0);
        return true;
    };

    let part_num = RE_PART_INDEX
        .captures(last)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| "1".to_string());

    log.push(format!("$ growpart {device} {part_num}"));
    match run_tool("growpart", &[device, &part_num], GROWPART_TIMEOUT, kill) {
        Ok(out) => {
            push_output(log, &out);
            sink.progress(1.0);
            // 1 = NOCHANGE (already expanded)
            matches!(out.code, 0 | 1)
        }
        Err(ToolError::Killed) => false,
        Err(ToolError::NotFound) => {
            log.push("WARN: growpart not found, skipping expand".to_string());
            sink.progress(1.0);
            true
        }
        Err(err) => {
            log.push(format!("ERROR expand: {err:?}"));
            sink.progress(1.0);
            false
        }
    }
}

/// Resize the filesystem on the last partition of `device` with resize2fs.
///
/// Only ext2/3/4 are supported; anything else is skipped with a warning.
/// An `e2fsck -f -y` pass runs first, its outcome ignored.
pub fn resize_filesystem(
    device: &str,
    sink: &StageSink,
    log: &LogRing,
    kill: &KillSignal,
) -> bool {
    if kill.is_raised() {
        return false;
    }
    sink.progress(0.0);

    let parts = match partitions_of(device, "NAME,FSTYPE,TYPE", kill) {
        Ok(parts) => parts,
        Err(ToolError::Killed) => return false,
        Err(ToolError::NotFound) => {
            log.push("WARN: lsblk not found, skipping resize".to_string());
            sink.progress(1.0);
            return true;
        }
        Err(err) => {
            log.push(format!("ERROR resize: {err:?}"));
            sink.progress(1.0);
            return false;
        }
    };
    let Some((last, fstype)) = parts.last() else {
        log.push("WARN: no partitions found, skipping resize".to_string());
        sink.progress(1.0);
        return true;
    };

    if !matches!(fstype.as_str(), "ext2" | "ext3" | "ext4") {
        log.push(format!(
            "WARN: filesystem is {fstype}, resize2fs only works with ext*, skipping"
        ));
        sink.progress(1.0);
        return true;
    }

    let part_dev = format!("/dev/{last}");
    // Outcome ignored: resize2fs insists on a recent fsck, nothing more.
    match run_tool("e2fsck", &["-f", "-y", &part_dev], RESIZE_TIMEOUT, kill) {
        Ok(_) | Err(ToolError::Failed(_)) | Err(ToolError::TimedOut) => {}
        Err(ToolError::Killed) => return false,
        Err(ToolError::NotFound) => {
            log.push("WARN: e2fsck not found, skipping resize".to_string());
            sink.progress(1.0);
            return true;
        }
    }

    log.push(format!("$ resize2fs {part_dev}"));
    match run_tool("resize2fs", &[part_dev.as_str()], RESIZE_TIMEOUT, kill) {
        Ok(out) => {
            push_output(log, &out);
            sink.progress(1.0);
            out.code == 0
        }
        Err(ToolError::Killed) => false,
        Err(ToolError::NotFound) => {
            log.push("WARN: resize2fs not found, skipping".to_string());
            sink.progress(1.0);
            true
        }
        Err(err) => {
            log.push(format!("ERROR resize: {err:?}"));
            sink.progress(1.0);
            false
        }
    }
}
