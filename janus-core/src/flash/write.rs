//! Write stage: stream an image onto a block device with `dd`.
//!
//! Compressed images are decompressed on the fly by piping a decompressor's
//! stdout into dd's stdin as two explicit child processes. Progress comes
//! from dd's `status=progress` diagnostic stream.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use janus_model::{StageUpdate, human_eta, human_speed};

use super::progress::{KillSignal, LogRing, StageSink, parse_copied_bytes, round4};

/// Poll interval for the progress stream; bounds how long a raised kill
/// signal can go unobserved.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

const DD_BLOCK_SIZE: &str = "4M";

/// Decompressor command for a compressed image suffix.
fn decompressor_for(image: &Path) -> Option<(&'static str, &'static [&'static str])> {
    let name = image.file_name()?.to_str()?;
    if name.ends_with(".xz") {
        Some(("xzcat", &[]))
    } else if name.ends_with(".gz") {
        Some(("gunzip", &["-c"]))
    } else if name.ends_with(".bz2") {
        Some(("bzcat", &[]))
    } else if name.ends_with(".zst") {
        Some(("zstdcat", &[]))
    } else {
        None
    }
}

/// Write `image` to `device`, reporting progress against `image_size` (the
/// on-disk size of the source file, compressed or not).
///
/// Returns true on success. A raised kill signal terminates the children
/// within one poll interval and returns false with no retry obligation.
pub fn write_image(
    image: &Path,
    device: &str,
    image_size: u64,
    sink: &StageSink,
    log: &LogRing,
    kill: &KillSignal,
) -> bool {
    let decompressor = decompressor_for(image);

    let mut source: Option<Child> = None;
    let mut dd_cmd = Command::new("dd");
    dd_cmd
        .arg(format!("of={device}"))
        .arg(format!("bs={DD_BLOCK_SIZE}"))
        .arg("conv=fsync")
        .arg("status=progress")
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    match decompressor {
        Some((prog, args)) => {
            log.push(format!(
                "$ {prog} {}'{}' | dd of='{device}' bs={DD_BLOCK_SIZE} conv=fsync status=progress",
                args.iter().map(|a| format!("{a} ")).collect::<String>(),
                image.display(),
            ));
            let child = Command::new(prog)
                .args(args)
                .arg(image)
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn();
            let mut child = match child {
                Ok(c) => c,
                Err(err) => {
                    log.push(format!("ERROR: failed to start {prog}: {err}"));
                    return false;
                }
            };
            let Some(stdout) = child.stdout.take() else {
                log.push(format!("ERROR: no stdout pipe from {prog}"));
                let _ = child.kill();
                return false;
            };
            dd_cmd.stdin(Stdio::from(stdout));
            source = Some(child);
        }
        None => {
            log.push(format!(
                "$ dd if='{}' of='{device}' bs={DD_BLOCK_SIZE} conv=fsync status=progress",
                image.display()
            ));
            dd_cmd.arg(format!("if={}", image.display())).stdin(Stdio::null());
        }
    }

    let mut dd = match dd_cmd.spawn() {
        Ok(c) => c,
        Err(err) => {
            log.push(format!("ERROR: failed to start dd: {err}"));
            if let Some(mut child) = source {
                let _ = child.kill();
                let _ = child.wait();
            }
            return false;
        }
    };

    let Some(stderr) = dd.stderr.take() else {
        log.push("ERROR: no stderr pipe from dd".to_string());
        let _ = dd.kill();
        return false;
    };

    // dd terminates progress lines with \r; a dedicated reader thread turns
    // the stream into lines so the stage loop can poll with a short timeout
    // and keep checking the kill signal.
    let (line_tx, line_rx) = mpsc::channel::<String>();
    let reader = thread::spawn(move || {
        let mut stderr = stderr;
        let mut buf = [0u8; 4096];
        let mut acc: Vec<u8> = Vec::new();
        loop {
            let n = match stderr.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                if byte == b'\r' || byte == b'\n' {
                    let line = String::from_utf8_lossy(&acc).trim().to_string();
                    acc.clear();
                    if !line.is_empty() && line_tx.send(line).is_err() {
                        return;
                    }
                } else {
                    acc.push(byte);
                }
            }
        }
        let line = String::from_utf8_lossy(&acc).trim().to_string();
        if !line.is_empty() {
            let _ = line_tx.send(line);
        }
    });

    let start = Instant::now();
    let mut cancelled = false;
    loop {
        if kill.is_raised() {
            log.push("CANCELLED: killing dd process".to_string());
            let _ = dd.kill();
            if let Some(child) = source.as_mut() {
                let _ = child.kill();
            }
            cancelled = true;
            break;
        }
        match line_rx.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                log.push(line.clone());
                if image_size > 0
                    && let Some(copied) = parse_copied_bytes(&line)
                {
                    let progress = (copied as f64 / image_size as f64).min(1.0);
                    let elapsed = start.elapsed().as_secs_f64();
                    let speed = if elapsed > 0.0 { copied as f64 / elapsed } else { 0.0 };
                    let eta = if speed > 0.0 {
                        image_size.saturating_sub(copied) as f64 / speed
                    } else {
                        0.0
                    };
                    sink.send(StageUpdate {
                        progress: Some(round4(progress)),
                        speed_bytes: Some(speed),
                        speed_human: Some(human_speed(speed)),
                        eta_sec: Some((eta * 10.0).round() / 10.0),
                        eta_human: Some(human_eta(eta)),
                    });
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = reader.join();
    let dd_status = dd.wait().ok();
    let source_ok = match source {
        Some(mut child) => child.wait().ok().is_some_and(|s| s.success()),
        None => true,
    };

    if cancelled {
        return false;
    }

    let dd_ok = dd_status.is_some_and(|s| s.success());
    if !dd_ok {
        let code = dd_status.and_then(|s| s.code()).unwrap_or(-1);
        log.push(format!("ERROR: dd exited with code {code}"));
        return false;
    }
    if !source_ok {
        log.push("ERROR: decompressor failed".to_string());
        return false;
    }

    // Flush page cache to the device before declaring success.
    let _ = Command::new("sync").status();
    sink.send(StageUpdate {
        progress: Some(1.0),
        speed_human: Some("--".to_string()),
        eta_human: Some("done".to_string()),
        ..Default::default()
    });
    true
}
