//! Stage executors for the flash pipeline.
//!
//! Each executor is a synchronous worker meant to run under
//! `tokio::task::spawn_blocking`. Executors report progress through a
//! [`StageSink`] channel, append output to the job's [`LogRing`], and honour
//! the [`KillSignal`] between I/O boundaries.

mod postprocess;
mod progress;
mod verify;
mod write;

use std::path::Path;

pub use progress::{KillSignal, LOG_TAIL_CAPACITY, LogRing, StageSink};

/// The four pipeline stages, as a seam.
///
/// The job manager only sees this trait; production wires in
/// [`SystemStages`], tests wire in stubs.
pub trait StageRunner: Send + Sync {
    /// Write `image` to `device`; progress is measured against `image_size`.
    fn write(
        &self,
        image: &Path,
        device: &str,
        image_size: u64,
        sink: &StageSink,
        log: &LogRing,
        kill: &KillSignal,
    ) -> bool;

    /// Compare checksums of `image` and `device`.
    fn verify(
        &self,
        image: &Path,
        device: &str,
        sink: &StageSink,
        log: &LogRing,
        kill: &KillSignal,
    ) -> bool;

    /// Grow the last partition to fill the device.
    fn expand(&self, device: &str, sink: &StageSink, log: &LogRing, kill: &KillSignal) -> bool;

    /// Grow the filesystem on the last partition.
    fn resize(&self, device: &str, sink: &StageSink, log: &LogRing, kill: &KillSignal) -> bool;
}

/// Production stages driving the real external tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemStages;

impl StageRunner for SystemStages {
    fn write(
        &self,
        image: &Path,
        device: &str,
        image_size: u64,
        sink: &StageSink,
        log: &LogRing,
        kill: &KillSignal,
    ) -> bool {
        write::write_image(image, device, image_size, sink, log, kill)
    }

    fn verify(
        &self,
        image: &Path,
        device: &str,
        sink: &StageSink,
        log: &LogRing,
        kill: &KillSignal,
    ) -> bool {
        verify::verify_image(image, device, sink, log, kill)
    }

    fn expand(&self, device: &str, sink: &StageSink, log: &LogRing, kill: &KillSignal) -> bool {
        postprocess::expand_partition(device, sink, log, kill)
    }

    fn resize(&self, device: &str, sink: &StageSink, log: &LogRing, kill: &KillSignal) -> bool {
        postprocess::resize_filesystem(device, sink, log, kill)
    }
}
