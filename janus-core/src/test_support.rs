//! Fake inventory and stage stubs for tests.
//!
//! Enabled for this crate's own tests and, via the `test-support` feature,
//! for downstream integration tests that need pipelines without hardware.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use janus_model::{DriveInfo, PhysicalPort, PortEntry, human_size};

use crate::flash::{KillSignal, LogRing, StageRunner, StageSink};
use crate::inventory::DeviceInventory;

/// A removable, unmounted drive suitable for flashing.
pub fn removable_drive(device_path: &str, by_path: &str) -> DriveInfo {
    DriveInfo {
        device_path: device_path.to_string(),
        by_path: by_path.to_string(),
        model: "Fake SD Card".to_string(),
        serial: "FAKE0001".to_string(),
        vendor: "Janus".to_string(),
        size_bytes: 4 * 1024 * 1024 * 1024,
        size_human: human_size(4 * 1024 * 1024 * 1024),
        removable: true,
        mounted: false,
        mountpoints: Vec::new(),
        usb_speed: "usb".to_string(),
        port_path: by_path.to_string(),
        is_system: false,
    }
}

/// In-memory inventory with a settable drive list.
#[derive(Debug, Default)]
pub struct FakeInventory {
    drives: RwLock<Vec<DriveInfo>>,
    /// Devices passed to `eject_device`, in call order.
    pub ejected: Mutex<Vec<String>>,
    /// Devices passed to `unmount_device`, in call order.
    pub unmounted: Mutex<Vec<String>>,
}

impl FakeInventory {
    pub fn new(drives: Vec<DriveInfo>) -> Self {
        Self {
            drives: RwLock::new(drives),
            ..Default::default()
        }
    }

    pub fn set_drives(&self, drives: Vec<DriveInfo>) {
        *self.drives.write() = drives;
    }
}

#[async_trait]
impl DeviceInventory for FakeInventory {
    async fn list_drives(&self, removable_only: bool) -> Vec<DriveInfo> {
        self.drives
            .read()
            .iter()
            .filter(|d| !removable_only || d.removable)
            .cloned()
            .collect()
    }

    async fn list_ports(&self) -> Vec<PortEntry> {
        self.drives
            .read()
            .iter()
            .filter(|d| !d.by_path.is_empty())
            .map(|d| PortEntry {
                port_path: d.by_path.clone(),
                device: d.device_path.clone(),
            })
            .collect()
    }

    async fn list_physical_ports(&self) -> Vec<PhysicalPort> {
        self.drives
            .read()
            .iter()
            .filter(|d| !d.by_path.is_empty())
            .map(|d| PhysicalPort {
                port_path: d.by_path.clone(),
                alias: d.by_path.clone(),
                usb_speed: "unknown".to_string(),
                device_path: d.device_path.clone(),
                device_model: d.model.clone(),
                device_size: d.size_human.clone(),
                device_serial: d.serial.clone(),
                device_vendor: d.vendor.clone(),
                removable: d.removable,
                is_system: d.is_system,
                occupied: true,
            })
            .collect()
    }

    async fn unmount_device(&self, device_path: &str) -> (bool, String) {
        self.unmounted.lock().push(device_path.to_string());
        (true, "OK".to_string())
    }

    async fn eject_device(&self, device_path: &str) -> (bool, String) {
        self.ejected.lock().push(device_path.to_string());
        (true, "ejected".to_string())
    }
}

/// Gate for holding a stub write stage open until the test releases it.
#[derive(Debug, Default)]
pub struct StageGate {
    released: AtomicBool,
}

impl StageGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    /// Block until released; false when the kill signal fires first.
    fn wait(&self, kill: &KillSignal) -> bool {
        loop {
            if self.released.load(Ordering::SeqCst) {
                return true;
            }
            if kill.is_raised() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Stage runner with fixed outcomes, an optional write gate, and counters
/// for observing the concurrency bound.
#[derive(Debug)]
pub struct StubStages {
    write_ok: bool,
    verify_ok: bool,
    expand_ok: bool,
    resize_ok: bool,
    gate: Option<Arc<StageGate>>,
    active_writes: AtomicUsize,
    max_active_writes: AtomicUsize,
}

impl StubStages {
    /// Every stage succeeds immediately.
    pub fn succeeding() -> Self {
        Self::with_results(true, true, true, true)
    }

    pub fn with_results(write_ok: bool, verify_ok: bool, expand_ok: bool, resize_ok: bool) -> Self {
        Self {
            write_ok,
            verify_ok,
            expand_ok,
            resize_ok,
            gate: None,
            active_writes: AtomicUsize::new(0),
            max_active_writes: AtomicUsize::new(0),
        }
    }

    /// Every stage succeeds, but writes block on the gate.
    pub fn gated(gate: Arc<StageGate>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::succeeding()
        }
    }

    /// Highest number of writes ever in flight at once.
    pub fn max_active_writes(&self) -> usize {
        self.max_active_writes.load(Ordering::SeqCst)
    }

    /// The gate writes block on, when constructed with [`StubStages::gated`].
    pub fn gate_handle(&self) -> Option<Arc<StageGate>> {
        self.gate.clone()
    }
}

impl StageRunner for StubStages {
    fn write(
        &self,
        _image: &Path,
        _device: &str,
        _image_size: u64,
        sink: &StageSink,
        log: &LogRing,
        kill: &KillSignal,
    ) -> bool {
        let active = self.active_writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_writes.fetch_max(active, Ordering::SeqCst);
        log.push("stub: writing");
        sink.progress(0.5);
        let survived = match &self.gate {
            Some(gate) => gate.wait(kill),
            None => !kill.is_raised(),
        };
        self.active_writes.fetch_sub(1, Ordering::SeqCst);
        survived && self.write_ok
    }

    fn verify(
        &self,
        _image: &Path,
        _device: &str,
        sink: &StageSink,
        log: &LogRing,
        _kill: &KillSignal,
    ) -> bool {
        log.push("stub: verifying");
        sink.progress(1.0);
        self.verify_ok
    }

    fn expand(&self, _device: &str, sink: &StageSink, log: &LogRing, _kill: &KillSignal) -> bool {
        log.push("stub: expanding");
        sink.progress(1.0);
        self.expand_ok
    }

    fn resize(&self, _device: &str, sink: &StageSink, log: &LogRing, _kill: &KillSignal) -> bool {
        log.push("stub: resizing");
        sink.progress(1.0);
        self.resize_ok
    }
}
