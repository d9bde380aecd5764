//! Device inventory: block devices, USB port topology, unmount and eject.
//!
//! Everything here is a fresh snapshot per call; nothing is cached. Device
//! enumeration leans on `lsblk -J`, topology on `/dev/disk/by-path`, and the
//! root-filesystem device on `findmnt`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use janus_model::{DriveInfo, PhysicalPort, PortEntry, human_size};

use crate::error::CoreError;

const LSBLK_COLUMNS: &str = "NAME,SIZE,TYPE,MOUNTPOINT,MOUNTPOINTS,VENDOR,MODEL,SERIAL,TRAN,RM,HOTPLUG";
const LSBLK_TIMEOUT: Duration = Duration::from_secs(10);
const FINDMNT_TIMEOUT: Duration = Duration::from_secs(5);
const UMOUNT_TIMEOUT: Duration = Duration::from_secs(15);
const EJECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Capability seam between the job manager / API and the host platform.
///
/// Production uses [`SystemInventory`]; tests substitute a fake so pipelines
/// can run against synthetic drives.
#[async_trait]
pub trait DeviceInventory: Send + Sync {
    /// Snapshot of block devices of type disk.
    async fn list_drives(&self, removable_only: bool) -> Vec<DriveInfo>;

    /// Flat legacy listing of every by-path link with its resolved device.
    async fn list_ports(&self) -> Vec<PortEntry>;

    /// Deduplicated physical USB ports (disk-level links only) with the
    /// currently attached drive, if any.
    async fn list_physical_ports(&self) -> Vec<PhysicalPort>;

    /// Unmount every mounted child of a device. Returns `(ok, message)`.
    async fn unmount_device(&self, device_path: &str) -> (bool, String);

    /// Unmount, then power the device off. Returns `(ok, message)`.
    async fn eject_device(&self, device_path: &str) -> (bool, String);
}

// ── lsblk JSON DTOs ──────────────────────────────────────────────────────

/// lsblk emits booleans as real booleans or as "0"/"1" strings depending on
/// version; sizes likewise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Toggle {
    Bool(bool),
    Int(u64),
    Text(String),
}

impl Toggle {
    fn as_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Text(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ByteCount {
    Int(u64),
    Text(String),
}

impl ByteCount {
    fn as_u64(&self) -> u64 {
        match self {
            Self::Int(n) => *n,
            Self::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LsblkReport {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    size: Option<ByteCount>,
    mountpoint: Option<String>,
    mountpoints: Option<Vec<Option<String>>>,
    vendor: Option<String>,
    model: Option<String>,
    serial: Option<String>,
    tran: Option<String>,
    rm: Option<Toggle>,
    hotplug: Option<Toggle>,
    children: Option<Vec<LsblkDevice>>,
}

// ── Topology helpers ─────────────────────────────────────────────────────

static RE_ROOT_DISK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/dev/(?:sd[a-z]+|nvme\d+n\d+|mmcblk\d+))").expect("static regex"));
static RE_USB_TOPOLOGY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"usb[v23]*-(\d+):(\d+)").expect("static regex"));
static RE_PARTITION_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-part\d+$").expect("static regex"));
static RE_LUN_PARTITION_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"lun-\d+-part\d+$").expect("static regex"));

/// Strip the partition suffix from a findmnt SOURCE, e.g.
/// `/dev/mmcblk0p2` → `/dev/mmcblk0`.
fn parent_disk_of(source: &str) -> String {
    RE_ROOT_DISK
        .captures(source)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| source.to_string())
}

/// Whether a by-path link name refers to a partition rather than a disk.
fn is_partition_link(name: &str) -> bool {
    RE_PARTITION_LINK.is_match(name) || RE_LUN_PARTITION_LINK.is_match(name)
}

/// USB generation for a by-path identifier.
///
/// Version markers in the topology string win; otherwise the kernel-reported
/// link speed under sysfs decides: ≥5000 Mb/s → 3.2, ≥480 → 2.0, else 1.1.
fn usb_speed_from_path(port_path: &str, sysfs_usb_dir: &Path) -> String {
    let lower = port_path.to_lowercase();
    if lower.contains("usb3") || lower.contains("usbv3") {
        return "3.0".to_string();
    }
    if lower.contains("usb2") || lower.contains("usbv2") {
        return "2.0".to_string();
    }
    if let Some(caps) = RE_USB_TOPOLOGY.captures(port_path) {
        let speed_file = sysfs_usb_dir.join(format!("{}-{}", &caps[1], &caps[2])).join("speed");
        if let Ok(raw) = std::fs::read_to_string(speed_file)
            && let Ok(mbps) = raw.trim().parse::<f64>()
        {
            return if mbps >= 5000.0 {
                "3.2".to_string()
            } else if mbps >= 480.0 {
                "2.0".to_string()
            } else {
                "1.1".to_string()
            };
        }
    }
    "unknown".to_string()
}

/// Short human alias for a by-path identifier, e.g. `USB 0:3`; falls back to
/// the last 20 characters of the link name.
fn short_port_alias(port_path: &str) -> String {
    let name = Path::new(port_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| port_path.to_string());
    if let Some(caps) = RE_USB_TOPOLOGY.captures(&name) {
        return format!("USB {}:{}", &caps[1], &caps[2]);
    }
    let chars: Vec<char> = name.chars().collect();
    if chars.len() > 20 {
        chars[chars.len() - 20..].iter().collect()
    } else {
        name
    }
}

/// Map resolved device path → by-path link, e.g.
/// `/dev/sdb` → `/dev/disk/by-path/pci-...-usb-0:3:1.0-scsi-0:0:0:0`.
fn by_path_map(by_path_dir: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(entries) = std::fs::read_dir(by_path_dir) else {
        return map;
    };
    for entry in entries.flatten() {
        let link = entry.path();
        if let Ok(target) = std::fs::canonicalize(&link) {
            map.insert(
                target.to_string_lossy().into_owned(),
                link.to_string_lossy().into_owned(),
            );
        }
    }
    map
}

/// Sorted by-path links with their resolved targets.
fn by_path_entries(by_path_dir: &Path) -> Vec<(String, String)> {
    let Ok(entries) = std::fs::read_dir(by_path_dir) else {
        return Vec::new();
    };
    let mut links: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    links.sort();
    links
        .into_iter()
        .map(|link| {
            let target = std::fs::canonicalize(&link)
                .map(|t| t.to_string_lossy().into_owned())
                .unwrap_or_default();
            (link.to_string_lossy().into_owned(), target)
        })
        .collect()
}

async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> crate::Result<std::process::Output> {
    let future = tokio::process::Command::new(program).args(args).output();
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(CoreError::Io(err)),
        Err(_) => Err(CoreError::Timeout {
            command: program.to_string(),
            seconds: timeout.as_secs(),
        }),
    }
}

fn is_not_found(err: &CoreError) -> bool {
    matches!(err, CoreError::Io(io) if io.kind() == std::io::ErrorKind::NotFound)
}

// ── SystemInventory ──────────────────────────────────────────────────────

/// Inventory backed by the host's lsblk / findmnt / udisksctl tooling.
#[derive(Debug, Clone)]
pub struct SystemInventory {
    by_path_dir: PathBuf,
    sysfs_usb_dir: PathBuf,
}

impl Default for SystemInventory {
    fn default() -> Self {
        Self {
            by_path_dir: PathBuf::from("/dev/disk/by-path"),
            sysfs_usb_dir: PathBuf::from("/sys/bus/usb/devices"),
        }
    }
}

impl SystemInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The block device backing `/`, with any partition suffix stripped.
    async fn root_device(&self) -> String {
        match run_command("findmnt", &["-n", "-o", "SOURCE", "/"], FINDMNT_TIMEOUT).await {
            Ok(out) if out.status.success() => {
                parent_disk_of(String::from_utf8_lossy(&out.stdout).trim())
            }
            Ok(_) | Err(_) => String::new(),
        }
    }

    async fn lsblk(&self, args: &[&str]) -> crate::Result<LsblkReport> {
        let out = run_command("lsblk", args, LSBLK_TIMEOUT).await?;
        if !out.status.success() {
            return Err(CoreError::Command {
                command: "lsblk".to_string(),
                message: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(serde_json::from_slice(&out.stdout)?)
    }
}

#[async_trait]
impl DeviceInventory for SystemInventory {
    async fn list_drives(&self, removable_only: bool) -> Vec<DriveInfo> {
        let report = match self.lsblk(&["-J", "-b", "-o", LSBLK_COLUMNS]).await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = %err, "lsblk failed");
                return Vec::new();
            }
        };

        let root_dev = self.root_device().await;
        let bp_map = by_path_map(&self.by_path_dir);

        let mut drives = Vec::new();
        for device in &report.blockdevices {
            if device.kind != "disk" {
                continue;
            }
            let dev_path = format!("/dev/{}", device.name);
            let removable = device.rm.as_ref().is_some_and(Toggle::as_bool)
                || device.hotplug.as_ref().is_some_and(Toggle::as_bool);
            if removable_only && !removable {
                continue;
            }

            // Mountpoints live on the children; the parent only carries one
            // for partitionless filesystems.
            let mut mounts: Vec<String> = Vec::new();
            for child in device.children.as_deref().unwrap_or_default() {
                if let Some(mp) = &child.mountpoint
                    && !mp.is_empty()
                {
                    mounts.push(mp.clone());
                }
                for mp in child.mountpoints.as_deref().unwrap_or_default().iter().flatten() {
                    if !mp.is_empty() && !mounts.contains(mp) {
                        mounts.push(mp.clone());
                    }
                }
            }
            if let Some(mp) = &device.mountpoint
                && !mp.is_empty()
            {
                mounts.push(mp.clone());
            }

            let is_system = (!root_dev.is_empty() && dev_path == root_dev)
                || mounts.iter().any(|m| m == "/");
            let size_bytes = device.size.as_ref().map(ByteCount::as_u64).unwrap_or(0);
            let by_path = bp_map.get(&dev_path).cloned().unwrap_or_default();

            drives.push(DriveInfo {
                device_path: dev_path,
                by_path: by_path.clone(),
                model: device.model.as_deref().unwrap_or("").trim().to_string(),
                serial: device.serial.as_deref().unwrap_or("").trim().to_string(),
                vendor: device.vendor.as_deref().unwrap_or("").trim().to_string(),
                size_bytes,
                size_human: human_size(size_bytes),
                removable,
                mounted: !mounts.is_empty(),
                mountpoints: mounts,
                usb_speed: device.tran.clone().unwrap_or_default(),
                port_path: by_path,
                is_system,
            });
        }
        drives
    }

    async fn list_ports(&self) -> Vec<PortEntry> {
        by_path_entries(&self.by_path_dir)
            .into_iter()
            .map(|(port_path, device)| PortEntry { port_path, device })
            .collect()
    }

    async fn list_physical_ports(&self) -> Vec<PhysicalPort> {
        let drives = self.list_drives(false).await;
        let drive_by_bypath: HashMap<&str, &DriveInfo> = drives
            .iter()
            .filter(|d| !d.by_path.is_empty())
            .map(|d| (d.by_path.as_str(), d))
            .collect();

        let mut ports = Vec::new();
        for (port_path, target) in by_path_entries(&self.by_path_dir) {
            let name = Path::new(&port_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if is_partition_link(&name) {
                continue;
            }

            let drive = drive_by_bypath
                .get(port_path.as_str())
                .copied()
                .or_else(|| {
                    if target.is_empty() {
                        None
                    } else {
                        drives.iter().find(|d| d.device_path == target)
                    }
                });

            ports.push(PhysicalPort {
                alias: short_port_alias(&port_path),
                usb_speed: usb_speed_from_path(&port_path, &self.sysfs_usb_dir),
                device_path: drive.map(|d| d.device_path.clone()).unwrap_or_default(),
                device_model: drive.map(|d| d.model.clone()).unwrap_or_default(),
                device_size: drive.map(|d| d.size_human.clone()).unwrap_or_default(),
                device_serial: drive.map(|d| d.serial.clone()).unwrap_or_default(),
                device_vendor: drive.map(|d| d.vendor.clone()).unwrap_or_default(),
                removable: drive.map(|d| d.removable).unwrap_or(false),
                is_system: drive.map(|d| d.is_system).unwrap_or(false),
                occupied: drive.is_some(),
                port_path,
            });
        }
        ports
    }

    async fn unmount_device(&self, device_path: &str) -> (bool, String) {
        let report = match self
            .lsblk(&["-J", "-n", "-o", "NAME,MOUNTPOINT", device_path])
            .await
        {
            Ok(report) => report,
            Err(err) => return (false, err.to_string()),
        };

        for device in &report.blockdevices {
            // Partitionless devices mount the disk node itself.
            let nodes: Vec<&LsblkDevice> = match device.children.as_deref() {
                Some(children) if !children.is_empty() => children.iter().collect(),
                _ => vec![device],
            };
            for node in nodes {
                let Some(mp) = &node.mountpoint else { continue };
                if mp.is_empty() {
                    continue;
                }
                let dev = format!("/dev/{}", node.name);
                match run_command("umount", &[dev.as_str()], UMOUNT_TIMEOUT).await {
                    Ok(out) if out.status.success() => {}
                    Ok(out) => {
                        return (
                            false,
                            format!(
                                "umount {dev}: {}",
                                String::from_utf8_lossy(&out.stderr).trim()
                            ),
                        );
                    }
                    Err(err) => return (false, err.to_string()),
                }
            }
        }
        (true, "OK".to_string())
    }

    async fn eject_device(&self, device_path: &str) -> (bool, String) {
        let (ok, msg) = self.unmount_device(device_path).await;
        if !ok {
            return (false, format!("unmount failed: {msg}"));
        }

        match run_command(
            "udisksctl",
            &["power-off", "-b", device_path, "--no-user-interaction"],
            EJECT_TIMEOUT,
        )
        .await
        {
            Ok(out) if out.status.success() => (true, "ejected".to_string()),
            Err(err) if is_not_found(&err) => {
                // udisksctl not installed; eject(1) is the usual fallback.
                match run_command("eject", &[device_path], EJECT_TIMEOUT).await {
                    Ok(out) if out.status.success() => (true, "ejected".to_string()),
                    Ok(out) => (false, String::from_utf8_lossy(&out.stderr).trim().to_string()),
                    Err(err) => (false, err.to_string()),
                }
            }
            Ok(out) => (false, String::from_utf8_lossy(&out.stderr).trim().to_string()),
            Err(err) => (false, err.to_string()),
        }
    }
}
