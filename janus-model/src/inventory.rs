use serde::{Deserialize, Serialize};

/// Snapshot of one block device at inventory time.
///
/// Constructed fresh on every inventory call; never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveInfo {
    /// Kernel device path, e.g. `/dev/sdb`.
    pub device_path: String,
    /// Topology-stable `/dev/disk/by-path/...` link, empty when unknown.
    pub by_path: String,
    pub model: String,
    pub serial: String,
    pub vendor: String,
    pub size_bytes: u64,
    pub size_human: String,
    pub removable: bool,
    pub mounted: bool,
    pub mountpoints: Vec<String>,
    /// Transport reported by the kernel (`usb`, `sata`, ...).
    pub usb_speed: String,
    pub port_path: String,
    /// True iff this device backs the root filesystem.
    pub is_system: bool,
}

impl Default for DriveInfo {
    fn default() -> Self {
        Self {
            device_path: String::new(),
            by_path: String::new(),
            model: String::new(),
            serial: String::new(),
            vendor: String::new(),
            size_bytes: 0,
            size_human: String::new(),
            removable: false,
            mounted: false,
            mountpoints: Vec::new(),
            usb_speed: String::new(),
            port_path: String::new(),
            is_system: false,
        }
    }
}

/// A flashable image file found in the images directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageInfo {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub size_human: String,
    /// Modification time, unix seconds.
    pub mtime: f64,
    /// Suffix chain without the leading dot, e.g. `img` or `img.xz`.
    pub img_type: String,
}

impl Default for ImageInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            path: String::new(),
            size_bytes: 0,
            size_human: String::new(),
            mtime: 0.0,
            img_type: String::new(),
        }
    }
}

/// A deduplicated physical USB port with its currently attached drive, if any.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalPort {
    pub port_path: String,
    /// Short human name, e.g. `USB 0:3`.
    pub alias: String,
    pub usb_speed: String,
    pub device_path: String,
    pub device_model: String,
    pub device_size: String,
    pub device_serial: String,
    pub device_vendor: String,
    pub removable: bool,
    pub is_system: bool,
    pub occupied: bool,
}

/// Legacy flat port listing entry: one by-path link and its resolved device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PortEntry {
    pub port_path: String,
    pub device: String,
}
