use serde::{Deserialize, Serialize};

use crate::state::UsbHint;

/// One cell in the operator grid.
///
/// A cell binds a short stable label (`cell_id`, e.g. `"A1"`) to the
/// topology-stable identifier of a physical USB port. The port binding is
/// what survives replugs; the kernel device name does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortCell {
    pub cell_id: String,
    pub label: String,
    /// Stable device path / by-path identifier, empty when unbound.
    pub port_id: String,
    pub usb_hint: UsbHint,
    pub enabled: bool,
}

impl Default for PortCell {
    fn default() -> Self {
        Self {
            cell_id: String::new(),
            label: String::new(),
            port_id: String::new(),
            usb_hint: UsbHint::Unknown,
            enabled: true,
        }
    }
}

/// The operator grid: cells plus display dimensions.
///
/// `cells.len() == rows * cols` is not enforced; sparse layouts are valid.
/// The invariant that matters is `cell_id` uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub schema_version: u32,
    pub rows: u32,
    pub cols: u32,
    /// Display density, `"compact"` or `"normal"`.
    pub cell_size: String,
    pub cells: Vec<PortCell>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            rows: 2,
            cols: 4,
            cell_size: "normal".to_string(),
            cells: Vec::new(),
        }
    }
}

impl LayoutConfig {
    /// Look up a cell by id.
    pub fn cell(&self, cell_id: &str) -> Option<&PortCell> {
        self.cells.iter().find(|c| c.cell_id == cell_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let layout: LayoutConfig =
            serde_json::from_str(r#"{"cells": [{"cell_id": "A1"}]}"#).unwrap();
        assert_eq!(layout.schema_version, 1);
        assert_eq!((layout.rows, layout.cols), (2, 4));
        assert_eq!(layout.cell_size, "normal");
        let cell = layout.cell("A1").unwrap();
        assert!(cell.enabled);
        assert_eq!(cell.usb_hint, UsbHint::Unknown);
        assert!(layout.cell("Z9").is_none());
    }
}
