//! Layout store: the operator grid persisted as pretty JSON.

use std::io::Write;
use std::path::{Path, PathBuf};

use janus_model::{LayoutConfig, PortCell};

use crate::error::Result;

/// Synthesize the default 2×4 grid labelled `A1..B4`.
fn default_layout() -> LayoutConfig {
    let (rows, cols) = (2u32, 4u32);
    let mut cells = Vec::with_capacity((rows * cols) as usize);
    for r in 0..rows {
        for c in 0..cols {
            let label = format!("{}{}", (b'A' + r as u8) as char, c + 1);
            cells.push(PortCell {
                cell_id: label.clone(),
                label,
                ..Default::default()
            });
        }
    }
    LayoutConfig {
        rows,
        cols,
        cells,
        ..Default::default()
    }
}

/// Persistence for the operator grid.
#[derive(Debug, Clone)]
pub struct LayoutStore {
    path: PathBuf,
}

impl LayoutStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current layout.
    ///
    /// A missing file yields the default grid (persisted immediately). A
    /// corrupt file yields the default too, but the file is left untouched
    /// for the operator to inspect.
    pub fn load(&self) -> LayoutConfig {
        if !self.path.exists() {
            let layout = default_layout();
            if let Err(err) = self.save(&layout) {
                tracing::warn!(error = %err, "failed to persist default layout");
            }
            return layout;
        }
        match std::fs::read_to_string(&self.path)
            .map_err(crate::CoreError::from)
            .and_then(|raw| Ok(serde_json::from_str::<LayoutConfig>(&raw)?))
        {
            Ok(layout) => layout,
            Err(err) => {
                tracing::warn!(error = %err, "failed to parse layout.json, using default");
                default_layout()
            }
        }
    }

    /// Persist a layout atomically (write-then-rename in the same directory).
    pub fn save(&self, layout: &LayoutConfig) -> Result<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)?;
        let pretty = serde_json::to_string_pretty(layout)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(pretty.as_bytes())?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        tracing::info!(cells = layout.cells.len(), "layout saved");
        Ok(())
    }

    /// Pretty JSON encoding of the current layout, for download.
    pub fn export_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.load())?)
    }

    /// Parse an uploaded layout and replace the stored one.
    pub fn import(&self, raw: &[u8]) -> Result<LayoutConfig> {
        let layout: LayoutConfig = serde_json::from_slice(raw)?;
        self.save(&layout)?;
        Ok(layout)
    }
}
