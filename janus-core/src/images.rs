//! Image catalog: flashable files in the images directory.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use janus_model::{ImageInfo, human_size};

use crate::error::Result;

const IMAGE_EXTENSIONS: [&str; 6] = [".img", ".iso", ".img.xz", ".img.gz", ".img.bz2", ".img.zst"];

/// Full dot-suffix chain of a file name, e.g. `.img.xz` for `raspios.img.xz`.
fn suffix_chain(name: &str) -> Option<&str> {
    let trimmed = name.trim_start_matches('.');
    let idx = trimmed.find('.')?;
    Some(&trimmed[idx..])
}

/// Last single suffix of a file name, e.g. `.xz` for `raspios.img.xz`.
fn last_suffix(name: &str) -> Option<&str> {
    let trimmed = name.trim_start_matches('.');
    let idx = trimmed.rfind('.')?;
    Some(&trimmed[idx..])
}

/// Whether a file name carries a recognized image suffix.
///
/// The full joined suffix chain is checked before the single suffix so that
/// `.img.xz` wins over a bare `.xz`.
fn is_image_name(name: &str) -> bool {
    let chain_hit = suffix_chain(name).is_some_and(|c| IMAGE_EXTENSIONS.contains(&c));
    let single_hit = last_suffix(name).is_some_and(|s| IMAGE_EXTENSIONS.contains(&s));
    chain_hit || single_hit
}

/// Read-only view over the configured images directory.
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    dir: PathBuf,
}

impl ImageCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Enumerate recognized image files, sorted by name.
    ///
    /// Creates the directory on first use so a fresh install starts clean.
    pub fn list_images(&self) -> Result<Vec<ImageInfo>> {
        std::fs::create_dir_all(&self.dir)?;

        let mut images = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_image_name(&name) {
                continue;
            }
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            let img_type = suffix_chain(&name)
                .or_else(|| last_suffix(&name))
                .unwrap_or_default()
                .trim_start_matches('.')
                .to_string();
            images.push(ImageInfo {
                path: entry.path().to_string_lossy().into_owned(),
                size_bytes: meta.len(),
                size_human: human_size(meta.len()),
                mtime,
                img_type,
                name,
            });
        }
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    /// Resolve an image name to its catalog entry.
    pub fn find(&self, name: &str) -> Result<Option<ImageInfo>> {
        Ok(self.list_images()?.into_iter().find(|img| img.name == name))
    }
}
