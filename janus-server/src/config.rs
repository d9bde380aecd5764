use std::path::PathBuf;

use clap::Parser;

/// Command line arguments for the Janus server; every switch can also come
/// from the environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "janus-server")]
#[command(about = "Operator console for mass-flashing SD cards via USB hubs")]
pub struct Config {
    /// Bind address
    #[arg(long, env = "JANUS_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port
    #[arg(short, long, env = "JANUS_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Directory scanned for flashable images
    #[arg(long, env = "JANUS_IMAGES_DIR", default_value = "images")]
    pub images_dir: PathBuf,

    /// Directory holding persistent state (layout.json)
    #[arg(long, env = "JANUS_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Static web UI directory, served when present
    #[arg(long, env = "JANUS_WEB_DIR", default_value = "web")]
    pub web_dir: PathBuf,
}

impl Config {
    pub fn layout_path(&self) -> PathBuf {
        self.data_dir.join("layout.json")
    }

    /// Create the data and images directories if missing.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.images_dir)?;
        Ok(())
    }
}
