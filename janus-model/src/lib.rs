//! Core data model definitions shared across Janus crates.
#![allow(missing_docs)]

pub mod inventory;
pub mod job;
pub mod layout;
pub mod state;
pub mod units;

// Intentionally curated re-exports for downstream consumers.
pub use inventory::{DriveInfo, ImageInfo, PhysicalPort, PortEntry};
pub use job::{BatchInfo, BatchOptions, BatchStartRequest, JobInfo, StageUpdate};
pub use layout::{LayoutConfig, PortCell};
pub use state::{JobStage, JobState, UsbHint};
pub use units::{human_eta, human_size, human_speed};
