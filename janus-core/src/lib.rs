//! # Janus Core
//!
//! Orchestration core for the Janus mass-flashing console.
//!
//! ## Overview
//!
//! This crate owns everything between the HTTP edge and the external tools:
//!
//! - **Event Bus**: fan-out of typed events to SSE subscribers with bounded
//!   inboxes and slow-consumer eviction
//! - **Device Inventory**: block-device and USB-port enumeration, unmount
//!   and power-off
//! - **Image Catalog**: flashable image discovery and classification
//! - **Layout Store**: persistence of the operator grid
//! - **Stage Executors**: write / verify / expand / resize workers driving
//!   external tools with incremental progress
//! - **Job Manager**: concurrency-limited, cancellable pipelines over the
//!   stage executors

pub mod bus;
pub mod error;
pub mod flash;
pub mod images;
pub mod inventory;
pub mod jobs;
pub mod layout;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use bus::{BusEvent, EventBus};
pub use error::{CoreError, Result};
pub use flash::{KillSignal, LogRing, StageRunner, StageSink, SystemStages};
pub use images::ImageCatalog;
pub use inventory::{DeviceInventory, SystemInventory};
pub use jobs::JobManager;
pub use layout::LayoutStore;
