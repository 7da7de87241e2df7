//! # Watermark Core
//!
//! Watermark assignment resolution and image compositing for a media
//! catalog of item sets, items and media. Resources pick up a watermark set
//! directly, by inheritance along media → item → item set, or from the
//! system default. The applicator composites the selected watermark onto a
//! media's derivative renditions and rewrites them in their original format.

pub mod applicator;
pub mod codec;
pub mod compositor;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod resolver;
pub mod storage;
pub mod store;

// Re-export commonly used types
pub use applicator::WatermarkApplicator;
pub use codec::ImageFormat;
pub use compositor::{Compositor, Placement, PositionCalculator};
pub use self::config::*;
pub use database::DatabaseManager;
pub use error::*;
pub use logging::*;
pub use models::*;
pub use resolver::{AssignmentResolver, Resolution, ResolutionSource};
pub use storage::{FileStore, MediaStorage};
pub use store::{ResourceLookup, WatermarkStore};

/// Initialize the watermark core library
pub async fn init() -> Result<()> {
    // Guard is only returned when logging to a file, which the default config doesn't do
    let _guard = logging::init_logging()?;

    tracing::info!("Watermark core initialized successfully");
    Ok(())
}

/// Get the version of the watermark core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
