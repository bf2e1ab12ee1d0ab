//! Prepares geographic inputs for a spatial epidemic simulator: rasterizes
//! administrative-boundary shapefiles onto a global 1/120-degree grid, and
//! partitions a population raster into per-node patch files.

pub mod admin_units;
pub mod binary_helpers;
pub mod config;
pub mod datasets;
pub mod error;
pub mod grid;
pub mod input;
pub mod instrumented_reader;
pub mod node_boundaries;
pub mod partition;
pub mod population;
pub mod raster;
pub mod rasterizer;
pub mod shapefile;

pub use admin_units::AdminUnit;
pub use config::{PartitionSettings, RasterSettings};
pub use error::{Error, Result};
pub use grid::{GridPoint, Rect, Ring, RingKind};
pub use node_boundaries::NodeBoundary;
pub use partition::{partition_to_files, Patch, PatchCounts, Partitioner};
pub use population::PopulationRaster;
pub use raster::{CellStore, FileCellStore, MemoryCellStore, RasterHeader};
pub use rasterizer::{fill, fill_unit, population_under, AdminRasterizer, CellMemory, FillMode};
pub use shapefile::AdminUnitStream;

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber. `RUST_LOG` wins over the `-v` count.
pub fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
