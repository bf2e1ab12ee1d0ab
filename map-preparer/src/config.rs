use crate::error::{Error, Result};
use crate::grid::{GRID_HEIGHT, GRID_WIDTH};

/// Quadtree patch sizes and parallelism for the partitioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSettings {
    /// Side of the top-level tiling blocks, in cells.
    pub max_patch: u32,
    /// Side below which blocks are never split.
    pub min_patch: u32,
    /// Worker threads; `None` uses rayon's default pool.
    pub jobs: Option<usize>,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self { max_patch: 320, min_patch: 20, jobs: None }
    }
}

impl PartitionSettings {
    /// `max_patch` must be `min_patch` doubled zero or more times.
    pub fn validate(&self) -> Result<()> {
        if self.min_patch == 0 {
            return Err(Error::Config("minimum patch size must be positive".to_string()));
        }
        if self.max_patch % self.min_patch != 0 || !(self.max_patch / self.min_patch).is_power_of_two() {
            return Err(Error::Config(format!(
                "maximum patch size {} is not a power-of-two multiple of {}",
                self.max_patch, self.min_patch
            )));
        }
        if self.max_patch > i32::MAX as u32 / 2 {
            return Err(Error::Config(format!("maximum patch size {} too large", self.max_patch)));
        }
        if self.jobs == Some(0) {
            return Err(Error::Config("at least one job is needed".to_string()));
        }
        Ok(())
    }

    /// Every size a patch can have, largest first.
    pub fn patch_sizes(&self) -> Vec<u32> {
        let mut sizes = vec![self.max_patch];
        while let Some(&last) = sizes.last() {
            if last <= self.min_patch || last % 2 != 0 {
                break;
            }
            sizes.push(last / 2);
        }
        sizes
    }
}

/// Shape and backing of the administrative-unit raster being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterSettings {
    pub width: u32,
    pub height: u32,
    /// Build the raster in memory and write it out at the end, instead of
    /// editing the file in place.
    pub in_memory: bool,
}

impl Default for RasterSettings {
    fn default() -> Self {
        Self { width: GRID_WIDTH, height: GRID_HEIGHT, in_memory: false }
    }
}

impl RasterSettings {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!("empty {}x{} raster", self.width, self.height)));
        }
        if self.width > GRID_WIDTH || self.height > GRID_HEIGHT {
            return Err(Error::Config(format!(
                "{}x{} raster exceeds the {}x{} grid",
                self.width, self.height, GRID_WIDTH, GRID_HEIGHT
            )));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = PartitionSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.patch_sizes(), vec![320, 160, 80, 40, 20]);
        RasterSettings::default().validate().unwrap();
    }

    #[test]
    fn sizes_must_halve_evenly() {
        let bad = PartitionSettings { max_patch: 300, min_patch: 20, jobs: None };
        assert!(matches!(bad.validate(), Err(Error::Config(_))));
        let bad = PartitionSettings { max_patch: 320, min_patch: 30, jobs: None };
        assert!(bad.validate().is_err());
        let bad = PartitionSettings { max_patch: 320, min_patch: 0, jobs: None };
        assert!(bad.validate().is_err());
        let same = PartitionSettings { max_patch: 40, min_patch: 40, jobs: Some(2) };
        same.validate().unwrap();
        assert_eq!(same.patch_sizes(), vec![40]);
    }

    #[test]
    fn zero_jobs_rejected() {
        let bad = PartitionSettings { jobs: Some(0), ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn raster_must_fit_the_grid() {
        let bad = RasterSettings { width: GRID_WIDTH + 1, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = RasterSettings { height: 0, ..Default::default() };
        assert!(bad.validate().is_err());
    }
}
