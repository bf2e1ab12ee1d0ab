//! Finding `<ISO>_adm<level>` datasets in a download directory, and bundling
//! the converted artifacts into one archive.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::admin_units::parse_dataset_name;
use crate::error::Result;

/// All administrative levels of one country found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub iso: String,
    pub max_level: u8,
    dir: PathBuf,
}

impl Dataset {
    /// Stubs for levels `0..=max_level`, coarsest first. Levels below the
    /// deepest one are expected to exist as well; a missing one fails when
    /// it is opened.
    pub fn stubs(&self) -> Vec<PathBuf> {
        (0..=self.max_level).map(|level| self.dir.join(format!("{}_adm{}", self.iso, level))).collect()
    }
}

/// Scans `dir` for `<ISO>_adm<level>.shp` (or `.shp.gz`) and keeps the
/// deepest level per country. Countries come back sorted by ISO code.
pub fn find_datasets(dir: &Path) -> Result<Vec<Dataset>> {
    let mut deepest: BTreeMap<String, u8> = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".shp.gz").or_else(|| name.strip_suffix(".shp")) else {
            continue;
        };
        if let Some((iso, level)) = parse_dataset_name(stem) {
            let max = deepest.entry(iso).or_insert(level);
            *max = (*max).max(level);
        }
    }

    let datasets: Vec<Dataset> = deepest
        .into_iter()
        .map(|(iso, max_level)| Dataset { iso, max_level, dir: dir.to_path_buf() })
        .collect();
    for d in &datasets {
        debug!("{}: levels 0..={}", d.iso, d.max_level);
    }
    info!("{} countries found in {}", datasets.len(), dir.display());
    Ok(datasets)
}

/// Deflates every `.bin` artifact in `dir` into `archive`, in name order.
/// The artifacts themselves are left in place. Returns the number packed.
pub fn package_artifacts(dir: &Path, archive: &Path) -> Result<usize> {
    let mut artifacts = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |e| e == "bin") {
            artifacts.push(path);
        }
    }
    artifacts.sort();

    let mut zip = ZipWriter::new(BufWriter::new(File::create(archive)?));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for path in &artifacts {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        zip.start_file(name, options)?;
        io::copy(&mut File::open(path)?, &mut zip)?;
        debug!("Packed {}", name);
    }
    zip.finish()?;
    info!("{} artifacts packed into {}", artifacts.len(), archive.display());
    Ok(artifacts.len())
}
