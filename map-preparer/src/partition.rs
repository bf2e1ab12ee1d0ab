//! Splits the population raster into square patches and assigns each to a
//! simulation node.
//!
//! Every node runs its own traversal over a fixed tiling of `max_patch`
//! blocks and writes the result to its own file. A block wholly inside one
//! territory becomes a single patch; blocks on a border are split down to
//! `min_patch`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rayon::prelude::*;
use tracing::{debug, info, span, trace, Level};

use crate::config::PartitionSettings;
use crate::error::{truncated, Error, Result};
use crate::grid::Rect;
use crate::node_boundaries::NodeBoundary;
use crate::population::PopulationRaster;
use crate::rasterizer::population_under;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Patch {
    pub x: i32,
    pub y: i32,
    pub size: i32,
    pub owner: i32,
}

impl Patch {
    pub fn new(rect: Rect, owner: usize) -> Self {
        Self { x: rect.x, y: rect.y, size: rect.size, owner: owner as i32 }
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.size)
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PatchCounts {
    pub local: u32,
    pub remote: u32,
}

impl PatchCounts {
    pub fn total(&self) -> u32 {
        self.local + self.remote
    }
}

/// `<stub>_<node>.lsi`
pub fn node_file_path(stub: &Path, node: usize) -> PathBuf {
    let mut name = stub.as_os_str().to_owned();
    name.push(format!("_{}.lsi", node));
    PathBuf::from(name)
}


// --------------------------------------------------------------------------
// Patch files

/// Streams one node's patches: two little-endian `i32` counts, the
/// `(x, y, size, owner)` records, then an all `-1` record. The counts are
/// filled in by `finish`.
#[derive(Debug)]
pub struct PatchWriter<W: Write + Seek> {
    w: W,
    node: usize,
    counts: PatchCounts,
}

impl<W: Write + Seek> PatchWriter<W> {
    pub fn new(mut w: W, node: usize) -> Result<Self> {
        w.write_i32::<LittleEndian>(0)?;
        w.write_i32::<LittleEndian>(0)?;
        Ok(Self { w, node, counts: PatchCounts::default() })
    }

    pub fn write(&mut self, patch: Patch) -> Result<()> {
        for v in [patch.x, patch.y, patch.size, patch.owner] {
            self.w.write_i32::<LittleEndian>(v)?;
        }
        if patch.owner as usize == self.node {
            self.counts.local += 1;
        } else {
            self.counts.remote += 1;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<(PatchCounts, W)> {
        for _ in 0..4 {
            self.w.write_i32::<LittleEndian>(-1)?;
        }
        self.w.seek(SeekFrom::Start(0))?;
        self.w.write_i32::<LittleEndian>(self.counts.local as i32)?;
        self.w.write_i32::<LittleEndian>(self.counts.remote as i32)?;
        self.w.flush()?;
        Ok((self.counts, self.w))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchFile {
    pub counts: PatchCounts,
    pub patches: Vec<Patch>,
}

impl PatchFile {
    /// Number of patches of each size.
    pub fn size_histogram(&self) -> BTreeMap<i32, usize> {
        let mut histogram = BTreeMap::new();
        for p in &self.patches {
            *histogram.entry(p.size).or_insert(0) += 1;
        }
        histogram
    }
}

pub fn read_patch_file<R: Read>(mut r: R) -> Result<PatchFile> {
    let local = r.read_i32::<LittleEndian>().map_err(truncated("patch counts"))?;
    let remote = r.read_i32::<LittleEndian>().map_err(truncated("patch counts"))?;
    if local < 0 || remote < 0 {
        return Err(Error::format(format!("negative patch counts {} and {}", local, remote)));
    }

    let mut patches = Vec::new();
    loop {
        let x = r.read_i32::<LittleEndian>().map_err(truncated("patch record"))?;
        if x == -1 {
            // Older files end on a single -1
            io::copy(&mut r.by_ref().take(12), &mut io::sink())?;
            break;
        }
        let y = r.read_i32::<LittleEndian>().map_err(truncated("patch record"))?;
        let size = r.read_i32::<LittleEndian>().map_err(truncated("patch record"))?;
        let owner = r.read_i32::<LittleEndian>().map_err(truncated("patch record"))?;
        patches.push(Patch { x, y, size, owner });
    }

    let counts = PatchCounts { local: local as u32, remote: remote as u32 };
    if counts.total() as usize != patches.len() {
        return Err(Error::format(format!(
            "header counts {} patches, file holds {}",
            counts.total(), patches.len()
        )));
    }
    Ok(PatchFile { counts, patches })
}

pub fn read_patch_file_at(path: &Path) -> Result<PatchFile> {
    read_patch_file(BufReader::new(File::open(path)?))
}


// --------------------------------------------------------------------------
// Partitioner

pub struct Partitioner<'a> {
    population: &'a PopulationRaster,
    nodes: &'a [NodeBoundary],
    max_patch: i32,
    min_patch: i32,
}

impl<'a> Partitioner<'a> {
    pub fn new(population: &'a PopulationRaster, nodes: &'a [NodeBoundary], settings: &PartitionSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            population,
            nodes,
            max_patch: settings.max_patch as i32,
            min_patch: settings.min_patch as i32,
        })
    }

    /// Runs node `node`'s traversal, streaming its patches into `out`.
    pub fn partition_node<W: Write + Seek>(&self, node: usize, out: W) -> Result<PatchCounts> {
        let _span = span!(Level::DEBUG, "partition_node", node).entered();
        if node >= self.nodes.len() {
            return Err(Error::Config(format!("no node {} among {}", node, self.nodes.len())));
        }

        let mut writer = PatchWriter::new(out, node)?;
        let (width, height) = (self.population.width() as i32, self.population.height() as i32);
        for x in (0..width).step_by(self.max_patch as usize) {
            for y in (0..height).step_by(self.max_patch as usize) {
                self.visit_block(node, Rect::new(x, y, self.max_patch), &mut writer)?;
            }
        }
        let (counts, _) = writer.finish()?;
        debug!("{} local and {} remote patches", counts.local, counts.remote);
        Ok(counts)
    }

    fn visit_block<W: Write + Seek>(&self, node: usize, rect: Rect, writer: &mut PatchWriter<W>) -> Result<()> {
        let population = population_under(&rect.to_ring(), self.population)?;
        if population == 0 {
            return Ok(());
        }

        if self.nodes[node].crosses(&rect) {
            if rect.size > self.min_patch {
                return self.split(node, rect, writer);
            }
            let owner = self.first_overlapping(&rect).unwrap_or(node);
            trace!("Border patch {} ({} people) to node {}", rect, population, owner);
            return writer.write(Patch::new(rect, owner));
        }

        let overlapping: Vec<usize> = (0..self.nodes.len()).filter(|&i| self.nodes[i].overlaps(&rect)).collect();
        match overlapping.as_slice() {
            [] => debug!("{} people in {} lie outside every territory", population, rect),
            [only] => {
                trace!("Patch {} ({} people) to node {}", rect, population, only);
                writer.write(Patch::new(rect, *only))?;
            }
            [first, ..] => {
                if rect.size > self.min_patch {
                    return self.split(node, rect, writer);
                }
                trace!("Shared patch {} ({} people) to node {}", rect, population, first);
                writer.write(Patch::new(rect, *first))?;
            }
        }
        Ok(())
    }

    fn split<W: Write + Seek>(&self, node: usize, rect: Rect, writer: &mut PatchWriter<W>) -> Result<()> {
        for quadrant in rect.quadrants() {
            self.visit_block(node, quadrant, writer)?;
        }
        Ok(())
    }

    fn first_overlapping(&self, rect: &Rect) -> Option<usize> {
        self.nodes.iter().position(|n| n.overlaps(rect))
    }
}

/// Writes `<out_stub>_<n>.lsi` for every node, running the traversals in
/// parallel.
pub fn partition_to_files(
    population: &PopulationRaster,
    nodes: &[NodeBoundary],
    settings: &PartitionSettings,
    out_stub: &Path,
) -> Result<Vec<PatchCounts>> {
    let partitioner = Partitioner::new(population, nodes, settings)?;
    info!("Partitioning {} people among {} nodes", population.total(), nodes.len());

    let run = || {
        (0..nodes.len())
            .into_par_iter()
            .map(|node| -> Result<PatchCounts> {
                let path = node_file_path(out_stub, node);
                let out = BufWriter::new(File::create(&path)?);
                let counts = partitioner.partition_node(node, out)?;
                info!("Node {}: {} local, {} remote patches in {}", node, counts.local, counts.remote, path.display());
                Ok(counts)
            })
            .collect::<Result<Vec<_>>>()
    };

    match settings.jobs {
        Some(jobs) => rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?
            .install(run),
        None => run(),
    }
}
