use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use map_preparer::admin_units::{self, artifact_name, write_artifact_file, write_catalogue, write_catalogue_header};
use map_preparer::datasets::{find_datasets, package_artifacts, Dataset};
use map_preparer::partition::read_patch_file_at;
use map_preparer::raster::{create_empty_raster, raster_paths, UNASSIGNED};
use map_preparer::{
    init_tracing, node_boundaries, partition_to_files, AdminRasterizer, AdminUnit, AdminUnitStream, CellStore,
    FileCellStore, MemoryCellStore, PartitionSettings, PopulationRaster, RasterHeader, RasterSettings,
};

#[derive(clap::Parser)]
#[command(about = "Prepares administrative-unit rasters and population patch files")]
struct ClArgs {
    #[command(subcommand)]
    command: Command,

    /// Verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbosity: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Decode `<ISO>_adm<level>` shapefile pairs into unit artifacts
    Convert {
        /// Dataset stubs; `<stub>.shp` and `<stub>.dbf` (or their `.gz`) must exist
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        stubs: Vec<PathBuf>,

        /// Convert every level of every country found in this directory
        #[arg(long, value_name = "DIR")]
        all: Option<PathBuf>,

        /// Directory receiving the artifacts and `units.tsv`
        #[arg(long)]
        out: PathBuf,

        /// Also pack the artifacts into `<out>/bins.zip`
        #[arg(long)]
        zip: bool,
    },

    /// Paint unit artifacts into an administrative-unit raster
    Rasterize {
        #[arg(required = true)]
        artifacts: Vec<PathBuf>,

        /// Output raster stub; `.flt` and `.hdr` are appended
        #[arg(long)]
        map: PathBuf,

        #[arg(long, default_value_t = RasterSettings::default().width)]
        width: u32,

        #[arg(long, default_value_t = RasterSettings::default().height)]
        height: u32,

        /// Build the raster in memory rather than editing the file in place
        #[arg(long)]
        in_memory: bool,
    },

    /// Partition a population raster into per-node patch files
    Patches {
        /// Population raster (`.flt`, with a `.hdr` alongside)
        population: PathBuf,

        /// Node boundary configuration
        nodes: PathBuf,

        /// Output stub; node `n` is written to `<stub>_<n>.lsi`
        out_stub: PathBuf,

        #[arg(long, default_value_t = PartitionSettings::default().max_patch)]
        max_patch: u32,

        #[arg(long, default_value_t = PartitionSettings::default().min_patch)]
        min_patch: u32,

        /// Worker threads (default: one per core)
        #[arg(long)]
        jobs: Option<usize>,
    },

    /// Summarize a patch file
    InspectPatches {
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = ClArgs::parse();
    init_tracing(args.verbosity);

    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Convert { stubs, all, out, zip } => {
            let stubs: Vec<PathBuf> = match all {
                Some(dir) => find_datasets(&dir)
                    .with_context(|| format!("scanning {}", dir.display()))?
                    .iter()
                    .flat_map(Dataset::stubs)
                    .collect(),
                None => stubs,
            };
            convert(&stubs, &out)?;
            if zip {
                let archive = out.join("bins.zip");
                package_artifacts(&out, &archive).with_context(|| format!("writing {}", archive.display()))?;
            }
            Ok(())
        }
        Command::Rasterize { artifacts, map, width, height, in_memory } => {
            rasterize(&artifacts, &map, &RasterSettings { width, height, in_memory })
        }
        Command::Patches { population, nodes, out_stub, max_patch, min_patch, jobs } => {
            patches(&population, &nodes, &out_stub, &PartitionSettings { max_patch, min_patch, jobs })
        }
        Command::InspectPatches { file } => inspect_patches(&file),
    }
}

fn convert(stubs: &[PathBuf], out: &Path) -> Result<()> {
    std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;
    let catalogue_path = out.join("units.tsv");
    let mut catalogue = BufWriter::new(
        File::create(&catalogue_path).with_context(|| format!("creating {}", catalogue_path.display()))?,
    );
    write_catalogue_header(&mut catalogue)?;

    let mut next_code = 0;
    for stub in stubs {
        let units: Vec<AdminUnit> = AdminUnitStream::from_files(stub)
            .and_then(|stream| stream.collect())
            .with_context(|| format!("decoding {}", stub.display()))?;
        let Some(first) = units.first() else {
            warn!("{} holds no units", stub.display());
            continue;
        };
        let (iso, level) = (first.iso.clone(), first.level);

        let path = out.join(artifact_name(&iso, level));
        write_artifact_file(&path, &iso, level, &units).with_context(|| format!("writing {}", path.display()))?;
        next_code = write_catalogue(&mut catalogue, next_code, &units)?;
        info!("{}: {} units written to {}", stub.display(), units.len(), path.display());
    }
    catalogue.flush()?;
    info!("{} units catalogued in {}", next_code, catalogue_path.display());
    Ok(())
}

fn rasterize(artifacts: &[PathBuf], map: &Path, settings: &RasterSettings) -> Result<()> {
    settings.validate()?;
    let header = RasterHeader::with_size(settings.width, settings.height);
    let (flt, hdr) = raster_paths(map);

    if settings.in_memory {
        let mut store = MemoryCellStore::new(settings.width, settings.height, UNASSIGNED);
        let written = paint_artifacts(artifacts, &mut store)?;
        header.write_file(&hdr).with_context(|| format!("writing {}", hdr.display()))?;
        store
            .write_to(File::create(&flt).with_context(|| format!("creating {}", flt.display()))?)
            .with_context(|| format!("writing {}", flt.display()))?;
        info!("{} units painted into {}", written, flt.display());
    } else {
        create_empty_raster(map, &header).with_context(|| format!("creating {}", flt.display()))?;
        let mut store = FileCellStore::open(&flt, settings.width, settings.height)?;
        let written = paint_artifacts(artifacts, &mut store)?;
        store.sync()?;
        info!("{} units painted into {}", written, flt.display());
    }
    Ok(())
}

fn paint_artifacts<S: CellStore>(artifacts: &[PathBuf], store: &mut S) -> Result<usize> {
    let mut rasterizer = AdminRasterizer::new(store);
    for path in artifacts {
        let units = admin_units::read_artifact_file(path).with_context(|| format!("reading {}", path.display()))?;
        for unit in &units {
            rasterizer
                .add_unit(unit)
                .with_context(|| format!("painting {} from {}", unit.display_name(), path.display()))?;
        }
        info!("{}: {} units", path.display(), units.len());
    }
    Ok(rasterizer.units_written())
}

fn patches(population: &Path, nodes: &Path, out_stub: &Path, settings: &PartitionSettings) -> Result<()> {
    settings.validate()?;
    let population =
        PopulationRaster::open(population).with_context(|| format!("loading {}", population.display()))?;
    let nodes = node_boundaries::load_file(nodes).with_context(|| format!("loading {}", nodes.display()))?;

    let counts = partition_to_files(&population, &nodes, settings, out_stub)
        .with_context(|| format!("writing patches to {}", out_stub.display()))?;
    for (node, c) in counts.iter().enumerate() {
        println!("{}\t{}\t{}\t{}", node, nodes[node].name, c.local, c.remote);
    }
    Ok(())
}

fn inspect_patches(file: &Path) -> Result<()> {
    let patches = read_patch_file_at(file).with_context(|| format!("reading {}", file.display()))?;
    println!("local patches:  {}", patches.counts.local);
    println!("remote patches: {}", patches.counts.remote);
    for (size, count) in patches.size_histogram() {
        println!("  {:>5} x {:<5} {}", size, size, count);
    }
    let cells: i64 = patches.patches.iter().map(|p| p.size as i64 * p.size as i64).sum();
    println!("cells covered:  {}", cells);
    Ok(())
}
