use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use clap::Parser;
use plotters::prelude::*;
use tracing::info;

use map_preparer::init_tracing;
use map_preparer::input::open_input;
use map_preparer::instrumented_reader::InstrumentedReader;
use map_preparer::raster::{raster_paths, ByteOrder, RasterHeader};

/// Jet colormap: Blue -> Cyan -> Green -> Yellow -> Red
fn jet_colormap(v: f64) -> (u8, u8, u8) {
    let r = if v < 0.375 {
        0.0
    } else if v < 0.625 {
        (v - 0.375) / 0.25
    } else if v < 0.875 {
        1.0
    } else {
        1.0 - (v - 0.875) / 0.125 * 0.5
    };

    let g = if v < 0.125 {
        0.0
    } else if v < 0.375 {
        (v - 0.125) / 0.25
    } else if v < 0.625 {
        1.0
    } else if v < 0.875 {
        1.0 - (v - 0.625) / 0.25
    } else {
        0.0
    };

    let b = if v < 0.125 {
        0.5 + v / 0.125 * 0.5
    } else if v < 0.375 {
        1.0
    } else if v < 0.625 {
        1.0 - (v - 0.375) / 0.25
    } else {
        0.0
    };

    ((r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8)
}

/// Distinct, stable color per administrative-unit code
fn categorical_color(code: u32) -> (u8, u8, u8) {
    // Golden-ratio hue stepping keeps neighbouring codes apart
    let hue = (code as f64 * 0.618_033_988_75).fract() * 6.0;
    let sector = hue.floor() as u32;
    let f = hue - sector as f64;
    let (hi, lo) = (230.0, 60.0);
    let rise = lo + f * (hi - lo);
    let fall = hi - f * (hi - lo);
    let (r, g, b) = match sector {
        0 => (hi, rise, lo),
        1 => (fall, hi, lo),
        2 => (lo, hi, rise),
        3 => (lo, fall, hi),
        4 => (rise, lo, hi),
        _ => (hi, lo, fall),
    };
    (r as u8, g as u8, b as u8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scale {
    /// ln(1 + v) normalization, for population counts
    Log,
    Linear,
    /// One color per code, for administrative-unit rasters
    Categorical,
}

/// Downsampled raster: each pixel aggregates a `factor` x `factor` block.
#[derive(Debug)]
struct Preview {
    width: usize,
    height: usize,
    /// Summed values for numeric scales, the largest code for categorical
    data: Vec<f64>,
    /// Whether any cell of the block held data
    covered: Vec<bool>,
}

#[derive(clap::Parser)]
struct ClArgs {
    /// Input raster (`.flt` with a `.hdr` alongside)
    #[arg()]
    input_raster: PathBuf,

    /// Output PNG file path
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Value scale (log, linear, categorical)
    #[arg(long, default_value = "log")]
    scale: String,

    /// Maximum width of the image in pixels
    #[arg(long, default_value_t = 2160)]
    max_width: usize,

    /// Verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbosity: u8,
}

fn main() -> Result<()> {
    let args = ClArgs::parse();
    init_tracing(args.verbosity);

    let scale = match args.scale.to_lowercase().as_str() {
        "log" => Scale::Log,
        "linear" => Scale::Linear,
        "categorical" => Scale::Categorical,
        other => bail!("unknown scale '{}'", other),
    };
    if args.max_width == 0 {
        bail!("--max-width must be positive");
    }

    info!("Loading raster from: {}", args.input_raster.display());
    let preview = load_preview(&args.input_raster, args.max_width, scale)?;
    info!("Preview: {}x{} pixels", preview.width, preview.height);

    save_heatmap_to_png(&preview, &args.output, scale)?;

    info!("Heatmap saved to: {}", args.output.display());
    Ok(())
}

/// Stream a raster row by row, aggregating it down to at most `max_width`
/// pixels across.
fn load_preview(input: &Path, max_width: usize, scale: Scale) -> Result<Preview> {
    let (flt, hdr) = raster_paths(input);
    let header = RasterHeader::from_file(&hdr).with_context(|| format!("reading {}", hdr.display()))?;
    let (ncols, nrows) = (header.ncols as usize, header.nrows as usize);
    if ncols == 0 || nrows == 0 {
        bail!("{} describes an empty raster", hdr.display());
    }

    let factor = (ncols + max_width - 1) / max_width;
    let width = (ncols + factor - 1) / factor;
    let height = (nrows + factor - 1) / factor;
    let mut preview = Preview { width, height, data: vec![0.0; width * height], covered: vec![false; width * height] };

    let file = open_input(&flt).with_context(|| format!("opening {}", flt.display()))?;
    let mut stream = InstrumentedReader::new(file, |n| info!("Read {} MiB", n >> 20));
    let mut row = vec![0f32; ncols];
    for y in 0..nrows {
        match header.byte_order {
            ByteOrder::LsbFirst => stream.read_f32_into::<LittleEndian>(&mut row),
            ByteOrder::MsbFirst => stream.read_f32_into::<BigEndian>(&mut row),
        }
        .with_context(|| format!("reading row {} of {}", y, flt.display()))?;

        let out_row = (y / factor) * width;
        for (x, &v) in row.iter().enumerate() {
            let v = v as f64;
            if v < 0.0 || v == header.nodata_value {
                continue;
            }
            let i = out_row + x / factor;
            preview.covered[i] = true;
            match scale {
                Scale::Categorical => preview.data[i] = preview.data[i].max(v),
                _ => preview.data[i] += v,
            }
        }
    }
    Ok(preview)
}

/// Paint the preview and save to PNG
fn save_heatmap_to_png(preview: &Preview, output_path: &Path, scale: Scale) -> Result<()> {
    // Find max value for normalization
    let max_value = preview.data.iter().copied().fold(0.0, f64::max);
    info!("Max value in preview: {}", max_value);

    let root = BitMapBackend::new(output_path, (preview.width as u32, preview.height as u32)).into_drawing_area();
    root.fill(&BLACK)?;

    for y in 0..preview.height {
        for x in 0..preview.width {
            let idx = y * preview.width + x;
            if !preview.covered[idx] {
                continue;
            }
            let value = preview.data[idx];
            let (r, g, b) = match scale {
                Scale::Categorical => categorical_color(value as u32),
                Scale::Log if max_value > 0.0 => jet_colormap(value.ln_1p() / max_value.ln_1p()),
                Scale::Linear if max_value > 0.0 => jet_colormap(value / max_value),
                _ => jet_colormap(0.0),
            };
            root.draw_pixel((x as i32, y as i32), &RGBColor(r, g, b))?;
        }
    }

    root.present()?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jet_runs_from_dark_blue_to_dark_red() {
        assert_eq!(jet_colormap(0.0), (0, 0, 127));
        assert_eq!(jet_colormap(0.5), (127, 255, 127));
        assert_eq!(jet_colormap(1.0), (127, 0, 0));
    }

    #[test]
    fn neighbouring_codes_get_different_colors() {
        for code in 0..200 {
            assert_ne!(categorical_color(code), categorical_color(code + 1));
        }
    }
}
