//! ESRI-style float rasters: the text header, and cell stores the rasterizer
//! writes into.
//!
//! A raster is a pair of files sharing a stub: `<stub>.hdr` holds `key value`
//! lines, `<stub>.flt` holds `ncols * nrows` 32-bit floats in row-major order,
//! row 0 being the northern edge.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder as _, LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::grid::{CELLS_PER_DEGREE, GRID_HEIGHT, GRID_WIDTH};

/// Value of a cell no administrative unit claims.
pub const UNASSIGNED: f32 = -1.0;

const WRITE_CHUNK_CELLS: usize = 1 << 20;


// --------------------------------------------------------------------------
// RasterHeader

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ByteOrder {
    LsbFirst,
    MsbFirst,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterHeader {
    pub ncols: u32,
    pub nrows: u32,
    pub xllcorner: f64,
    pub yllcorner: f64,
    pub cellsize: f64,
    pub nodata_value: f64,
    pub byte_order: ByteOrder,
}

impl RasterHeader {
    /// The 1/120-degree whole-world grid.
    pub fn global() -> Self {
        Self::with_size(GRID_WIDTH, GRID_HEIGHT)
    }

    /// A grid anchored at the north-west corner of the world with the global
    /// cell size.
    pub fn with_size(ncols: u32, nrows: u32) -> Self {
        let cellsize = 0.00833333333;
        Self {
            ncols,
            nrows,
            xllcorner: -180.0,
            yllcorner: 90.0 - nrows as f64 / CELLS_PER_DEGREE as f64,
            cellsize,
            nodata_value: -9999.0,
            byte_order: ByteOrder::LsbFirst,
        }
    }

    pub fn cell_count(&self) -> u64 {
        self.ncols as u64 * self.nrows as u64
    }

    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut ncols = None;
        let mut nrows = None;
        let mut cellsize = None;
        let mut xllcorner = None;
        let mut yllcorner = None;
        let mut xllcenter = None;
        let mut yllcenter = None;
        let mut nodata_value = -9999.0;
        let mut byte_order = ByteOrder::LsbFirst;

        for line in reader.lines() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let (key, value) = match (parts.next(), parts.next()) {
                (Some(k), Some(v)) => (k.to_ascii_lowercase(), v),
                _ => continue,
            };
            match key.as_str() {
                "ncols" => ncols = Some(parse_value::<u32>(&key, value)?),
                "nrows" => nrows = Some(parse_value::<u32>(&key, value)?),
                "cellsize" => cellsize = Some(parse_value::<f64>(&key, value)?),
                "xllcorner" => xllcorner = Some(parse_value::<f64>(&key, value)?),
                "yllcorner" => yllcorner = Some(parse_value::<f64>(&key, value)?),
                "xllcenter" => xllcenter = Some(parse_value::<f64>(&key, value)?),
                "yllcenter" => yllcenter = Some(parse_value::<f64>(&key, value)?),
                "nodata_value" => nodata_value = parse_value::<f64>(&key, value)?,
                "byteorder" => {
                    byte_order = match value.to_ascii_uppercase().as_str() {
                        "LSBFIRST" | "I" => ByteOrder::LsbFirst,
                        "MSBFIRST" | "M" => ByteOrder::MsbFirst,
                        other => return Err(Error::format(format!("unknown byteorder {}", other))),
                    }
                }
                _ => debug!("ignoring raster header key {}", key),
            }
        }

        let ncols = ncols.ok_or_else(|| Error::format("raster header lacks ncols"))?;
        let nrows = nrows.ok_or_else(|| Error::format("raster header lacks nrows"))?;
        let cellsize = cellsize.ok_or_else(|| Error::format("raster header lacks cellsize"))?;
        let xllcorner = xllcorner
            .or(xllcenter.map(|c| c - cellsize / 2.0))
            .unwrap_or(-180.0);
        let yllcorner = yllcorner
            .or(yllcenter.map(|c| c - cellsize / 2.0))
            .unwrap_or(90.0 - nrows as f64 * cellsize);

        Ok(Self { ncols, nrows, xllcorner, yllcorner, cellsize, nodata_value, byte_order })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::io::BufReader::new(File::open(path)?);
        Self::parse(file)
    }

    pub fn write<W: Write>(&self, mut w: W) -> Result<()> {
        writeln!(w, "{:<14}{}", "ncols", self.ncols)?;
        writeln!(w, "{:<14}{}", "nrows", self.nrows)?;
        writeln!(w, "{:<14}{}", "xllcorner", header_number(self.xllcorner))?;
        writeln!(w, "{:<14}{}", "yllcorner", header_number(self.yllcorner))?;
        writeln!(w, "{:<14}{}", "cellsize", header_number(self.cellsize))?;
        writeln!(w, "{:<14}{}", "NODATA_value", header_number(self.nodata_value))?;
        let order = match self.byte_order {
            ByteOrder::LsbFirst => "LSBFIRST",
            ByteOrder::MsbFirst => "MSBFIRST",
        };
        writeln!(w, "{:<14}{}", "byteorder", order)?;
        Ok(())
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write(&mut w)?;
        w.flush()?;
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::format(format!("bad raster header value for {}: {}", key, value)))
}

/// Formats with up to 11 decimals, dropping trailing zeros.
fn header_number(v: f64) -> String {
    let s = format!("{:.11}", v);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" { "0".to_string() } else { s.to_string() }
}

/// `<stub>.flt` and `<stub>.hdr` for a stub, which may itself carry either
/// extension.
pub fn raster_paths(stub: &Path) -> (PathBuf, PathBuf) {
    let base = match stub.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("flt") || ext.eq_ignore_ascii_case("hdr") => stub.with_extension(""),
        _ => stub.to_path_buf(),
    };
    (base.with_extension("flt"), base.with_extension("hdr"))
}


// --------------------------------------------------------------------------
// CellStore

/// Random access to the cells of a float raster.
///
/// Coordinates are grid cells; `in_bounds` tells whether a cell exists.
/// Reads and writes of cells outside the raster are errors.
pub trait CellStore {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn get(&mut self, x: u32, y: u32) -> Result<f32>;
    fn set(&mut self, x: u32, y: u32, value: f32) -> Result<()>;

    fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width() && (y as u32) < self.height()
    }

    fn check(&self, x: u32, y: u32) -> Result<()> {
        if x < self.width() && y < self.height() {
            Ok(())
        } else {
            Err(Error::OutOfRange { x: x as i64, y: y as i64, width: self.width(), height: self.height() })
        }
    }
}

/// A whole raster held in memory.
#[derive(Debug, Clone)]
pub struct MemoryCellStore {
    width: u32,
    height: u32,
    cells: Vec<f32>,
}

impl MemoryCellStore {
    pub fn new(width: u32, height: u32, fill: f32) -> Self {
        Self { width, height, cells: vec![fill; width as usize * height as usize] }
    }

    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    /// Convenience accessor for tests and previews.
    pub fn value(&self, x: u32, y: u32) -> f32 {
        self.cells[y as usize * self.width as usize + x as usize]
    }

    /// Writes the cells as little-endian floats, row-major.
    pub fn write_to<W: Write>(&self, w: W) -> Result<()> {
        let mut w = BufWriter::new(w);
        let mut bytes = vec![0u8; WRITE_CHUNK_CELLS.min(self.cells.len().max(1)) * 4];
        for chunk in self.cells.chunks(WRITE_CHUNK_CELLS) {
            let out = &mut bytes[..chunk.len() * 4];
            LittleEndian::write_f32_into(chunk, out);
            w.write_all(out)?;
        }
        w.flush()?;
        Ok(())
    }
}

impl CellStore for MemoryCellStore {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn get(&mut self, x: u32, y: u32) -> Result<f32> {
        self.check(x, y)?;
        Ok(self.cells[y as usize * self.width as usize + x as usize])
    }

    fn set(&mut self, x: u32, y: u32, value: f32) -> Result<()> {
        self.check(x, y)?;
        self.cells[y as usize * self.width as usize + x as usize] = value;
        Ok(())
    }
}

/// A raster `.flt` file edited in place, one seek per cell. Suitable for the
/// full global grid, which does not comfortably fit in memory.
#[derive(Debug)]
pub struct FileCellStore {
    file: File,
    width: u32,
    height: u32,
}

impl FileCellStore {
    pub fn open(path: &Path, width: u32, height: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let expected = width as u64 * height as u64 * 4;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(Error::format(format!(
                "{} holds {} bytes, a {}x{} raster needs {}",
                path.display(), actual, width, height, expected
            )));
        }
        Ok(Self { file, width, height })
    }

    fn seek_cell(&mut self, x: u32, y: u32) -> Result<()> {
        self.check(x, y)?;
        let offset = (y as u64 * self.width as u64 + x as u64) * 4;
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl CellStore for FileCellStore {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn get(&mut self, x: u32, y: u32) -> Result<f32> {
        self.seek_cell(x, y)?;
        Ok(self.file.read_f32::<LittleEndian>()?)
    }

    fn set(&mut self, x: u32, y: u32, value: f32) -> Result<()> {
        self.seek_cell(x, y)?;
        self.file.write_f32::<LittleEndian>(value)?;
        Ok(())
    }
}

/// Creates `<stub>.flt` with every cell `UNASSIGNED`, plus its header.
pub fn create_empty_raster(stub: &Path, header: &RasterHeader) -> Result<PathBuf> {
    let (flt, hdr) = raster_paths(stub);
    header.write_file(&hdr)?;

    info!("Creating empty {}x{} raster {}", header.ncols, header.nrows, flt.display());
    let mut w = BufWriter::new(File::create(&flt)?);
    let chunk = vec![UNASSIGNED; WRITE_CHUNK_CELLS];
    let mut bytes = vec![0u8; WRITE_CHUNK_CELLS * 4];
    LittleEndian::write_f32_into(&chunk, &mut bytes);
    let mut remaining = header.cell_count();
    while remaining > 0 {
        let n = remaining.min(WRITE_CHUNK_CELLS as u64) as usize;
        w.write_all(&bytes[..n * 4])?;
        remaining -= n as u64;
    }
    w.flush()?;
    Ok(flt)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn global_header_round_trips() {
        let mut buf = Vec::new();
        RasterHeader::global().write(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("ncols         43200\n"));
        assert!(text.contains("xllcorner     -180\n"));
        assert!(text.contains("cellsize      0.00833333333\n"));
        assert!(text.contains("byteorder     LSBFIRST\n"));

        let parsed = RasterHeader::parse(Cursor::new(buf)).unwrap();
        assert_eq!(parsed.ncols, 43200);
        assert_eq!(parsed.nrows, 21600);
        assert_eq!(parsed.xllcorner, -180.0);
        assert_eq!(parsed.yllcorner, -90.0);
        assert_eq!(parsed.nodata_value, -9999.0);
    }

    #[test]
    fn header_keys_are_case_insensitive_and_centers_are_converted() {
        let text = "NCOLS 10\nNROWS 5\nXLLCENTER 0.5\nYLLCENTER 0.5\nCELLSIZE 1\nbyteorder MSBFIRST\n";
        let h = RasterHeader::parse(Cursor::new(text)).unwrap();
        assert_eq!((h.ncols, h.nrows), (10, 5));
        assert_eq!(h.xllcorner, 0.0);
        assert_eq!(h.yllcorner, 0.0);
        assert_eq!(h.byte_order, ByteOrder::MsbFirst);
    }

    #[test]
    fn header_without_dimensions_is_rejected() {
        let err = RasterHeader::parse(Cursor::new("cellsize 1\n")).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn stub_paths_strip_known_extensions() {
        let (flt, hdr) = raster_paths(Path::new("maps/cbr.flt"));
        assert_eq!(flt, PathBuf::from("maps/cbr.flt"));
        assert_eq!(hdr, PathBuf::from("maps/cbr.hdr"));
        let (flt, _) = raster_paths(Path::new("maps/map_raster"));
        assert_eq!(flt, PathBuf::from("maps/map_raster.flt"));
    }

    #[test]
    fn memory_store_rejects_out_of_range_cells() {
        let mut store = MemoryCellStore::new(4, 3, UNASSIGNED);
        store.set(3, 2, 5.0).unwrap();
        assert_eq!(store.get(3, 2).unwrap(), 5.0);
        assert!(matches!(store.get(4, 0), Err(Error::OutOfRange { .. })));
        assert!(!store.in_bounds(-1, 0));
    }

    #[test]
    fn empty_file_raster_reads_unassigned_and_accepts_writes() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("cbr");
        let header = RasterHeader::with_size(8, 4);
        let flt = create_empty_raster(&stub, &header).unwrap();

        // -1.0f32 little-endian
        let bytes = std::fs::read(&flt).unwrap();
        assert_eq!(bytes.len(), 8 * 4 * 4);
        assert_eq!(&bytes[..4], &[0x00, 0x00, 0x80, 0xBF]);

        let mut store = FileCellStore::open(&flt, 8, 4).unwrap();
        assert_eq!(store.get(7, 3).unwrap(), UNASSIGNED);
        store.set(2, 1, 12.0).unwrap();
        assert_eq!(store.get(2, 1).unwrap(), 12.0);
        drop(store);

        let mut cells = vec![0f32; 8 * 4];
        File::open(&flt).unwrap().read_f32_into::<LittleEndian>(&mut cells).unwrap();
        let reloaded = MemoryCellStore { width: 8, height: 4, cells };
        assert_eq!(reloaded.value(2, 1), 12.0);
        assert_eq!(reloaded.value(0, 0), UNASSIGNED);
        assert!(RasterHeader::from_file(&stub.with_extension("hdr")).is_ok());
    }

    #[test]
    fn file_store_checks_size() {
        let dir = tempfile::tempdir().unwrap();
        let flt = dir.path().join("short.flt");
        std::fs::write(&flt, [0u8; 12]).unwrap();
        assert!(matches!(FileCellStore::open(&flt, 2, 2), Err(Error::Format(_))));
    }
}
