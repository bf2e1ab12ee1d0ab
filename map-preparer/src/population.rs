//! Population-density raster held sparsely, one sorted list of populated
//! columns per row.

use std::io::Read;
use std::path::Path;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use tracing::{debug, info, span, Level};

use crate::error::{truncated, Error, Result};
use crate::grid::Bounds;
use crate::input::open_input;
use crate::instrumented_reader::InstrumentedReader;
use crate::raster::{raster_paths, ByteOrder, RasterHeader};

#[derive(Debug, Clone, Default)]
struct SparseRow {
    cols: Vec<u32>,
    counts: Vec<u32>,
}

impl SparseRow {
    fn from_values(values: &[f32]) -> Self {
        let mut row = SparseRow::default();
        for (x, &v) in values.iter().enumerate() {
            let rounded = (v as f64 + 0.5).floor();
            if rounded > 0.0 {
                row.cols.push(x as u32);
                row.counts.push(rounded.min(u32::MAX as f64) as u32);
            }
        }
        row
    }

    /// Index range of the stored columns within `x0..=x1`.
    fn span(&self, x0: u32, x1: u32) -> std::ops::Range<usize> {
        let start = self.cols.partition_point(|&c| c < x0);
        let end = self.cols.partition_point(|&c| c <= x1);
        start..end
    }
}

/// Populated cells of one row between two columns.
#[derive(Debug, Clone, Copy)]
pub struct RowSpan<'a> {
    x0: u32,
    x1: u32,
    cols: &'a [u32],
    counts: &'a [u32],
}

impl<'a> RowSpan<'a> {
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    /// `(column, count)` for every populated cell, left to right.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + 'a {
        self.cols.iter().copied().zip(self.counts.iter().copied())
    }

    /// One count per column of the span, zeros included.
    #[cfg(test)]
    fn dense(&self) -> Vec<u32> {
        let mut out = vec![0; (self.x1 - self.x0) as usize + 1];
        for (x, c) in self.iter() {
            out[(x - self.x0) as usize] = c;
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct PopulationRaster {
    width: u32,
    height: u32,
    rows: Vec<SparseRow>,
}

impl PopulationRaster {
    /// Reads `header.nrows` rows of `header.ncols` floats from `data`.
    pub fn load<R: Read>(header: &RasterHeader, data: R) -> Result<Self> {
        let _span = span!(Level::DEBUG, "load_population", ncols = header.ncols, nrows = header.nrows).entered();

        let mut data = InstrumentedReader::new(data, |n| info!("Read {} MiB of population data", n >> 20));
        let mut values = vec![0f32; header.ncols as usize];
        let mut rows = Vec::with_capacity(header.nrows as usize);
        for _ in 0..header.nrows {
            let read = match header.byte_order {
                ByteOrder::LsbFirst => data.read_f32_into::<LittleEndian>(&mut values),
                ByteOrder::MsbFirst => data.read_f32_into::<BigEndian>(&mut values),
            };
            read.map_err(truncated("population cells"))?;
            rows.push(SparseRow::from_values(&values));
        }

        let raster = Self { width: header.ncols, height: header.nrows, rows };
        debug!(
            "{} bytes read, {} populated cells, {} people",
            data.total_read(),
            raster.nonzero_cells(),
            raster.total()
        );
        Ok(raster)
    }

    /// Loads `<stub>.hdr` and `<stub>.flt` (or `<stub>.flt.gz`).
    pub fn open(stub: &Path) -> Result<Self> {
        let (flt, hdr) = raster_paths(stub);
        let header = RasterHeader::from_file(&hdr)?;
        info!("Loading {}x{} population raster from {}", header.ncols, header.nrows, flt.display());
        Self::load(&header, open_input(&flt)?)
    }

    /// Builds a raster from dense row-major values.
    pub fn from_values(width: u32, height: u32, values: &[f32]) -> Result<Self> {
        if values.len() != width as usize * height as usize {
            return Err(Error::format(format!(
                "{} values for a {}x{} population raster",
                values.len(), width, height
            )));
        }
        let rows = if width == 0 {
            vec![SparseRow::default(); height as usize]
        } else {
            values.chunks(width as usize).map(SparseRow::from_values).collect()
        };
        Ok(Self { width, height, rows })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn out_of_range(&self, x: i64, y: i64) -> Error {
        Error::OutOfRange { x, y, width: self.width, height: self.height }
    }

    /// Populated cells of row `y` within columns `x0..=x1`.
    pub fn row_range(&self, y: i32, x0: i32, x1: i32) -> Result<RowSpan<'_>> {
        if y < 0 || y as u32 >= self.height {
            return Err(self.out_of_range(x0 as i64, y as i64));
        }
        for x in [x0, x1] {
            if x < 0 || x as u32 >= self.width {
                return Err(self.out_of_range(x as i64, y as i64));
            }
        }
        if x0 > x1 {
            return Err(Error::format(format!("empty column range {}..={}", x0, x1)));
        }
        let row = &self.rows[y as usize];
        let span = row.span(x0 as u32, x1 as u32);
        Ok(RowSpan {
            x0: x0 as u32,
            x1: x1 as u32,
            cols: &row.cols[span.clone()],
            counts: &row.counts[span],
        })
    }

    pub fn cell(&self, x: i32, y: i32) -> Result<u32> {
        Ok(self.row_range(y, x, x)?.total() as u32)
    }

    /// Population inside the box, ignoring any part of it off the raster.
    pub fn rect_sum(&self, bounds: Bounds) -> u64 {
        let Some(b) = bounds.clip(self.width, self.height) else {
            return 0;
        };
        (b.min_y..=b.max_y)
            .map(|y| {
                let row = &self.rows[y as usize];
                let span = row.span(b.min_x as u32, b.max_x as u32);
                row.counts[span].iter().map(|&c| c as u64).sum::<u64>()
            })
            .sum()
    }

    pub fn total(&self) -> u64 {
        self.rows.iter().flat_map(|r| r.counts.iter()).map(|&c| c as u64).sum()
    }

    pub fn nonzero_cells(&self) -> usize {
        self.rows.iter().map(|r| r.cols.len()).sum()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    fn header(ncols: u32, nrows: u32, byte_order: ByteOrder) -> RasterHeader {
        RasterHeader { byte_order, ..RasterHeader::with_size(ncols, nrows) }
    }

    fn sample() -> Vec<f32> {
        #[rustfmt::skip]
        let values = vec![
            0.0, 1.4, 0.0, 2.5, 0.0, 0.0,
            0.3, 0.0, 9.0, 0.0, 4.0, -9999.0,
            0.0, 0.0, 0.0, 0.0, 0.0, 0.49,
        ];
        values
    }

    #[test]
    fn values_are_rounded_and_only_positive_kept() {
        let pop = PopulationRaster::from_values(6, 3, &sample()).unwrap();
        assert_eq!(pop.nonzero_cells(), 4);
        assert_eq!(pop.cell(1, 0).unwrap(), 1);
        assert_eq!(pop.cell(3, 0).unwrap(), 3);
        assert_eq!(pop.cell(0, 1).unwrap(), 0);
        assert_eq!(pop.cell(5, 1).unwrap(), 0);
        assert_eq!(pop.cell(5, 2).unwrap(), 0);
        assert_eq!(pop.total(), 1 + 3 + 9 + 4);
    }

    #[test]
    fn row_range_matches_a_dense_scan() {
        let values = sample();
        let pop = PopulationRaster::from_values(6, 3, &values).unwrap();
        for y in 0..3 {
            for x0 in 0..6 {
                for x1 in x0..6 {
                    let expected: u64 = (x0..=x1)
                        .map(|x| (values[(y * 6 + x) as usize] as f64 + 0.5).floor().max(0.0) as u64)
                        .sum();
                    let span = pop.row_range(y, x0, x1).unwrap();
                    assert_eq!(span.total(), expected, "row {} {}..={}", y, x0, x1);
                    assert_eq!(span.dense().len(), (x1 - x0 + 1) as usize);
                }
            }
        }
        let span = pop.row_range(1, 2, 5).unwrap();
        assert_eq!(span.iter().collect::<Vec<_>>(), vec![(2, 9), (4, 4)]);
        assert_eq!(span.dense(), vec![9, 0, 4, 0]);
    }

    #[test]
    fn out_of_range_queries_fail() {
        let pop = PopulationRaster::from_values(6, 3, &sample()).unwrap();
        assert!(matches!(pop.row_range(3, 0, 1), Err(Error::OutOfRange { .. })));
        assert!(matches!(pop.row_range(0, 0, 6), Err(Error::OutOfRange { .. })));
        assert!(matches!(pop.cell(-1, 0), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn rect_sum_is_clipped() {
        let pop = PopulationRaster::from_values(6, 3, &sample()).unwrap();
        let all = Bounds { min_x: -5, min_y: -5, max_x: 50, max_y: 50 };
        assert_eq!(pop.rect_sum(all), pop.total());
        let right = Bounds { min_x: 3, min_y: 0, max_x: 10, max_y: 1 };
        assert_eq!(pop.rect_sum(right), 3 + 4);
        let off = Bounds { min_x: 6, min_y: 0, max_x: 9, max_y: 2 };
        assert_eq!(pop.rect_sum(off), 0);
    }

    #[test]
    fn loads_both_byte_orders() {
        let values = sample();
        let mut le = Vec::new();
        let mut be = Vec::new();
        for &v in &values {
            le.write_f32::<LittleEndian>(v).unwrap();
            be.write_f32::<BigEndian>(v).unwrap();
        }
        let a = PopulationRaster::load(&header(6, 3, ByteOrder::LsbFirst), Cursor::new(le)).unwrap();
        let b = PopulationRaster::load(&header(6, 3, ByteOrder::MsbFirst), Cursor::new(be)).unwrap();
        assert_eq!(a.total(), 17);
        assert_eq!(b.total(), 17);
        assert_eq!(b.cell(2, 1).unwrap(), 9);
    }

    #[test]
    fn short_data_is_a_format_error() {
        let data = vec![0u8; 6 * 3 * 4 - 2];
        let err = PopulationRaster::load(&header(6, 3, ByteOrder::LsbFirst), Cursor::new(data)).unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{:?}", err);
    }

    #[test]
    fn opens_header_and_data_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("pop");
        header(6, 3, ByteOrder::LsbFirst).write_file(&stub.with_extension("hdr")).unwrap();
        let mut bytes = Vec::new();
        for &v in &sample() {
            bytes.write_f32::<LittleEndian>(v).unwrap();
        }
        std::fs::write(stub.with_extension("flt"), bytes).unwrap();

        let pop = PopulationRaster::open(&stub).unwrap();
        assert_eq!((pop.width(), pop.height()), (6, 3));
        assert_eq!(pop.total(), 17);
    }
}
