//! Polygon rasterization onto the grid.
//!
//! A ring is rasterized in two steps. Its edges are traced with Bresenham
//! stepping into a bit-per-cell boundary bitmap covering the ring's bounding
//! box; every boundary cell is visited the first time it is marked. Then each
//! bitmap row is swept and every run of non-boundary cells between the outer
//! boundary runs is tested once for containment; inside runs are visited.
//!
//! What a visit does is up to the `CellVisitor`: write a unit code into a
//! raster, remember or restore the values under a hole, or sum population.

use tracing::{debug, info, span, trace, Level};

use crate::admin_units::AdminUnit;
use crate::error::{Error, Result};
use crate::grid::{Bounds, GridPoint, Ring, RingKind};
use crate::population::PopulationRaster;
use crate::raster::CellStore;

pub trait CellVisitor {
    fn visit(&mut self, x: i32, y: i32) -> Result<()>;

    /// Visits the interior run `x0..=x1` of row `y`.
    fn visit_run(&mut self, y: i32, x0: i32, x1: i32) -> Result<()> {
        for x in x0..=x1 {
            self.visit(x, y)?;
        }
        Ok(())
    }
}


// --------------------------------------------------------------------------
// Boundary tracing

/// Cells of the segment from `from` to `to`, both endpoints included.
#[derive(Debug, Clone)]
pub struct LineCells {
    x: i32,
    y: i32,
    end: GridPoint,
    x_inc: i32,
    y_inc: i32,
    // Extent along the major axis and the error increments.
    major: i64,
    step: i64,
    correction: i64,
    error: i64,
    x_major: bool,
    done: bool,
}

impl LineCells {
    pub fn new(from: GridPoint, to: GridPoint) -> Self {
        let hx = (to.x as i64 - from.x as i64).abs();
        let hy = (to.y as i64 - from.y as i64).abs();
        let x_major = hy <= hx;
        let (major, minor) = if x_major { (hx, hy) } else { (hy, hx) };
        Self {
            x: from.x,
            y: from.y,
            end: to,
            x_inc: if to.x < from.x { -1 } else { 1 },
            y_inc: if to.y < from.y { -1 } else { 1 },
            major,
            step: 2 * minor,
            correction: 2 * major,
            error: 0,
            x_major,
            done: false,
        }
    }
}

impl Iterator for LineCells {
    type Item = GridPoint;

    fn next(&mut self) -> Option<GridPoint> {
        if self.done {
            return None;
        }
        let at_end = if self.x_major { self.x == self.end.x } else { self.y == self.end.y };
        if at_end {
            self.done = true;
            return Some(self.end);
        }

        let here = GridPoint::new(self.x, self.y);
        self.error += self.step;
        if self.x_major {
            self.x += self.x_inc;
            if self.error > self.major {
                self.y += self.y_inc;
                self.error -= self.correction;
            }
        } else {
            self.y += self.y_inc;
            if self.error > self.major {
                self.x += self.x_inc;
                self.error -= self.correction;
            }
        }
        Some(here)
    }
}

/// One bit per cell of a bounding box, eight cells to a byte.
#[derive(Debug)]
pub struct BoundaryBitmap {
    bounds: Bounds,
    row_bytes: usize,
    bits: Vec<u8>,
}

impl BoundaryBitmap {
    pub fn new(bounds: Bounds) -> Self {
        let row_bytes = (bounds.columns() + 7) / 8;
        Self { bounds, row_bytes, bits: vec![0; row_bytes * bounds.rows()] }
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    fn index(&self, col: usize, row: usize) -> (usize, u8) {
        (row * self.row_bytes + col / 8, 1 << (col % 8))
    }

    /// Marks the cell, returning true if it was not marked before.
    pub fn mark(&mut self, p: GridPoint) -> bool {
        let col = (p.x - self.bounds.min_x) as usize;
        let row = (p.y - self.bounds.min_y) as usize;
        let (i, bit) = self.index(col, row);
        let fresh = self.bits[i] & bit == 0;
        self.bits[i] |= bit;
        fresh
    }

    /// Tests a cell by its offset from the box's top-left corner.
    pub fn is_marked(&self, col: usize, row: usize) -> bool {
        let (i, bit) = self.index(col, row);
        self.bits[i] & bit != 0
    }
}

/// Marks every edge cell of `ring`, visiting each the first time it is marked.
pub fn trace_ring<V: CellVisitor + ?Sized>(ring: &Ring, bitmap: &mut BoundaryBitmap, visitor: &mut V) -> Result<()> {
    for (from, to) in ring.edges() {
        for p in LineCells::new(from, to) {
            if bitmap.mark(p) {
                visitor.visit(p.x, p.y)?;
            }
        }
    }
    Ok(())
}

/// Sweeps the rows of a traced bitmap and visits the inside runs.
pub fn scan_interior<V: CellVisitor + ?Sized>(ring: &Ring, bitmap: &BoundaryBitmap, visitor: &mut V) -> Result<()> {
    let b = bitmap.bounds();
    let cols = b.columns();
    for row in 0..b.rows() {
        let marked = |col: usize| bitmap.is_marked(col, row);

        let mut start = 0;
        while start < cols && !marked(start) {
            start += 1;
        }
        while start < cols && marked(start) {
            start += 1;
        }
        // `end` is exclusive
        let mut end = cols;
        while end > start && !marked(end - 1) {
            end -= 1;
        }
        while end > start && marked(end - 1) {
            end -= 1;
        }

        let y = b.min_y + row as i32;
        let mut col = start;
        while col < end {
            if marked(col) {
                col += 1;
                continue;
            }
            let run_start = col;
            while col < end && !marked(col) {
                col += 1;
            }
            let x0 = b.min_x + run_start as i32;
            if ring.contains(x0, y) {
                visitor.visit_run(y, x0, b.min_x + col as i32 - 1)?;
            }
        }
    }
    Ok(())
}

/// Visits every boundary and interior cell of the ring exactly once.
pub fn rasterize_ring<V: CellVisitor + ?Sized>(ring: &Ring, visitor: &mut V) -> Result<()> {
    let Some(bounds) = ring.bounds() else {
        return Ok(());
    };
    let mut bitmap = BoundaryBitmap::new(bounds);
    trace_ring(ring, &mut bitmap, visitor)?;
    scan_interior(ring, &bitmap, visitor)
}


// --------------------------------------------------------------------------
// Filling

/// Values saved from under holes, replayed in the order they were taken.
#[derive(Debug, Default)]
pub struct CellMemory {
    values: Vec<f32>,
    next: usize,
}

impl CellMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn remember(&mut self, value: f32) {
        self.values.push(value);
    }

    fn recall(&mut self) -> Result<f32> {
        let v = self.values.get(self.next).copied().ok_or_else(|| {
            Error::Restore(format!("asked for value {} of {}", self.next + 1, self.values.len()))
        })?;
        self.next += 1;
        Ok(v)
    }

    /// Checks that every remembered value was restored.
    pub fn finish(&self) -> Result<()> {
        if self.next != self.values.len() {
            return Err(Error::Restore(format!(
                "{} values remembered, {} restored",
                self.values.len(), self.next
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum FillMode<'m> {
    Write(f32),
    Remember(&'m mut CellMemory),
    Restore(&'m mut CellMemory),
}

struct FillVisitor<'s, 'm, S: CellStore + ?Sized> {
    store: &'s mut S,
    mode: FillMode<'m>,
    cells: usize,
}

impl<S: CellStore + ?Sized> CellVisitor for FillVisitor<'_, '_, S> {
    fn visit(&mut self, x: i32, y: i32) -> Result<()> {
        if !self.store.in_bounds(x, y) {
            return Ok(());
        }
        let (x, y) = (x as u32, y as u32);
        match &mut self.mode {
            FillMode::Write(code) => self.store.set(x, y, *code)?,
            FillMode::Remember(memory) => memory.remember(self.store.get(x, y)?),
            FillMode::Restore(memory) => {
                let v = memory.recall()?;
                self.store.set(x, y, v)?;
            }
        }
        self.cells += 1;
        Ok(())
    }
}

/// Applies `mode` to every on-grid cell enclosed by `ring`, boundary
/// included. Returns the number of cells touched.
pub fn fill<S: CellStore + ?Sized>(ring: &Ring, store: &mut S, mode: FillMode<'_>) -> Result<usize> {
    let mut visitor = FillVisitor { store, mode, cells: 0 };
    rasterize_ring(ring, &mut visitor)?;
    Ok(visitor.cells)
}

/// Paints one unit: the cells under its holes are remembered, its fill rings
/// are written with `code`, then the hole cells get their old values back.
pub fn fill_unit<S: CellStore + ?Sized>(rings: &[Ring], store: &mut S, code: f32) -> Result<usize> {
    let (holes, fills): (Vec<&Ring>, Vec<&Ring>) = rings.iter().partition(|r| r.kind() == RingKind::Hole);

    let mut memory = CellMemory::new();
    for hole in &holes {
        fill(hole, store, FillMode::Remember(&mut memory))?;
    }
    let mut cells = 0;
    for ring in &fills {
        cells += fill(ring, store, FillMode::Write(code))?;
    }
    for hole in &holes {
        fill(hole, store, FillMode::Restore(&mut memory))?;
    }
    memory.finish()?;
    Ok(cells)
}

/// Paints administrative units into a raster, each with the next code in
/// build order.
pub struct AdminRasterizer<'s, S: CellStore + ?Sized> {
    store: &'s mut S,
    next_code: usize,
}

impl<'s, S: CellStore + ?Sized> AdminRasterizer<'s, S> {
    pub fn new(store: &'s mut S) -> Self {
        Self { store, next_code: 0 }
    }

    pub fn units_written(&self) -> usize {
        self.next_code
    }

    /// Paints `unit` and returns its code.
    pub fn add_unit(&mut self, unit: &AdminUnit) -> Result<f32> {
        let _span = span!(Level::DEBUG, "add_unit", iso = %unit.iso, level = unit.level, code = self.next_code).entered();

        let code = self.next_code as f32;
        let cells = fill_unit(&unit.rings, &mut *self.store, code)?;
        trace!("{}: {} rings, {} cells", unit.display_name(), unit.rings.len(), cells);
        if cells == 0 {
            debug!("{} covers no cells", unit.display_name());
        }
        self.next_code += 1;
        if self.next_code % 1000 == 0 {
            info!("Rasterized {} units", self.next_code);
        }
        Ok(code)
    }
}


// --------------------------------------------------------------------------
// Population under a ring

struct PopulationVisitor<'p> {
    population: &'p PopulationRaster,
    total: u64,
}

impl PopulationVisitor<'_> {
    fn on_raster(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.population.width() && (y as u32) < self.population.height()
    }
}

impl CellVisitor for PopulationVisitor<'_> {
    fn visit(&mut self, x: i32, y: i32) -> Result<()> {
        if self.on_raster(x, y) {
            self.total += self.population.cell(x, y)? as u64;
        }
        Ok(())
    }

    fn visit_run(&mut self, y: i32, x0: i32, x1: i32) -> Result<()> {
        if y < 0 || y as u32 >= self.population.height() {
            return Ok(());
        }
        let x0 = x0.max(0);
        let x1 = (x1 as i64).min(self.population.width() as i64 - 1) as i32;
        if x0 <= x1 {
            self.total += self.population.row_range(y, x0, x1)?.total();
        }
        Ok(())
    }
}

/// Population of every on-raster cell enclosed by `ring`. Axis-aligned
/// rectangles are summed directly.
pub fn population_under(ring: &Ring, population: &PopulationRaster) -> Result<u64> {
    if let Some(rect) = ring.as_rectangle() {
        return Ok(population.rect_sum(rect));
    }
    traced_population(ring, population)
}

fn traced_population(ring: &Ring, population: &PopulationRaster) -> Result<u64> {
    let mut visitor = PopulationVisitor { population, total: 0 };
    rasterize_ring(ring, &mut visitor)?;
    Ok(visitor.total)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Rect;
    use crate::raster::{MemoryCellStore, UNASSIGNED};

    fn ring(points: &[(i32, i32)]) -> Ring {
        Ring::from_points(points.iter().map(|&(x, y)| GridPoint::new(x, y)))
    }

    fn square(x0: i32, y0: i32, x1: i32, y1: i32) -> Ring {
        ring(&[(x0, y0), (x1, y0), (x1, y1), (x0, y1)])
    }

    fn cells(from: (i32, i32), to: (i32, i32)) -> Vec<(i32, i32)> {
        LineCells::new(GridPoint::new(from.0, from.1), GridPoint::new(to.0, to.1))
            .map(|p| (p.x, p.y))
            .collect()
    }

    #[test]
    fn bresenham_steps_the_minor_axis_on_accumulated_error() {
        assert_eq!(cells((0, 0), (5, 2)), vec![(0, 0), (1, 0), (2, 1), (3, 1), (4, 2), (5, 2)]);
        assert_eq!(cells((5, 2), (0, 0)).len(), 6);
        assert_eq!(cells((0, 0), (0, -3)), vec![(0, 0), (0, -1), (0, -2), (0, -3)]);
        assert_eq!(cells((3, 3), (3, 3)), vec![(3, 3)]);
    }

    #[test]
    fn bitmap_reports_first_mark_only() {
        let mut bitmap = BoundaryBitmap::new(Bounds { min_x: 10, min_y: 10, max_x: 29, max_y: 12 });
        assert!(bitmap.mark(GridPoint::new(27, 11)));
        assert!(!bitmap.mark(GridPoint::new(27, 11)));
        assert!(bitmap.is_marked(17, 1));
        assert!(!bitmap.is_marked(16, 1));
    }

    #[test]
    fn square_is_filled_with_its_code() {
        let mut store = MemoryCellStore::new(32, 32, UNASSIGNED);
        let touched = fill(&square(0, 0, 10, 10), &mut store, FillMode::Write(7.0)).unwrap();
        assert_eq!(touched, 121);
        assert_eq!(store.value(5, 5), 7.0);
        assert_eq!(store.value(0, 0), 7.0);
        assert_eq!(store.value(10, 10), 7.0);
        assert_eq!(store.value(11, 5), UNASSIGNED);
        assert_eq!(store.value(20, 20), UNASSIGNED);
    }

    #[test]
    fn concave_notch_is_left_alone() {
        let u = ring(&[(0, 0), (3, 0), (3, 6), (6, 6), (6, 0), (9, 0), (9, 9), (0, 9)]);
        let mut store = MemoryCellStore::new(16, 16, UNASSIGNED);
        fill(&u, &mut store, FillMode::Write(1.0)).unwrap();
        assert_eq!(store.value(4, 2), UNASSIGNED);
        assert_eq!(store.value(1, 2), 1.0);
        assert_eq!(store.value(4, 8), 1.0);
    }

    #[test]
    fn off_grid_cells_are_skipped() {
        let mut store = MemoryCellStore::new(8, 8, UNASSIGNED);
        let touched = fill(&square(-4, -4, 3, 3), &mut store, FillMode::Write(2.0)).unwrap();
        assert_eq!(touched, 16);
        assert_eq!(store.value(0, 0), 2.0);
        assert_eq!(store.value(3, 3), 2.0);
        assert_eq!(store.value(4, 4), UNASSIGNED);
    }

    #[test]
    fn hole_keeps_what_was_underneath() {
        let mut store = MemoryCellStore::new(32, 32, UNASSIGNED);
        store.set(14, 14, 3.0).unwrap();

        let outer = square(2, 2, 28, 28);
        let hole = Ring::from_points(square(10, 10, 18, 18).points().iter().rev().copied());
        assert_eq!(outer.kind(), RingKind::Fill);
        assert_eq!(hole.kind(), RingKind::Hole);

        fill_unit(&[hole, outer], &mut store, 5.0).unwrap();
        assert_eq!(store.value(5, 5), 5.0);
        assert_eq!(store.value(25, 25), 5.0);
        assert_eq!(store.value(9, 9), 5.0);
        assert_eq!(store.value(14, 14), 3.0);
        assert_eq!(store.value(12, 12), UNASSIGNED);
        assert_eq!(store.value(10, 10), UNASSIGNED);
        assert_eq!(store.value(0, 0), UNASSIGNED);
    }

    #[test]
    fn restore_without_memory_is_out_of_step() {
        let mut store = MemoryCellStore::new(8, 8, UNASSIGNED);
        let mut memory = CellMemory::new();
        let err = fill(&square(1, 1, 3, 3), &mut store, FillMode::Restore(&mut memory)).unwrap_err();
        assert!(matches!(err, Error::Restore(_)));

        let mut memory = CellMemory::new();
        fill(&square(1, 1, 3, 3), &mut store, FillMode::Remember(&mut memory)).unwrap();
        assert_eq!(memory.len(), 9);
        assert!(matches!(memory.finish(), Err(Error::Restore(_))));
    }

    #[test]
    fn units_get_codes_in_build_order() {
        let mut store = MemoryCellStore::new(32, 32, UNASSIGNED);
        let mut first = AdminUnit { iso: "COD".into(), level: 0, ..Default::default() };
        first.rings.push(square(0, 0, 9, 9));
        let mut second = first.clone();
        second.rings = vec![square(20, 20, 29, 29)];

        let mut rasterizer = AdminRasterizer::new(&mut store);
        assert_eq!(rasterizer.add_unit(&first).unwrap(), 0.0);
        assert_eq!(rasterizer.add_unit(&second).unwrap(), 1.0);
        assert_eq!(rasterizer.units_written(), 2);
        assert_eq!(store.value(4, 4), 0.0);
        assert_eq!(store.value(25, 25), 1.0);
        assert_eq!(store.value(15, 15), UNASSIGNED);
    }

    fn gradient(width: u32, height: u32) -> PopulationRaster {
        let values: Vec<f32> = (0..width * height).map(|i| (i % 7) as f32).collect();
        PopulationRaster::from_values(width, height, &values).unwrap()
    }

    #[test]
    fn rectangle_shortcut_matches_traced_sum() {
        let pop = gradient(40, 40);
        for rect in [Rect::new(5, 7, 20), Rect::new(-5, -5, 20), Rect::new(30, 30, 20)] {
            let ring = rect.to_ring();
            assert!(ring.as_rectangle().is_some());
            assert_eq!(
                population_under(&ring, &pop).unwrap(),
                traced_population(&ring, &pop).unwrap(),
                "{}",
                rect
            );
        }
    }

    #[test]
    fn population_under_visits_the_same_cells_as_fill() {
        let ones = PopulationRaster::from_values(40, 40, &vec![1.0; 1600]).unwrap();
        let tri = ring(&[(2, 2), (30, 5), (10, 28)]);
        let mut store = MemoryCellStore::new(40, 40, 0.0);
        let touched = fill(&tri, &mut store, FillMode::Write(1.0)).unwrap();
        assert_eq!(population_under(&tri, &ones).unwrap(), touched as u64);
        assert_eq!(store.cells().iter().filter(|&&v| v == 1.0).count(), touched);
    }
}
