use std::fmt;

/// Cells per degree of latitude/longitude.
pub const CELLS_PER_DEGREE: i32 = 120;
/// Columns of the global grid (360 degrees).
pub const GRID_WIDTH: u32 = 43200;
/// Rows of the global grid (180 degrees).
pub const GRID_HEIGHT: u32 = 21600;

// Column of longitude 0 and row of latitude 0.
const X_ORIGIN: i32 = 180 * CELLS_PER_DEGREE;
const Y_ORIGIN: i32 = 90 * CELLS_PER_DEGREE;

// Fixed offsets applied to every vertex when measuring winding.
const WINDING_X_OFFSET: i64 = 360;
const WINDING_Y_OFFSET: i64 = 180;


// --------------------------------------------------------------------------
// GridPoint

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GridPoint {
    pub x: i32,
    pub y: i32,
}

impl GridPoint {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Grid cell holding a geographic position given in degrees.
    /// Row 0 is the northern edge of the grid.
    pub fn from_degrees(longitude: f64, latitude: f64) -> Self {
        let x = round_half_up(CELLS_PER_DEGREE as f64 * longitude) + X_ORIGIN;
        let y = 2 * Y_ORIGIN - (round_half_up(CELLS_PER_DEGREE as f64 * latitude) + Y_ORIGIN);
        Self { x, y }
    }
}

impl fmt::Display for GridPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

fn round_half_up(v: f64) -> i32 {
    (v + 0.5).floor() as i32
}


// --------------------------------------------------------------------------
// Bounds / Rect

/// Inclusive bounding box of a set of cells.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Bounds {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl Bounds {
    pub fn columns(&self) -> usize {
        (self.max_x as i64 - self.min_x as i64 + 1) as usize
    }

    pub fn rows(&self) -> usize {
        (self.max_y as i64 - self.min_y as i64 + 1) as usize
    }

    /// The part of the box inside a `width` x `height` raster, if any.
    pub fn clip(&self, width: u32, height: u32) -> Option<Bounds> {
        let b = Bounds {
            min_x: self.min_x.max(0),
            min_y: self.min_y.max(0),
            max_x: (self.max_x as i64).min(width as i64 - 1) as i32,
            max_y: (self.max_y as i64).min(height as i64 - 1) as i32,
        };
        if b.min_x > b.max_x || b.min_y > b.max_y {
            None
        } else {
            Some(b)
        }
    }
}

/// Axis-aligned square block of cells, `size` cells on a side.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub size: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, size: i32) -> Self {
        Self { x, y, size }
    }

    /// Last column covered (inclusive).
    pub fn x1(&self) -> i32 {
        self.x + self.size - 1
    }

    /// Last row covered (inclusive).
    pub fn y1(&self) -> i32 {
        self.y + self.size - 1
    }

    pub fn bounds(&self) -> Bounds {
        Bounds { min_x: self.x, min_y: self.y, max_x: self.x1(), max_y: self.y1() }
    }

    pub fn contains_cell(&self, x: i32, y: i32) -> bool {
        x >= self.x && x <= self.x1() && y >= self.y && y <= self.y1()
    }

    /// The four half-size blocks, in the order top-left, top-right,
    /// bottom-right, bottom-left.
    pub fn quadrants(&self) -> [Rect; 4] {
        let h = self.size / 2;
        [
            Rect::new(self.x, self.y, h),
            Rect::new(self.x + h, self.y, h),
            Rect::new(self.x + h, self.y + h, h),
            Rect::new(self.x, self.y + h, h),
        ]
    }

    /// The block's outline as a 4-point ring through its corner cells.
    pub fn to_ring(&self) -> Ring {
        Ring::from_points([
            GridPoint::new(self.x, self.y),
            GridPoint::new(self.x1(), self.y),
            GridPoint::new(self.x1(), self.y1()),
            GridPoint::new(self.x, self.y1()),
        ])
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{} +{}]", self.x, self.y, self.size)
    }
}


// --------------------------------------------------------------------------
// Ring

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RingKind {
    Fill,
    Hole,
}

/// Closed polygon ring in grid coordinates. The closing edge from the last
/// point back to the first is implicit; consecutive duplicates never occur.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ring {
    points: Vec<GridPoint>,
}

impl Ring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self { points: Vec::with_capacity(n) }
    }

    pub fn from_points(points: impl IntoIterator<Item = GridPoint>) -> Self {
        let mut ring = Self::new();
        for p in points {
            ring.push(p);
        }
        ring
    }

    /// Appends a point unless it repeats the previous one. Returns whether the
    /// point was kept.
    pub fn push(&mut self, p: GridPoint) -> bool {
        if self.points.last() == Some(&p) {
            return false;
        }
        self.points.push(p);
        true
    }

    /// Like `push`, but also collapses an out-and-back spike `A, B, A` to `A`.
    pub fn push_despiked(&mut self, p: GridPoint) {
        let n = self.points.len();
        if n >= 2 && self.points[n - 2] == p {
            self.points.pop();
            return;
        }
        self.push(p);
    }

    pub fn points(&self) -> &[GridPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Edges as (from, to) pairs, closing edge included.
    pub fn edges(&self) -> impl Iterator<Item = (GridPoint, GridPoint)> + '_ {
        let n = self.points.len();
        (0..n).map(move |i| (self.points[i], self.points[(i + 1) % n]))
    }

    pub fn bounds(&self) -> Option<Bounds> {
        let first = self.points.first()?;
        let mut b = Bounds { min_x: first.x, min_y: first.y, max_x: first.x, max_y: first.y };
        for p in &self.points[1..] {
            b.min_x = b.min_x.min(p.x);
            b.min_y = b.min_y.min(p.y);
            b.max_x = b.max_x.max(p.x);
            b.max_y = b.max_y.max(p.y);
        }
        Some(b)
    }

    /// Signed cross-sum over consecutive vertex pairs. Non-negative for rings
    /// that run clockwise on a north-up map (grid rows grow southward, so rows
    /// are measured downward from the offset).
    pub fn winding_sum(&self) -> i64 {
        self.edges()
            .map(|(prev, cur)| {
                let dx = (WINDING_X_OFFSET + cur.x as i64) - (WINDING_X_OFFSET + prev.x as i64);
                let ys = (WINDING_Y_OFFSET - cur.y as i64) + (WINDING_Y_OFFSET - prev.y as i64);
                dx * ys
            })
            .sum()
    }

    pub fn kind(&self) -> RingKind {
        if self.winding_sum() >= 0 {
            RingKind::Fill
        } else {
            RingKind::Hole
        }
    }

    /// Even-odd containment test for the cell `(x, y)`, in integer arithmetic.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        if self.points.len() < 3 {
            return false;
        }
        let (px, py) = (x as i64, y as i64);
        let mut inside = false;
        for (a, b) in self.edges() {
            let (xa, ya, xb, yb) = (a.x as i64, a.y as i64, b.x as i64, b.y as i64);
            if (ya > py) != (yb > py) {
                // px < xa + (py - ya) * (xb - xa) / (yb - ya), without dividing
                let lhs = (px - xa) * (yb - ya);
                let rhs = (py - ya) * (xb - xa);
                if (yb > ya && lhs < rhs) || (yb < ya && lhs > rhs) {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// True when some edge of the ring touches the block's cells.
    pub fn crosses_rect(&self, rect: &Rect) -> bool {
        if self.points.len() == 1 {
            let p = self.points[0];
            return rect.contains_cell(p.x, p.y);
        }
        self.edges().any(|(a, b)| segment_touches_rect(a, b, rect))
    }

    /// True when the ring's area and the block share at least one cell: an
    /// edge touches the block, or the block lies wholly inside the ring.
    pub fn overlaps_rect(&self, rect: &Rect) -> bool {
        self.crosses_rect(rect) || self.contains(rect.x, rect.y)
    }

    /// Recognizes the 4-point axis-aligned rectangle produced by `Rect::to_ring`.
    pub fn as_rectangle(&self) -> Option<Bounds> {
        let p = &self.points;
        if p.len() != 4 {
            return None;
        }
        let aligned = p[0].x == p[3].x && p[1].x == p[2].x && p[0].y == p[1].y && p[2].y == p[3].y;
        if !aligned {
            return None;
        }
        self.bounds()
    }
}

fn orientation(a: GridPoint, b: GridPoint, c: GridPoint) -> i64 {
    let v = (b.x as i64 - a.x as i64) * (c.y as i64 - a.y as i64)
        - (b.y as i64 - a.y as i64) * (c.x as i64 - a.x as i64);
    v.signum()
}

fn on_segment(a: GridPoint, b: GridPoint, p: GridPoint) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

fn segments_intersect(p1: GridPoint, p2: GridPoint, q1: GridPoint, q2: GridPoint) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);
    if d1 * d2 < 0 && d3 * d4 < 0 {
        return true;
    }
    (d1 == 0 && on_segment(q1, q2, p1))
        || (d2 == 0 && on_segment(q1, q2, p2))
        || (d3 == 0 && on_segment(p1, p2, q1))
        || (d4 == 0 && on_segment(p1, p2, q2))
}

fn segment_touches_rect(a: GridPoint, b: GridPoint, rect: &Rect) -> bool {
    if rect.contains_cell(a.x, a.y) || rect.contains_cell(b.x, b.y) {
        return true;
    }
    if a.x.max(b.x) < rect.x || a.x.min(b.x) > rect.x1() || a.y.max(b.y) < rect.y || a.y.min(b.y) > rect.y1() {
        return false;
    }
    let corners = [
        GridPoint::new(rect.x, rect.y),
        GridPoint::new(rect.x1(), rect.y),
        GridPoint::new(rect.x1(), rect.y1()),
        GridPoint::new(rect.x, rect.y1()),
    ];
    (0..4).any(|i| segments_intersect(a, b, corners[i], corners[(i + 1) % 4]))
}
