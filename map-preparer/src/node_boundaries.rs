//! Node boundary configuration: the territory each simulation node owns.
//!
//! Big-endian. A node count, then per node the length of its ring data in
//! 32-bit words (each ring contributes `1 + 2 * points`) followed by
//! `(name, population, ring)` triples until that length is used up.

use std::io::{Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info, span, Level};

use crate::binary_helpers::{read_count, read_utf16_string, write_utf16_string};
use crate::error::{truncated, Error, Result};
use crate::grid::{GridPoint, Rect, Ring};
use crate::input::open_input;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeBoundary {
    pub name: String,
    pub population: i64,
    pub rings: Vec<Ring>,
}

impl NodeBoundary {
    /// Some ring edge touches the block.
    pub fn crosses(&self, rect: &Rect) -> bool {
        self.rings.iter().any(|r| r.crosses_rect(rect))
    }

    /// The territory shares at least one cell with the block.
    pub fn overlaps(&self, rect: &Rect) -> bool {
        self.rings.iter().any(|r| r.overlaps_rect(rect))
    }

    fn ring_words(&self) -> i64 {
        self.rings.iter().map(|r| 1 + 2 * r.len() as i64).sum()
    }
}

pub fn load<R: Read>(mut stream: R) -> Result<Vec<NodeBoundary>> {
    let _span = span!(Level::DEBUG, "load_node_boundaries").entered();

    let count = read_count(&mut stream, "node count")?;
    let mut nodes = Vec::with_capacity(count.min(1 << 12));
    for index in 0..count {
        let node = read_node(&mut stream, index)?;
        debug!("Node {} ({}): {} rings, population {}", index, node.name, node.rings.len(), node.population);
        nodes.push(node);
    }
    Ok(nodes)
}

fn read_node<R: Read>(stream: &mut R, index: usize) -> Result<NodeBoundary> {
    let mut remaining = read_count(stream, "node record length")? as i64;
    let mut node = NodeBoundary::default();
    while remaining > 0 {
        let name = read_utf16_string(stream, "node name")?;
        let population = stream.read_i64::<BigEndian>().map_err(truncated("node population"))?;
        let points = read_count(stream, "ring point count")?;
        let words = 1 + 2 * points as i64;
        if words > remaining {
            return Err(Error::format(format!(
                "node {}: ring of {} points overruns the record ({} words left)",
                index, points, remaining
            )));
        }

        let mut ring = Ring::with_capacity(points.min(1 << 16));
        for _ in 0..points {
            let x = stream.read_i32::<BigEndian>().map_err(truncated("ring point"))?;
            let y = stream.read_i32::<BigEndian>().map_err(truncated("ring point"))?;
            ring.push(GridPoint::new(x, y));
        }

        if node.rings.is_empty() {
            node.name = name;
        }
        node.population += population;
        node.rings.push(ring);
        remaining -= words;
    }
    Ok(node)
}

pub fn load_file(path: &Path) -> Result<Vec<NodeBoundary>> {
    info!("Loading node boundaries from {}", path.display());
    load(open_input(path)?)
}

/// Writes nodes in the format `load` reads. The node's population is stored
/// with its first ring, later rings carry zero.
pub fn write<W: Write>(mut w: W, nodes: &[NodeBoundary]) -> Result<()> {
    w.write_i32::<BigEndian>(nodes.len() as i32)?;
    for node in nodes {
        w.write_i32::<BigEndian>(node.ring_words() as i32)?;
        for (i, ring) in node.rings.iter().enumerate() {
            write_utf16_string(&mut w, &node.name)?;
            w.write_i64::<BigEndian>(if i == 0 { node.population } else { 0 })?;
            w.write_i32::<BigEndian>(ring.len() as i32)?;
            for p in ring.points() {
                w.write_i32::<BigEndian>(p.x)?;
                w.write_i32::<BigEndian>(p.y)?;
            }
        }
    }
    w.flush()?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ring(points: &[(i32, i32)]) -> Ring {
        Ring::from_points(points.iter().map(|&(x, y)| GridPoint::new(x, y)))
    }

    fn nodes() -> Vec<NodeBoundary> {
        vec![
            NodeBoundary {
                name: "Kinshasa".to_string(),
                population: 1200,
                rings: vec![ring(&[(0, 0), (640, 0), (640, 640), (0, 640)]), ring(&[(700, 0), (720, 0), (720, 20)])],
            },
            NodeBoundary {
                name: "Kasaï".to_string(),
                population: 800,
                rings: vec![ring(&[(640, 0), (1280, 0), (1280, 640), (640, 640)])],
            },
        ]
    }

    #[test]
    fn reads_what_it_writes() {
        let mut buf = Vec::new();
        write(&mut buf, &nodes()).unwrap();
        assert_eq!(load(Cursor::new(buf)).unwrap(), nodes());
    }

    #[test]
    fn name_comes_from_first_ring_and_populations_add_up() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(1).unwrap();
        buf.write_i32::<BigEndian>(2 * (1 + 2 * 3)).unwrap();
        for (name, pop) in [("North", 10i64), ("South", 5)] {
            write_utf16_string(&mut buf, name).unwrap();
            buf.write_i64::<BigEndian>(pop).unwrap();
            buf.write_i32::<BigEndian>(3).unwrap();
            for v in [0, 0, 10, 0, 0, 10] {
                buf.write_i32::<BigEndian>(v).unwrap();
            }
        }
        let nodes = load(Cursor::new(buf)).unwrap();
        assert_eq!(nodes[0].name, "North");
        assert_eq!(nodes[0].population, 15);
        assert_eq!(nodes[0].rings.len(), 2);
    }

    #[test]
    fn truncated_stream_fails() {
        let mut buf = Vec::new();
        write(&mut buf, &nodes()).unwrap();
        buf.truncate(buf.len() - 6);
        assert!(matches!(load(Cursor::new(buf)), Err(Error::Format(_))));
    }

    #[test]
    fn ring_overrunning_record_fails() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(1).unwrap();
        buf.write_i32::<BigEndian>(5).unwrap();
        write_utf16_string(&mut buf, "X").unwrap();
        buf.write_i64::<BigEndian>(0).unwrap();
        buf.write_i32::<BigEndian>(3).unwrap();
        for v in [0, 0, 10, 0, 0, 10] {
            buf.write_i32::<BigEndian>(v).unwrap();
        }
        assert!(matches!(load(Cursor::new(buf)), Err(Error::Format(_))));
    }

    #[test]
    fn corrupt_point_count_fails_as_truncation() {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(1).unwrap();
        buf.write_i32::<BigEndian>(i32::MAX).unwrap();
        write_utf16_string(&mut buf, "X").unwrap();
        buf.write_i64::<BigEndian>(0).unwrap();
        buf.write_i32::<BigEndian>(i32::MAX / 2 - 1).unwrap();
        buf.write_i32::<BigEndian>(0).unwrap();
        assert!(matches!(load(Cursor::new(buf)), Err(Error::Format(_))));
    }

    #[test]
    fn crossing_and_overlap() {
        let all = nodes();
        let n = &all[0];
        assert!(n.overlaps(&Rect::new(20, 20, 320)));
        assert!(!n.crosses(&Rect::new(20, 20, 320)));
        assert!(n.crosses(&Rect::new(320, 320, 640)));
        assert!(n.overlaps(&Rect::new(700, 0, 20)));
        assert!(!n.overlaps(&Rect::new(2000, 2000, 20)));
    }
}
