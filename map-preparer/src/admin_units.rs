//! Administrative units and their intermediate on-disk form.
//!
//! `convert` writes one artifact per `<ISO>_adm<level>` dataset. Artifacts are
//! big-endian: ISO string, level byte, record count, then per record the
//! display name, the ids for levels `1..=level` (`-1` when absent) and the
//! rings. The country itself is named by the ISO string, so level-0 records
//! go straight from the name to the rings.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, span, Level};

use crate::binary_helpers::{read_count, read_utf16_string, write_utf16_string};
use crate::error::{truncated, Error, Result};
use crate::grid::{GridPoint, Ring};

/// Deepest administrative level.
pub const MAX_LEVEL: u8 = 5;
pub const LEVELS: usize = MAX_LEVEL as usize + 1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdminUnit {
    pub iso: String,
    pub level: u8,
    /// Ids of the unit and its ancestors, indexed by level.
    pub ids: [Option<i32>; LEVELS],
    pub names: [Option<String>; LEVELS],
    pub rings: Vec<Ring>,
}

impl AdminUnit {
    /// The name at the unit's own level.
    pub fn display_name(&self) -> &str {
        self.names[self.level as usize].as_deref().unwrap_or("")
    }

    pub fn point_count(&self) -> usize {
        self.rings.iter().map(Ring::len).sum()
    }
}

/// `<ISO>_adm<level>.bin`
pub fn artifact_name(iso: &str, level: u8) -> String {
    format!("{}_adm{}.bin", iso, level)
}

/// Splits a dataset name such as `COD_adm2` into its ISO code and level.
pub fn parse_dataset_name(name: &str) -> Option<(String, u8)> {
    let (iso, level) = name.rsplit_once("_adm")?;
    let level: u8 = level.parse().ok()?;
    if iso.is_empty() || level > MAX_LEVEL {
        return None;
    }
    Some((iso.to_string(), level))
}


// --------------------------------------------------------------------------
// Artifact

pub fn write_artifact<W: Write>(mut w: W, iso: &str, level: u8, units: &[AdminUnit]) -> Result<()> {
    let _span = span!(Level::DEBUG, "write_artifact", iso, level).entered();

    write_utf16_string(&mut w, iso)?;
    w.write_u8(level)?;
    w.write_i32::<BigEndian>(units.len() as i32)?;
    for unit in units {
        write_utf16_string(&mut w, unit.display_name())?;
        for id in &unit.ids[1..=level as usize] {
            w.write_i32::<BigEndian>(id.unwrap_or(-1))?;
        }
        w.write_i32::<BigEndian>(unit.rings.len() as i32)?;
        for ring in &unit.rings {
            w.write_i32::<BigEndian>(ring.len() as i32)?;
            for p in ring.points() {
                w.write_i32::<BigEndian>(p.x)?;
                w.write_i32::<BigEndian>(p.y)?;
            }
        }
    }
    w.flush()?;
    debug!("Wrote {} units", units.len());
    Ok(())
}

pub fn write_artifact_file(path: &Path, iso: &str, level: u8, units: &[AdminUnit]) -> Result<()> {
    write_artifact(BufWriter::new(File::create(path)?), iso, level, units)
}

/// Reads an artifact back. Out-and-back spikes left over from coordinate
/// rounding are removed from every ring. The level-0 id is not stored, so it
/// comes back as `None`; `iso` identifies the country.
pub fn read_artifact<R: Read>(mut r: R) -> Result<Vec<AdminUnit>> {
    let _span = span!(Level::DEBUG, "read_artifact").entered();

    let iso = read_utf16_string(&mut r, "ISO code")?;
    let level = r.read_u8().map_err(truncated("level"))?;
    if level > MAX_LEVEL {
        return Err(Error::format(format!("administrative level {} out of range", level)));
    }
    let count = read_count(&mut r, "unit count")?;

    let mut units = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let mut unit = AdminUnit { iso: iso.clone(), level, ..Default::default() };
        unit.names[level as usize] = Some(read_utf16_string(&mut r, "unit name")?);
        for id in &mut unit.ids[1..=level as usize] {
            let v = r.read_i32::<BigEndian>().map_err(truncated("unit id"))?;
            *id = (v != -1).then_some(v);
        }
        let parts = read_count(&mut r, "part count")?;
        for _ in 0..parts {
            let points = read_count(&mut r, "point count")?;
            let mut ring = Ring::with_capacity(points.min(1 << 16));
            for _ in 0..points {
                let x = r.read_i32::<BigEndian>().map_err(truncated("ring point"))?;
                let y = r.read_i32::<BigEndian>().map_err(truncated("ring point"))?;
                ring.push_despiked(GridPoint::new(x, y));
            }
            if !ring.is_empty() {
                unit.rings.push(ring);
            }
        }
        units.push(unit);
    }
    debug!("Read {} {} level-{} units", units.len(), iso, level);
    Ok(units)
}

pub fn read_artifact_file(path: &Path) -> Result<Vec<AdminUnit>> {
    read_artifact(BufReader::new(File::open(path)?))
}


// --------------------------------------------------------------------------
// Catalogue

/// Writes one tab-separated line per unit: code, ISO, level, the six ids
/// (`-1` when absent) and the six names. Codes count up from `first_code`.
pub fn write_catalogue<'a, W, I>(mut w: W, first_code: usize, units: I) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = &'a AdminUnit>,
{
    let mut code = first_code;
    for unit in units {
        write!(w, "{}\t{}\t{}", code, unit.iso, unit.level)?;
        for id in &unit.ids {
            write!(w, "\t{}", id.unwrap_or(-1))?;
        }
        for name in &unit.names {
            write!(w, "\t{}", name.as_deref().unwrap_or(""))?;
        }
        writeln!(w)?;
        code += 1;
    }
    Ok(code)
}

pub fn write_catalogue_header<W: Write>(mut w: W) -> Result<()> {
    write!(w, "code\tiso\tlevel")?;
    for n in 0..LEVELS {
        write!(w, "\tid_{}", n)?;
    }
    for n in 0..LEVELS {
        write!(w, "\tname_{}", n)?;
    }
    writeln!(w)?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn unit(name: &str, ids: [Option<i32>; 3], rings: Vec<Ring>) -> AdminUnit {
        let mut u = AdminUnit { iso: "COD".to_string(), level: 2, rings, ..Default::default() };
        u.ids[..3].copy_from_slice(&ids);
        u.names[0] = Some("Democratic Republic of the Congo".to_string());
        u.names[2] = Some(name.to_string());
        u
    }

    fn ring(points: &[(i32, i32)]) -> Ring {
        Ring::from_points(points.iter().map(|&(x, y)| GridPoint::new(x, y)))
    }

    #[test]
    fn dataset_names_parse() {
        assert_eq!(parse_dataset_name("COD_adm2"), Some(("COD".to_string(), 2)));
        assert_eq!(parse_dataset_name("GBR_adm0"), Some(("GBR".to_string(), 0)));
        assert_eq!(parse_dataset_name("COD_adm9"), None);
        assert_eq!(parse_dataset_name("population"), None);
        assert_eq!(artifact_name("COD", 2), "COD_adm2.bin");
    }

    fn be_words(bytes: &[u8]) -> Vec<i32> {
        bytes.chunks_exact(4).map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]])).collect()
    }

    #[test]
    fn artifact_reload_keeps_ids_and_rings() {
        let units = vec![
            unit("Kinshasa", [Some(1), Some(4), Some(17)], vec![ring(&[(0, 0), (10, 0), (10, 10)])]),
            unit("Bas-Uele", [Some(1), Some(2), None], vec![ring(&[(5, 5), (6, 5), (6, 6)]), ring(&[(1, 1), (2, 1), (2, 2)])]),
        ];
        let mut buf = Vec::new();
        write_artifact(&mut buf, "COD", 2, &units).unwrap();

        let back = read_artifact(Cursor::new(buf)).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].display_name(), "Kinshasa");
        assert_eq!(back[0].ids[..3], [None, Some(4), Some(17)]);
        assert_eq!(back[1].ids[2], None);
        assert_eq!(back[1].rings.len(), 2);
        assert_eq!(back[1].rings[1], units[1].rings[1]);
        // Only the unit's own name is stored
        assert_eq!(back[0].names[0], None);
    }

    #[test]
    fn level_zero_records_hold_no_ids() {
        let mut country = unit("Gabon", [Some(80), None, None], vec![ring(&[(0, 0), (4, 0), (4, 4)])]);
        country.level = 0;
        country.names[0] = Some("Gabon".to_string());
        let mut buf = Vec::new();
        write_artifact(&mut buf, "GAB", 0, &[country]).unwrap();

        // "GAB" (4 + 6 bytes), level byte, record count
        assert_eq!(&buf[..4], &3i32.to_be_bytes());
        assert_eq!(buf[10], 0);
        assert_eq!(&buf[11..15], &1i32.to_be_bytes());
        // "Gabon" then straight to the ring count
        let record = &buf[15..];
        assert_eq!(&record[..4], &5i32.to_be_bytes());
        assert_eq!(be_words(&record[14..]), vec![1, 3, 0, 0, 4, 0, 4, 4]);

        let back = read_artifact(Cursor::new(buf)).unwrap();
        assert_eq!(back[0].ids, [None; LEVELS]);
        assert_eq!(back[0].rings[0].len(), 3);
    }

    #[test]
    fn level_two_records_hold_ids_one_and_two() {
        let units = [unit("Kinshasa", [Some(1), Some(4), None], vec![ring(&[(0, 0), (10, 0), (10, 10)])])];
        let mut buf = Vec::new();
        write_artifact(&mut buf, "COD", 2, &units).unwrap();

        // "Kinshasa" is 4 + 16 bytes
        let record = &buf[15..];
        assert_eq!(&record[..4], &8i32.to_be_bytes());
        assert_eq!(be_words(&record[20..]), vec![4, -1, 1, 3, 0, 0, 10, 0, 10, 10]);
    }

    #[test]
    fn spikes_are_removed_on_reload() {
        let mut spiky = Ring::new();
        for (x, y) in [(0, 0), (10, 0), (15, 0), (10, 0), (10, 10)] {
            spiky.push(GridPoint::new(x, y));
        }
        assert_eq!(spiky.len(), 5);
        let mut buf = Vec::new();
        write_artifact(&mut buf, "COD", 2, &[unit("X", [Some(1), None, None], vec![spiky])]).unwrap();
        let back = read_artifact(Cursor::new(buf)).unwrap();
        assert_eq!(back[0].rings[0].len(), 3);
    }

    #[test]
    fn truncated_artifact_fails() {
        let mut buf = Vec::new();
        write_artifact(&mut buf, "COD", 2, &[unit("X", [Some(1), None, None], vec![ring(&[(0, 0), (4, 0), (4, 4)])])]).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(read_artifact(Cursor::new(buf)), Err(Error::Format(_))));
    }

    #[test]
    fn catalogue_lists_codes_ids_and_names() {
        let units = vec![
            unit("Kinshasa", [Some(1), Some(4), Some(17)], vec![]),
            unit("Bas-Uele", [Some(1), Some(2), None], vec![]),
        ];
        let mut buf = Vec::new();
        let next = write_catalogue(&mut buf, 10, &units).unwrap();
        assert_eq!(next, 12);
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[1],
            "11\tCOD\t2\t1\t2\t-1\t-1\t-1\t-1\tDemocratic Republic of the Congo\t\tBas-Uele\t\t\t"
        );

        let mut header = Vec::new();
        write_catalogue_header(&mut header).unwrap();
        assert_eq!(String::from_utf8(header).unwrap().split('\t').count(), 15);
    }
}
