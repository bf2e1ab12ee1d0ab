//! Streaming decoder for administrative-boundary shapefiles.
//!
//! A dataset is a `.shp` holding polygon geometry and a `.dbf` holding one
//! attribute row per shape. Rows are paired with shapes positionally; the
//! `ID_<n>` and `NAME_<n>` columns give the parent chain.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use tracing::{debug, span, trace, Level};

use crate::admin_units::{parse_dataset_name, AdminUnit, LEVELS};
use crate::binary_helpers::latin1_field;
use crate::error::{truncated, Error, Result};
use crate::grid::{GridPoint, Ring};
use crate::input::{open_input, InputStream};

const SHP_FILE_CODE: i32 = 9994;
const SHAPE_POLYGON: i32 = 5;
const SHP_HEADER_BYTES: u64 = 100;

const DBF_HEADER_BYTES: usize = 32;
const DBF_DESCRIPTOR_BYTES: usize = 32;
const DBF_HEADER_END: u8 = 0x0D;
const DBF_DELETED: u8 = b'*';

fn skip<R: Read>(stream: &mut R, n: u64, what: &'static str) -> Result<()> {
    let skipped = io::copy(&mut stream.by_ref().take(n), &mut io::sink())?;
    if skipped < n {
        return Err(Error::format(format!("stream truncated while skipping {}", what)));
    }
    Ok(())
}


// --------------------------------------------------------------------------
// DBF

#[derive(Debug, Clone)]
pub struct DbfField {
    pub name: String,
    pub kind: char,
    offset: usize,
    length: usize,
}

#[derive(Debug, Clone)]
pub struct DbfRecord {
    deleted: bool,
    bytes: Vec<u8>,
}

impl DbfRecord {
    pub fn value(&self, field: &DbfField) -> String {
        latin1_field(&self.bytes[field.offset..field.offset + field.length])
    }
}

#[derive(Debug)]
pub struct DbfReader<R: Read> {
    stream: R,
    fields: Vec<DbfField>,
    record_count: u32,
    record_length: usize,
    records_read: u32,
}

impl<R: Read> DbfReader<R> {
    pub fn new(mut stream: R) -> Result<Self> {
        let _span = span!(Level::TRACE, "read_dbf_header").entered();

        let mut header = [0u8; DBF_HEADER_BYTES];
        stream.read_exact(&mut header).map_err(truncated("DBF header"))?;
        let mut h = &header[4..12];
        let record_count = h.read_u32::<LittleEndian>()?;
        let header_length = h.read_u16::<LittleEndian>()? as usize;
        let record_length = h.read_u16::<LittleEndian>()? as usize;
        trace!("DBF version {:#04x}: {} records of {} bytes", header[0], record_count, record_length);

        let mut fields = Vec::new();
        let mut consumed = DBF_HEADER_BYTES;
        let mut offset = 1;
        loop {
            let marker = stream.read_u8().map_err(truncated("DBF field descriptors"))?;
            consumed += 1;
            if marker == DBF_HEADER_END {
                break;
            }
            let mut descriptor = [0u8; DBF_DESCRIPTOR_BYTES];
            descriptor[0] = marker;
            stream
                .read_exact(&mut descriptor[1..])
                .map_err(truncated("DBF field descriptors"))?;
            consumed += DBF_DESCRIPTOR_BYTES - 1;

            let field = DbfField {
                name: latin1_field(&descriptor[..11]),
                kind: descriptor[11] as char,
                offset,
                length: descriptor[16] as usize,
            };
            trace!("DBF field {} ({}) width {}", field.name, field.kind, field.length);
            offset += field.length;
            fields.push(field);
        }

        if consumed > header_length {
            return Err(Error::format(format!(
                "DBF header declares {} bytes but its descriptors take {}",
                header_length, consumed
            )));
        }
        skip(&mut stream, (header_length - consumed) as u64, "DBF header")?;
        if offset > record_length {
            return Err(Error::format(format!(
                "DBF fields need {} bytes per record, header says {}",
                offset, record_length
            )));
        }

        Ok(Self { stream, fields, record_count, record_length, records_read: 0 })
    }

    pub fn fields(&self) -> &[DbfField] {
        &self.fields
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    pub fn remaining(&self) -> u32 {
        self.record_count - self.records_read
    }

    /// Index of the column called `name`, ignoring case.
    pub fn column(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::Lookup(name.to_string()))
    }

    pub fn next_record(&mut self) -> Result<Option<DbfRecord>> {
        if self.records_read >= self.record_count {
            return Ok(None);
        }
        let mut bytes = vec![0u8; self.record_length];
        self.stream.read_exact(&mut bytes).map_err(truncated("DBF record"))?;
        self.records_read += 1;
        Ok(Some(DbfRecord { deleted: bytes.first() == Some(&DBF_DELETED), bytes }))
    }
}


// --------------------------------------------------------------------------
// SHP

#[derive(Debug)]
pub struct ShpReader<R: Read> {
    stream: R,
    file_length: u64,
    position: u64,
}

impl<R: Read> ShpReader<R> {
    pub fn new(mut stream: R) -> Result<Self> {
        let _span = span!(Level::TRACE, "read_shp_header").entered();

        let file_code = stream.read_i32::<BigEndian>().map_err(truncated("SHP header"))?;
        if file_code != SHP_FILE_CODE {
            return Err(Error::format(format!("bad SHP file code {}", file_code)));
        }
        skip(&mut stream, 5 * 4, "SHP header")?;
        let words = stream.read_i32::<BigEndian>().map_err(truncated("SHP header"))?;
        let version = stream.read_i32::<LittleEndian>().map_err(truncated("SHP header"))?;
        let shape_type = stream.read_i32::<LittleEndian>().map_err(truncated("SHP header"))?;
        if shape_type != SHAPE_POLYGON {
            return Err(Error::format(format!("unsupported SHP shape type {}", shape_type)));
        }
        skip(&mut stream, 8 * 8, "SHP bounding box")?;
        trace!("SHP version {}, {} words", version, words);

        Ok(Self { stream, file_length: words.max(0) as u64 * 2, position: SHP_HEADER_BYTES })
    }

    /// The rings of the next polygon record, or `None` past the last one.
    pub fn next_polygon(&mut self) -> Result<Option<Vec<Ring>>> {
        if self.position >= self.file_length {
            return Ok(None);
        }
        let record_number = self.stream.read_i32::<BigEndian>().map_err(truncated("SHP record header"))?;
        let content_words = self.stream.read_i32::<BigEndian>().map_err(truncated("SHP record header"))?;
        if content_words < 0 {
            return Err(Error::format(format!("SHP record {} has negative length", record_number)));
        }
        let content_length = content_words as u64 * 2;
        self.position += 8 + content_length;

        let mut content = (&mut self.stream).take(content_length);
        let rings = read_polygon(&mut content, content_length, record_number)?;
        let rest = content.limit();
        skip(&mut content, rest, "SHP record padding")?;
        Ok(Some(rings))
    }
}

/// Shape type, bounding box and the two counts.
const POLYGON_FIXED_BYTES: u64 = 4 + 4 * 8 + 4 + 4;

fn read_polygon<R: Read>(content: &mut R, content_length: u64, record_number: i32) -> Result<Vec<Ring>> {
    let shape_type = content.read_i32::<LittleEndian>().map_err(truncated("SHP record"))?;
    if shape_type != SHAPE_POLYGON {
        return Err(Error::format(format!(
            "SHP record {} has unsupported shape type {}",
            record_number, shape_type
        )));
    }
    skip(content, 4 * 8, "SHP record bounding box")?;
    let parts = content.read_i32::<LittleEndian>().map_err(truncated("SHP record"))?;
    let points = content.read_i32::<LittleEndian>().map_err(truncated("SHP record"))?;
    if parts < 0 || points < 0 {
        return Err(Error::format(format!("SHP record {} has negative counts", record_number)));
    }
    let needed = POLYGON_FIXED_BYTES + 4 * parts as u64 + 16 * points as u64;
    if needed > content_length {
        return Err(Error::format(format!(
            "SHP record {}: {} parts and {} points need {} bytes, record holds {}",
            record_number, parts, points, needed, content_length
        )));
    }
    let (parts, points) = (parts as usize, points as usize);

    let mut starts = Vec::with_capacity(parts.min(1 << 12));
    for _ in 0..parts {
        starts.push(content.read_i32::<LittleEndian>().map_err(truncated("SHP part index"))?);
    }
    match starts.first() {
        Some(0) => {}
        None if points == 0 => {}
        _ => {
            return Err(Error::format(format!(
                "SHP record {} has points before its first part",
                record_number
            )))
        }
    }
    let mut previous = 0;
    for &start in &starts {
        if start < previous || start as usize >= points.max(1) {
            return Err(Error::format(format!(
                "SHP record {} part index {} out of range for {} points",
                record_number, start, points
            )));
        }
        previous = start;
    }

    let mut rings = Vec::with_capacity(parts.min(1 << 12));
    let mut ring = Ring::new();
    let mut next_part = 1;
    for i in 0..points {
        if next_part < parts && i == starts[next_part] as usize {
            rings.push(std::mem::take(&mut ring));
            next_part += 1;
        }
        let x = content.read_f64::<LittleEndian>().map_err(truncated("SHP point"))?;
        let y = content.read_f64::<LittleEndian>().map_err(truncated("SHP point"))?;
        ring.push(GridPoint::from_degrees(x, y));
    }
    rings.push(ring);
    rings.retain(|r| !r.is_empty());
    Ok(rings)
}


// --------------------------------------------------------------------------
// AdminUnitStream

#[derive(Debug, Default)]
struct AttributeColumns {
    ids: [Option<usize>; LEVELS],
    names: [Option<usize>; LEVELS],
}

impl AttributeColumns {
    fn locate<R: Read>(dbf: &DbfReader<R>, level: u8) -> Self {
        let mut columns = Self::default();
        for n in 0..=level as usize {
            columns.ids[n] = find_column(dbf, &format!("ID_{}", n), (n == 0).then_some("GADMID"));
            columns.names[n] = find_column(dbf, &format!("NAME_{}", n), (n == 0).then_some("NAME_ENGLI"));
        }
        columns
    }
}

fn find_column<R: Read>(dbf: &DbfReader<R>, name: &str, alias: Option<&str>) -> Option<usize> {
    let found = dbf.column(name).or_else(|e| match alias {
        Some(alias) => dbf.column(alias),
        None => Err(e),
    });
    match found {
        Ok(i) => Some(i),
        Err(e) => {
            debug!("{}; treating as absent", e);
            None
        }
    }
}

fn parse_id(text: &str, record: usize) -> Result<Option<i32>> {
    if text.is_empty() {
        return Ok(None);
    }
    if let Ok(id) = text.parse::<i32>() {
        return Ok(Some(id));
    }
    match text.parse::<f64>() {
        Ok(v) if v.fract() == 0.0 && v >= i32::MIN as f64 && v <= i32::MAX as f64 => Ok(Some(v as i32)),
        _ => Err(Error::format(format!("record {}: id {:?} is not a number", record, text))),
    }
}

/// Joins the attribute rows and polygons of one dataset into
/// administrative units, one per shape.
#[derive(Debug)]
pub struct AdminUnitStream<D: Read, S: Read> {
    dbf: DbfReader<D>,
    shp: ShpReader<S>,
    columns: AttributeColumns,
    iso: String,
    level: u8,
    index: usize,
    done: bool,
}

impl<D: Read, S: Read> AdminUnitStream<D, S> {
    pub fn new(iso: &str, level: u8, dbf: D, shp: S) -> Result<Self> {
        let dbf = DbfReader::new(dbf)?;
        let shp = ShpReader::new(shp)?;
        let columns = AttributeColumns::locate(&dbf, level);
        Ok(Self { dbf, shp, columns, iso: iso.to_string(), level, index: 0, done: false })
    }

    fn decode_next(&mut self) -> Result<Option<AdminUnit>> {
        let _span = span!(Level::TRACE, "decode_unit", index = self.index).entered();

        let rings = match self.shp.next_polygon()? {
            Some(rings) => rings,
            None if self.dbf.remaining() == 0 => return Ok(None),
            None => {
                return Err(Error::format(format!(
                    "{} attribute rows but only {} shapes",
                    self.dbf.record_count(), self.index
                )))
            }
        };
        let record = self.dbf.next_record()?.ok_or_else(|| {
            Error::format(format!(
                "more shapes than the {} attribute rows",
                self.dbf.record_count()
            ))
        })?;

        let mut unit = AdminUnit { iso: self.iso.clone(), level: self.level, rings, ..Default::default() };
        for n in 0..=self.level as usize {
            if let Some(col) = self.columns.ids[n] {
                unit.ids[n] = parse_id(&record.value(&self.dbf.fields()[col]), self.index)?;
            }
            if let Some(col) = self.columns.names[n] {
                let name = record.value(&self.dbf.fields()[col]);
                unit.names[n] = (!name.is_empty()).then_some(name);
            }
        }
        if record.deleted {
            trace!("Attribute row {} is flagged deleted, joined by position", self.index);
        }
        trace!("{} ({:?}): {} rings, {} points", unit.display_name(), unit.ids, unit.rings.len(), unit.point_count());
        self.index += 1;
        Ok(Some(unit))
    }
}

impl AdminUnitStream<InputStream<BufReader<File>>, InputStream<BufReader<File>>> {
    /// Opens `<stub>.dbf` and `<stub>.shp`, either possibly gzipped. The stub's
    /// file name must look like `<ISO>_adm<level>`.
    pub fn from_files(stub: &Path) -> Result<Self> {
        let name = stub
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::format(format!("bad dataset path {}", stub.display())))?;
        let (iso, level) = parse_dataset_name(name)
            .ok_or_else(|| Error::format(format!("{} is not named <ISO>_adm<level>", name)))?;
        let dbf = open_input(&stub.with_extension("dbf"))?;
        let shp = open_input(&stub.with_extension("shp"))?;
        Self::new(&iso, level, dbf, shp)
    }
}

impl<D: Read, S: Read> Iterator for AdminUnitStream<D, S> {
    type Item = Result<AdminUnit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.decode_next().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

/// Decodes a whole dataset.
pub fn decode<D: Read, S: Read>(iso: &str, level: u8, dbf: D, shp: S) -> Result<Vec<AdminUnit>> {
    AdminUnitStream::new(iso, level, dbf, shp)?.collect()
}
