use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::bufread::GzDecoder;
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// An input that is either read as-is or gunzipped on the fly, depending on
/// its first two bytes. Shapefiles and raster grids are often shipped
/// compressed; callers never need to know which they got.
pub enum InputStream<R: BufRead> {
    Plain(R),
    Gzip(BufReader<GzDecoder<R>>),
}

impl<R: BufRead> InputStream<R> {
    pub fn from_reader(mut reader: R) -> std::io::Result<Self> {
        let head = reader.fill_buf()?;
        if head.len() >= 2 && head[..2] == GZIP_MAGIC {
            Ok(InputStream::Gzip(BufReader::new(GzDecoder::new(reader))))
        } else {
            Ok(InputStream::Plain(reader))
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, InputStream::Gzip(_))
    }
}

impl InputStream<BufReader<File>> {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = BufReader::new(File::open(path)?);
        Self::from_reader(file)
    }
}

impl<R: BufRead> Read for InputStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            InputStream::Plain(reader) => reader.read(buf),
            InputStream::Gzip(decoder) => decoder.read(buf),
        }
    }
}

impl<R: BufRead> BufRead for InputStream<R> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        match self {
            InputStream::Plain(reader) => reader.fill_buf(),
            InputStream::Gzip(decoder) => decoder.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            InputStream::Plain(reader) => reader.consume(amt),
            InputStream::Gzip(decoder) => decoder.consume(amt),
        }
    }
}

/// Opens `path`, falling back to `path.gz` when only the compressed file
/// exists.
pub fn open_input(path: &Path) -> std::io::Result<InputStream<BufReader<File>>> {
    if !path.exists() {
        let mut gz = path.as_os_str().to_owned();
        gz.push(".gz");
        let gz = Path::new(&gz);
        if gz.exists() {
            return open_logged(gz);
        }
    }
    open_logged(path)
}

fn open_logged(path: &Path) -> std::io::Result<InputStream<BufReader<File>>> {
    let input = InputStream::open(path)?;
    if input.is_compressed() {
        debug!("Decompressing {} on the fly", path.display());
    }
    Ok(input)
}
