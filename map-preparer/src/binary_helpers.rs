use std::io::{Read, Write};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::error::{truncated, Error, Result};

/// Reads a big-endian `i32` element count and rejects negative values.
/// `what` names the field in error messages.
#[inline]
pub fn read_count<R: Read>(stream: &mut R, what: &'static str) -> Result<usize> {
    let n = stream.read_i32::<BigEndian>().map_err(truncated(what))?;
    if n < 0 {
        return Err(Error::format(format!("negative {}: {}", what, n)));
    }
    Ok(n as usize)
}

/// Decode a length-prefixed UTF-16 string: a big-endian `i32` count of code
/// units followed by that many big-endian `u16` code units.
///
/// The buffer grows with the bytes actually present, so a corrupt length
/// fails as truncation.
pub fn read_utf16_string<R: Read>(stream: &mut R, what: &'static str) -> Result<String> {
    let len = read_count(stream, what)?;
    let mut bytes = Vec::new();
    stream.take(2 * len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != 2 * len {
        return Err(Error::format(format!("truncated {}: {} of {} bytes", what, bytes.len(), 2 * len)));
    }
    let units: Vec<u16> = bytes.chunks_exact(2).map(BigEndian::read_u16).collect();
    String::from_utf16(&units).map_err(|_| Error::format(format!("invalid UTF-16 in {}", what)))
}

/// Inverse of `read_utf16_string`.
pub fn write_utf16_string<W: Write>(stream: &mut W, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    stream.write_i32::<BigEndian>(units.len() as i32)?;
    for unit in units {
        stream.write_u16::<BigEndian>(unit)?;
    }
    Ok(())
}

/// Decode a fixed-width byte field as Latin-1 text, treating NUL as a space
/// and trimming surrounding blanks.
pub fn latin1_field(bytes: &[u8]) -> String {
    let text: String = bytes
        .iter()
        .map(|&b| if b == 0 { ' ' } else { b as char })
        .collect();
    text.trim().to_string()
}
