//! Little-endian binary primitives shared by the persistent stores.
//!
//! All store files (users, groups, sections, dupes) use the same
//! conventions: integers are little-endian, strings are UTF-8 prefixed
//! with a 7-bit varint byte length. The varint stores 7 payload bits per
//! byte with the high bit as a continuation flag.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Upper bound on an encoded string, applied when decoding so a corrupt
/// or hostile file cannot force an unbounded allocation.
pub const MAX_STRING_LEN: usize = 64 * 1024;

/// Endianness used by every store file.
pub type StoreEndian = LittleEndian;

pub fn write_varint(dest: &mut impl Write, mut value: u64) -> io::Result<()> {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            return dest.write_u8(byte);
        }
        dest.write_u8(byte | 0x80)?;
    }
}

pub fn read_varint(src: &mut impl Read) -> io::Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = src.read_u8()?;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(invalid_data("varint too long"));
        }
    }
}

/// Writes a length-prefixed UTF-8 string.
pub fn write_string(dest: &mut impl Write, value: &str) -> io::Result<()> {
    write_varint(dest, value.len() as u64)?;
    dest.write_all(value.as_bytes())
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_string(src: &mut impl Read) -> io::Result<String> {
    let len = read_varint(src)? as usize;
    if len > MAX_STRING_LEN {
        return Err(invalid_data("string length exceeds maximum"));
    }
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| invalid_data("string is not valid UTF-8"))
}

pub fn write_i32(dest: &mut impl Write, value: i32) -> io::Result<()> {
    dest.write_i32::<StoreEndian>(value)
}

pub fn read_i32(src: &mut impl Read) -> io::Result<i32> {
    src.read_i32::<StoreEndian>()
}

pub fn write_i64(dest: &mut impl Write, value: i64) -> io::Result<()> {
    dest.write_i64::<StoreEndian>(value)
}

pub fn read_i64(src: &mut impl Read) -> io::Result<i64> {
    src.read_i64::<StoreEndian>()
}

pub fn write_u8(dest: &mut impl Write, value: u8) -> io::Result<()> {
    dest.write_u8(value)
}

pub fn read_u8(src: &mut impl Read) -> io::Result<u8> {
    src.read_u8()
}

pub fn write_u32(dest: &mut impl Write, value: u32) -> io::Result<()> {
    dest.write_u32::<StoreEndian>(value)
}

pub fn read_u32(src: &mut impl Read) -> io::Result<u32> {
    src.read_u32::<StoreEndian>()
}

pub fn write_f64(dest: &mut impl Write, value: f64) -> io::Result<()> {
    dest.write_f64::<StoreEndian>(value)
}

pub fn read_f64(src: &mut impl Read) -> io::Result<f64> {
    src.read_f64::<StoreEndian>()
}

pub fn write_bool(dest: &mut impl Write, value: bool) -> io::Result<()> {
    dest.write_u8(value as u8)
}

pub fn read_bool(src: &mut impl Read) -> io::Result<bool> {
    Ok(src.read_u8()? != 0)
}

pub fn invalid_data(m: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, 16383, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value).unwrap();
            assert_eq!(read_varint(&mut buf.as_slice()).unwrap(), value);
        }
    }

    #[test]
    fn varint_single_byte_below_128() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 127).unwrap();
        assert_eq!(buf, vec![0x7F]);
        buf.clear();
        write_varint(&mut buf, 128).unwrap();
        assert_eq!(buf, vec![0x80, 0x01]);
    }

    #[test]
    fn string_round_trip() {
        for s in ["", "a", "Section|Release-2024-GRP", "ünïcode"] {
            let mut buf = Vec::new();
            write_string(&mut buf, s).unwrap();
            assert_eq!(read_string(&mut buf.as_slice()).unwrap(), s);
        }
    }

    #[test]
    fn string_length_is_capped() {
        let mut buf = Vec::new();
        write_varint(&mut buf, (MAX_STRING_LEN + 1) as u64).unwrap();
        buf.extend_from_slice(&[0u8; 8]);
        assert!(read_string(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn integers_are_little_endian() {
        let mut buf = Vec::new();
        write_i32(&mut buf, 0x0102_0304).unwrap();
        assert_eq!(buf, vec![0x04, 0x03, 0x02, 0x01]);
    }
}
