//! Little-endian scalar helpers for component checkpoint streams.
//!
//! Every stateful component serializes its primitives with these, in the
//! order its fields are declared, inside a tagged record owned by the
//! machine.

use std::io::{self, Read, Write};

pub fn write_u8(w: &mut impl Write, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn write_bool(w: &mut impl Write, v: bool) -> io::Result<()> {
    write_u8(w, v as u8)
}

pub fn write_u16(w: &mut impl Write, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64(w: &mut impl Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f64(w: &mut impl Write, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];

    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_bool(r: &mut impl Read) -> io::Result<bool> {
    Ok(read_u8(r)? != 0)
}

pub fn read_u16(r: &mut impl Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];

    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];

    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];

    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_f64(r: &mut impl Read) -> io::Result<f64> {
    let mut buf = [0u8; 8];

    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// A record that does not match the running configuration.
pub fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip() {
        let mut buf = Vec::new();

        write_u8(&mut buf, 0xAB).unwrap();
        write_bool(&mut buf, true).unwrap();
        write_u16(&mut buf, 0x1234).unwrap();
        write_u32(&mut buf, 0xDEAD_BEEF).unwrap();
        write_u64(&mut buf, u64::MAX - 1).unwrap();
        write_f64(&mut buf, 2.5).unwrap();

        let r = &mut buf.as_slice();
        assert_eq!(read_u8(r).unwrap(), 0xAB);
        assert!(read_bool(r).unwrap());
        assert_eq!(read_u16(r).unwrap(), 0x1234);
        assert_eq!(read_u32(r).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_u64(r).unwrap(), u64::MAX - 1);
        assert_eq!(read_f64(r).unwrap(), 2.5);

        assert!(read_u8(r).is_err());
    }
}
