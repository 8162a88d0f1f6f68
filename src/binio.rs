//! Fixed-width scalar IO for the model files: 32-bit indices, 64-bit sizes,
//! IEEE-754 64-bit reals, all in host byte order.

use std::io::{Read, Result, Write};

pub fn write_i32<W: Write>(out: &mut W, v: i32) -> Result<()> {
    out.write_all(&v.to_ne_bytes())
}

pub fn write_u64<W: Write>(out: &mut W, v: u64) -> Result<()> {
    out.write_all(&v.to_ne_bytes())
}

pub fn write_f64<W: Write>(out: &mut W, v: f64) -> Result<()> {
    out.write_all(&v.to_ne_bytes())
}

pub fn write_bool<W: Write>(out: &mut W, v: bool) -> Result<()> {
    out.write_all(&[v as u8])
}

pub fn read_i32<R: Read>(input: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

pub fn read_u64<R: Read>(input: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

pub fn read_f64<R: Read>(input: &mut R) -> Result<f64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(f64::from_ne_bytes(buf))
}

pub fn read_bool<R: Read>(input: &mut R) -> Result<bool> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf)?;
    Ok(buf[0] != 0)
}
