//! Byte-buffer primitives shared by the frame codec: network-order integer
//! access and XOR masking.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io::{self, Write};

/// Reads a network-order u16 at `offset`. Callers guard the slice length;
/// a short slice is a caller bug and panics.
pub fn read_u16_be(data: &[u8], offset: usize) -> u16 {
    BigEndian::read_u16(&data[offset..])
}

/// Reads a network-order u64 at `offset`. Same bounds contract as
/// [`read_u16_be`].
pub fn read_u64_be(data: &[u8], offset: usize) -> u64 {
    BigEndian::read_u64(&data[offset..])
}

pub fn write_u16_be<W: Write>(out: &mut W, value: u16) -> io::Result<()> {
    out.write_u16::<BigEndian>(value)
}

pub fn write_u32_be<W: Write>(out: &mut W, value: u32) -> io::Result<()> {
    out.write_u32::<BigEndian>(value)
}

pub fn write_u64_be<W: Write>(out: &mut W, value: u64) -> io::Result<()> {
    out.write_u64::<BigEndian>(value)
}

/// Applies the rolling 4-byte XOR mask in place:
/// `buf[i] ^= key[(start_index + i) % 4]`.
///
/// Masking its own output restores the input, so the same call serves both
/// directions. `start_index` lets a payload be masked in chunks.
pub fn xor_mask(buf: &mut [u8], key: [u8; 4], start_index: usize) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[(start_index + i) % 4];
    }
}
